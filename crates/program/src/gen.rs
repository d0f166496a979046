//! Random program synthesis for generated (batch) processes, plus the
//! alternating PRINT/ADD program used by interactive creates.
//!
//! Generation is driven entirely by a seeded PRNG and the config-supplied
//! bounds, so two runs with the same seed produce the same programs. Heap
//! addresses are drawn from `[TEXT_end, HEAP_end + 1%)`: the 1 % overshoot
//! plants occasional out-of-range accesses on purpose, exercising the
//! memory-violation shutdown path.

use crate::instruction::{Instruction, Operand};

const MAX_NEST_LEVELS: u32 = 3;
const MAX_VARIABLES: usize = 32;
const INSTRUCTION_BYTES: u64 = 2;
const SYMBOL_TABLE_BYTES: u64 = 64;

/// splitmix64. Small, fast, and good enough for instruction mixing; the
/// reference corpus carries no RNG dependency and a hand-seeded generator
/// keeps test runs reproducible.
#[derive(Clone, Debug)]
pub struct Rng {
    state: u64,
}

impl Rng {
    pub fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    pub fn next_u64(&mut self) -> u64 {
        self.state = self.state.wrapping_add(0x9e37_79b9_7f4a_7c15);
        let mut z = self.state;
        z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
        z ^ (z >> 31)
    }

    /// Uniform in `[min, max]`, inclusive on both ends.
    pub fn range(&mut self, min: u64, max: u64) -> u64 {
        debug_assert!(min <= max);
        let span = max - min + 1;
        min + self.next_u64() % span
    }

    pub fn flip(&mut self) -> bool {
        self.next_u64() & 1 == 1
    }
}

/// Inputs to [`generate_program`].
pub struct GenParams<'a> {
    pub process_name: &'a str,
    pub min_ins: u32,
    pub max_ins: u32,
    /// Requested memory in bytes, before text accounting is added on top.
    pub required_memory: u64,
}

/// Synthesizes a program of `[min_ins, max_ins]` total lines. FOR loops stay
/// structured; the kernel expands them at submission.
pub fn generate_program(rng: &mut Rng, params: &GenParams) -> Vec<Instruction> {
    let target_lines = rng.range(u64::from(params.min_ins), u64::from(params.max_ins));

    // Final layout once text is accounted: TEXT ends at target*2, the heap
    // ends at text + requested memory. Addresses overshoot by 1 %.
    let text_end = target_lines * INSTRUCTION_BYTES;
    let heap_end = text_end + params.required_memory;
    let overshoot = heap_end / 100;

    let mut ctx = GenCtx {
        rng,
        process_name: params.process_name,
        declared: Vec::new(),
        addr_min: text_end,
        addr_max: (heap_end + overshoot).saturating_sub(2).max(text_end),
    };

    let mut program = Vec::new();
    let mut accumulated = 0;
    while accumulated < target_lines {
        let remaining = target_lines - accumulated;
        let instr = ctx.random_instruction(0, remaining);
        let lines = instr.line_count();
        if lines > remaining {
            continue;
        }
        accumulated += lines;
        program.push(instr);
    }
    program
}

/// The interactive-create program: PRINT and `ADD x x <1..10>` alternating,
/// sized like a generated program.
pub fn alternating_print_add(rng: &mut Rng, min_ins: u32, max_ins: u32) -> Vec<Instruction> {
    let lines = rng.range(u64::from(min_ins), u64::from(max_ins));
    (0..lines)
        .map(|i| {
            if i % 2 == 0 {
                Instruction::Print { message: "Value from: ".into(), var: Some("x".into()) }
            } else {
                Instruction::Add {
                    dest: "x".into(),
                    lhs: Operand::Var("x".into()),
                    rhs: Operand::Literal(rng.range(1, 10) as u16),
                }
            }
        })
        .collect()
}

struct GenCtx<'a> {
    rng: &'a mut Rng,
    process_name: &'a str,
    declared: Vec<String>,
    addr_min: u64,
    addr_max: u64,
}

impl GenCtx<'_> {
    fn random_instruction(&mut self, nest_level: u32, max_lines: u64) -> Instruction {
        let loopable = nest_level < MAX_NEST_LEVELS && max_lines > 1;
        match self.rng.range(0, if loopable { 7 } else { 6 }) {
            0 => {
                if self.declared.is_empty() {
                    Instruction::Print {
                        message: format!("Hello world from {}.", self.process_name),
                        var: None,
                    }
                } else {
                    let var = self.existing_var();
                    Instruction::Print {
                        message: format!("The value of {var} is: "),
                        var: Some(var),
                    }
                }
            }
            1 => {
                let var = self.new_var();
                let value = self.rng.range(0, u64::from(u16::MAX)) as u16;
                Instruction::Declare { var, value }
            }
            2 => Instruction::Sleep { ticks: self.rng.range(1, 255) as u8 },
            3 => {
                let (dest, lhs, rhs) = self.arith_operands();
                Instruction::Add { dest, lhs, rhs }
            }
            4 => {
                let (dest, lhs, rhs) = self.arith_operands();
                Instruction::Sub { dest, lhs, rhs }
            }
            5 => {
                let value = if self.rng.flip() {
                    Operand::Literal(self.rng.range(0, u64::from(u16::MAX)) as u16)
                } else {
                    Operand::Var(self.any_var())
                };
                Instruction::Write { addr: self.heap_addr(), value }
            }
            6 => Instruction::Read { var: self.any_var(), addr: self.heap_addr() },
            _ => self.for_loop(nest_level, max_lines),
        }
    }

    fn for_loop(&mut self, nest_level: u32, max_lines: u64) -> Instruction {
        let iterations = self.rng.range(2, 5.min(max_lines));
        let body_budget = (max_lines / iterations).max(1);
        let body_target = self.rng.range(1, body_budget);

        let mut body = Vec::new();
        let mut accumulated = 0;
        while accumulated < body_target {
            let remaining = body_target - accumulated;
            let instr = self.random_instruction(nest_level + 1, remaining);
            let lines = instr.line_count();
            if lines > remaining {
                continue;
            }
            accumulated += lines;
            body.push(instr);
        }

        Instruction::For { iterations: iterations as u32, body }
    }

    fn arith_operands(&mut self) -> (String, Operand, Operand) {
        let dest = self.any_var();
        let lhs = self.operand();
        let rhs = self.operand();
        (dest, lhs, rhs)
    }

    fn operand(&mut self) -> Operand {
        if self.rng.flip() {
            Operand::Var(self.any_var())
        } else {
            Operand::Literal(self.rng.range(0, u64::from(u16::MAX)) as u16)
        }
    }

    fn heap_addr(&mut self) -> u32 {
        self.rng.range(self.addr_min, self.addr_max) as u32
    }

    /// Existing variable half the time, fresh one otherwise.
    fn any_var(&mut self) -> String {
        if !self.declared.is_empty() && self.rng.flip() {
            self.existing_var()
        } else {
            self.new_var()
        }
    }

    fn existing_var(&mut self) -> String {
        let idx = self.rng.range(0, self.declared.len() as u64 - 1) as usize;
        self.declared[idx].clone()
    }

    /// Fresh `var_<n>` name. The symbol table caps at 32 entries, so names
    /// past the cap are still emitted but no longer tracked; declaring them
    /// is a no-op at execution time.
    fn new_var(&mut self) -> String {
        let mut n = self.declared.len();
        let name = loop {
            let candidate = format!("var_{n}");
            if !self.declared.contains(&candidate) {
                break candidate;
            }
            n += 1;
        };
        if self.declared.len() < MAX_VARIABLES {
            self.declared.push(name.clone());
        }
        name
    }
}

/// Validation for `screen -c`: `1 <= count <= 50` instructions and the text
/// plus symbol table must fit the requested size.
pub fn validate_script_shape(instruction_count: usize, mem_size: u64) -> Result<(), String> {
    if instruction_count == 0 || instruction_count > 50 {
        return Err(format!(
            "instruction count must be between 1 and 50, got {instruction_count}"
        ));
    }
    let needed = instruction_count as u64 * INSTRUCTION_BYTES + SYMBOL_TABLE_BYTES;
    if needed > mem_size {
        return Err(format!(
            "{instruction_count} instructions need at least {needed} bytes, got {mem_size}"
        ));
    }
    Ok(())
}
