//! The simulated process: program image, segmented address space, symbol
//! table, page table, log, and lifecycle.
//!
//! Address space layout, in bytes from 0:
//!
//! ```text
//! [0, TEXT_end)        one 2-byte slot per flattened instruction
//! [TEXT_end, DATA_end) the symbol table, 32 variables x 2 bytes
//! [DATA_end, HEAP_end) the heap; HEAP_end == required_memory
//! ```
//!
//! Nothing here owns physical memory. Every word the process touches —
//! instruction fetches included — goes through the paging allocator:
//! look up the page-table entry, fault the page in if invalid, pin the
//! frame, then read or write the word (which unpins). The pin spans exactly
//! one word access so concurrent evictions on other cores can never pull a
//! frame out from under a half-done access.
//!
//! Locking: a process carries four small mutexes (control block, symbol
//! table, page table, log). The page table is a leaf lock the allocator
//! takes while holding the paging mutex; the others are only touched by the
//! worker currently running the process and by the scheduler's wakeup step.

use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, OnceLock};

use log::warn;
use program::{expand_program, Instruction, StoredWord};
use types::{clock, Pid, ProcessStatus, SimError, SimResult, Tick};

use crate::paging::PagingAllocator;

pub type ProcessHandle = Arc<Process>;

/// Bytes reserved for the symbol table: 32 variables, 2 bytes each.
pub const SYMBOL_TABLE_BYTES: u64 = 64;
/// Maximum number of named variables per process.
pub const MAX_VARIABLES: usize = 32;

const MAX_ACCESS_RETRIES: usize = 100_000;

/// One per-process page-table entry. `dirty` records the state observed at
/// the most recent swap-out; while resident, dirtiness is tracked on the
/// frame itself.
#[derive(Clone, Copy, Debug, Default)]
pub struct PageEntry {
    pub valid: bool,
    pub in_backing_store: bool,
    pub frame: Option<usize>,
    pub dirty: bool,
}

/// Finalized program of a process. Immutable once submitted.
pub struct ProgramImage {
    pub instructions: Vec<Arc<Instruction>>,
    pub total_lines: u64,
    pub required_memory: u64,
    pub text_end: u64,
    pub data_end: u64,
    pub num_pages: usize,
}

struct Ctl {
    status: ProcessStatus,
    current_line: u64,
    core: Option<usize>,
    wakeup_tick: Tick,
    finished_tick: Option<Tick>,
    violation: Option<String>,
}

pub struct Process {
    pid: Pid,
    name: String,
    created_at: String,
    requested_memory: u64,
    mem_per_frame: usize,
    logs_dir: PathBuf,
    image: OnceLock<ProgramImage>,
    ctl: Mutex<Ctl>,
    symbols: Mutex<Vec<(String, u32)>>,
    page_table: Mutex<Vec<PageEntry>>,
    logs: Mutex<Vec<String>>,
}

/// `Ok(None)` from a memory operation means the access violated the address
/// space and the process has already been shut down; callers just stop.
pub type MemAccess<T> = SimResult<Option<T>>;

impl Process {
    pub fn new(
        pid: Pid,
        name: &str,
        requested_memory: u64,
        mem_per_frame: usize,
        logs_dir: PathBuf,
    ) -> ProcessHandle {
        Arc::new(Self {
            pid,
            name: name.to_string(),
            created_at: clock::timestamp_now(),
            requested_memory,
            mem_per_frame,
            logs_dir,
            image: OnceLock::new(),
            ctl: Mutex::new(Ctl {
                status: ProcessStatus::Ready,
                current_line: 0,
                core: None,
                wakeup_tick: 0,
                finished_tick: None,
                violation: None,
            }),
            symbols: Mutex::new(Vec::new()),
            page_table: Mutex::new(Vec::new()),
            logs: Mutex::new(Vec::new()),
        })
    }

    /// Finalizes the program: expands FOR bodies, fixes the segment map, and
    /// sizes the page table. With `account_text` the instruction bytes are
    /// added on top of the requested memory; without it the caller has
    /// already budgeted for them. Must be called exactly once, before the
    /// process is scheduled.
    pub fn submit_instructions(&self, instructions: &[Instruction], account_text: bool) {
        let flat = expand_program(instructions);
        let total_lines = flat.len() as u64;
        let text_end = total_lines * 2;
        let required_memory =
            self.requested_memory + if account_text { text_end } else { 0 };
        let num_pages = required_memory.div_ceil(self.mem_per_frame as u64) as usize;

        let image = ProgramImage {
            instructions: flat,
            total_lines,
            required_memory,
            text_end,
            data_end: text_end + SYMBOL_TABLE_BYTES,
            num_pages,
        };

        *self.page_table.lock().expect("page table poisoned") =
            vec![PageEntry::default(); num_pages];
        self.image
            .set(image)
            .unwrap_or_else(|_| panic!("process {} submitted twice", self.name));
    }

    pub fn image(&self) -> &ProgramImage {
        self.image.get().expect("process has no submitted program")
    }

    // ---- plain accessors -------------------------------------------------

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn created_at(&self) -> &str {
        &self.created_at
    }

    pub fn status(&self) -> ProcessStatus {
        self.ctl().status
    }

    pub fn set_status(&self, status: ProcessStatus) {
        self.ctl().status = status;
    }

    pub fn current_line(&self) -> u64 {
        self.ctl().current_line
    }

    pub fn total_lines(&self) -> u64 {
        self.image.get().map_or(0, |i| i.total_lines)
    }

    pub fn core(&self) -> Option<usize> {
        self.ctl().core
    }

    pub fn set_core(&self, core: Option<usize>) {
        self.ctl().core = core;
    }

    pub fn wakeup_tick(&self) -> Tick {
        self.ctl().wakeup_tick
    }

    /// Parks the process: WAITING until `wakeup`.
    pub fn set_waiting(&self, wakeup: Tick) {
        let mut ctl = self.ctl();
        ctl.status = ProcessStatus::Waiting;
        ctl.wakeup_tick = wakeup;
    }

    pub fn finished_tick(&self) -> Option<Tick> {
        self.ctl().finished_tick
    }

    /// Records the completion tick if nothing else already has. Called by
    /// the worker that observes the DONE transition.
    pub fn mark_finished(&self, tick: Tick) {
        let mut ctl = self.ctl();
        if ctl.finished_tick.is_none() {
            ctl.finished_tick = Some(tick);
        }
    }

    pub fn memory_usage(&self) -> u64 {
        self.image.get().map_or(0, |i| i.required_memory)
    }

    pub fn violation(&self) -> Option<String> {
        self.ctl().violation.clone()
    }

    pub fn log_lines(&self) -> Vec<String> {
        self.logs.lock().expect("log poisoned").clone()
    }

    pub fn append_log(&self, line: String) {
        self.logs.lock().expect("log poisoned").push(line);
    }

    fn ctl(&self) -> std::sync::MutexGuard<'_, Ctl> {
        self.ctl.lock().expect("control block poisoned")
    }

    // ---- page table (leaf lock; the allocator calls these) ---------------

    pub fn page_entry(&self, page: usize) -> Option<PageEntry> {
        self.page_table
            .lock()
            .expect("page table poisoned")
            .get(page)
            .copied()
    }

    pub fn page_table_view(&self) -> Vec<PageEntry> {
        self.page_table.lock().expect("page table poisoned").clone()
    }

    /// Points the entry at a freshly loaded frame. The page starts clean;
    /// `in_backing_store` keeps its old value so a later clean eviction can
    /// still find the superseded-by-nothing record.
    pub fn swap_page_in(&self, page: usize, frame: usize) {
        let mut table = self.page_table.lock().expect("page table poisoned");
        let entry = &mut table[page];
        entry.valid = true;
        entry.frame = Some(frame);
        entry.dirty = false;
    }

    /// Invalidates the entry at eviction. Only a dirty page gains a backing
    /// store record; a clean one re-faults from wherever it came from.
    pub fn swap_page_out(&self, page: usize, dirty: bool) {
        let mut table = self.page_table.lock().expect("page table poisoned");
        let entry = &mut table[page];
        entry.valid = false;
        entry.frame = None;
        entry.dirty = dirty;
        if dirty {
            entry.in_backing_store = true;
        }
    }

    /// Initial contents of a page that has never been swapped: instruction
    /// handles across the text segment, zeroed words from there to the end
    /// of the address space.
    pub fn initial_page_data(&self, page: usize) -> Vec<Option<StoredWord>> {
        let image = self.image();
        let words = self.mem_per_frame / 2;
        let mut data = vec![None; words];
        for (slot, word) in data.iter_mut().enumerate() {
            let byte = (page * self.mem_per_frame + slot * 2) as u64;
            if byte >= image.required_memory {
                break;
            }
            *word = if byte < image.text_end {
                Some(StoredWord::Instr(image.instructions[(byte / 2) as usize].clone()))
            } else {
                Some(StoredWord::Value(0))
            };
        }
        data
    }

    // ---- memory access ---------------------------------------------------

    /// Fault-in / pin / access loop shared by every word access. The closure
    /// runs with the frame pinned and must clear the pin (read/write do).
    fn word_access<T>(
        &self,
        alloc: &PagingAllocator,
        addr: u32,
        access: impl Fn(&PagingAllocator, usize, usize) -> SimResult<T>,
    ) -> SimResult<T> {
        let page = addr as usize / self.mem_per_frame;
        let offset = addr as usize % self.mem_per_frame;

        for _ in 0..MAX_ACCESS_RETRIES {
            let entry = self.page_entry(page).ok_or_else(|| {
                SimError::Internal(format!(
                    "pid {} touched page {page} beyond its {}-page table",
                    self.pid,
                    self.image().num_pages
                ))
            })?;

            let frame = match entry {
                PageEntry { valid: true, frame: Some(frame), .. } => frame,
                _ => {
                    alloc.handle_page_fault(self, page)?;
                    continue;
                }
            };

            // The frame can be stolen between the table read and the pin;
            // a failed pin is just a page fault we have not taken yet.
            if !alloc.pin_frame(frame, self.pid, page) {
                continue;
            }
            return access(alloc, frame, offset);
        }
        Err(SimError::Internal(format!(
            "pid {} gave up re-pinning page {page}",
            self.pid
        )))
    }

    fn read_value(&self, alloc: &PagingAllocator, addr: u32) -> SimResult<u16> {
        let word = self.word_access(alloc, addr, |a, frame, offset| a.read_frame(frame, offset))?;
        match word {
            StoredWord::Value(v) => Ok(v),
            StoredWord::Instr(_) => Err(SimError::Internal(format!(
                "pid {} read an instruction handle at data address {addr:#x}",
                self.pid
            ))),
        }
    }

    fn write_value(&self, alloc: &PagingAllocator, addr: u32, value: u16) -> SimResult<()> {
        self.word_access(alloc, addr, |a, frame, offset| {
            a.write_frame(frame, offset, value)
        })
    }

    /// Fetches the instruction under the program counter through the text
    /// page, faulting it in like any other memory.
    pub fn fetch_instruction(&self, alloc: &PagingAllocator) -> SimResult<Arc<Instruction>> {
        let line = self.current_line();
        let addr = (line * 2) as u32;
        let word = self.word_access(alloc, addr, |a, frame, offset| a.read_frame(frame, offset))?;
        match word {
            StoredWord::Instr(instr) => Ok(instr),
            StoredWord::Value(_) => Err(SimError::Internal(format!(
                "pid {} line {line}: text page slot holds a raw value",
                self.pid
            ))),
        }
    }

    // ---- symbol table ----------------------------------------------------

    fn symbol_addr(&self, name: &str) -> Option<u32> {
        self.symbols
            .lock()
            .expect("symbol table poisoned")
            .iter()
            .find(|(n, _)| n == name)
            .map(|&(_, addr)| addr)
    }

    /// DECLARE: first declaration wins, a full table is a silent no-op, and
    /// a slot that would fall past the end of the address space is a
    /// memory-access violation.
    pub fn declare_var(
        &self,
        alloc: &PagingAllocator,
        name: &str,
        value: u16,
    ) -> MemAccess<()> {
        let addr = {
            let mut symbols = self.symbols.lock().expect("symbol table poisoned");
            if symbols.iter().any(|(n, _)| n == name) {
                return Ok(Some(()));
            }
            if symbols.len() >= MAX_VARIABLES {
                return Ok(Some(()));
            }
            let image = self.image();
            let addr = (image.text_end + symbols.len() as u64 * 2) as u32;
            if u64::from(addr) + 2 > image.required_memory {
                drop(symbols);
                self.shutdown_violation(addr);
                return Ok(None);
            }
            symbols.push((name.to_string(), addr));
            addr
        };
        self.write_value(alloc, addr, value)?;
        Ok(Some(()))
    }

    /// Variable read; undeclared names auto-declare to 0 while the table has
    /// room, and read as 0 once it is full.
    pub fn var_read(&self, alloc: &PagingAllocator, name: &str) -> MemAccess<u16> {
        match self.symbol_addr(name) {
            Some(addr) => self.read_value(alloc, addr).map(Some),
            None => match self.declare_var(alloc, name, 0)? {
                Some(()) => Ok(Some(0)),
                None => Ok(None),
            },
        }
    }

    /// Variable write; declares the name first when absent.
    pub fn var_assign(&self, alloc: &PagingAllocator, name: &str, value: u16) -> MemAccess<()> {
        match self.symbol_addr(name) {
            Some(addr) => self.write_value(alloc, addr, value).map(Some),
            None => self.declare_var(alloc, name, value),
        }
    }

    pub fn symbol_count(&self) -> usize {
        self.symbols.lock().expect("symbol table poisoned").len()
    }

    // ---- heap access -----------------------------------------------------

    /// Rounds to the containing word and bounds-checks against the heap
    /// segment. Out-of-segment addresses shut the process down.
    fn heap_addr(&self, requested: u32) -> Option<u32> {
        let addr = requested & !1;
        let image = self.image();
        if u64::from(addr) < image.data_end || u64::from(addr) + 2 > image.required_memory {
            self.shutdown_violation(requested);
            return None;
        }
        Some(addr)
    }

    pub fn heap_read(&self, alloc: &PagingAllocator, addr: u32) -> MemAccess<u16> {
        match self.heap_addr(addr) {
            Some(addr) => self.read_value(alloc, addr).map(Some),
            None => Ok(None),
        }
    }

    pub fn heap_write(&self, alloc: &PagingAllocator, addr: u32, value: u16) -> MemAccess<()> {
        match self.heap_addr(addr) {
            Some(addr) => self.write_value(alloc, addr, value).map(Some),
            None => Ok(None),
        }
    }

    // ---- lifecycle -------------------------------------------------------

    /// Memory-access-violation shutdown: records the canonical message,
    /// enters DONE, flushes the log file. Idempotent.
    pub fn shutdown_violation(&self, addr: u32) {
        let message = format!(
            "Process {} shut down due to memory access violation error that occurred at {}. {:#X} invalid.",
            self.name,
            clock::clock_now(),
            addr
        );
        self.shutdown_with(message);
    }

    /// Shutdown on an internal fault surfaced by the worker.
    pub fn shutdown_internal(&self, reason: &str) {
        self.shutdown_with(format!(
            "Process {} shut down due to an internal error: {reason}",
            self.name
        ));
    }

    fn shutdown_with(&self, message: String) {
        {
            let mut ctl = self.ctl();
            if ctl.status == ProcessStatus::Done {
                return;
            }
            ctl.status = ProcessStatus::Done;
            ctl.violation = Some(message.clone());
        }
        self.append_log(message);
        self.write_log_file();
    }

    /// Advances the program counter after an executed line; entering the
    /// final line transitions to DONE and flushes the log file. Returns
    /// whether the process just finished.
    pub fn advance_line(&self, tick: Tick) -> bool {
        let finished = {
            let mut ctl = self.ctl();
            if ctl.status == ProcessStatus::Done {
                return false;
            }
            ctl.current_line += 1;
            let image = self.image();
            if ctl.current_line >= image.total_lines {
                ctl.status = ProcessStatus::Done;
                ctl.finished_tick = Some(tick);
                true
            } else {
                false
            }
        };
        if finished {
            self.write_log_file();
        }
        finished
    }

    /// Dumps the accumulated log to `logs/<name>.txt`. Best-effort: a
    /// failing filesystem only costs the file, never the run.
    fn write_log_file(&self) {
        if let Err(err) = fs::create_dir_all(&self.logs_dir) {
            warn!("could not create {}: {err}", self.logs_dir.display());
            return;
        }
        let path = self.logs_dir.join(format!("{}.txt", self.name));
        let body = self.log_lines().join("\n") + "\n";
        if let Err(err) = fs::write(&path, body) {
            warn!("could not write {}: {err}", path.display());
        }
    }
}
