//! The instruction interpreter: one executed line per call.
//!
//! Dispatch is a single match over the instruction tag. Instructions are
//! pure data; everything stateful happens against the process and the
//! allocator, so the scheduler worker passes both in. A `Ok(None)`-style
//! early return from the process's memory helpers means the access violated
//! the address space and the process has already shut itself down — the
//! step simply ends.

use std::sync::Arc;

use log::warn;
use program::{Instruction, Operand};
use types::{clock, ProcessStatus, SimResult, Tick};

use crate::paging::PagingAllocator;
use crate::process::Process;
use crate::scheduler::Scheduler;

/// Runs exactly one line of `proc`: fetch through the text page, execute,
/// advance. Returns without effect when the process is not RUNNING.
pub fn step(
    proc: &Arc<Process>,
    scheduler: &Scheduler,
    alloc: &PagingAllocator,
    tick: Tick,
    core: usize,
) -> SimResult<()> {
    if proc.status() != ProcessStatus::Running {
        return Ok(());
    }

    let instr = proc.fetch_instruction(alloc)?;
    execute(&instr, proc, scheduler, alloc, tick, core)?;
    proc.advance_line(tick);
    Ok(())
}

fn execute(
    instr: &Instruction,
    proc: &Arc<Process>,
    scheduler: &Scheduler,
    alloc: &PagingAllocator,
    tick: Tick,
    core: usize,
) -> SimResult<()> {
    match instr {
        Instruction::Print { message, var } => {
            let value = match var {
                Some(name) => match proc.var_read(alloc, name)? {
                    Some(value) => value.to_string(),
                    None => return Ok(()),
                },
                None => String::new(),
            };
            proc.append_log(format!(
                "({}) Core:{core} \"{message}{value}\"",
                clock::timestamp_now()
            ));
        }

        Instruction::Declare { var, value } => {
            proc.declare_var(alloc, var, *value)?;
        }

        Instruction::Add { dest, lhs, rhs } => {
            let (Some(lhs), Some(rhs)) = (
                resolve(proc, alloc, lhs)?,
                resolve(proc, alloc, rhs)?,
            ) else {
                return Ok(());
            };
            let sum = (u32::from(lhs) + u32::from(rhs)).min(u32::from(u16::MAX)) as u16;
            proc.var_assign(alloc, dest, sum)?;
        }

        Instruction::Sub { dest, lhs, rhs } => {
            let (Some(lhs), Some(rhs)) = (
                resolve(proc, alloc, lhs)?,
                resolve(proc, alloc, rhs)?,
            ) else {
                return Ok(());
            };
            proc.var_assign(alloc, dest, lhs.saturating_sub(rhs))?;
        }

        Instruction::Sleep { ticks } => {
            // SLEEP 0 still parks for the remainder of the current tick.
            let wakeup = tick + Tick::from(*ticks);
            proc.set_waiting(wakeup);
            scheduler.sleep_process(proc.clone(), wakeup);
        }

        Instruction::Read { var, addr } => {
            let Some(value) = proc.heap_read(alloc, *addr)? else {
                return Ok(());
            };
            proc.var_assign(alloc, var, value)?;
        }

        Instruction::Write { addr, value } => {
            let Some(value) = resolve(proc, alloc, value)? else {
                return Ok(());
            };
            proc.heap_write(alloc, *addr, value)?;
        }

        Instruction::For { .. } => {
            // Programs are flattened at submission; a FOR can only get here
            // through a bug in expansion.
            warn!("pid {}: unexpanded FOR reached the interpreter", proc.pid());
        }
    }
    Ok(())
}

/// Resolves an operand; variable reads auto-declare and may shut the
/// process down (the `None` case).
fn resolve(
    proc: &Arc<Process>,
    alloc: &PagingAllocator,
    operand: &Operand,
) -> SimResult<Option<u16>> {
    match operand {
        Operand::Literal(v) => Ok(Some(*v)),
        Operand::Var(name) => proc.var_read(alloc, name),
    }
}
