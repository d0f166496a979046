//! Read-only, consistent-at-a-point views for process-smi, vmstat, and the
//! utilization report.
//!
//! Capturing takes each lock briefly in a fixed order (registry, then core
//! table, then the per-process control blocks, then allocator counters) and
//! copies everything out; it is a rare and comparatively slow operation, so
//! nothing here is optimized.

use serde::Serialize;
use types::{clock, Pid, Tick};

use crate::paging::PagingAllocator;
use crate::registry::ProcessRegistry;
use crate::scheduler::Scheduler;

#[derive(Clone, Debug, Serialize)]
pub struct ProcessSnapshot {
    pub name: String,
    pub pid: Pid,
    pub status: String,
    pub current_line: u64,
    pub total_lines: u64,
    pub core: Option<usize>,
    pub created_at: String,
    pub memory_bytes: u64,
    pub finished_tick: Option<Tick>,
    pub violation: Option<String>,
}

#[derive(Clone, Debug, Serialize)]
pub struct MemorySnapshot {
    pub total_bytes: u64,
    pub used_bytes: u64,
    pub free_bytes: u64,
    pub paged_in: u64,
    pub paged_out: u64,
}

#[derive(Clone, Debug, Serialize)]
pub struct TickSnapshot {
    pub total: Tick,
    pub active: u64,
    pub idle: u64,
}

#[derive(Clone, Debug, Serialize)]
pub struct SystemSnapshot {
    pub timestamp: String,
    pub total_cores: usize,
    pub available_cores: usize,
    /// Name of the process running on each core, if any.
    pub core_assignments: Vec<Option<String>>,
    pub processes: Vec<ProcessSnapshot>,
    pub memory: MemorySnapshot,
    pub ticks: TickSnapshot,
}

impl SystemSnapshot {
    /// CPU utilization in percent, derived from core occupancy.
    pub fn cpu_utilization(&self) -> f64 {
        if self.total_cores == 0 {
            return 0.0;
        }
        let busy = self.total_cores - self.available_cores;
        busy as f64 / self.total_cores as f64 * 100.0
    }

    /// Memory utilization in percent.
    pub fn memory_utilization(&self) -> f64 {
        if self.memory.total_bytes == 0 {
            return 0.0;
        }
        self.memory.used_bytes as f64 / self.memory.total_bytes as f64 * 100.0
    }
}

pub fn capture(
    registry: &ProcessRegistry,
    scheduler: &Scheduler,
    allocator: &PagingAllocator,
) -> SystemSnapshot {
    let handles = registry.all();
    let assignments = scheduler.core_assignments();

    let processes = handles
        .iter()
        .map(|proc| ProcessSnapshot {
            name: proc.name().to_string(),
            pid: proc.pid(),
            status: proc.status().as_str().to_string(),
            current_line: proc.current_line(),
            total_lines: proc.total_lines(),
            core: proc.core(),
            created_at: proc.created_at().to_string(),
            memory_bytes: proc.memory_usage(),
            finished_tick: proc.finished_tick(),
            violation: proc.violation(),
        })
        .collect();

    SystemSnapshot {
        timestamp: clock::timestamp_now(),
        total_cores: scheduler.total_cores(),
        available_cores: scheduler.available_cores(),
        core_assignments: assignments
            .iter()
            .map(|slot| slot.as_ref().map(|p| p.name().to_string()))
            .collect(),
        processes,
        memory: MemorySnapshot {
            total_bytes: allocator.total_memory(),
            used_bytes: allocator.used_memory(),
            free_bytes: allocator.free_memory(),
            paged_in: allocator.paged_in(),
            paged_out: allocator.paged_out(),
        },
        ticks: TickSnapshot {
            total: scheduler.current_tick(),
            active: scheduler.active_cpu_ticks(),
            idle: scheduler.idle_cpu_ticks(),
        },
    }
}
