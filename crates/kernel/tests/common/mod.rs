//! Shared fixtures: isolated configs (own backing store and logs dir per
//! test), component construction without the CLI layer, and two ways to run
//! programs — a deterministic single-stepped drive for exact-tick
//! assertions, and a real threaded scheduler for concurrency scenarios.

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use kernel::process::Process;
use kernel::{exec, PagingAllocator, ProcessHandle, ProcessRegistry, Scheduler};
use program::Instruction;
use types::{Config, ProcessStatus, Tick};

pub fn unique_path(tag: &str, suffix: &str) -> PathBuf {
    std::env::temp_dir().join(format!(
        "sim-{tag}-{}-{:?}{suffix}",
        std::process::id(),
        std::thread::current().id()
    ))
}

/// A default config whose file side effects stay out of the repo.
pub fn test_config(tag: &str) -> Config {
    Config {
        backing_store_path: unique_path(tag, "-store.txt"),
        logs_dir: unique_path(tag, "-logs"),
        ..Config::default()
    }
}

pub struct Env {
    pub config: Config,
    pub registry: Arc<ProcessRegistry>,
    pub allocator: Arc<PagingAllocator>,
    pub scheduler: Arc<Scheduler>,
}

impl Env {
    /// Components wired together but with no threads running; callers either
    /// drive processes manually or call `scheduler.start()` themselves.
    pub fn build(config: Config, tick_period: Duration) -> Self {
        let registry = Arc::new(ProcessRegistry::new());
        let allocator =
            Arc::new(PagingAllocator::new(&config, registry.clone()).expect("allocator"));
        let scheduler = Scheduler::new(&config, allocator.clone(), tick_period);
        Self { config, registry, allocator, scheduler }
    }

    pub fn spawn(
        &self,
        name: &str,
        requested_memory: u64,
        program: &[Instruction],
        account_text: bool,
    ) -> ProcessHandle {
        let logs_dir = self.config.logs_dir.clone();
        let frame = self.config.mem_per_frame;
        let proc = self
            .registry
            .register(name, |pid| Process::new(pid, name, requested_memory, frame, logs_dir))
            .expect("register");
        proc.submit_instructions(program, account_text);
        proc
    }

    /// Deterministic single-core execution: one instruction per tick, SLEEP
    /// fast-forwards the clock to the wakeup tick. Returns the tick after
    /// the last executed step.
    pub fn drive(&self, proc: &ProcessHandle, max_ticks: u64) -> Tick {
        proc.set_status(ProcessStatus::Running);
        proc.set_core(Some(0));
        let mut tick: Tick = 0;
        let mut steps = 0;
        while steps < max_ticks {
            match proc.status() {
                ProcessStatus::Done => break,
                ProcessStatus::Waiting => {
                    tick = proc.wakeup_tick().max(tick);
                    proc.set_status(ProcessStatus::Running);
                }
                ProcessStatus::Ready => proc.set_status(ProcessStatus::Running),
                ProcessStatus::Running => {
                    exec::step(proc, &self.scheduler, &self.allocator, tick, 0).expect("step");
                    tick += 1;
                    steps += 1;
                }
            }
        }
        tick
    }

    pub fn cleanup(&self) {
        std::fs::remove_file(&self.config.backing_store_path).ok();
        std::fs::remove_dir_all(&self.config.logs_dir).ok();
    }
}

/// Polls until every handle is DONE. Panics on timeout so a hung scheduler
/// fails loudly instead of wedging the suite.
pub fn await_done(handles: &[ProcessHandle], timeout: Duration) {
    let deadline = Instant::now() + timeout;
    loop {
        if handles.iter().all(|p| p.status() == ProcessStatus::Done) {
            return;
        }
        assert!(
            Instant::now() < deadline,
            "processes did not finish: {:?}",
            handles
                .iter()
                .map(|p| (p.name().to_string(), p.status(), p.current_line(), p.total_lines()))
                .collect::<Vec<_>>()
        );
        std::thread::sleep(Duration::from_millis(2));
    }
}

pub fn print(message: &str) -> Instruction {
    Instruction::Print { message: message.to_string(), var: None }
}
