//! The supervisor: owns the subsystems, creates processes, serves queries.
//!
//! `System::init` wires everything in dependency order (config, registry,
//! allocator, scheduler — the registry precedes the allocator because the
//! allocator resolves victim PIDs through it) and `shutdown` tears down in
//! reverse. There is no global state: tests build as many `System`s as they
//! like, each with its own backing-store path.

use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use log::info;
use program::gen::{self, GenParams};
use program::{parse, Rng};
use types::{Config, SimError, SimResult};

use crate::paging::PagingAllocator;
use crate::process::{Process, ProcessHandle};
use crate::registry::ProcessRegistry;
use crate::scheduler::Scheduler;
use crate::snapshot::{self, SystemSnapshot};

/// Nominal tick period; tests pass something much shorter.
pub const DEFAULT_TICK_PERIOD: Duration = Duration::from_millis(1);

pub struct System {
    pub config: Config,
    pub registry: Arc<ProcessRegistry>,
    pub allocator: Arc<PagingAllocator>,
    pub scheduler: Arc<Scheduler>,
    rng: Mutex<Rng>,
}

impl System {
    pub fn init(config: Config) -> SimResult<Arc<Self>> {
        Self::init_with_tick(config, DEFAULT_TICK_PERIOD)
    }

    /// Constructs and starts the whole simulator. The tick period is a
    /// construction knob, not a config key.
    pub fn init_with_tick(config: Config, tick_period: Duration) -> SimResult<Arc<Self>> {
        let registry = Arc::new(ProcessRegistry::new());
        let allocator = Arc::new(PagingAllocator::new(&config, registry.clone())?);
        let scheduler = Scheduler::new(&config, allocator.clone(), tick_period);

        let seed = match config.rng_seed {
            0 => {
                let derived = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_nanos() as u64)
                    .unwrap_or(1);
                info!("rng-seed not pinned; derived seed {derived}");
                derived
            }
            pinned => pinned,
        };

        let system = Arc::new(Self {
            config,
            registry,
            allocator,
            scheduler,
            rng: Mutex::new(Rng::new(seed)),
        });
        system.scheduler.start();
        Ok(system)
    }

    /// Reverse of `init`: the scheduler goes down first; the allocator and
    /// registry are passive once no thread runs.
    pub fn shutdown(&self) {
        self.scheduler.shutdown();
    }

    // ---- process creation ------------------------------------------------

    /// `screen -s`: an alternating PRINT / ADD program in the configured
    /// instruction range, with `mem_per_proc` bytes of memory plus text.
    pub fn create_interactive(&self, name: &str) -> SimResult<ProcessHandle> {
        let program = {
            let mut rng = self.rng.lock().expect("rng poisoned");
            gen::alternating_print_add(&mut rng, self.config.min_ins, self.config.max_ins)
        };
        let proc = self.register(name, self.config.mem_per_proc as u64)?;
        proc.submit_instructions(&program, true);
        self.scheduler.schedule(proc.clone());
        Ok(proc)
    }

    /// `screen -c`: user-supplied script and memory size. The size must be
    /// a power of two in [64, 65536] and large enough for text plus the
    /// symbol table; the script may hold 1 to 50 instructions.
    pub fn create_scripted(
        &self,
        name: &str,
        mem_size: u64,
        script: &str,
    ) -> SimResult<ProcessHandle> {
        if !(64..=65_536).contains(&mem_size) || !mem_size.is_power_of_two() {
            return Err(SimError::InvalidScript(format!(
                "memory size must be a power of two in [64, 65536], got {mem_size}"
            )));
        }
        let program = parse::parse_script(script)?;
        gen::validate_script_shape(program.len(), mem_size).map_err(SimError::InvalidScript)?;

        let proc = self.register(name, mem_size)?;
        // The user-supplied size already covers text and symbol table.
        proc.submit_instructions(&program, false);
        self.scheduler.schedule(proc.clone());
        Ok(proc)
    }

    /// Batch-generated process: random memory (a power of two between the
    /// configured bounds) and a random program.
    pub fn create_generated(&self, name: &str) -> SimResult<ProcessHandle> {
        let proc = self.create_generated_unscheduled(name)?;
        self.scheduler.schedule(proc.clone());
        Ok(proc)
    }

    fn register(&self, name: &str, memory: u64) -> SimResult<ProcessHandle> {
        let logs_dir = self.config.logs_dir.clone();
        let frame = self.config.mem_per_frame;
        self.registry
            .register(name, |pid| Process::new(pid, name, memory, frame, logs_dir))
    }

    // ---- batch generation ------------------------------------------------

    /// Starts auto-creation of `process_<k>` every `batch_process_freq`
    /// ticks. Returns false when generation is already running.
    pub fn start_batch_generation(self: &Arc<Self>) -> bool {
        let weak: Weak<System> = Arc::downgrade(self);
        self.scheduler.start_batch_generation(Box::new(move || {
            let system = weak.upgrade()?;
            let name = format!("process_{:02}", system.registry.count());
            match system.create_generated_unscheduled(&name) {
                Ok(proc) => Some(proc),
                Err(err) => {
                    log::warn!("batch generation skipped a round: {err}");
                    None
                }
            }
        }))
    }

    pub fn stop_batch_generation(&self) -> bool {
        self.scheduler.stop_batch_generation()
    }

    /// Like `create_generated` but leaves scheduling to the caller (the
    /// generator loop enqueues the handle it gets back).
    fn create_generated_unscheduled(&self, name: &str) -> SimResult<ProcessHandle> {
        let (program, memory) = {
            let mut rng = self.rng.lock().expect("rng poisoned");
            let memory = random_mem_size(
                &mut rng,
                self.config.min_mem_per_proc as u64,
                self.config.max_mem_per_proc as u64,
            );
            let program = gen::generate_program(
                &mut rng,
                &GenParams {
                    process_name: name,
                    min_ins: self.config.min_ins,
                    max_ins: self.config.max_ins,
                    required_memory: memory,
                },
            );
            (program, memory)
        };
        let proc = self.register(name, memory)?;
        proc.submit_instructions(&program, true);
        Ok(proc)
    }

    // ---- queries ---------------------------------------------------------

    pub fn snapshot(&self) -> SystemSnapshot {
        snapshot::capture(&self.registry, &self.scheduler, &self.allocator)
    }
}

/// Random power of two in `[min, max]`; both bounds are already powers of
/// two from config clamping.
fn random_mem_size(rng: &mut Rng, min: u64, max: u64) -> u64 {
    let lo = min.trailing_zeros() as u64;
    let hi = max.trailing_zeros() as u64;
    1 << rng.range(lo, hi)
}
