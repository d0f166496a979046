//! The tick-synchronized multi-core scheduler.
//!
//! One driver thread and N workers meet at an (N+1)-arity barrier once per
//! tick. The barrier's completion callback is the clock edge: it increments
//! the global tick counter, wakes every sleeper whose time has come, and
//! pokes the batch generator. Workers dequeue READY processes, run them
//! under the configured policy (FCFS to completion, RR for a quantum of
//! ticks), and re-arrive at the barrier once per tick whether or not they
//! had work — so `active + idle` ticks per core always equals the global
//! tick count.
//!
//! Shutdown clears `running`; the driver and each worker leave the barrier
//! with `arrive_and_drop`, so nobody is left stranded mid-tick.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::thread;
use std::time::Duration;

use log::{debug, error, info};
use types::{Config, ProcessStatus, SchedulerKind, Tick};

use crate::barrier::TickBarrier;
use crate::exec;
use crate::paging::PagingAllocator;
use crate::process::ProcessHandle;

/// Builder for generated processes, invoked on the generator thread each
/// time `batch_process_freq` ticks elapse. `None` means creation failed
/// (e.g. a name collision) and the round is skipped.
pub type BatchFactory = Box<dyn Fn() -> Option<ProcessHandle> + Send + 'static>;

struct Sleeper {
    wakeup: Tick,
    seq: u64,
    proc: ProcessHandle,
}

// BinaryHeap is a max-heap; order sleepers so the earliest wakeup (ties
// broken by arrival order) surfaces first.
impl Ord for Sleeper {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .wakeup
            .cmp(&self.wakeup)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Sleeper {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Sleeper {
    fn eq(&self, other: &Self) -> bool {
        self.wakeup == other.wakeup && self.seq == other.seq
    }
}

impl Eq for Sleeper {}

#[derive(Default)]
struct Threads {
    workers: Vec<thread::JoinHandle<()>>,
    tick: Option<thread::JoinHandle<()>>,
    generator: Option<thread::JoinHandle<()>>,
}

pub struct Scheduler {
    config: Config,
    allocator: Arc<PagingAllocator>,
    tick_period: Duration,

    barrier: OnceLock<TickBarrier>,
    ready: Mutex<VecDeque<ProcessHandle>>,
    wait: Mutex<BinaryHeap<Sleeper>>,
    cores: Mutex<Vec<Option<ProcessHandle>>>,

    ticks: AtomicU64,
    active_ticks: Vec<AtomicU64>,
    idle_ticks: Vec<AtomicU64>,
    sleep_seq: AtomicU64,

    running: AtomicBool,
    generating: AtomicBool,
    tick_signal: Mutex<()>,
    tick_cv: Condvar,
    threads: Mutex<Threads>,
}

impl Scheduler {
    pub fn new(
        config: &Config,
        allocator: Arc<PagingAllocator>,
        tick_period: Duration,
    ) -> Arc<Self> {
        let cores = config.num_cpu as usize;
        Arc::new(Self {
            config: config.clone(),
            allocator,
            tick_period,
            barrier: OnceLock::new(),
            ready: Mutex::new(VecDeque::new()),
            wait: Mutex::new(BinaryHeap::new()),
            cores: Mutex::new(vec![None; cores]),
            ticks: AtomicU64::new(0),
            active_ticks: (0..cores).map(|_| AtomicU64::new(0)).collect(),
            idle_ticks: (0..cores).map(|_| AtomicU64::new(0)).collect(),
            sleep_seq: AtomicU64::new(0),
            running: AtomicBool::new(false),
            generating: AtomicBool::new(false),
            tick_signal: Mutex::new(()),
            tick_cv: Condvar::new(),
            threads: Mutex::new(Threads::default()),
        })
    }

    /// Spawns the workers and the tick driver. Idempotent.
    pub fn start(self: &Arc<Self>) {
        if self.barrier.get().is_some() {
            return;
        }
        self.running.store(true, Ordering::SeqCst);

        let weak = Arc::downgrade(self);
        let barrier = TickBarrier::new(
            self.config.num_cpu as usize + 1,
            Box::new(move || {
                if let Some(scheduler) = weak.upgrade() {
                    scheduler.on_tick_complete();
                }
            }),
        );
        if self.barrier.set(barrier).is_err() {
            return;
        }

        let mut threads = self.threads.lock().expect("thread table poisoned");
        for core in 0..self.config.num_cpu as usize {
            let scheduler = Arc::clone(self);
            threads.workers.push(
                thread::Builder::new()
                    .name(format!("core-{core}"))
                    .spawn(move || scheduler.worker_loop(core))
                    .expect("failed to spawn worker"),
            );
        }
        let scheduler = Arc::clone(self);
        threads.tick = Some(
            thread::Builder::new()
                .name("tick".into())
                .spawn(move || scheduler.tick_loop())
                .expect("failed to spawn tick thread"),
        );
        info!(
            "scheduler started: {} cores, {} policy",
            self.config.num_cpu, self.config.scheduler
        );
    }

    /// Stops generation, the driver, and the workers, joining in reverse
    /// construction order.
    pub fn shutdown(&self) {
        self.stop_batch_generation();
        self.running.store(false, Ordering::SeqCst);
        {
            let _signal = self.tick_signal.lock().expect("tick signal poisoned");
        }
        self.tick_cv.notify_all();

        let mut threads = self.threads.lock().expect("thread table poisoned");
        if let Some(tick) = threads.tick.take() {
            tick.join().ok();
        }
        for worker in threads.workers.drain(..) {
            worker.join().ok();
        }
        debug!("scheduler stopped at tick {}", self.current_tick());
    }

    /// Appends a READY process to the back of the global queue.
    pub fn schedule(&self, proc: ProcessHandle) {
        proc.set_status(ProcessStatus::Ready);
        self.ready.lock().expect("ready queue poisoned").push_back(proc);
    }

    /// Parks a WAITING process until `wakeup`. Called from the worker that
    /// just executed its SLEEP.
    pub fn sleep_process(&self, proc: ProcessHandle, wakeup: Tick) {
        let seq = self.sleep_seq.fetch_add(1, Ordering::Relaxed);
        self.wait
            .lock()
            .expect("wait heap poisoned")
            .push(Sleeper { wakeup, seq, proc });
    }

    // ---- the three loops -------------------------------------------------

    fn tick_loop(&self) {
        let barrier = self.barrier();
        while self.running.load(Ordering::SeqCst) {
            thread::sleep(self.tick_period);
            barrier.arrive_and_wait();
        }
        barrier.arrive_and_drop();
    }

    fn worker_loop(&self, core: usize) {
        let barrier = self.barrier();
        while self.running.load(Ordering::SeqCst) {
            let proc = self.ready.lock().expect("ready queue poisoned").pop_front();
            let Some(proc) = proc else {
                self.idle_ticks[core].fetch_add(1, Ordering::Relaxed);
                barrier.arrive_and_wait();
                continue;
            };

            proc.set_status(ProcessStatus::Running);
            proc.set_core(Some(core));
            self.cores.lock().expect("core table poisoned")[core] = Some(proc.clone());

            let preempted = match self.config.scheduler {
                SchedulerKind::Fcfs => {
                    self.run_fcfs(&proc, core);
                    false
                }
                SchedulerKind::Rr => self.run_rr(&proc, core),
            };

            // Release the core before re-enqueueing a preempted process so
            // no other worker can pick it up while it still looks assigned.
            self.release_core(&proc, core);
            if preempted {
                self.schedule(proc);
            }
        }
        barrier.arrive_and_drop();
    }

    fn generator_loop(&self, make: BatchFactory) {
        let interval = self.config.batch_process_freq;
        let mut last = self.current_tick();
        while self.generating.load(Ordering::SeqCst) {
            {
                let signal = self.tick_signal.lock().expect("tick signal poisoned");
                let _signal = self
                    .tick_cv
                    .wait_while(signal, |_| {
                        self.generating.load(Ordering::SeqCst)
                            && self.current_tick().saturating_sub(last) < interval
                    })
                    .expect("tick signal poisoned");
            }
            if !self.generating.load(Ordering::SeqCst) {
                break;
            }
            last = self.current_tick();
            if let Some(proc) = make() {
                debug!("batch generator created {} (pid {})", proc.name(), proc.pid());
                self.schedule(proc);
            }
        }
    }

    // ---- policies --------------------------------------------------------

    /// FCFS holds the core until the process stops RUNNING.
    fn run_fcfs(&self, proc: &ProcessHandle, core: usize) {
        let barrier = self.barrier();
        while self.running.load(Ordering::SeqCst) && proc.status() == ProcessStatus::Running {
            self.one_step(proc, core);
            self.active_ticks[core].fetch_add(1, Ordering::Relaxed);
            barrier.arrive_and_wait();
        }
    }

    /// RR runs at most `quantum_cycles` ticks. Delay-skipped ticks still
    /// consume quantum. Returns true when the process used its full quantum
    /// and must go back to the ready queue.
    fn run_rr(&self, proc: &ProcessHandle, core: usize) -> bool {
        let barrier = self.barrier();
        let quantum = u64::from(self.config.quantum_cycles);
        let mut used = 0;
        while self.running.load(Ordering::SeqCst)
            && proc.status() == ProcessStatus::Running
            && used < quantum
        {
            self.one_step(proc, core);
            used += 1;
            self.active_ticks[core].fetch_add(1, Ordering::Relaxed);
            barrier.arrive_and_wait();
        }
        proc.status() == ProcessStatus::Running && used >= quantum
    }

    /// One tick of one process: advance an instruction unless this tick is
    /// delay-skipped. Either way the tick counts as active CPU time.
    fn one_step(&self, proc: &ProcessHandle, core: usize) {
        let tick = self.current_tick();
        let delays = u64::from(self.config.delays_per_exec);
        if delays != 0 && tick % delays != 0 {
            return;
        }
        if let Err(err) = exec::step(proc, self, &self.allocator, tick, core) {
            error!("pid {} step failed: {err}", proc.pid());
            proc.shutdown_internal(&err.to_string());
        }
    }

    fn release_core(&self, proc: &ProcessHandle, core: usize) {
        self.cores.lock().expect("core table poisoned")[core] = None;
        proc.set_core(None);
        if proc.status() == ProcessStatus::Done {
            proc.mark_finished(self.current_tick());
            if let Err(err) = self.allocator.deallocate(proc.pid()) {
                error!("deallocating pid {} failed: {err}", proc.pid());
            }
        }
    }

    // ---- the clock edge --------------------------------------------------

    /// Barrier completion: advance the clock, wake due sleepers, signal the
    /// generator. Runs while every participant is parked at the barrier.
    fn on_tick_complete(&self) {
        let now = self.ticks.fetch_add(1, Ordering::SeqCst) + 1;

        let mut wait = self.wait.lock().expect("wait heap poisoned");
        while wait.peek().is_some_and(|s| s.wakeup <= now) {
            let sleeper = wait.pop().expect("peeked sleeper vanished");
            if sleeper.proc.status() == ProcessStatus::Done {
                // Finished on its final SLEEP line; free what it still holds.
                if let Err(err) = self.allocator.deallocate(sleeper.proc.pid()) {
                    error!("deallocating pid {} failed: {err}", sleeper.proc.pid());
                }
            } else {
                sleeper.proc.set_status(ProcessStatus::Ready);
                self.ready
                    .lock()
                    .expect("ready queue poisoned")
                    .push_back(sleeper.proc);
            }
        }
        drop(wait);

        {
            let _signal = self.tick_signal.lock().expect("tick signal poisoned");
        }
        self.tick_cv.notify_all();
    }

    // ---- batch generation ------------------------------------------------

    /// Starts the generator thread. Returns false if it was already running.
    pub fn start_batch_generation(self: &Arc<Self>, make: BatchFactory) -> bool {
        if self.generating.swap(true, Ordering::SeqCst) {
            return false;
        }
        let scheduler = Arc::clone(self);
        let handle = thread::Builder::new()
            .name("batch-gen".into())
            .spawn(move || scheduler.generator_loop(make))
            .expect("failed to spawn generator");
        self.threads.lock().expect("thread table poisoned").generator = Some(handle);
        true
    }

    /// Stops and joins the generator thread. Returns false if it was not
    /// running.
    pub fn stop_batch_generation(&self) -> bool {
        if !self.generating.swap(false, Ordering::SeqCst) {
            return false;
        }
        {
            let _signal = self.tick_signal.lock().expect("tick signal poisoned");
        }
        self.tick_cv.notify_all();
        let generator = self.threads.lock().expect("thread table poisoned").generator.take();
        if let Some(handle) = generator {
            handle.join().ok();
        }
        true
    }

    pub fn is_generating(&self) -> bool {
        self.generating.load(Ordering::SeqCst)
    }

    // ---- statistics ------------------------------------------------------

    pub fn current_tick(&self) -> Tick {
        self.ticks.load(Ordering::SeqCst)
    }

    pub fn total_cores(&self) -> usize {
        self.config.num_cpu as usize
    }

    pub fn available_cores(&self) -> usize {
        self.cores
            .lock()
            .expect("core table poisoned")
            .iter()
            .filter(|slot| slot.is_none())
            .count()
    }

    pub fn core_assignments(&self) -> Vec<Option<ProcessHandle>> {
        self.cores.lock().expect("core table poisoned").clone()
    }

    pub fn active_cpu_ticks(&self) -> u64 {
        self.active_ticks.iter().map(|t| t.load(Ordering::Relaxed)).sum()
    }

    pub fn idle_cpu_ticks(&self) -> u64 {
        self.idle_ticks.iter().map(|t| t.load(Ordering::Relaxed)).sum()
    }

    /// Per-core `(active, idle)` tick counts.
    pub fn per_core_ticks(&self) -> Vec<(u64, u64)> {
        self.active_ticks
            .iter()
            .zip(&self.idle_ticks)
            .map(|(a, i)| (a.load(Ordering::Relaxed), i.load(Ordering::Relaxed)))
            .collect()
    }

    pub fn ready_count(&self) -> usize {
        self.ready.lock().expect("ready queue poisoned").len()
    }

    pub fn waiting_count(&self) -> usize {
        self.wait.lock().expect("wait heap poisoned").len()
    }

    fn barrier(&self) -> &TickBarrier {
        self.barrier.get().expect("scheduler not started")
    }
}
