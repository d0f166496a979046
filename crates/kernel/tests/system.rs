//! Scheduler-policy and supervisor-level behavior against real threads.

mod common;

use std::time::Duration;

use common::{await_done, test_config, Env};
use kernel::System;
use program::Instruction;
use types::{SchedulerKind, SimError};

#[test]
fn fcfs_finishes_in_arrival_order() {
    let mut config = test_config("sys-fcfs");
    config.num_cpu = 1;
    config.scheduler = SchedulerKind::Fcfs;
    let env = Env::build(config, Duration::from_micros(200));

    let program: Vec<Instruction> = (0..10).map(|i| common::print(&format!("{i}"))).collect();
    let first = env.spawn("first", 64, &program, true);
    let second = env.spawn("second", 64, &program, true);
    env.scheduler.schedule(first.clone());
    env.scheduler.schedule(second.clone());
    env.scheduler.start();
    await_done(&[first.clone(), second.clone()], Duration::from_secs(10));
    env.scheduler.shutdown();

    let (t1, t2) = (first.finished_tick().unwrap(), second.finished_tick().unwrap());
    assert!(t1 < t2, "FCFS ran second ({t2}) past first ({t1})");
    // On one FCFS core the second process cannot start before the first
    // ends, so it finishes at least a full program later.
    assert!(t2 >= t1 + program.len() as u64);
    env.cleanup();
}

#[test]
fn delays_per_exec_skips_ticks_but_counts_them() {
    let mut config = test_config("sys-delays");
    config.num_cpu = 1;
    config.scheduler = SchedulerKind::Fcfs;
    config.delays_per_exec = 2;
    let env = Env::build(config, Duration::from_micros(200));

    let program: Vec<Instruction> = (0..5).map(|i| common::print(&format!("{i}"))).collect();
    let proc = env.spawn("slowpoke", 64, &program, true);
    env.scheduler.schedule(proc.clone());
    env.scheduler.start();
    await_done(std::slice::from_ref(&proc), Duration::from_secs(10));
    env.scheduler.shutdown();

    // Instructions only advance on even ticks: five lines span at least
    // eight ticks of held core time.
    assert!(proc.finished_tick().unwrap() >= 8);
    assert_eq!(proc.log_lines().len(), 5);
    env.cleanup();
}

#[test]
fn scripted_processes_page_against_each_other() {
    let mut config = test_config("sys-paging");
    config.num_cpu = 2;
    config.scheduler = SchedulerKind::Rr;
    config.quantum_cycles = 3;
    config.max_overall_mem = 64;
    config.mem_per_frame = 16;
    let env = Env::build(config, Duration::from_micros(500));

    let program = program::parse::parse_script(r#"DECLARE a 5; ADD a a 1; PRINT("a=" + a)"#)
        .unwrap();
    let procs: Vec<_> = (0..3)
        .map(|i| env.spawn(&format!("pager-{i}"), 64, &program, false))
        .collect();
    for proc in &procs {
        env.scheduler.schedule(proc.clone());
    }
    env.scheduler.start();
    await_done(&procs, Duration::from_secs(10));
    env.scheduler.shutdown();

    for proc in &procs {
        let logs = proc.log_lines();
        assert!(
            logs.last().unwrap().ends_with("\"a=6\""),
            "{}: {logs:?}",
            proc.name()
        );
    }
    assert!(env.allocator.paged_in() >= 3);
    env.cleanup();
}

#[test]
fn system_runs_scripted_processes_end_to_end() {
    let mut config = test_config("sys-e2e");
    config.num_cpu = 2;
    let system = System::init_with_tick(config, Duration::from_micros(500)).unwrap();

    let proc = system
        .create_scripted("worker", 128, r#"DECLARE x 1; ADD x x 41; PRINT("x is " + x)"#)
        .unwrap();
    await_done(std::slice::from_ref(&proc), Duration::from_secs(10));

    let snapshot = system.snapshot();
    let view = snapshot.processes.iter().find(|p| p.name == "worker").unwrap();
    assert_eq!(view.status, "DONE");
    assert_eq!(view.current_line, 3);
    assert_eq!(view.total_lines, 3);
    assert_eq!(view.memory_bytes, 128);

    // The finished process flushed its log file.
    let log_path = system.config.logs_dir.join("worker.txt");
    let text = std::fs::read_to_string(&log_path).unwrap();
    assert!(text.contains("\"x is 42\""), "log file was: {text}");

    system.shutdown();
    std::fs::remove_file(&system.config.backing_store_path).ok();
    std::fs::remove_dir_all(&system.config.logs_dir).ok();
}

#[test]
fn creation_rejections_have_no_side_effects() {
    let mut config = test_config("sys-reject");
    config.num_cpu = 1;
    let system = System::init_with_tick(config, Duration::from_millis(1)).unwrap();

    system.create_scripted("taken", 128, "DECLARE x 1").unwrap();
    let dup = system.create_scripted("taken", 128, "DECLARE x 1");
    assert!(matches!(dup, Err(SimError::DuplicateName(_))));

    let bad_mem = system.create_scripted("badmem", 100, "DECLARE x 1");
    assert!(matches!(bad_mem, Err(SimError::InvalidScript(_))));

    let too_small = system.create_scripted("small", 64, "DECLARE x 1; SLEEP 1");
    assert!(matches!(too_small, Err(SimError::InvalidScript(_))));

    let bad_script = system.create_scripted("badscript", 128, "HALT AND CATCH FIRE");
    assert!(matches!(bad_script, Err(SimError::InvalidScript(_))));

    // Only the successful create registered anything.
    assert_eq!(system.registry.count(), 1);

    system.shutdown();
    std::fs::remove_file(&system.config.backing_store_path).ok();
    std::fs::remove_dir_all(&system.config.logs_dir).ok();
}

#[test]
fn batch_generation_creates_and_stops() {
    let mut config = test_config("sys-batch");
    config.num_cpu = 2;
    config.batch_process_freq = 1;
    config.min_ins = 3;
    config.max_ins = 6;
    config.min_mem_per_proc = 64;
    config.max_mem_per_proc = 128;
    config.rng_seed = 7;
    let system = System::init_with_tick(config, Duration::from_micros(500)).unwrap();

    assert!(system.start_batch_generation());
    assert!(!system.start_batch_generation(), "second start must report running");
    std::thread::sleep(Duration::from_millis(50));
    assert!(system.stop_batch_generation());
    assert!(!system.stop_batch_generation(), "second stop must report stopped");

    let created = system.registry.count();
    assert!(created > 0, "generator never created a process");
    assert!(system.registry.by_name("process_00").is_some());

    let after = system.registry.count();
    std::thread::sleep(Duration::from_millis(20));
    assert_eq!(system.registry.count(), after, "generator kept running after stop");

    system.shutdown();
    std::fs::remove_file(&system.config.backing_store_path).ok();
    std::fs::remove_dir_all(&system.config.logs_dir).ok();
}

/// SLEEP 0 yields at least the current tick: the process goes through the
/// wait heap and resumes no earlier than the next tick.
#[test]
fn sleep_zero_still_yields() {
    let mut config = test_config("sys-sleep0");
    config.num_cpu = 1;
    let env = Env::build(config, Duration::from_micros(500));

    let program = [Instruction::Sleep { ticks: 0 }, common::print("woke")];
    let proc = env.spawn("napper", 64, &program, true);
    env.scheduler.schedule(proc.clone());
    env.scheduler.start();
    await_done(std::slice::from_ref(&proc), Duration::from_secs(10));
    env.scheduler.shutdown();

    let slept_at = proc.wakeup_tick();
    let finished = proc.finished_tick().unwrap();
    assert!(finished > slept_at, "resumed in the same tick it slept");
    env.cleanup();
}
