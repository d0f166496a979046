//! Structural invariants of the allocator and scheduler.

mod common;

use std::collections::HashSet;
use std::time::Duration;

use common::{await_done, test_config, Env};
use program::Instruction;
use types::ProcessStatus;

/// Per core, `active + idle` always equals the global tick count once the
/// scheduler has quiesced: a worker contributes exactly one tick-unit per
/// barrier round.
#[test]
fn core_tick_accounting_is_exact() {
    let mut config = test_config("inv-ticks");
    config.num_cpu = 3;
    let env = Env::build(config, Duration::from_micros(200));

    let program: Vec<Instruction> = (0..4).map(|i| common::print(&format!("{i}"))).collect();
    let procs: Vec<_> = (0..5)
        .map(|i| env.spawn(&format!("ticker-{i}"), 64, &program, true))
        .collect();
    for proc in &procs {
        env.scheduler.schedule(proc.clone());
    }
    env.scheduler.start();
    await_done(&procs, Duration::from_secs(10));
    env.scheduler.shutdown();

    let total = env.scheduler.current_tick();
    for (core, (active, idle)) in env.scheduler.per_core_ticks().iter().enumerate() {
        assert_eq!(
            active + idle,
            total,
            "core {core}: active {active} + idle {idle} != T {total}"
        );
    }
    env.cleanup();
}

/// `current_line` grows monotonically and never passes `total_lines`.
#[test]
fn line_counter_is_monotone_and_bounded() {
    let mut config = test_config("inv-lines");
    config.num_cpu = 2;
    let env = Env::build(config, Duration::from_micros(500));

    let program: Vec<Instruction> = (0..30).map(|i| common::print(&format!("{i}"))).collect();
    let procs: Vec<_> = (0..4)
        .map(|i| env.spawn(&format!("mono-{i}"), 64, &program, true))
        .collect();
    for proc in &procs {
        env.scheduler.schedule(proc.clone());
    }
    env.scheduler.start();

    let mut last: Vec<u64> = vec![0; procs.len()];
    for _ in 0..200 {
        for (i, proc) in procs.iter().enumerate() {
            let line = proc.current_line();
            assert!(line >= last[i], "line counter moved backwards");
            assert!(line <= proc.total_lines(), "line counter passed the end");
            last[i] = line;
        }
        if procs.iter().all(|p| p.status() == ProcessStatus::Done) {
            break;
        }
        std::thread::sleep(Duration::from_millis(1));
    }

    await_done(&procs, Duration::from_secs(10));
    env.scheduler.shutdown();
    env.cleanup();
}

/// A frame is free exactly when it sits on the free list, and every
/// resident (pid, page) occupies exactly one frame which its page table
/// points back at.
#[test]
fn frame_table_and_page_tables_agree() {
    let mut config = test_config("inv-frames");
    config.max_overall_mem = 64;
    config.mem_per_frame = 16;
    let env = Env::build(config, Duration::from_millis(1));

    // Three two-page processes contending for four frames.
    let procs: Vec<_> = (0..3)
        .map(|i| env.spawn(&format!("frames-{i}"), 32, &[], false))
        .collect();
    for round in 0..4 {
        for proc in &procs {
            let page = round % 2;
            env.allocator.handle_page_fault(proc, page).unwrap();
            let frame = proc.page_entry(page).unwrap().frame.unwrap();
            assert!(env.allocator.pin_frame(frame, proc.pid(), page));
            env.allocator.write_frame(frame, 0, round as u16).unwrap();
        }
    }

    let frames = env.allocator.frame_views();
    let free: HashSet<usize> = env.allocator.free_frames().into_iter().collect();

    let mut seen = HashSet::new();
    for (idx, frame) in frames.iter().enumerate() {
        match frame.owner {
            None => assert!(free.contains(&idx), "unowned frame {idx} not on free list"),
            Some(owner) => {
                assert!(!free.contains(&idx), "owned frame {idx} on free list");
                assert!(seen.insert(owner), "duplicate resident page {owner:?}");
            }
        }
    }

    for proc in &procs {
        for (page, entry) in proc.page_table_view().iter().enumerate() {
            if entry.valid {
                let frame = entry.frame.expect("valid entry without frame");
                assert_eq!(
                    frames[frame].owner,
                    Some((proc.pid(), page)),
                    "page table and frame disagree"
                );
            }
        }
    }
    env.cleanup();
}

/// Deallocation is idempotent: the second call finds nothing to do.
#[test]
fn deallocate_twice_is_deallocate_once() {
    let mut config = test_config("inv-dealloc");
    config.max_overall_mem = 64;
    config.mem_per_frame = 16;
    let env = Env::build(config, Duration::from_millis(1));

    let proc = env.spawn("doomed", 48, &[], false);
    for page in 0..3 {
        env.allocator.handle_page_fault(&proc, page).unwrap();
        let frame = proc.page_entry(page).unwrap().frame.unwrap();
        assert!(env.allocator.pin_frame(frame, proc.pid(), page));
        env.allocator.write_frame(frame, 0, 7).unwrap();
    }

    env.allocator.deallocate(proc.pid()).unwrap();
    let frames_once = format!("{:?}", env.allocator.frame_views());
    let free_once = env.allocator.free_frames();
    let store_once = env.allocator.backing_store_empty().unwrap();

    env.allocator.deallocate(proc.pid()).unwrap();
    assert_eq!(format!("{:?}", env.allocator.frame_views()), frames_once);
    assert_eq!(env.allocator.free_frames(), free_once);
    assert_eq!(env.allocator.backing_store_empty().unwrap(), store_once);
    assert_eq!(env.allocator.used_memory(), 0);
    env.cleanup();
}

/// With no pinning in the way, victims leave in exactly the order their
/// frames were admitted.
#[test]
fn victim_selection_is_fifo() {
    let mut config = test_config("inv-fifo");
    config.max_overall_mem = 48;
    config.mem_per_frame = 16;
    let env = Env::build(config, Duration::from_millis(1));

    // Six pages, three frames. Touch pages 0..3 to fill the frames, then
    // each further fault must evict the oldest admission.
    let proc = env.spawn("fifo", 96, &[], false);
    for page in 0..3 {
        env.allocator.handle_page_fault(&proc, page).unwrap();
        let frame = proc.page_entry(page).unwrap().frame.unwrap();
        assert!(env.allocator.pin_frame(frame, proc.pid(), page));
        env.allocator.write_frame(frame, 0, page as u16).unwrap();
    }

    for (next_page, expected_victim) in (3..6).zip(0..3) {
        env.allocator.handle_page_fault(&proc, next_page).unwrap();
        let table = proc.page_table_view();
        assert!(
            !table[expected_victim].valid,
            "page {expected_victim} should have been the FIFO victim"
        );
        for (page, entry) in table.iter().enumerate() {
            let should_be_resident = page > expected_victim && page <= next_page;
            assert_eq!(
                entry.valid, should_be_resident,
                "page {page} residency after faulting page {next_page}"
            );
        }
    }
    env.cleanup();
}

/// The dirty bit gates swap-out: an unwritten page is dropped without I/O,
/// a written one is appended to the store.
#[test]
fn only_dirty_pages_reach_the_store() {
    let mut config = test_config("inv-dirty");
    config.max_overall_mem = 16;
    config.mem_per_frame = 16;
    let env = Env::build(config, Duration::from_millis(1));

    let clean = env.spawn("clean", 16, &[], false);
    let dirty = env.spawn("dirty", 16, &[], false);

    // Fault the clean page in and read it, then evict it via the other
    // process's fault: nothing may hit the store.
    env.allocator.handle_page_fault(&clean, 0).unwrap();
    let frame = clean.page_entry(0).unwrap().frame.unwrap();
    assert!(env.allocator.pin_frame(frame, clean.pid(), 0));
    env.allocator.read_frame(frame, 0).unwrap();

    env.allocator.handle_page_fault(&dirty, 0).unwrap();
    assert_eq!(env.allocator.paged_out(), 0);
    assert!(env.allocator.backing_store_empty().unwrap());

    // Now dirty the resident page and evict it: exactly one record.
    let frame = dirty.page_entry(0).unwrap().frame.unwrap();
    assert!(env.allocator.pin_frame(frame, dirty.pid(), 0));
    env.allocator.write_frame(frame, 0, 99).unwrap();

    env.allocator.handle_page_fault(&clean, 0).unwrap();
    assert_eq!(env.allocator.paged_out(), 1);
    assert!(!env.allocator.backing_store_empty().unwrap());
    env.cleanup();
}

/// A process is never assigned to two cores at once.
#[test]
fn core_assignments_are_disjoint() {
    let mut config = test_config("inv-cores");
    config.num_cpu = 4;
    let env = Env::build(config, Duration::from_micros(500));

    let program: Vec<Instruction> = (0..50).map(|i| common::print(&format!("{i}"))).collect();
    let procs: Vec<_> = (0..6)
        .map(|i| env.spawn(&format!("disjoint-{i}"), 64, &program, true))
        .collect();
    for proc in &procs {
        env.scheduler.schedule(proc.clone());
    }
    env.scheduler.start();

    for _ in 0..100 {
        let names: Vec<String> = env
            .scheduler
            .core_assignments()
            .into_iter()
            .flatten()
            .map(|p| p.name().to_string())
            .collect();
        let unique: HashSet<&String> = names.iter().collect();
        assert_eq!(unique.len(), names.len(), "process on two cores: {names:?}");
        if procs.iter().all(|p| p.status() == ProcessStatus::Done) {
            break;
        }
        std::thread::sleep(Duration::from_millis(1));
    }

    await_done(&procs, Duration::from_secs(10));
    env.scheduler.shutdown();
    env.cleanup();
}
