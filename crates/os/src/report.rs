//! Rendering of snapshots: screen -ls, process-smi, vmstat, report-util,
//! the frame-table display, and the per-process attach view.

use std::fs;
use std::io::Write;
use std::sync::Arc;

use kernel::snapshot::{ProcessSnapshot, SystemSnapshot};
use kernel::System;

pub fn process_report(system: &Arc<System>, out: &mut dyn Write) {
    let snapshot = system.snapshot();
    render_report(&snapshot, out).ok();
}

fn render_report(snapshot: &SystemSnapshot, out: &mut dyn Write) -> std::io::Result<()> {
    let busy = snapshot.total_cores - snapshot.available_cores;
    writeln!(out, "CPU Utilization: {:.0}%", snapshot.cpu_utilization())?;
    writeln!(out, "Cores used: {busy}")?;
    writeln!(out, "Cores available: {}", snapshot.available_cores)?;
    writeln!(out, "Total Cores: {}", snapshot.total_cores)?;
    writeln!(out, "{}", "-".repeat(30))?;

    let mut sorted: Vec<&ProcessSnapshot> = snapshot.processes.iter().collect();
    sorted.sort_by(|a, b| a.name.cmp(&b.name));

    writeln!(out, "Waiting processes:")?;
    for proc in sorted.iter().filter(|p| p.status == "WAITING") {
        writeln!(out, "{}", progress_line(proc))?;
    }

    writeln!(out, "\nRunning processes:")?;
    for proc in sorted.iter().filter(|p| p.status != "DONE" && p.status != "WAITING") {
        writeln!(out, "{}", progress_line(proc))?;
    }

    writeln!(out, "\nFinished processes:")?;
    for proc in sorted.iter().filter(|p| p.status == "DONE") {
        writeln!(
            out,
            "{:<10}\t({})\tFinished\t{} / {}",
            proc.name, proc.created_at, proc.current_line, proc.total_lines
        )?;
    }
    writeln!(out, "{}", "-".repeat(30))?;
    Ok(())
}

fn progress_line(proc: &ProcessSnapshot) -> String {
    let core = proc.core.map_or_else(|| "N/A".to_string(), |c| c.to_string());
    format!(
        "{:<10}\t({})\tCore:\t{:<4}\t{} / {}",
        proc.name, proc.created_at, core, proc.current_line, proc.total_lines
    )
}

/// `screen -r` / post-create attach view: a finished process is reported as
/// missing, exactly like an unknown name.
pub fn attach(system: &Arc<System>, name: &str) {
    let Some(proc) = system.registry.by_name(name) else {
        println!("Error: No process named {name} was found.");
        return;
    };
    if proc.status() == types::ProcessStatus::Done {
        println!("Process {name} not found.");
        return;
    }

    println!("Process: {}", proc.name());
    println!("ID: {}", proc.pid());
    println!("Created: {}", proc.created_at());
    println!("Status: {}", proc.status().as_str());
    println!(
        "Instruction line: {} / {}",
        proc.current_line(),
        proc.total_lines()
    );
    println!("Memory: {} bytes", proc.memory_usage());
    let logs = proc.log_lines();
    if !logs.is_empty() {
        println!("Logs:");
        for line in logs {
            println!("  {line}");
        }
    }
}

pub fn process_smi(system: &Arc<System>) {
    let snapshot = system.snapshot();
    let header = "| PROCESS-SMI V01.00 Driver Version: 01.00 |";
    println!("{}", "-".repeat(header.len()));
    println!("{header}");
    println!("{}", "-".repeat(header.len()));
    println!("CPU-Util: {:.0}%", snapshot.cpu_utilization());
    println!(
        "Memory Usage: {}B / {}B",
        snapshot.memory.used_bytes, snapshot.memory.total_bytes
    );
    println!("Memory Util: {:.0}%", snapshot.memory_utilization());
    println!("{}", "=".repeat(header.len()));
    println!("Running processes and memory usage:");

    for (core, name) in snapshot.core_assignments.iter().enumerate() {
        let Some(name) = name else { continue };
        let proc = snapshot.processes.iter().find(|p| &p.name == name);
        let (mem, status) = proc.map_or((0, "OTHER"), |p| {
            (p.memory_bytes, if p.status == "RUNNING" { "RUNNING" } else { "OTHER" })
        });
        println!("Core {core:<2}:  {name:<12} {mem:<8} {status}");
    }

    println!("Ready/Waiting processes with memory usage:");
    for proc in &snapshot.processes {
        let on_core = snapshot
            .core_assignments
            .iter()
            .any(|slot| slot.as_deref() == Some(proc.name.as_str()));
        if on_core || proc.memory_bytes == 0 {
            continue;
        }
        match proc.status.as_str() {
            "WAITING" => println!("WAITING  {:<12} {:<8}B", proc.name, proc.memory_bytes),
            "READY" => println!("READY    {:<12} {:<8}B", proc.name, proc.memory_bytes),
            _ => {}
        }
    }
    println!("{}", "-".repeat(header.len()));
}

pub fn vmstat(system: &Arc<System>) {
    let snapshot = system.snapshot();
    println!("\n===== System Statistics =====");
    println!("{:>20} B Total memory", snapshot.memory.total_bytes);
    println!("{:>20} B Used memory", snapshot.memory.used_bytes);
    println!("{:>20} B Free memory", snapshot.memory.free_bytes);
    println!("{:>20} Idle CPU ticks", snapshot.ticks.idle);
    println!("{:>20} Active CPU ticks", snapshot.ticks.active);
    println!("{:>20} Total CPU ticks", snapshot.ticks.total);
    println!("{:>20} Pages paged in", snapshot.memory.paged_in);
    println!("{:>20} Pages paged out", snapshot.memory.paged_out);
    println!("==============================\n");
}

/// Writes the utilization report to `logs/csopesy-log.txt` plus a JSON twin
/// next to it.
pub fn report_util(system: &Arc<System>) {
    let snapshot = system.snapshot();
    let dir = &system.config.logs_dir;
    if let Err(err) = fs::create_dir_all(dir) {
        println!("Error: Could not create {}: {err}", dir.display());
        return;
    }

    let text_path = dir.join("csopesy-log.txt");
    let result = fs::File::create(&text_path).and_then(|mut file| {
        writeln!(file, "CPU Utilization Report")?;
        writeln!(file, "Timestamp: {}\n", snapshot.timestamp)?;
        render_report(&snapshot, &mut file)
    });
    if let Err(err) = result {
        println!("Error: Could not write {}: {err}", text_path.display());
        return;
    }

    let json_path = dir.join("csopesy-log.json");
    match serde_json::to_string_pretty(&snapshot) {
        Ok(json) => {
            if let Err(err) = fs::write(&json_path, json) {
                println!("Error: Could not write {}: {err}", json_path.display());
                return;
            }
        }
        Err(err) => {
            println!("Error: Could not serialize snapshot: {err}");
            return;
        }
    }

    println!("Report generated at {}", text_path.display());
}

pub fn scheduler_status(system: &Arc<System>) {
    let scheduler = &system.scheduler;
    println!("Scheduler Status:");
    println!("- CPU Ticks: {}", scheduler.current_tick());
    println!(
        "- Batch Generation: {}",
        if scheduler.is_generating() { "Running" } else { "Stopped" }
    );
    println!(
        "- Available Cores: {}/{}",
        scheduler.available_cores(),
        scheduler.total_cores()
    );
    println!("Ready queue: {}", scheduler.ready_count());
    println!("Waiting queue: {}", scheduler.waiting_count());
}

pub fn visualize(system: &Arc<System>) {
    println!("\n=== Memory Frame Table ===");
    println!("{:>6} | {:>10} | {:>10}", "Frame", "Process ID", "Page #");
    println!("--------+------------+------------");
    for (idx, frame) in system.allocator.frame_views().iter().enumerate() {
        match frame.owner {
            Some((pid, page)) => println!("{idx:>6} | {pid:>10} | {page:>10}"),
            None => println!("{:>6} | {:>10} | {:>10}", idx, "-", "-"),
        }
    }
    println!("================================\n");
}
