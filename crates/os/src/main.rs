//! Line-oriented console front end.
//!
//! Thin by design: every command resolves to a supervisor call or a
//! snapshot, and this layer only parses arguments and formats output. It is
//! also the one place allowed to print errors at the user.

use std::io::{self, BufRead, Write};
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use kernel::System;
use once_cell::sync::OnceCell;
use types::Config;

mod report;

static SYSTEM: OnceCell<Arc<System>> = OnceCell::new();

const CONFIG_PATH: &str = "config.txt";

fn main() -> Result<()> {
    env_logger::init();
    println!("Type 'initialize' to boot the simulator, 'exit' to quit.");

    let stdin = io::stdin();
    loop {
        print!("> ");
        io::stdout().flush().context("flushing prompt")?;

        let mut line = String::new();
        if stdin.lock().read_line(&mut line).context("reading command")? == 0 {
            break; // EOF behaves like exit
        }
        let tokens = tokenize(&line);
        if tokens.is_empty() {
            continue;
        }

        match tokens[0].as_str() {
            "exit" => break,
            "initialize" => initialize(),
            command => match SYSTEM.get() {
                Some(system) => dispatch(system, command, &tokens),
                None => println!("Please run 'initialize' first."),
            },
        }
    }

    if let Some(system) = SYSTEM.get() {
        system.shutdown();
    }
    Ok(())
}

fn initialize() {
    if SYSTEM.get().is_some() {
        println!("Program has already been initialized.");
        return;
    }
    let config = Config::load(Path::new(CONFIG_PATH));
    match System::init(config) {
        Ok(system) => {
            SYSTEM.set(system).ok();
            println!("Simulator initialized.");
        }
        Err(err) => println!("Error: initialization failed: {err}"),
    }
}

fn dispatch(system: &Arc<System>, command: &str, tokens: &[String]) {
    match command {
        "screen" => screen_command(system, tokens),
        "scheduler-start" => {
            if system.start_batch_generation() {
                println!(
                    "Started batch process generation every {} CPU ticks.",
                    system.config.batch_process_freq
                );
            } else {
                println!("Batch process generation is already running.");
            }
        }
        "scheduler-stop" => {
            if system.stop_batch_generation() {
                println!("Stopped batch process generation.");
            } else {
                println!("Batch process generation is not currently running.");
            }
        }
        "scheduler-status" => report::scheduler_status(system),
        "process-smi" => report::process_smi(system),
        "vmstat" => report::vmstat(system),
        "report-util" => report::report_util(system),
        "visualize" => report::visualize(system),
        other => println!("Error: Unknown command {other}"),
    }
}

fn screen_command(system: &Arc<System>, tokens: &[String]) {
    let Some(flag) = tokens.get(1) else {
        println!("Error: Not enough arguments for screen command.");
        return;
    };

    match flag.as_str() {
        "-ls" => report::process_report(system, &mut io::stdout()),
        "-s" | "-r" => {
            let Some(name) = tokens.get(2) else {
                println!("Error: Missing process name for {flag} flag.");
                return;
            };
            if flag == "-s" {
                match system.create_interactive(name) {
                    Ok(_) => report::attach(system, name),
                    Err(err) => println!("Error: {err}"),
                }
            } else {
                report::attach(system, name);
            }
        }
        "-c" => {
            if tokens.len() < 5 {
                println!("Usage: screen -c <name> <mem_size> \"<instrs;separated;by;semicolons>\"");
                return;
            }
            let (name, mem) = (&tokens[2], &tokens[3]);
            let Ok(mem_size) = mem.parse::<u64>() else {
                println!("Error: Invalid memory size '{mem}'. Must be a number.");
                return;
            };
            // The script may itself contain spaces and quotes; rejoin the
            // remaining tokens and strip one surrounding quote pair.
            let script = strip_outer_quotes(&tokens[4..].join(" ")).to_string();
            if script.is_empty() {
                println!("Error: No instructions provided.");
                return;
            }
            match system.create_scripted(name, mem_size, &script) {
                Ok(_) => report::attach(system, name),
                Err(err) => println!("Error: {err}"),
            }
        }
        other => println!("Invalid screen flag: {other}"),
    }
}

fn tokenize(line: &str) -> Vec<String> {
    line.split_whitespace().map(str::to_string).collect()
}

fn strip_outer_quotes(text: &str) -> &str {
    let trimmed = text.trim();
    if trimmed.len() >= 2 && trimmed.starts_with('"') && trimmed.ends_with('"') {
        &trimmed[1..trimmed.len() - 1]
    } else {
        trimmed
    }
}
