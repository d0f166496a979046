//! Boot-time configuration.
//!
//! Loaded once from a whitespace-separated `key value` file and immutable
//! afterwards. Every other subsystem receives the loaded `Config` by
//! reference at construction; nothing writes it back.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use log::warn;

/// Scheduling policy for the worker loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SchedulerKind {
    Fcfs,
    Rr,
}

impl fmt::Display for SchedulerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SchedulerKind::Fcfs => "FCFS",
            SchedulerKind::Rr => "RR",
        })
    }
}

/// Immutable simulator parameters.
#[derive(Clone, Debug)]
pub struct Config {
    /// Worker thread count, clamped to [1, 128].
    pub num_cpu: u32,
    pub scheduler: SchedulerKind,
    /// Round-robin quantum in ticks, at least 1.
    pub quantum_cycles: u32,
    /// Ticks between auto-generated processes, at least 1.
    pub batch_process_freq: u64,
    /// Bounds on generated program length, at least 1 each.
    pub min_ins: u32,
    pub max_ins: u32,
    /// Every `delays_per_exec` ticks a worker advances an instruction;
    /// 0 means every tick.
    pub delays_per_exec: u32,
    /// Total simulated physical memory in bytes. Power of two in [64, 65536].
    pub max_overall_mem: usize,
    /// Frame (and page) size in bytes. Power of two in [64, 65536].
    pub mem_per_frame: usize,
    /// Memory bounds for generated processes. Powers of two in [64, 65536].
    pub min_mem_per_proc: usize,
    pub max_mem_per_proc: usize,
    /// Memory for interactively created processes. Power of two in [64, 65536].
    pub mem_per_proc: usize,
    /// Seed for the instruction generator; 0 derives one from the clock at
    /// boot so repeated runs differ unless a seed is pinned.
    pub rng_seed: u64,
    /// Swap file location. Truncated at startup.
    pub backing_store_path: PathBuf,
    /// Directory for per-process logs and reports.
    pub logs_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            num_cpu: 4,
            scheduler: SchedulerKind::Rr,
            quantum_cycles: 5,
            batch_process_freq: 1,
            min_ins: 1000,
            max_ins: 2000,
            delays_per_exec: 0,
            max_overall_mem: 16_384,
            mem_per_frame: 16,
            min_mem_per_proc: 64,
            max_mem_per_proc: 1024,
            mem_per_proc: 512,
            rng_seed: 0,
            backing_store_path: PathBuf::from("csopesy-backing-store.txt"),
            logs_dir: PathBuf::from("logs"),
        }
    }
}

impl Config {
    /// Number of physical frames backing the allocator.
    pub fn num_frames(&self) -> usize {
        self.max_overall_mem / self.mem_per_frame
    }

    /// Parses `key value` pairs from `path`.
    ///
    /// Unknown keys warn and are skipped. Out-of-range numbers are clamped,
    /// memory sizes down to the nearest power of two in [64, 65536]. An
    /// unreadable file warns and yields the defaults.
    pub fn load(path: &Path) -> Self {
        let mut config = Config::default();

        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(err) => {
                warn!("could not open config file {}: {err}; using defaults", path.display());
                return config;
            }
        };

        let mut tokens = text.split_whitespace();
        while let Some(key) = tokens.next() {
            let Some(raw) = tokens.next() else {
                warn!("config key {key} has no value");
                break;
            };
            let value = strip_quotes(raw);
            config.apply(key, value);
        }

        if config.min_ins > config.max_ins {
            warn!(
                "min-ins {} exceeds max-ins {}; raising max-ins",
                config.min_ins, config.max_ins
            );
            config.max_ins = config.min_ins;
        }
        if config.min_mem_per_proc > config.max_mem_per_proc {
            warn!(
                "min-mem-per-proc {} exceeds max-mem-per-proc {}; raising max-mem-per-proc",
                config.min_mem_per_proc, config.max_mem_per_proc
            );
            config.max_mem_per_proc = config.min_mem_per_proc;
        }
        if config.mem_per_frame > config.max_overall_mem {
            warn!(
                "mem-per-frame {} exceeds max-overall-mem {}; clamping to one frame",
                config.mem_per_frame, config.max_overall_mem
            );
            config.mem_per_frame = config.max_overall_mem;
        }

        config
    }

    fn apply(&mut self, key: &str, value: &str) {
        match key {
            "num-cpu" => self.num_cpu = parse_clamped(key, value, 1, 128, self.num_cpu),
            "scheduler" => match value.to_ascii_lowercase().as_str() {
                "fcfs" => self.scheduler = SchedulerKind::Fcfs,
                "rr" => self.scheduler = SchedulerKind::Rr,
                other => warn!("unknown scheduler {other:?}; keeping {}", self.scheduler),
            },
            "quantum-cycles" => {
                self.quantum_cycles = parse_clamped(key, value, 1, u32::MAX, self.quantum_cycles)
            }
            "batch-process-freq" => {
                self.batch_process_freq =
                    parse_clamped(key, value, 1, u64::MAX, self.batch_process_freq)
            }
            "min-ins" => self.min_ins = parse_clamped(key, value, 1, u32::MAX, self.min_ins),
            "max-ins" => self.max_ins = parse_clamped(key, value, 1, u32::MAX, self.max_ins),
            "delays-per-exec" => {
                self.delays_per_exec = parse_clamped(key, value, 0, u32::MAX, self.delays_per_exec)
            }
            "max-overall-mem" => self.max_overall_mem = parse_mem(key, value, self.max_overall_mem),
            "mem-per-frame" => self.mem_per_frame = parse_mem(key, value, self.mem_per_frame),
            "min-mem-per-proc" => {
                self.min_mem_per_proc = parse_mem(key, value, self.min_mem_per_proc)
            }
            "max-mem-per-proc" => {
                self.max_mem_per_proc = parse_mem(key, value, self.max_mem_per_proc)
            }
            "mem-per-proc" => self.mem_per_proc = parse_mem(key, value, self.mem_per_proc),
            "rng-seed" => self.rng_seed = parse_clamped(key, value, 0, u64::MAX, self.rng_seed),
            "backing-store-path" => self.backing_store_path = PathBuf::from(value),
            "logs-dir" => self.logs_dir = PathBuf::from(value),
            other => warn!("unknown config key {other:?}; skipping"),
        }
    }
}

fn strip_quotes(value: &str) -> &str {
    let v = value.strip_prefix('"').unwrap_or(value);
    v.strip_suffix('"').unwrap_or(v)
}

fn parse_clamped<T>(key: &str, value: &str, min: T, max: T, fallback: T) -> T
where
    T: Copy + Ord + fmt::Display + std::str::FromStr,
{
    match value.parse::<T>() {
        Ok(v) if v < min => {
            warn!("config {key} = {v} below minimum {min}; clamping");
            min
        }
        Ok(v) if v > max => {
            warn!("config {key} = {v} above maximum {max}; clamping");
            max
        }
        Ok(v) => v,
        Err(_) => {
            warn!("config {key} has non-numeric value {value:?}; keeping {fallback}");
            fallback
        }
    }
}

/// Memory sizes must be powers of two in [64, 65536]; anything else is
/// clamped down to the nearest valid value with a warning.
fn parse_mem(key: &str, value: &str, fallback: usize) -> usize {
    let parsed = match value.parse::<usize>() {
        Ok(v) => v,
        Err(_) => {
            warn!("config {key} has non-numeric value {value:?}; keeping {fallback}");
            return fallback;
        }
    };
    let clamped = clamp_mem_size(parsed);
    if clamped != parsed {
        warn!("config {key} = {parsed} is not a power of two in [64, 65536]; clamping to {clamped}");
    }
    clamped
}

/// Largest power of two that is <= `value`, clamped into [64, 65536].
pub fn clamp_mem_size(value: usize) -> usize {
    let capped = value.clamp(64, 65_536);
    if capped.is_power_of_two() {
        capped
    } else {
        // next_power_of_two overshoots; halve it back below the input.
        capped.next_power_of_two() / 2
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(contents: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!(
            "sim-config-{}-{:?}.txt",
            std::process::id(),
            std::thread::current().id()
        ));
        let mut file = fs::File::create(&path).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        path
    }

    #[test]
    fn missing_file_yields_defaults() {
        let config = Config::load(Path::new("/nonexistent/config.txt"));
        assert_eq!(config.num_cpu, 4);
        assert_eq!(config.scheduler, SchedulerKind::Rr);
    }

    #[test]
    fn parses_the_documented_example() {
        let path = write_config(
            "num-cpu 4\nscheduler \"rr\"\nquantum-cycles 5\nbatch-process-freq 1\n\
             min-ins 1000\nmax-ins 2000\ndelays-per-exec 0\nmax-overall-mem 16384\n\
             mem-per-frame 16\nmin-mem-per-proc 64\nmax-mem-per-proc 1024\nmem-per-proc 512\n",
        );
        let config = Config::load(&path);
        fs::remove_file(&path).ok();

        assert_eq!(config.num_cpu, 4);
        assert_eq!(config.scheduler, SchedulerKind::Rr);
        assert_eq!(config.quantum_cycles, 5);
        assert_eq!(config.max_overall_mem, 16_384);
        assert_eq!(config.num_frames(), 1024);
    }

    #[test]
    fn clamps_out_of_range_values() {
        let path = write_config("num-cpu 500\nquantum-cycles 0\nmax-overall-mem 100\n");
        let config = Config::load(&path);
        fs::remove_file(&path).ok();

        assert_eq!(config.num_cpu, 128);
        assert_eq!(config.quantum_cycles, 1);
        assert_eq!(config.max_overall_mem, 64);
    }

    #[test]
    fn unknown_keys_are_skipped() {
        let path = write_config("frobnicate 9\nnum-cpu 2\n");
        let config = Config::load(&path);
        fs::remove_file(&path).ok();
        assert_eq!(config.num_cpu, 2);
    }

    #[test]
    fn mem_clamp_is_power_of_two_in_range() {
        assert_eq!(clamp_mem_size(16), 64);
        assert_eq!(clamp_mem_size(64), 64);
        assert_eq!(clamp_mem_size(100), 64);
        assert_eq!(clamp_mem_size(1000), 512);
        assert_eq!(clamp_mem_size(65_536), 65_536);
        assert_eq!(clamp_mem_size(1 << 20), 65_536);
    }
}
