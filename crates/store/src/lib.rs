//! The backing store: evicted pages as text.
//!
//! One file holds a sequence of page records. A record is a header line
//! `<pid> <page>` followed by entry lines, terminated by the next header or
//! end of file:
//!
//! ```text
//! 3 0
//! V 0 4660 x8
//! V 20 7
//! I 2 SLEEP 3
//! ```
//!
//! `V <offset> <value> [xN]` stores N (default 1) consecutive identical
//! 16-bit words starting at even byte offset `offset`. `I <offset> <text>`
//! stores an instruction handle in its single-line wire form. Swap-out
//! appends; swap-in scans for the LATEST matching record (a page may be
//! swapped out repeatedly and newer records supersede older ones); process
//! death removes every record of that PID in one streaming rewrite.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use log::{debug, trace};
use program::{Instruction, StoredWord};
use types::{Pid, SimResult};

pub struct BackingStore {
    path: PathBuf,
    words_per_page: usize,
}

impl BackingStore {
    /// Opens (and truncates) the store file. Called once at boot.
    pub fn create(path: &Path, page_bytes: usize) -> SimResult<Self> {
        File::create(path)?;
        Ok(Self { path: path.to_path_buf(), words_per_page: page_bytes / 2 })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one page record. `words` is the frame's word array.
    pub fn append_page(
        &self,
        pid: Pid,
        page: usize,
        words: &[Option<StoredWord>],
    ) -> SimResult<()> {
        let file = OpenOptions::new().append(true).open(&self.path)?;
        let mut out = BufWriter::new(file);
        writeln!(out, "{pid} {page}")?;

        let mut slot = 0;
        while slot < words.len() {
            match &words[slot] {
                Some(StoredWord::Value(value)) => {
                    let mut run = 1;
                    while slot + run < words.len()
                        && matches!(&words[slot + run], Some(StoredWord::Value(v)) if v == value)
                    {
                        run += 1;
                    }
                    if run > 1 {
                        writeln!(out, "V {} {} x{}", slot * 2, value, run)?;
                    } else {
                        writeln!(out, "V {} {}", slot * 2, value)?;
                    }
                    slot += run;
                }
                Some(StoredWord::Instr(instr)) => {
                    writeln!(out, "I {} {}", slot * 2, instr.serialize())?;
                    slot += 1;
                }
                None => slot += 1,
            }
        }

        out.flush()?;
        trace!("swapped out pid {pid} page {page}");
        Ok(())
    }

    /// Reads the latest record for `(pid, page)` into a fresh word array.
    /// Offsets never seen stay `None`; a page with no record reads as empty.
    pub fn read_page(&self, pid: Pid, page: usize) -> SimResult<Vec<Option<StoredWord>>> {
        let mut words = vec![None; self.words_per_page];
        let reader = BufReader::new(File::open(&self.path)?);

        let mut in_target = false;
        for line in reader.lines() {
            let line = line?;
            match parse_line(&line) {
                Line::Header { pid: h_pid, page: h_page } => {
                    in_target = h_pid == pid && h_page == page;
                    if in_target {
                        // Newer records fully supersede older ones.
                        words.iter_mut().for_each(|w| *w = None);
                    }
                }
                Line::Value { offset, value, count } if in_target => {
                    for i in 0..count {
                        let slot = offset / 2 + i;
                        if slot < words.len() {
                            words[slot] = Some(StoredWord::Value(value));
                        }
                    }
                }
                Line::Instr { offset, text } if in_target => {
                    let slot = offset / 2;
                    if slot < words.len() {
                        let instr = Instruction::deserialize(text)?;
                        words[slot] = Some(StoredWord::Instr(instr.into()));
                    }
                }
                _ => {}
            }
        }

        trace!("swapped in pid {pid} page {page}");
        Ok(words)
    }

    /// Drops every record belonging to `pid`: streaming copy through a
    /// sibling temp file, then an atomic rename over the original.
    pub fn remove_pid(&self, pid: Pid) -> SimResult<()> {
        let temp_path = self.path.with_extension("tmp");
        {
            let reader = BufReader::new(File::open(&self.path)?);
            let mut out = BufWriter::new(File::create(&temp_path)?);

            let mut skipping = false;
            for line in reader.lines() {
                let line = line?;
                if let Line::Header { pid: h_pid, .. } = parse_line(&line) {
                    skipping = h_pid == pid;
                }
                if !skipping {
                    writeln!(out, "{line}")?;
                }
            }
            out.flush()?;
        }
        fs::rename(&temp_path, &self.path)?;
        debug!("removed backing-store records for pid {pid}");
        Ok(())
    }

    /// True when no record remains. Diagnostic for vmstat and tests.
    pub fn is_empty(&self) -> SimResult<bool> {
        let reader = BufReader::new(File::open(&self.path)?);
        for line in reader.lines() {
            if !line?.trim().is_empty() {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

enum Line<'a> {
    Header { pid: Pid, page: usize },
    Value { offset: usize, value: u16, count: usize },
    Instr { offset: usize, text: &'a str },
    Other,
}

fn parse_line(line: &str) -> Line<'_> {
    let trimmed = line.trim_start();
    if let Some(rest) = trimmed.strip_prefix("V ") {
        let mut tokens = rest.split_whitespace();
        let offset = tokens.next().and_then(|t| t.parse().ok());
        let value = tokens.next().and_then(|t| t.parse().ok());
        let count = match tokens.next() {
            Some(run) => run.strip_prefix('x').and_then(|n| n.parse().ok()),
            None => Some(1),
        };
        if let (Some(offset), Some(value), Some(count)) = (offset, value, count) {
            return Line::Value { offset, value, count };
        }
        return Line::Other;
    }
    if let Some(rest) = trimmed.strip_prefix("I ") {
        let mut split = rest.splitn(2, ' ');
        let offset = split.next().and_then(|t| t.parse().ok());
        if let (Some(offset), Some(text)) = (offset, split.next()) {
            return Line::Instr { offset, text };
        }
        return Line::Other;
    }
    let mut tokens = trimmed.split_whitespace();
    if let (Some(Ok(pid)), Some(Ok(page))) = (
        tokens.next().map(str::parse::<Pid>),
        tokens.next().map(str::parse::<usize>),
    ) {
        if tokens.next().is_none() {
            return Line::Header { pid, page };
        }
    }
    Line::Other
}
