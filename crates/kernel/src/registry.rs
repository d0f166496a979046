//! Name and PID lookup for live processes.
//!
//! PIDs are assigned densely from 0 in creation order; names are unique for
//! the lifetime of the run (DONE processes stay listed so reports can show
//! them). One reader-writer lock guards both tables; lookups only ever take
//! the read side.

use std::collections::HashMap;
use std::sync::RwLock;

use types::{Pid, SimError, SimResult};

use crate::process::ProcessHandle;

#[derive(Default)]
pub struct ProcessRegistry {
    inner: RwLock<Tables>,
}

#[derive(Default)]
struct Tables {
    by_name: HashMap<String, ProcessHandle>,
    by_pid: Vec<ProcessHandle>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserves the next dense PID and registers the process `build`
    /// returns for it. Rejected without side effects when `name` is taken.
    pub fn register<F>(&self, name: &str, build: F) -> SimResult<ProcessHandle>
    where
        F: FnOnce(Pid) -> ProcessHandle,
    {
        let mut tables = self.inner.write().expect("registry lock poisoned");
        if tables.by_name.contains_key(name) {
            return Err(SimError::DuplicateName(name.to_string()));
        }

        let pid = tables.by_pid.len() as Pid;
        let handle = build(pid);
        debug_assert_eq!(handle.pid(), pid);

        tables.by_name.insert(name.to_string(), handle.clone());
        tables.by_pid.push(handle.clone());
        Ok(handle)
    }

    pub fn by_pid(&self, pid: Pid) -> Option<ProcessHandle> {
        self.inner
            .read()
            .expect("registry lock poisoned")
            .by_pid
            .get(pid as usize)
            .cloned()
    }

    pub fn by_name(&self, name: &str) -> Option<ProcessHandle> {
        self.inner
            .read()
            .expect("registry lock poisoned")
            .by_name
            .get(name)
            .cloned()
    }

    /// All processes in PID (creation) order.
    pub fn all(&self) -> Vec<ProcessHandle> {
        self.inner.read().expect("registry lock poisoned").by_pid.clone()
    }

    pub fn count(&self) -> usize {
        self.inner.read().expect("registry lock poisoned").by_pid.len()
    }
}
