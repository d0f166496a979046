use std::fmt;
use std::io;

use crate::Pid;

pub type SimResult<T> = Result<T, SimError>;

/// Error taxonomy of the simulator core.
///
/// Process-local failures (memory access violations) shut down the offending
/// process and are not surfaced through this type; everything here is either
/// a user-visible rejection or an internal fault that must stop the
/// subsystem that raised it.
#[derive(Debug)]
pub enum SimError {
    /// A frame slot was read at an offset holding no word. Cannot happen
    /// under the even-address rule; raised as a fatal internal error.
    MisalignedAccess { frame: usize, offset: usize },
    /// A PID reached the allocator or a snapshot without a live registry
    /// entry. Indicates a dangling handle.
    UnknownPid(Pid),
    /// The named process does not exist.
    UnknownProcess(String),
    /// A create was rejected because the name is already taken.
    DuplicateName(String),
    /// Scripted creation parameters failed validation.
    InvalidScript(String),
    /// The backing store could not be read or written. Fatal to paging.
    Store(io::Error),
    /// A broken invariant that has no recovery path (e.g. a frame could not
    /// be allocated right after a successful eviction).
    Internal(String),
}

impl fmt::Display for SimError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SimError::MisalignedAccess { frame, offset } => {
                write!(f, "no word stored at frame {frame} offset {offset} (misaligned access?)")
            }
            SimError::UnknownPid(pid) => write!(f, "no process registered for pid {pid}"),
            SimError::UnknownProcess(name) => write!(f, "no process named {name}"),
            SimError::DuplicateName(name) => write!(f, "process {name} already exists"),
            SimError::InvalidScript(reason) => write!(f, "invalid script: {reason}"),
            SimError::Store(err) => write!(f, "backing store I/O failed: {err}"),
            SimError::Internal(reason) => write!(f, "internal error: {reason}"),
        }
    }
}

impl std::error::Error for SimError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SimError::Store(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for SimError {
    fn from(err: io::Error) -> Self {
        SimError::Store(err)
    }
}
