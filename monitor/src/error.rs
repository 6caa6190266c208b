//! Error types for the sampling engine
//!
//! Per-process faults ([`ProbeError`]) are recovered where they happen and
//! turned into data (omitted rows, `restricted` flags, unknown rates).
//! [`MonitorError`] covers faults that reach a caller.

use std::io;
use thiserror::Error;

use crate::monitor_loop::LoopState;
use crate::snapshot::ProcessIdentity;

/// Failure to read or signal a single process
#[derive(Debug, Error)]
pub enum ProbeError {
    /// Read or signal refused by the kernel (EACCES / EPERM)
    #[error("permission denied")]
    PermissionDenied,

    /// The process exited while it was being read (ENOENT / ESRCH)
    #[error("process vanished")]
    Vanished,

    #[error("malformed {file}: {reason}")]
    Malformed { file: &'static str, reason: String },

    #[error(transparent)]
    Io(io::Error),
}

impl From<io::Error> for ProbeError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => ProbeError::Vanished,
            io::ErrorKind::PermissionDenied => ProbeError::PermissionDenied,
            _ => match err.raw_os_error() {
                Some(libc::ESRCH) => ProbeError::Vanished,
                Some(libc::EPERM) | Some(libc::EACCES) => ProbeError::PermissionDenied,
                _ => ProbeError::Io(err),
            },
        }
    }
}

impl From<nix::errno::Errno> for ProbeError {
    fn from(errno: nix::errno::Errno) -> Self {
        match errno {
            nix::errno::Errno::ESRCH | nix::errno::Errno::ENOENT => ProbeError::Vanished,
            nix::errno::Errno::EPERM | nix::errno::Errno::EACCES => ProbeError::PermissionDenied,
            other => ProbeError::Io(io::Error::from_raw_os_error(other as i32)),
        }
    }
}

/// Engine-level failures
#[derive(Debug, Error)]
pub enum MonitorError {
    /// The process table as a whole could not be read; fatal to one tick only
    #[error("process table unreadable: {0}")]
    TableUnreadable(#[source] ProbeError),

    /// The pid is now occupied by a different process than the one requested
    #[error("pid {} no longer belongs to the requested process", .0.pid)]
    StaleIdentity(ProcessIdentity),

    /// Wall time did not advance between two captures
    #[error("non-positive interval between captures")]
    ClockAnomaly,

    /// Another loop or one-shot sample is already publishing to this view
    #[error("another sampler is already publishing to this view")]
    Busy,

    /// A state-machine transition that the loop does not allow
    #[error("monitor loop cannot start from state {0:?}")]
    InvalidState(LoopState),
}

pub type MonitorResult<T> = Result<T, MonitorError>;
