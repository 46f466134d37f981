//! Named cross-process primitives backed by POSIX shared memory.
//!
//! - **segment**: a named, resizable shared memory mapping
//! - **mutex**: a lock word living in its own segment
//! - **event**: an auto-reset signal living in its own segment
//!
//! Every object is created by the host side and opened by the worker side.
//! The creator unlinks the name when its handle is dropped.

use std::io;

pub mod event;
pub mod mutex;
pub mod segment;

pub use event::NamedEvent;
pub use mutex::{NamedMutex, NamedMutexGuard};
pub use segment::ShmSegment;

pub type Result<T> = std::result::Result<T, ShmError>;

#[derive(Debug, thiserror::Error)]
pub enum ShmError {
    #[error("failed to create shared memory '{name}': {source}")]
    Create {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to open shared memory '{name}': {source}")]
    Open {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to map shared memory '{name}': {source}")]
    Map {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to resize shared memory '{name}' to {len} bytes: {source}")]
    Truncate {
        name: String,
        len: usize,
        #[source]
        source: io::Error,
    },

    #[error("shared memory '{name}' has zero length")]
    Unsized { name: String },

    #[error("invalid shared memory name '{name}'")]
    InvalidName { name: String },

    #[error("shared memory name too long: max {max} chars, got {got}")]
    NameTooLong { max: usize, got: usize },
}

/// Whether a process with the given pid still exists.
///
/// `EPERM` means the process exists but belongs to someone else.
pub fn pid_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }

    match kill(Pid::from_raw(raw), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}
