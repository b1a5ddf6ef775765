//! Error types for the threading system.
//!
//! Errors are deliberately small: the library treats scheduler invariant
//! violations as fatal assertions (they are never recovered), so only the
//! application-visible failures surface as `Result`s.

use core::fmt;

/// Result alias for thread spawning.
pub type SpawnResult<T> = Result<T, SpawnError>;

/// Result alias for synchronization operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur when bringing up the simulated machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootError {
    /// `num_cpus` was zero.
    NoCpus,
    /// The machine was torn down after an internal fault (a scheduler
    /// invariant violation escaped a CPU worker).
    Faulted,
}

/// Errors that can occur during thread spawning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnError {
    /// The CPU subsystem has not booted on this thread's machine.
    NotBooted,
}

/// Errors raised by the blocking synchronization primitives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncError {
    /// The calling thread does not hold the mutex.
    NotOwner,
}

impl fmt::Display for BootError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BootError::NoCpus => write!(f, "cannot boot a machine with zero CPUs"),
            BootError::Faulted => write!(f, "machine torn down after an internal fault"),
        }
    }
}

impl fmt::Display for SpawnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpawnError::NotBooted => write!(f, "threading system not booted"),
        }
    }
}

impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncError::NotOwner => write!(f, "calling thread does not hold the mutex"),
        }
    }
}

impl std::error::Error for BootError {}
impl std::error::Error for SpawnError {}
impl std::error::Error for SyncError {}
