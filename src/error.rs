//! Error taxonomy for stressors
//!
//! Setup and orchestration code uses `anyhow` with context, like the rest of the
//! crate. Inside a worker loop the kind of failure decides what happens next, so
//! those paths use the typed [`StressError`] instead:
//!
//! - **Backpressure**: OS refused a resource (spawn or lock denied); the caller
//!   evicts and keeps going
//! - **Interrupted**: a syscall hit `EINTR`; retried by the caller
//! - **PoolExhausted**: no memory for another resource record; fatal to the worker
//! - **Operational**: an I/O step the loop depends on failed; fatal to the worker
//!   and counted by the circuit breaker
//! - **Setup**: the worker could not get ready to run at all

use std::io;
use thiserror::Error;

/// Resource pool allocation failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PoolError {
    /// Backing storage for a new record could not be obtained
    #[error("out of memory allocating resource record ({live} records live)")]
    OutOfMemory { live: usize },
}

/// Failure raised from inside a stressor
#[derive(Debug, Error)]
pub enum StressError {
    #[error("resource temporarily unavailable: {0}")]
    Backpressure(#[source] io::Error),

    #[error("interrupted system call")]
    Interrupted,

    #[error(transparent)]
    PoolExhausted(#[from] PoolError),

    #[error("{what} failed: {source}")]
    Operational {
        what: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("{what} failed: {source}")]
    Setup {
        what: &'static str,
        #[source]
        source: io::Error,
    },
}

impl StressError {
    /// Operational failure built from `errno`
    pub fn last_os(what: &'static str) -> Self {
        Self::Operational {
            what,
            source: io::Error::last_os_error(),
        }
    }

    /// Setup failure built from an I/O error
    pub fn setup(what: &'static str, source: io::Error) -> Self {
        Self::Setup { what, source }
    }

    /// Which circuit breaker bucket this error counts toward, if any
    ///
    /// Backpressure and interruptions are part of normal operation under stress
    /// and never count.
    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            Self::Backpressure(_) | Self::Interrupted => None,
            Self::PoolExhausted(_) => Some(FailureKind::Allocation),
            Self::Operational { .. } => Some(FailureKind::Operational),
            Self::Setup { .. } => Some(FailureKind::Setup),
        }
    }

    /// Classify a raw syscall error
    ///
    /// `EINTR` maps to [`StressError::Interrupted`]; resource and permission
    /// exhaustion (`EAGAIN`, `ENOMEM`, `EPERM`, `EACCES`, `ENOSPC`, `EINVAL`,
    /// `EDEADLK`, `ENOLCK`, `EUSERS`) map to backpressure; anything else is
    /// operational.
    pub fn from_errno(what: &'static str, err: io::Error) -> Self {
        match err.raw_os_error() {
            Some(libc::EINTR) => Self::Interrupted,
            Some(
                libc::EAGAIN
                | libc::ENOMEM
                | libc::EPERM
                | libc::EACCES
                | libc::ENOSPC
                | libc::EINVAL
                | libc::EDEADLK
                | libc::ENOLCK
                | libc::EUSERS,
            ) => Self::Backpressure(err),
            _ => Self::Operational { what, source: err },
        }
    }
}

/// Circuit breaker failure class
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Allocation,
    Operational,
    Setup,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Allocation => "allocation",
            Self::Operational => "operational",
            Self::Setup => "setup",
        }
    }
}
