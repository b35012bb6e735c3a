//! Stressors
//!
//! A stressor is the code one worker process runs. Every stressor receives the
//! same [`StressArgs`]: its own slot of the shared bogo-op counter array, its
//! instance number, its operation cap, and a controller over the run-wide
//! control block. Resource-tracking stressors hand a [`ContentionStrategy`]
//! to the [`WorkerDriver`]; see each submodule for the strategy it runs.
//!
//! - [`aio_linux`]: batched native asynchronous writes
//! - [`clone`]: churn-and-reap process spawning
//! - [`lockf`]: acquire-or-evict byte-range locking
//! - [`matrix`]: CPU-bound matrix kernels
//! - [`mlock`]: pin-and-cycle page locking
//! - [`sigpending`]: pending-signal bookkeeping
//! - [`sigsuspend`]: signal wake-up storm across forked children
//! - [`sysfs`]: recursive sysfs reads
//!
//! [`ContentionStrategy`]: crate::worker::ContentionStrategy
//! [`WorkerDriver`]: crate::worker::WorkerDriver

pub mod aio_linux;
pub mod clone;
pub mod lockf;
pub mod matrix;
pub mod mlock;
pub mod signal;
pub mod sigpending;
pub mod sigsuspend;
pub mod sysfs;

use crate::config::Config;
use crate::control::{CancellationToken, RunController};
use crate::error::StressError;
use crate::stats::SensorSampler;
use rand::SeedableRng;
use rand_xoshiro::Xoshiro256PlusPlus;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::atomic::AtomicU64;

/// Everything a worker needs to run its stressor
pub struct StressArgs<'a> {
    /// This worker's bogo-op counter (shared memory, read by the parent)
    pub counter: &'a AtomicU64,
    pub instance: u32,
    /// Operation cap (0 = unbounded)
    pub max_ops: u64,
    pub name: &'a str,
    pub controller: RunController<'a>,
    pub sampler: Option<SensorSampler<'a>>,
    /// Seed for this worker's RNG
    pub seed: u64,
    /// Directory for scratch files
    pub temp_path: &'a Path,
}

impl<'a> StressArgs<'a> {
    /// Token combining the run's stop flag with this worker's cap
    pub fn token(&self) -> CancellationToken<'a> {
        CancellationToken::new(self.controller, self.max_ops)
    }

    pub fn rng(&self) -> Xoshiro256PlusPlus {
        Xoshiro256PlusPlus::seed_from_u64(self.seed)
    }

    pub fn sampler_mut(&mut self) -> Option<&mut SensorSampler<'a>> {
        self.sampler.as_mut()
    }

    /// Count and log a failure that happened before the driver took over
    pub fn fail(&self, err: StressError) -> StressError {
        if let Some(kind) = err.failure_kind() {
            self.controller.record_failure(kind);
        }
        tracing::error!("{}: [{}] {}", self.name, std::process::id(), err);
        err
    }
}

/// A worker body
///
/// Built in the parent before forking and run once per worker process.
/// Returning `Err` marks the worker failed; the failure has already been
/// counted against the circuit breaker by the time it returns.
pub trait Stressor {
    fn kind(&self) -> StressorKind;

    fn run(&self, args: &mut StressArgs<'_>) -> Result<(), StressError>;
}

/// Stressors this build knows how to run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StressorKind {
    #[serde(rename = "aio-linux", alias = "aiol")]
    AioLinux,
    Clone,
    Lockf,
    Matrix,
    Mlock,
    Sigpending,
    Sigsuspend,
    Sysfs,
}

impl StressorKind {
    pub const ALL: [StressorKind; 8] = [
        Self::AioLinux,
        Self::Clone,
        Self::Lockf,
        Self::Matrix,
        Self::Mlock,
        Self::Sigpending,
        Self::Sigsuspend,
        Self::Sysfs,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::AioLinux => "aio-linux",
            Self::Clone => "clone",
            Self::Lockf => "lockf",
            Self::Matrix => "matrix",
            Self::Mlock => "mlock",
            Self::Sigpending => "sigpending",
            Self::Sigsuspend => "sigsuspend",
            Self::Sysfs => "sysfs",
        }
    }

    /// Build the stressor with the options in `config`
    pub fn build(&self, config: &Config) -> Box<dyn Stressor> {
        let mode = config.run.mode;
        match self {
            Self::AioLinux => Box::new(aio_linux::AioLinuxStressor::new(mode.resolve(
                config.aio_linux.requests,
                aio_linux::DEFAULT_AIO_REQUESTS,
                aio_linux::MIN_AIO_REQUESTS,
                aio_linux::MAX_AIO_REQUESTS,
            ))),
            Self::Clone => Box::new(clone::CloneStressor::new(mode.resolve(
                config.clone.max,
                clone::DEFAULT_CLONES,
                clone::MIN_CLONES,
                clone::MAX_CLONES,
            ))),
            Self::Lockf => Box::new(lockf::LockfStressor::new(config.lockf.mode)),
            Self::Matrix => Box::new(matrix::MatrixStressor::new(
                config.matrix.method,
                mode.resolve(
                    config.matrix.size,
                    matrix::DEFAULT_MATRIX_SIZE,
                    matrix::MIN_MATRIX_SIZE,
                    matrix::MAX_MATRIX_SIZE,
                ),
            )),
            Self::Mlock => Box::new(mlock::MlockStressor::default()),
            Self::Sigpending => Box::new(sigpending::SigpendingStressor::new()),
            Self::Sigsuspend => Box::new(sigsuspend::SigsuspendStressor::new()),
            Self::Sysfs => Box::new(sysfs::SysfsStressor::new(config.sysfs.root.clone())),
        }
    }
}

impl fmt::Display for StressorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for StressorKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|kind| kind.name() == s)
            .ok_or_else(|| anyhow::anyhow!("unknown stressor: {}", s))
    }
}

/// Per-worker seed derived from the run's base seed
///
/// Distinct (kind, instance) pairs get well-separated streams even when the
/// base seed is small.
pub fn worker_seed(base: u64, kind: usize, instance: u32) -> u64 {
    // splitmix64 finalizer
    let mut z = base
        .wrapping_add((kind as u64) << 32 | instance as u64)
        .wrapping_add(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}
