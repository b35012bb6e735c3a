//! StressPulse - resource-exhaustion stress harness
//!
//! StressPulse drives the kernel into its failure paths by having many worker
//! processes repeatedly acquire a finite resource until the kernel refuses,
//! then evict the oldest holdings and try again, all within a fixed time budget.
//!
//! # Architecture
//!
//! - **Resource pool**: per-worker arena of live records with FIFO eviction
//! - **Run control**: shared stop flag and a one-shot failure circuit breaker
//! - **Worker driver**: generic acquire/evict loop with guaranteed teardown
//! - **Stressors**: clone churn-and-reap, lockf acquire-or-evict, matrix kernels,
//!   mlock pin-and-cycle, signal wake-ups (sigsuspend, sigpending), sysfs
//!   tree reads and Linux native AIO writes
//! - **Thermal metrics**: per-worker zone sampling reduced to per-stressor means

pub mod config;
pub mod control;
pub mod coordinator;
pub mod error;
pub mod output;
pub mod pool;
pub mod stats;
pub mod stressor;
pub mod worker;

// Re-export commonly used types
pub use config::Config;
pub use coordinator::{Coordinator, RunSummary};
pub use error::StressError;

/// Result type used throughout StressPulse
pub type Result<T> = anyhow::Result<T>;
