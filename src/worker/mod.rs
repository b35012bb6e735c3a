//! Worker driver
//!
//! The driver is the loop every resource-tracking stressor runs: poll the
//! cancellation token, let the contention strategy take one step against the
//! worker's [`ResourcePool`], repeat. Whatever ends the loop (operation cap,
//! stop request, circuit breaker, fatal step error) the driver drains the pool
//! through the strategy's release hook and destroys it before returning, so no
//! process is left unreaped and no lock is left held.
//!
//! # Architecture
//!
//! - **ContentionStrategy**: allocates and evicts records, owns the OS calls
//! - **ResourcePool**: process-private record arena owned by the driver
//! - **CancellationToken**: shared stop flag plus this worker's operation cap
//! - **SensorSampler**: optional, polled once per iteration
//!
//! # Example
//!
//! ```
//! use stresspulse::control::{CancellationToken, ControlBlock, RunController};
//! use stresspulse::error::StressError;
//! use stresspulse::pool::ResourcePool;
//! use stresspulse::worker::{ContentionStrategy, StepContext, StepOutcome, WorkerDriver};
//! use std::sync::atomic::{AtomicU64, Ordering};
//!
//! /// Holds up to four fake handles, evicting the oldest when full
//! struct Juggler;
//!
//! impl ContentionStrategy for Juggler {
//!     type Record = u64;
//!
//!     fn step(&mut self, pool: &mut ResourcePool<u64>, ctx: &StepContext<'_>) -> Result<StepOutcome, StressError> {
//!         if pool.len() >= 4 {
//!             pool.evict_oldest();
//!             return Ok(StepOutcome::Evicted);
//!         }
//!         let handle = pool.allocate_with(|| 0)?;
//!         *pool.get_mut(handle) = ctx.bump();
//!         Ok(StepOutcome::Progress)
//!     }
//!
//!     fn release(&mut self, _record: &mut u64) -> Result<(), StressError> {
//!         Ok(())
//!     }
//! }
//!
//! let block = ControlBlock::new();
//! let token = CancellationToken::new(RunController::new(&block, 5), 100);
//! let counter = AtomicU64::new(0);
//!
//! let summary = WorkerDriver::new("juggler").run(&mut Juggler, &token, &counter, None)?;
//! assert_eq!(counter.load(Ordering::Relaxed), 100);
//! assert_eq!(summary.peak_live, 4);
//! # Ok::<(), StressError>(())
//! ```

pub mod process;

pub use process::WorkerProcess;

use crate::control::CancellationToken;
use crate::error::{FailureKind, StressError};
use crate::pool::ResourcePool;
use crate::stats::SensorSampler;
use std::sync::atomic::{AtomicU64, Ordering};

/// What one strategy step achieved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// A unit of work succeeded and the counter was advanced
    Progress,
    /// The live set was full; the oldest record was released instead
    Evicted,
    /// The OS refused the resource; the oldest record was released to make room
    Backpressure,
}

/// Per-step view of the worker's shared state
pub struct StepContext<'a> {
    counter: &'a AtomicU64,
    token: &'a CancellationToken<'a>,
}

impl<'a> StepContext<'a> {
    pub fn new(counter: &'a AtomicU64, token: &'a CancellationToken<'a>) -> Self {
        Self { counter, token }
    }

    /// Advance the shared operation counter, returning the new count
    #[inline]
    pub fn bump(&self) -> u64 {
        self.counter.fetch_add(1, Ordering::Relaxed) + 1
    }

    #[inline]
    pub fn count(&self) -> u64 {
        self.counter.load(Ordering::Relaxed)
    }

    /// False once the run has been asked to stop
    #[inline]
    pub fn is_running(&self) -> bool {
        self.token.controller().is_running()
    }

    /// Count a failure the loop survives against the circuit breaker
    pub fn record_failure(&self, kind: FailureKind) {
        self.token.controller().record_failure(kind);
    }
}

/// A policy for keeping a bounded live set under allocation pressure
pub trait ContentionStrategy {
    /// What the pool tracks per live resource
    type Record;

    /// Perform one unit of work
    ///
    /// Responsible for advancing the counter (through [`StepContext::bump`]) on
    /// success only. Backpressure is reported as [`StepOutcome::Backpressure`],
    /// never as an error; an `Err` ends the worker.
    fn step(
        &mut self,
        pool: &mut ResourcePool<Self::Record>,
        ctx: &StepContext<'_>,
    ) -> Result<StepOutcome, StressError>;

    /// Release the external resource behind a record being drained
    fn release(&mut self, record: &mut Self::Record) -> Result<(), StressError>;

    /// Called once after the pool has been drained
    fn finish(&mut self, _name: &str, _summary: &WorkerSummary) {}
}

/// What a worker loop did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerSummary {
    pub iterations: u64,
    pub successes: u64,
    pub evictions: u64,
    pub backpressure: u64,
    /// Most records live at once
    pub peak_live: usize,
    /// Records still live at exit, released by the drain
    pub drained: usize,
    /// Records the pool ever backed
    pub backed: usize,
}

/// Runs a [`ContentionStrategy`] to completion
#[derive(Debug, Clone)]
pub struct WorkerDriver {
    name: String,
}

impl WorkerDriver {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Drive `strategy` with a fresh pool
    pub fn run<S: ContentionStrategy>(
        &self,
        strategy: &mut S,
        token: &CancellationToken<'_>,
        counter: &AtomicU64,
        sampler: Option<&mut SensorSampler<'_>>,
    ) -> Result<WorkerSummary, StressError> {
        self.run_with_pool(strategy, ResourcePool::new(), token, counter, sampler)
    }

    /// Drive `strategy` with a caller-supplied pool (e.g. one with a record limit)
    pub fn run_with_pool<S: ContentionStrategy>(
        &self,
        strategy: &mut S,
        mut pool: ResourcePool<S::Record>,
        token: &CancellationToken<'_>,
        counter: &AtomicU64,
        mut sampler: Option<&mut SensorSampler<'_>>,
    ) -> Result<WorkerSummary, StressError> {
        let mut summary = WorkerSummary::default();
        let result = self.drive(strategy, &mut pool, token, counter, &mut sampler, &mut summary);

        if let Some(sampler) = sampler.as_mut() {
            sampler.sample_now();
        }

        // Release on every exit path, including a fatal step
        let mut release_error = None;
        summary.drained = pool.drain_all(|record| {
            if let Err(e) = strategy.release(record) {
                release_error.get_or_insert(e);
            }
        });
        summary.backed = pool.destroy();

        strategy.finish(&self.name, &summary);

        if let Err(e) = result {
            if let Some(kind) = e.failure_kind() {
                token.controller().record_failure(kind);
            }
            tracing::error!("{}: {}", self.name, e);
            return Err(e);
        }

        if let Some(e) = release_error {
            tracing::warn!("{}: release during drain failed: {}", self.name, e);
        }

        Ok(summary)
    }

    fn drive<S: ContentionStrategy>(
        &self,
        strategy: &mut S,
        pool: &mut ResourcePool<S::Record>,
        token: &CancellationToken<'_>,
        counter: &AtomicU64,
        sampler: &mut Option<&mut SensorSampler<'_>>,
        summary: &mut WorkerSummary,
    ) -> Result<(), StressError> {
        let ctx = StepContext::new(counter, token);
        let cap = token.cap();
        let mut backpressure_streak = 0u64;

        while token.should_continue(counter) {
            // A stressor that can never get its resource still ends after `cap` attempts
            if cap > 0 && backpressure_streak >= cap {
                tracing::debug!(
                    "{}: giving up after {} consecutive denied attempts",
                    self.name,
                    backpressure_streak
                );
                break;
            }

            let outcome = match strategy.step(pool, &ctx) {
                Ok(outcome) => outcome,
                Err(StressError::Interrupted) => continue,
                Err(e) => return Err(e),
            };

            summary.iterations += 1;
            match outcome {
                StepOutcome::Progress => {
                    summary.successes += 1;
                    backpressure_streak = 0;
                }
                StepOutcome::Evicted => summary.evictions += 1,
                StepOutcome::Backpressure => {
                    summary.backpressure += 1;
                    backpressure_streak += 1;
                }
            }
            summary.peak_live = summary.peak_live.max(pool.len());

            if let Some(sampler) = sampler.as_mut() {
                sampler.maybe_sample();
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::{ControlBlock, RunController};
    use crate::error::PoolError;
    use std::io;

    /// Allocates a sequential id per step; optionally fails at a given step
    struct Sequencer {
        max_live: usize,
        next: u64,
        released: Vec<u64>,
        fail_at: Option<u64>,
        deny_all: bool,
        /// Return `Interrupted` from every other step
        interrupt_alternate: bool,
        calls: u64,
        finished: bool,
    }

    impl Sequencer {
        fn new(max_live: usize) -> Self {
            Self {
                max_live,
                next: 0,
                released: Vec::new(),
                fail_at: None,
                deny_all: false,
                interrupt_alternate: false,
                calls: 0,
                finished: false,
            }
        }
    }

    impl ContentionStrategy for Sequencer {
        type Record = u64;

        fn step(&mut self, pool: &mut ResourcePool<u64>, ctx: &StepContext<'_>) -> Result<StepOutcome, StressError> {
            self.calls += 1;
            if self.interrupt_alternate && self.calls % 2 == 1 {
                return Err(StressError::Interrupted);
            }
            if self.deny_all {
                if let Some(id) = pool.evict_oldest() {
                    self.released.push(*id);
                }
                return Ok(StepOutcome::Backpressure);
            }
            if Some(self.next) == self.fail_at {
                return Err(StressError::Operational {
                    what: "write",
                    source: io::Error::from_raw_os_error(libc::EIO),
                });
            }
            if pool.len() >= self.max_live {
                let id = pool.evict_oldest().copied().unwrap();
                self.released.push(id);
                return Ok(StepOutcome::Evicted);
            }
            let handle = pool.allocate_with(|| 0)?;
            *pool.get_mut(handle) = self.next;
            self.next += 1;
            ctx.bump();
            Ok(StepOutcome::Progress)
        }

        fn release(&mut self, record: &mut u64) -> Result<(), StressError> {
            self.released.push(*record);
            Ok(())
        }

        fn finish(&mut self, _name: &str, _summary: &WorkerSummary) {
            self.finished = true;
        }
    }

    #[test]
    fn test_runs_to_cap_and_releases_everything() {
        let block = ControlBlock::new();
        let token = CancellationToken::new(RunController::new(&block, 5), 50);
        let counter = AtomicU64::new(0);
        let mut strategy = Sequencer::new(8);

        let summary = WorkerDriver::new("seq").run(&mut strategy, &token, &counter, None).unwrap();

        assert_eq!(counter.load(Ordering::Relaxed), 50);
        assert_eq!(summary.successes, 50);
        assert_eq!(summary.peak_live, 8);
        assert_eq!(summary.drained, 8);
        assert_eq!(summary.backed, 8);
        assert!(strategy.finished);

        // FIFO release, each id exactly once
        assert_eq!(strategy.released, (0..50).collect::<Vec<_>>());
    }

    #[test]
    fn test_fatal_step_still_drains_and_counts_failure() {
        let block = ControlBlock::new();
        let controller = RunController::new(&block, 5);
        let token = CancellationToken::new(controller, 0);
        let counter = AtomicU64::new(0);
        let mut strategy = Sequencer::new(100);
        strategy.fail_at = Some(10);

        let err = WorkerDriver::new("seq").run(&mut strategy, &token, &counter, None).unwrap_err();
        assert!(matches!(err, StressError::Operational { what: "write", .. }));
        assert_eq!(strategy.released, (0..10).collect::<Vec<_>>());
        assert_eq!(controller.failure_count(), 1);
    }

    #[test]
    fn test_pool_exhaustion_is_fatal() {
        let block = ControlBlock::new();
        let token = CancellationToken::new(RunController::new(&block, 5), 0);
        let counter = AtomicU64::new(0);
        let mut strategy = Sequencer::new(100);

        let err = WorkerDriver::new("seq")
            .run_with_pool(&mut strategy, ResourcePool::with_record_limit(3), &token, &counter, None)
            .unwrap_err();
        assert!(matches!(err, StressError::PoolExhausted(PoolError::OutOfMemory { live: 3 })));
        assert_eq!(strategy.released, vec![0, 1, 2]);
    }

    #[test]
    fn test_stop_request_ends_loop() {
        let block = ControlBlock::new();
        let controller = RunController::new(&block, 5);
        controller.request_stop();
        let token = CancellationToken::new(controller, 0);
        let counter = AtomicU64::new(0);
        let mut strategy = Sequencer::new(4);

        let summary = WorkerDriver::new("seq").run(&mut strategy, &token, &counter, None).unwrap();
        assert_eq!(summary.iterations, 0);
        assert!(strategy.finished);
    }

    #[test]
    fn test_denied_every_time_terminates_after_cap_iterations() {
        let block = ControlBlock::new();
        let token = CancellationToken::new(RunController::new(&block, 5), 25);
        let counter = AtomicU64::new(0);
        let mut strategy = Sequencer::new(4);
        strategy.deny_all = true;

        let summary = WorkerDriver::new("seq").run(&mut strategy, &token, &counter, None).unwrap();
        assert_eq!(summary.iterations, 25);
        assert_eq!(summary.backpressure, 25);
        assert_eq!(summary.peak_live, 0);
        assert_eq!(counter.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_interrupted_steps_are_retried_not_counted() {
        let block = ControlBlock::new();
        let controller = RunController::new(&block, 1);
        let token = CancellationToken::new(controller, 5);
        let counter = AtomicU64::new(0);
        let mut strategy = Sequencer::new(4);
        strategy.interrupt_alternate = true;

        let summary = WorkerDriver::new("seq").run(&mut strategy, &token, &counter, None).unwrap();

        assert_eq!(counter.load(Ordering::Relaxed), 5);
        assert_eq!(summary.iterations, 5);
        assert_eq!(summary.successes, 5);
        assert_eq!(strategy.calls, 10);
        assert_eq!(controller.failure_count(), 0);
        assert!(!controller.aborted());
    }
}
