//! Run control shared by every worker
//!
//! A [`ControlBlock`] holds the only control state that crosses process
//! boundaries: the run flag, the failure count feeding the circuit breaker and
//! the latch that makes the abort notice fire once. It is allocated in a
//! [`SharedMem`] mapping before any worker is forked and handed to each worker
//! through a [`RunController`].
//!
//! # Example
//!
//! ```
//! use stresspulse::control::{ControlBlock, RunController, SharedMem};
//! use stresspulse::error::FailureKind;
//!
//! let block: SharedMem<ControlBlock> = SharedMem::new().unwrap();
//! let controller = RunController::new(&block, 2);
//!
//! assert!(controller.should_continue(0, 10));
//! assert!(!controller.should_continue(10, 10));
//!
//! assert!(!controller.record_failure(FailureKind::Operational));
//! assert!(controller.record_failure(FailureKind::Operational));
//! assert!(!controller.is_running());
//! ```

pub mod shared;

pub use shared::{Shareable, SharedMem, SharedSlice};

use crate::error::FailureKind;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Default number of operational failures that aborts the run
pub const ABORT_FAILURES: u64 = 5;

/// Cross-process run state
///
/// Every field is zero at creation, which reads as "running, no failures".
#[repr(C)]
#[derive(Debug, Default)]
pub struct ControlBlock {
    /// Set once the run must wind down
    stop: AtomicBool,
    /// Set by the one caller that trips the circuit breaker
    aborted_latch: AtomicBool,
    failure_count: AtomicU64,
    abort_notices: AtomicU64,
}

unsafe impl Shareable for ControlBlock {}

impl ControlBlock {
    /// A fresh, process-private block (tests, single-process runs)
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the stop flag; a single atomic store, safe from a signal handler
    #[inline]
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
    }
}

/// Per-process handle on the shared [`ControlBlock`]
#[derive(Debug, Clone, Copy)]
pub struct RunController<'a> {
    block: &'a ControlBlock,
    failure_threshold: u64,
}

impl<'a> RunController<'a> {
    /// Create a controller; a `failure_threshold` of 0 disables the breaker
    pub fn new(block: &'a ControlBlock, failure_threshold: u64) -> Self {
        Self {
            block,
            failure_threshold,
        }
    }

    /// True while the run is active and `local_count` is below `cap`
    ///
    /// A `cap` of 0 means unbounded. This is the only point where a worker loop
    /// yields to the controller; nothing in flight is ever interrupted.
    #[inline]
    pub fn should_continue(&self, local_count: u64, cap: u64) -> bool {
        self.is_running() && (cap == 0 || local_count < cap)
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        !self.block.stop.load(Ordering::Acquire)
    }

    /// Stop the run (operator interrupt, expired time budget)
    ///
    /// Workers notice at their next loop check; in-flight syscalls complete.
    pub fn request_stop(&self) {
        self.block.request_stop();
    }

    /// Count an operational failure toward the circuit breaker
    ///
    /// Once the count reaches the threshold, exactly one caller across all
    /// processes wins the latch, stops the run and emits the abort notice.
    /// Returns `true` for that caller only.
    pub fn record_failure(&self, kind: FailureKind) -> bool {
        let count = self.block.failure_count.fetch_add(1, Ordering::AcqRel) + 1;
        tracing::debug!("{} failure recorded ({} so far)", kind.as_str(), count);

        if self.failure_threshold == 0 || count < self.failure_threshold {
            return false;
        }

        if self
            .block
            .aborted_latch
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        self.request_stop();
        self.block.abort_notices.fetch_add(1, Ordering::AcqRel);
        tracing::warn!(
            "{} failures reached, aborting stress process",
            self.failure_threshold
        );
        true
    }

    /// True once the circuit breaker has tripped
    pub fn aborted(&self) -> bool {
        self.block.aborted_latch.load(Ordering::Acquire)
    }

    pub fn failure_count(&self) -> u64 {
        self.block.failure_count.load(Ordering::Acquire)
    }

    /// Number of abort notices emitted (0 or 1)
    pub fn abort_notices(&self) -> u64 {
        self.block.abort_notices.load(Ordering::Acquire)
    }

    pub fn failure_threshold(&self) -> u64 {
        self.failure_threshold
    }
}

/// Cancellation token a worker loop polls once per iteration
///
/// Captures the shared stop flag (through the controller) and the worker's
/// operation cap.
#[derive(Debug, Clone, Copy)]
pub struct CancellationToken<'a> {
    controller: RunController<'a>,
    cap: u64,
}

impl<'a> CancellationToken<'a> {
    pub fn new(controller: RunController<'a>, cap: u64) -> Self {
        Self { controller, cap }
    }

    #[inline]
    pub fn should_continue(&self, counter: &AtomicU64) -> bool {
        self.controller
            .should_continue(counter.load(Ordering::Relaxed), self.cap)
    }

    #[inline]
    pub fn cap(&self) -> u64 {
        self.cap
    }

    #[inline]
    pub fn controller(&self) -> &RunController<'a> {
        &self.controller
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    #[test]
    fn test_should_continue_respects_cap() {
        let block = ControlBlock::new();
        let controller = RunController::new(&block, ABORT_FAILURES);

        assert!(controller.should_continue(0, 0));
        assert!(controller.should_continue(u64::MAX - 1, 0));
        assert!(controller.should_continue(4, 5));
        assert!(!controller.should_continue(5, 5));
    }

    #[test]
    fn test_request_stop_ends_run() {
        let block = ControlBlock::new();
        let controller = RunController::new(&block, ABORT_FAILURES);
        controller.request_stop();
        assert!(!controller.should_continue(0, 0));
        assert!(!controller.aborted());
        assert_eq!(controller.abort_notices(), 0);
    }

    #[test]
    fn test_threshold_zero_never_aborts() {
        let block = ControlBlock::new();
        let controller = RunController::new(&block, 0);
        for _ in 0..100 {
            assert!(!controller.record_failure(FailureKind::Operational));
        }
        assert!(controller.is_running());
        assert_eq!(controller.failure_count(), 100);
    }

    #[test]
    fn test_one_shot_abort_across_workers() {
        let block = ControlBlock::new();
        let winners = AtomicUsize::new(0);
        let observed_stop = AtomicUsize::new(0);

        thread::scope(|scope| {
            for worker in 0..3 {
                let block = &block;
                let winners = &winners;
                let observed_stop = &observed_stop;
                scope.spawn(move || {
                    let controller = RunController::new(block, 5);
                    // 20 failures spread over 3 workers: 7 + 7 + 6
                    let failures = if worker == 2 { 6 } else { 7 };
                    for _ in 0..failures {
                        if controller.record_failure(FailureKind::Operational) {
                            winners.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                    if !controller.should_continue(0, 0) {
                        observed_stop.fetch_add(1, Ordering::SeqCst);
                    }
                });
            }
        });

        let controller = RunController::new(&block, 5);
        assert_eq!(controller.failure_count(), 20);
        assert_eq!(winners.load(Ordering::SeqCst), 1);
        assert_eq!(controller.abort_notices(), 1);
        assert!(controller.aborted());
        assert_eq!(observed_stop.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_one_shot_abort_across_processes() {
        let block: SharedMem<ControlBlock> = SharedMem::new().unwrap();
        let mut pids = Vec::new();

        for _ in 0..3 {
            let pid = unsafe { libc::fork() };
            assert!(pid >= 0, "fork failed");
            if pid == 0 {
                let controller = RunController::new(&block, 5);
                for _ in 0..7 {
                    controller.record_failure(FailureKind::Operational);
                }
                let code = if controller.is_running() { 1 } else { 0 };
                unsafe { libc::_exit(code) };
            }
            pids.push(pid);
        }

        for pid in pids {
            let mut status = 0;
            assert_eq!(unsafe { libc::waitpid(pid, &mut status, 0) }, pid);
            assert!(libc::WIFEXITED(status));
            assert_eq!(libc::WEXITSTATUS(status), 0);
        }

        let controller = RunController::new(&block, 5);
        assert_eq!(controller.failure_count(), 21);
        assert_eq!(controller.abort_notices(), 1);
        assert!(!controller.is_running());
    }

    #[test]
    fn test_cancellation_token_reads_counter() {
        let block = ControlBlock::new();
        let token = CancellationToken::new(RunController::new(&block, 5), 3);
        let counter = AtomicU64::new(2);
        assert!(token.should_continue(&counter));
        counter.store(3, Ordering::Relaxed);
        assert!(!token.should_continue(&counter));
    }
}
