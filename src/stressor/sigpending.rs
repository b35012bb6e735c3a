//! Pending-signal bookkeeping
//!
//! Every step blocks SIGUSR1, raises it against the worker's own thread and
//! checks that `sigpending(2)` reports it; then unblocks it (the no-op handler
//! runs) and checks that it is no longer pending. A check that comes out wrong
//! counts against the circuit breaker but does not end the worker.

use super::signal::{is_pending, set_thread_mask, BlockedSignal, UserSignalHandler};
use super::{StressArgs, Stressor, StressorKind};
use crate::error::{FailureKind, StressError};
use crate::pool::ResourcePool;
use crate::worker::{ContentionStrategy, StepContext, StepOutcome, WorkerDriver};
use libc::sigset_t;

/// The block, raise, check, unblock, check [`ContentionStrategy`]
pub struct PendingSignals {
    /// Mask with SIGUSR1 blocked
    blocked: sigset_t,
    /// Mask the worker started with, SIGUSR1 open
    open: sigset_t,
    mismatches: u64,
}

impl PendingSignals {
    /// Masks derived from the one `guard` replaced
    pub fn new(guard: &BlockedSignal) -> Self {
        let mut open = *guard.previous();
        unsafe { libc::sigdelset(&mut open, libc::SIGUSR1) };
        let mut blocked = open;
        unsafe { libc::sigaddset(&mut blocked, libc::SIGUSR1) };
        Self {
            blocked,
            open,
            mismatches: 0,
        }
    }

    /// Checks that came out wrong
    pub fn mismatches(&self) -> u64 {
        self.mismatches
    }

    fn mismatch(&mut self, ctx: &StepContext<'_>, what: &str) -> StepOutcome {
        self.mismatches += 1;
        ctx.record_failure(FailureKind::Operational);
        tracing::error!("SIGUSR1 {}", what);
        StepOutcome::Backpressure
    }
}

impl ContentionStrategy for PendingSignals {
    type Record = ();

    fn step(&mut self, _pool: &mut ResourcePool<()>, ctx: &StepContext<'_>) -> Result<StepOutcome, StressError> {
        set_thread_mask(&self.blocked).map_err(|source| StressError::Operational {
            what: "pthread_sigmask",
            source,
        })?;
        if unsafe { libc::raise(libc::SIGUSR1) } != 0 {
            return Err(StressError::last_os("raise"));
        }
        let raised = is_pending(libc::SIGUSR1).map_err(|source| StressError::Operational {
            what: "sigpending",
            source,
        })?;

        // Unblocking delivers the signal before this returns
        set_thread_mask(&self.open).map_err(|source| StressError::Operational {
            what: "pthread_sigmask",
            source,
        })?;
        let lingering = is_pending(libc::SIGUSR1).map_err(|source| StressError::Operational {
            what: "sigpending",
            source,
        })?;

        if !raised {
            return Ok(self.mismatch(ctx, "not pending while blocked"));
        }
        if lingering {
            return Ok(self.mismatch(ctx, "still pending after unblock"));
        }
        ctx.bump();
        Ok(StepOutcome::Progress)
    }

    fn release(&mut self, _record: &mut ()) -> Result<(), StressError> {
        Ok(())
    }
}

/// The sigpending stressor
#[derive(Debug, Clone, Default)]
pub struct SigpendingStressor;

impl SigpendingStressor {
    pub fn new() -> Self {
        Self
    }
}

impl Stressor for SigpendingStressor {
    fn kind(&self) -> StressorKind {
        StressorKind::Sigpending
    }

    fn run(&self, args: &mut StressArgs<'_>) -> Result<(), StressError> {
        let _handler = UserSignalHandler::install().map_err(|e| args.fail(e))?;
        let guard = BlockedSignal::block(libc::SIGUSR1).map_err(|e| args.fail(e))?;

        let mut strategy = PendingSignals::new(&guard);
        let token = args.token();
        let counter = args.counter;
        WorkerDriver::new(args.name)
            .run(&mut strategy, &token, counter, args.sampler_mut())
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::{CancellationToken, ControlBlock, RunController};
    use crate::coordinator::signal::TEST_LOCK;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[test]
    fn test_runs_to_cap_without_mismatches() {
        let _serial = TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let block = ControlBlock::new();
        let controller = RunController::new(&block, 1);
        let token = CancellationToken::new(controller, 500);
        let counter = AtomicU64::new(0);

        let _handler = UserSignalHandler::install().unwrap();
        let guard = BlockedSignal::block(libc::SIGUSR1).unwrap();
        let mut strategy = PendingSignals::new(&guard);
        let summary = WorkerDriver::new("sigpending")
            .run(&mut strategy, &token, &counter, None)
            .unwrap();

        assert_eq!(counter.load(Ordering::Relaxed), 500);
        assert_eq!(summary.successes, 500);
        assert_eq!(strategy.mismatches(), 0);
        assert_eq!(controller.failure_count(), 0);
        drop(guard);
        assert!(!is_pending(libc::SIGUSR1).unwrap());
    }

    #[test]
    fn test_open_mask_leaves_signal_unblocked() {
        let _serial = TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let guard = BlockedSignal::block(libc::SIGUSR1).unwrap();
        let strategy = PendingSignals::new(&guard);
        unsafe {
            assert_eq!(libc::sigismember(&strategy.blocked, libc::SIGUSR1), 1);
            assert_eq!(libc::sigismember(&strategy.open, libc::SIGUSR1), 0);
        }
    }
}
