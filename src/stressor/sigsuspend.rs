//! Signal wake-up storm
//!
//! The worker forks [`SIGSUSPEND_CHILDREN`] children that sleep in
//! `sigsuspend(2)` and bump the worker's counter every time SIGUSR1 wakes
//! them. The worker itself does nothing but send SIGUSR1 to every child until
//! the cap or a stop request, then kills and reaps them.
//!
//! The handler is installed and SIGUSR1 blocked before forking, so a child can
//! never be killed by a signal that arrives before it first suspends, and a
//! signal sent between two waits stays pending for the next one.

use super::signal::{sigset_all_but, BlockedSignal, UserSignalHandler};
use super::{StressArgs, Stressor, StressorKind};
use crate::control::{CancellationToken, RunController};
use crate::error::StressError;
use crate::stats::SensorSampler;
use crate::worker::process::EXIT_SUCCESS;
use crate::worker::WorkerProcess;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};

/// Children each worker signals
pub const SIGSUSPEND_CHILDREN: usize = 4;

/// Signal rounds between checks that every child is still alive
const LIVENESS_ROUNDS: u64 = 64;

/// Child body: wait for SIGUSR1, count, repeat
fn suspend_loop(controller: &RunController<'_>, counter: &AtomicU64) -> i32 {
    let mask = sigset_all_but(libc::SIGUSR1);
    while controller.is_running() {
        unsafe { libc::sigsuspend(&mask) };
        counter.fetch_add(1, Ordering::Relaxed);
    }
    EXIT_SUCCESS
}

/// Send SIGUSR1 to every child until the token says stop
fn signal_children(
    children: &mut [WorkerProcess],
    token: &CancellationToken<'_>,
    counter: &AtomicU64,
    mut sampler: Option<&mut SensorSampler<'_>>,
) -> Result<(), StressError> {
    let mut rounds = 0u64;
    while token.should_continue(counter) {
        for child in children.iter() {
            if unsafe { libc::kill(child.pid(), libc::SIGUSR1) } != 0 {
                return Err(StressError::last_os("kill"));
            }
        }

        rounds += 1;
        if rounds % LIVENESS_ROUNDS == 0 {
            for child in children.iter_mut() {
                if let Ok(Some(exit)) = child.try_wait() {
                    // Children leave on their own once the run stops
                    if !token.controller().is_running() {
                        return Ok(());
                    }
                    return Err(StressError::Operational {
                        what: "sigsuspend child",
                        source: io::Error::new(io::ErrorKind::Other, format!("exited early: {:?}", exit)),
                    });
                }
            }
        }

        if let Some(sampler) = sampler.as_mut() {
            sampler.maybe_sample();
        }
    }
    Ok(())
}

/// The sigsuspend stressor
#[derive(Debug, Clone, Default)]
pub struct SigsuspendStressor;

impl SigsuspendStressor {
    pub fn new() -> Self {
        Self
    }
}

impl Stressor for SigsuspendStressor {
    fn kind(&self) -> StressorKind {
        StressorKind::Sigsuspend
    }

    fn run(&self, args: &mut StressArgs<'_>) -> Result<(), StressError> {
        let _handler = UserSignalHandler::install().map_err(|e| args.fail(e))?;
        let _blocked = BlockedSignal::block(libc::SIGUSR1).map_err(|e| args.fail(e))?;

        let name = args.name;
        let controller = args.controller;
        let counter = args.counter;
        let token = args.token();

        let mut children = Vec::with_capacity(SIGSUSPEND_CHILDREN);
        for _ in 0..SIGSUSPEND_CHILDREN {
            match WorkerProcess::spawn(Some(&controller), || suspend_loop(&controller, counter)) {
                Ok(child) => children.push(child),
                Err(e) => {
                    tracing::debug!("{}: {:#}", name, e);
                    break;
                }
            }
        }
        if children.is_empty() {
            tracing::warn!("{}: no children to signal", name);
            return Ok(());
        }

        let result = signal_children(&mut children, &token, counter, args.sampler_mut());

        for child in &children {
            if let Err(e) = child.kill() {
                tracing::warn!("{}: {:#}", name, e);
            }
        }
        for child in &mut children {
            if let Err(e) = child.wait() {
                tracing::warn!("{}: {:#}", name, e);
            }
        }

        result.map_err(|e| args.fail(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::{ControlBlock, SharedMem, SharedSlice};
    use crate::coordinator::signal::TEST_LOCK;
    use std::path::Path;

    #[test]
    fn test_children_count_wakeups_to_cap() {
        let _serial = TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let block: SharedMem<ControlBlock> = SharedMem::new().unwrap();
        let counters: SharedSlice<AtomicU64> = SharedSlice::new(1).unwrap();
        let controller = RunController::new(&block, 1);

        let mut args = StressArgs {
            counter: &counters[0],
            instance: 0,
            max_ops: 200,
            name: "sigsuspend",
            controller,
            sampler: None,
            seed: 1,
            temp_path: Path::new("."),
        };
        SigsuspendStressor::new().run(&mut args).unwrap();

        assert!(counters[0].load(Ordering::Relaxed) >= 200);
        assert_eq!(controller.failure_count(), 0);
    }

    #[test]
    fn test_stop_before_start_signals_nothing() {
        let _serial = TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let block: SharedMem<ControlBlock> = SharedMem::new().unwrap();
        let counters: SharedSlice<AtomicU64> = SharedSlice::new(1).unwrap();
        let controller = RunController::new(&block, 1);
        controller.request_stop();

        let mut args = StressArgs {
            counter: &counters[0],
            instance: 0,
            max_ops: 0,
            name: "sigsuspend",
            controller,
            sampler: None,
            seed: 1,
            temp_path: Path::new("."),
        };
        // Children see the stop flag and exit without being signalled
        assert!(SigsuspendStressor::new().run(&mut args).is_ok());
        assert_eq!(counters[0].load(Ordering::Relaxed), 0);
    }
}
