//! Out-of-process workers
//!
//! Every worker runs in its own forked process so that a crash takes down only
//! that worker. The child runs a closure and leaves with `_exit`, never
//! returning into the parent's code or running the parent's destructors.
//! Shared state must be mapped with [`crate::control::SharedMem`] before the
//! fork; everything else the child touches is its own copy.

use crate::control::RunController;
use crate::Result;
use anyhow::Context;
use std::panic::{self, AssertUnwindSafe};
use std::time::{Duration, Instant};

/// Exit status of the child when its closure reports success
pub const EXIT_SUCCESS: i32 = 0;
/// Exit status of the child on failure or panic
pub const EXIT_FAILURE: i32 = 1;

/// How a worker process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// Exited with status 0
    Success,
    /// Exited with a non-zero status
    Failed(i32),
    /// Killed by a signal
    Signaled(i32),
}

impl WorkerExit {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }

    fn from_wait_status(status: libc::c_int) -> Self {
        if libc::WIFEXITED(status) {
            match libc::WEXITSTATUS(status) {
                0 => Self::Success,
                code => Self::Failed(code),
            }
        } else if libc::WIFSIGNALED(status) {
            Self::Signaled(libc::WTERMSIG(status))
        } else {
            Self::Failed(-1)
        }
    }
}

/// A forked child process running a worker closure
#[derive(Debug)]
pub struct WorkerProcess {
    pid: libc::pid_t,
    exit: Option<WorkerExit>,
}

impl WorkerProcess {
    /// Fork a child that runs `body` and exits with the returned status
    ///
    /// `EAGAIN` from fork is retried for as long as `controller` reports the
    /// run active; any other failure is an error.
    pub fn spawn<F>(controller: Option<&RunController<'_>>, body: F) -> Result<Self>
    where
        F: FnOnce() -> i32,
    {
        let pid = fork_retrying(controller, || {
            let pid = unsafe { libc::fork() };
            if pid < 0 {
                Err(std::io::Error::last_os_error())
            } else {
                Ok(pid)
            }
        })
        .context("Failed to fork worker process")?;

        if pid == 0 {
            let code = panic::catch_unwind(AssertUnwindSafe(body)).unwrap_or(EXIT_FAILURE);
            unsafe { libc::_exit(code) };
        }

        Ok(Self { pid, exit: None })
    }

    pub fn pid(&self) -> libc::pid_t {
        self.pid
    }

    /// Exit status if the process has already been reaped
    pub fn exit_status(&self) -> Option<WorkerExit> {
        self.exit
    }

    /// Block until the process exits
    pub fn wait(&mut self) -> Result<WorkerExit> {
        if let Some(exit) = self.exit {
            return Ok(exit);
        }
        self.waitpid(0)?.context("waitpid returned without a status")
    }

    /// Reap the process if it has exited, without blocking
    pub fn try_wait(&mut self) -> Result<Option<WorkerExit>> {
        if let Some(exit) = self.exit {
            return Ok(Some(exit));
        }
        self.waitpid(libc::WNOHANG)
    }

    /// Wait until `deadline` for the process to exit
    pub fn wait_until(&mut self, deadline: Instant) -> Result<Option<WorkerExit>> {
        loop {
            if let Some(exit) = self.try_wait()? {
                return Ok(Some(exit));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            std::thread::sleep((deadline - now).min(Duration::from_millis(10)));
        }
    }

    /// Force the process to terminate (SIGKILL); reap with [`wait`](Self::wait)
    pub fn kill(&self) -> Result<()> {
        if self.exit.is_some() {
            return Ok(());
        }
        let rc = unsafe { libc::kill(self.pid, libc::SIGKILL) };
        if rc != 0 {
            let err = std::io::Error::last_os_error();
            // Already gone but not yet reaped
            if err.raw_os_error() != Some(libc::ESRCH) {
                return Err(err).with_context(|| format!("Failed to kill worker {}", self.pid));
            }
        }
        Ok(())
    }

    fn waitpid(&mut self, flags: libc::c_int) -> Result<Option<WorkerExit>> {
        loop {
            let mut status: libc::c_int = 0;
            let rc = unsafe { libc::waitpid(self.pid, &mut status, flags) };
            if rc == self.pid {
                let exit = WorkerExit::from_wait_status(status);
                self.exit = Some(exit);
                return Ok(Some(exit));
            }
            if rc == 0 {
                return Ok(None);
            }

            let err = std::io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EINTR) {
                return Err(err).with_context(|| format!("Failed to wait for worker {}", self.pid));
            }
        }
    }
}

/// Call `fork` until it succeeds or fails for good
///
/// `EAGAIN` and `EINTR` are retried while `controller` reports the run active.
fn fork_retrying(
    controller: Option<&RunController<'_>>,
    mut fork: impl FnMut() -> std::io::Result<libc::pid_t>,
) -> std::io::Result<libc::pid_t> {
    loop {
        match fork() {
            Ok(pid) => return Ok(pid),
            Err(err) => {
                let retry = matches!(err.raw_os_error(), Some(libc::EAGAIN) | Some(libc::EINTR))
                    && controller.map_or(false, |c| c.is_running());
                if !retry {
                    return Err(err);
                }
            }
        }
    }
}

impl Drop for WorkerProcess {
    fn drop(&mut self) {
        // Never leave a running or zombie child behind
        if self.exit.is_none() {
            let _ = self.kill();
            let _ = self.wait();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::ControlBlock;
    use std::io;

    #[test]
    fn test_exit_status_propagates() {
        let mut ok = WorkerProcess::spawn(None, || EXIT_SUCCESS).unwrap();
        let mut failed = WorkerProcess::spawn(None, || 3).unwrap();

        assert_eq!(ok.wait().unwrap(), WorkerExit::Success);
        assert_eq!(failed.wait().unwrap(), WorkerExit::Failed(3));
        // Reaped status is remembered
        assert_eq!(failed.try_wait().unwrap(), Some(WorkerExit::Failed(3)));
    }

    #[test]
    fn test_kill_stuck_worker() {
        let mut stuck = WorkerProcess::spawn(None, || loop {
            unsafe { libc::pause() };
        })
        .unwrap();

        let deadline = Instant::now() + Duration::from_millis(50);
        assert_eq!(stuck.wait_until(deadline).unwrap(), None);

        stuck.kill().unwrap();
        assert_eq!(stuck.wait().unwrap(), WorkerExit::Signaled(libc::SIGKILL));
    }

    #[test]
    fn test_fork_retries_transient_errors() {
        let block = ControlBlock::new();
        let controller = RunController::new(&block, 1);
        let mut calls = 0;

        let pid = fork_retrying(Some(&controller), || {
            calls += 1;
            match calls {
                1 => Err(io::Error::from_raw_os_error(libc::EAGAIN)),
                2 => Err(io::Error::from_raw_os_error(libc::EINTR)),
                _ => Ok(4242),
            }
        })
        .unwrap();

        assert_eq!(pid, 4242);
        assert_eq!(calls, 3);
        assert_eq!(controller.failure_count(), 0);
    }

    #[test]
    fn test_fork_gives_up_when_stopped_or_fatal() {
        let block = ControlBlock::new();
        let controller = RunController::new(&block, 1);

        let mut calls = 0;
        let err = fork_retrying(Some(&controller), || {
            calls += 1;
            Err(io::Error::from_raw_os_error(libc::ENOSYS))
        })
        .unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::ENOSYS));
        assert_eq!(calls, 1);

        controller.request_stop();
        let mut calls = 0;
        let err = fork_retrying(Some(&controller), || {
            calls += 1;
            Err(io::Error::from_raw_os_error(libc::EAGAIN))
        })
        .unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EAGAIN));
        assert_eq!(calls, 1);

        // Without a controller nothing is retried
        assert!(fork_retrying(None, || Err(io::Error::from_raw_os_error(libc::EINTR))).is_err());
    }
}
