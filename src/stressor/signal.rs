//! SIGUSR1 plumbing shared by the signal stressors
//!
//! Masks are changed with `pthread_sigmask`, so they only ever affect the
//! calling thread. Both guards put back what they replaced when dropped.

use crate::error::StressError;
use libc::{c_int, sigset_t};
use std::io;
use std::mem;
use std::ptr;

extern "C" fn on_user_signal(_sig: c_int) {}

/// Signal set holding exactly `signals`
pub fn sigset_of(signals: &[c_int]) -> sigset_t {
    let mut set: sigset_t = unsafe { mem::zeroed() };
    unsafe {
        libc::sigemptyset(&mut set);
        for &sig in signals {
            libc::sigaddset(&mut set, sig);
        }
    }
    set
}

/// Signal set holding every signal but `sig`
pub fn sigset_all_but(sig: c_int) -> sigset_t {
    let mut set: sigset_t = unsafe { mem::zeroed() };
    unsafe {
        libc::sigfillset(&mut set);
        libc::sigdelset(&mut set, sig);
    }
    set
}

/// True if `sig` is pending for this thread or the process
pub fn is_pending(sig: c_int) -> io::Result<bool> {
    let mut set: sigset_t = unsafe { mem::zeroed() };
    if unsafe { libc::sigpending(&mut set) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { libc::sigismember(&set, sig) } == 1)
}

/// Replace this thread's signal mask, returning the previous one
pub fn set_thread_mask(mask: &sigset_t) -> io::Result<sigset_t> {
    let mut previous: sigset_t = unsafe { mem::zeroed() };
    let rc = unsafe { libc::pthread_sigmask(libc::SIG_SETMASK, mask, &mut previous) };
    if rc != 0 {
        return Err(io::Error::from_raw_os_error(rc));
    }
    Ok(previous)
}

/// No-op SIGUSR1 handler, so the signal interrupts instead of terminating
pub struct UserSignalHandler {
    previous: libc::sigaction,
}

impl UserSignalHandler {
    pub fn install() -> Result<Self, StressError> {
        let mut action: libc::sigaction = unsafe { mem::zeroed() };
        action.sa_sigaction = on_user_signal as extern "C" fn(c_int) as libc::sighandler_t;
        unsafe { libc::sigemptyset(&mut action.sa_mask) };

        let mut previous: libc::sigaction = unsafe { mem::zeroed() };
        if unsafe { libc::sigaction(libc::SIGUSR1, &action, &mut previous) } < 0 {
            return Err(StressError::setup("sigaction", io::Error::last_os_error()));
        }
        Ok(Self { previous })
    }
}

impl Drop for UserSignalHandler {
    fn drop(&mut self) {
        unsafe { libc::sigaction(libc::SIGUSR1, &self.previous, ptr::null_mut()) };
    }
}

/// This thread's signal mask with `sig` added, restored on drop
pub struct BlockedSignal {
    previous: sigset_t,
}

impl BlockedSignal {
    pub fn block(sig: c_int) -> Result<Self, StressError> {
        let mut mask: sigset_t = unsafe { mem::zeroed() };
        let rc = unsafe { libc::pthread_sigmask(libc::SIG_SETMASK, ptr::null(), &mut mask) };
        if rc != 0 {
            return Err(StressError::setup("pthread_sigmask", io::Error::from_raw_os_error(rc)));
        }
        unsafe { libc::sigaddset(&mut mask, sig) };

        let previous = set_thread_mask(&mask).map_err(|e| StressError::setup("pthread_sigmask", e))?;
        Ok(Self { previous })
    }

    /// The mask that was in force before `sig` was blocked
    pub fn previous(&self) -> &sigset_t {
        &self.previous
    }
}

impl Drop for BlockedSignal {
    fn drop(&mut self) {
        let _ = set_thread_mask(&self.previous);
    }
}
