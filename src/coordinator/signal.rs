//! SIGINT handling
//!
//! An interrupt only sets the shared stop flag. Workers inherit the handler
//! across fork and the control block is mapped at the same address in every
//! process, so an interrupt delivered to any process in the group stops them
//! all at their next loop check.

use crate::control::ControlBlock;
use std::marker::PhantomData;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

/// Control block the handler stops; null when no guard is installed
static STOP_TARGET: AtomicPtr<ControlBlock> = AtomicPtr::new(ptr::null_mut());

extern "C" fn on_interrupt(_sig: libc::c_int) {
    let block = STOP_TARGET.load(Ordering::Acquire);
    if !block.is_null() {
        unsafe { (*block).request_stop() };
    }
}

/// Routes SIGINT to a control block's stop flag until dropped
pub struct InterruptGuard<'a> {
    previous: libc::sighandler_t,
    _block: PhantomData<&'a ControlBlock>,
}

impl<'a> InterruptGuard<'a> {
    pub fn install(block: &'a ControlBlock) -> Self {
        STOP_TARGET.store(block as *const ControlBlock as *mut ControlBlock, Ordering::Release);
        let previous = unsafe {
            libc::signal(
                libc::SIGINT,
                on_interrupt as extern "C" fn(libc::c_int) as libc::sighandler_t,
            )
        };
        Self {
            previous,
            _block: PhantomData,
        }
    }
}

impl Drop for InterruptGuard<'_> {
    fn drop(&mut self) {
        if self.previous != libc::SIG_ERR {
            unsafe { libc::signal(libc::SIGINT, self.previous) };
        }
        STOP_TARGET.store(ptr::null_mut(), Ordering::Release);
    }
}

/// Serializes tests that install a guard; there is only one SIGINT disposition
#[cfg(test)]
pub(crate) static TEST_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());
