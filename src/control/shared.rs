//! Cross-process shared memory
//!
//! Anonymous `MAP_SHARED` mappings created before workers fork. Unlike ordinary
//! heap memory, which a forked child gets a copy-on-write copy of, writes to these
//! pages are seen by the parent and by every sibling.
//!
//! Only types marked [`Shareable`] may be placed here: they must be valid when
//! every byte is zero (the kernel hands out zeroed pages) and must not contain
//! pointers into process-private memory.

use crate::Result;
use anyhow::Context;
use std::marker::PhantomData;
use std::ops::Deref;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64};

/// Marker for types that can live in a zero-initialised shared mapping
///
/// # Safety
///
/// Implementors must be valid when all bytes are zero, must be `Sync`, and must
/// only be mutated through interior atomics.
pub unsafe trait Shareable: Sync {}

unsafe impl Shareable for AtomicU64 {}
unsafe impl Shareable for AtomicU32 {}
unsafe impl Shareable for AtomicBool {}

/// A zero-initialised slice of `T` in a shared anonymous mapping
pub struct SharedSlice<T: Shareable> {
    ptr: NonNull<T>,
    len: usize,
    map_len: usize,
    _marker: PhantomData<T>,
}

impl<T: Shareable> SharedSlice<T> {
    /// Map `len` zeroed elements shared with future children
    pub fn new(len: usize) -> Result<Self> {
        let bytes = std::mem::size_of::<T>()
            .checked_mul(len.max(1))
            .context("Shared mapping size overflows")?;

        let addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                bytes,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(std::io::Error::last_os_error())
                .with_context(|| format!("Failed to map {} bytes of shared memory", bytes));
        }

        // mmap returns page-aligned memory, which satisfies any T alignment we use
        let ptr = NonNull::new(addr as *mut T).context("mmap returned a null mapping")?;

        Ok(Self {
            ptr,
            len,
            map_len: bytes,
            _marker: PhantomData,
        })
    }

    /// Number of elements
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl<T: Shareable> Deref for SharedSlice<T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl<T: Shareable> Drop for SharedSlice<T> {
    fn drop(&mut self) {
        let result = unsafe { libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.map_len) };
        if result != 0 {
            tracing::warn!(
                "munmap of {} shared bytes failed: {}",
                self.map_len,
                std::io::Error::last_os_error()
            );
        }
    }
}

// All access goes through atomics in T
unsafe impl<T: Shareable> Send for SharedSlice<T> {}
unsafe impl<T: Shareable> Sync for SharedSlice<T> {}

/// A single zero-initialised `T` in a shared anonymous mapping
pub struct SharedMem<T: Shareable> {
    inner: SharedSlice<T>,
}

impl<T: Shareable> SharedMem<T> {
    pub fn new() -> Result<Self> {
        Ok(Self {
            inner: SharedSlice::new(1)?,
        })
    }
}

impl<T: Shareable> Deref for SharedMem<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.inner[0]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    #[test]
    fn test_shared_slice_starts_zeroed() {
        let counters: SharedSlice<AtomicU64> = SharedSlice::new(16).unwrap();
        assert_eq!(counters.len(), 16);
        assert!(counters.iter().all(|c| c.load(Ordering::Relaxed) == 0));
    }

    #[test]
    fn test_child_writes_visible_to_parent() {
        let counters: SharedSlice<AtomicU64> = SharedSlice::new(2).unwrap();

        let pid = unsafe { libc::fork() };
        assert!(pid >= 0, "fork failed");
        if pid == 0 {
            // Child: atomics only, then leave without running destructors
            counters[1].fetch_add(42, Ordering::SeqCst);
            unsafe { libc::_exit(0) };
        }

        let mut status = 0;
        let reaped = unsafe { libc::waitpid(pid, &mut status, 0) };
        assert_eq!(reaped, pid);
        assert_eq!(counters[1].load(Ordering::SeqCst), 42);
        assert_eq!(counters[0].load(Ordering::SeqCst), 0);
    }
}
