//! Recyclable resource record pool
//!
//! Stressors track live OS resources (spawned processes, held locks) in a
//! `ResourcePool`. Records live in an arena and are addressed by stable indices;
//! the live set is an ordered singly-linked list (oldest first) threaded through
//! the arena, and retired records sit on a free stack until they are reused.
//!
//! # Memory Behavior
//!
//! Allocation always prefers a retired record over new backing storage, so the
//! arena never grows past the historical peak of live records no matter how
//! many allocate/evict cycles a stressor runs. Eviction does not touch the
//! payload: a reused record still carries whatever the previous owner left in
//! it (a clone stack buffer, a stale offset) until the caller overwrites it.
//!
//! # Example
//!
//! ```
//! use stresspulse::pool::ResourcePool;
//!
//! let mut pool: ResourcePool<u64> = ResourcePool::new();
//! let a = pool.allocate_with(|| 0).unwrap();
//! *pool.get_mut(a) = 4096;
//! let b = pool.allocate_with(|| 0).unwrap();
//! *pool.get_mut(b) = 8192;
//!
//! // Oldest first
//! assert_eq!(pool.evict_oldest().copied(), Some(4096));
//! assert_eq!(pool.len(), 1);
//!
//! let mut released = Vec::new();
//! pool.drain_all(|offset| released.push(*offset));
//! assert_eq!(released, vec![8192]);
//! pool.destroy();
//! ```

use crate::error::PoolError;

/// Stable index of a record inside its pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RecordHandle(usize);

impl RecordHandle {
    /// Arena index of the record
    #[inline]
    pub fn index(&self) -> usize {
        self.0
    }
}

#[derive(Debug)]
struct Slot<T> {
    payload: T,
    /// Forward link within the live list
    next: Option<usize>,
}

/// Arena-backed FIFO of live resource records with a recycling free stack
#[derive(Debug)]
pub struct ResourcePool<T> {
    slots: Vec<Slot<T>>,
    head: Option<usize>,
    tail: Option<usize>,
    free: Vec<usize>,
    length: usize,
    /// Optional cap on backed records (simulated memory exhaustion)
    record_limit: Option<usize>,
}

impl<T> ResourcePool<T> {
    /// Create an empty pool
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            head: None,
            tail: None,
            free: Vec::new(),
            length: 0,
            record_limit: None,
        }
    }

    /// Create a pool that refuses to back more than `limit` records
    ///
    /// Allocation past the limit fails with [`PoolError::OutOfMemory`] just as
    /// it would when the allocator gives up.
    pub fn with_record_limit(limit: usize) -> Self {
        Self {
            record_limit: Some(limit),
            ..Self::new()
        }
    }

    /// Allocate a record and append it to the tail of the live list
    ///
    /// Pops the free stack when possible, in which case `init` is not called and
    /// the payload is whatever the record held when it was evicted. Otherwise new
    /// backing storage is reserved and `init` builds the payload. The caller is
    /// expected to populate the payload through [`get_mut`](Self::get_mut).
    pub fn allocate_with<F>(&mut self, init: F) -> Result<RecordHandle, PoolError>
    where
        F: FnOnce() -> T,
    {
        self.try_allocate_with(|| Ok(init()))
    }

    /// Like [`allocate_with`](Self::allocate_with), for payloads whose own
    /// construction can run out of memory (e.g. a clone stack buffer)
    pub fn try_allocate_with<F>(&mut self, init: F) -> Result<RecordHandle, PoolError>
    where
        F: FnOnce() -> Result<T, PoolError>,
    {
        let index = match self.free.pop() {
            Some(index) => {
                self.slots[index].next = None;
                index
            }
            None => {
                let exhausted = self
                    .record_limit
                    .map_or(false, |limit| self.slots.len() >= limit);
                if exhausted || self.slots.try_reserve(1).is_err() {
                    return Err(PoolError::OutOfMemory { live: self.length });
                }
                // Keep the free stack able to take every record without reallocating
                if self.free.try_reserve(self.slots.len() + 1).is_err() {
                    return Err(PoolError::OutOfMemory { live: self.length });
                }
                self.slots.push(Slot {
                    payload: init()?,
                    next: None,
                });
                self.slots.len() - 1
            }
        };

        match self.tail {
            Some(tail) => self.slots[tail].next = Some(index),
            None => self.head = Some(index),
        }
        self.tail = Some(index);
        self.length += 1;

        Ok(RecordHandle(index))
    }

    /// Payload of a record
    ///
    /// # Panics
    /// Panics if the handle does not belong to this pool
    #[inline]
    pub fn get(&self, handle: RecordHandle) -> &T {
        &self.slots[handle.0].payload
    }

    /// Mutable payload of a record
    ///
    /// # Panics
    /// Panics if the handle does not belong to this pool
    #[inline]
    pub fn get_mut(&mut self, handle: RecordHandle) -> &mut T {
        &mut self.slots[handle.0].payload
    }

    /// Retire the oldest live record
    ///
    /// The record moves onto the free stack and its payload is handed back so
    /// the caller can release the external resource before the record is
    /// reused. Returns `None` (and does nothing) when the pool is empty.
    pub fn evict_oldest(&mut self) -> Option<&mut T> {
        let index = self.head?;

        self.head = self.slots[index].next.take();
        if self.head.is_none() {
            self.tail = None;
        }
        self.length -= 1;
        self.free.push(index);

        Some(&mut self.slots[index].payload)
    }

    /// Evict every live record, oldest first, calling `release` once for each
    ///
    /// Returns the number of records drained.
    pub fn drain_all<F>(&mut self, mut release: F) -> usize
    where
        F: FnMut(&mut T),
    {
        let mut drained = 0;
        while let Some(payload) = self.evict_oldest() {
            release(payload);
            drained += 1;
        }
        drained
    }

    /// Tear the pool down, releasing the backing storage of both lists
    ///
    /// Live records should have been drained first; their external resources
    /// would otherwise be dropped without release. Returns the number of records
    /// the pool ever backed (the historical peak of live records).
    pub fn destroy(self) -> usize {
        debug_assert_eq!(self.length, 0, "pool destroyed with live records");
        self.slots.len()
    }

    /// Number of live records
    #[inline]
    pub fn len(&self) -> usize {
        self.length
    }

    /// True if no records are live
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Number of retired records waiting for reuse
    #[inline]
    pub fn free_len(&self) -> usize {
        self.free.len()
    }

    /// Number of records ever backed by the arena
    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Handles of live records, oldest first
    pub fn live_handles(&self) -> Vec<RecordHandle> {
        let mut handles = Vec::with_capacity(self.length);
        let mut cursor = self.head;
        while let Some(index) = cursor {
            handles.push(RecordHandle(index));
            cursor = self.slots[index].next;
        }
        handles
    }

    /// Live payloads, oldest first
    pub fn iter(&self) -> impl Iterator<Item = &T> + '_ {
        let mut cursor = self.head;
        std::iter::from_fn(move || {
            let index = cursor?;
            cursor = self.slots[index].next;
            Some(&self.slots[index].payload)
        })
    }

    /// Verify the structural invariants of the pool
    ///
    /// - `len()` equals the number of records reachable from the head
    /// - no record is both live and free
    /// - the tail is the last live record, and is unset iff the head is
    /// - live and free records together account for every backed record
    pub fn check_invariants(&self) -> Result<(), String> {
        let mut live = vec![false; self.slots.len()];
        let mut count = 0;
        let mut last = None;
        let mut cursor = self.head;

        while let Some(index) = cursor {
            if live[index] {
                return Err(format!("record {} appears twice in the live list", index));
            }
            live[index] = true;
            count += 1;
            last = Some(index);
            cursor = self.slots[index].next;
        }

        if count != self.length {
            return Err(format!("length {} but {} records reachable", self.length, count));
        }
        if self.tail != last {
            return Err(format!("tail {:?} is not the last live record {:?}", self.tail, last));
        }
        if self.head.is_none() != self.tail.is_none() {
            return Err("head and tail disagree on emptiness".to_string());
        }

        let mut seen_free = vec![false; self.slots.len()];
        for &index in &self.free {
            if live[index] {
                return Err(format!("record {} is both live and free", index));
            }
            if seen_free[index] {
                return Err(format!("record {} is on the free stack twice", index));
            }
            seen_free[index] = true;
        }

        if self.length + self.free.len() != self.slots.len() {
            return Err(format!(
                "{} live + {} free does not cover {} backed records",
                self.length,
                self.free.len(),
                self.slots.len()
            ));
        }

        Ok(())
    }
}

impl<T> Default for ResourcePool<T> {
    fn default() -> Self {
        Self::new()
    }
}
