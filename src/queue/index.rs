//! Atomic-payload ring queue specialized for `u32` slot indices
//!
//! The guard byte of the generic queue exists to order a non-atomic payload
//! write against readers. An index payload fits in one atomic word, so the
//! cell itself can carry the publication state: a reserved sentinel marks
//! the cell released, any other value marks it published. Producers and
//! consumers still sequence through the head/tail CAS; the sentinel closes
//! the same transient window the guard byte does, without a second byte per
//! cell.
//!
//! Stored values must stay below [`IndexQueue::MAX_VALUE`]; slot indices
//! always do, because capacities are capped well below the sentinel.

use core::sync::atomic::{AtomicU32, Ordering};

use crossbeam_utils::CachePadded;

use crate::error::{MemoryError, MemoryResult};

use super::mpmc::MAX_CAPACITY;

const EMPTY: u32 = u32::MAX;

/// Outcome of one enqueue attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Success,
    /// `head − tail` reached capacity
    Full,
    /// The target cell has not been released by its consumer yet
    Busy,
    /// Another producer won the head CAS
    Beaten,
}

/// Outcome of one dequeue attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DequeueOutcome {
    Success(u32),
    /// `head == tail`
    Empty,
    /// The target cell's value has not been published yet
    Busy,
    /// Another consumer won the tail CAS
    Beaten,
}

/// Bounded lock-free MPMC queue of `u32` values below the sentinel
///
/// This is the free list inside every allocator block: the queue holds the
/// indices of unoccupied slots, and the enqueue/dequeue handoff is the only
/// synchronization between threads releasing and claiming storage.
#[derive(Debug)]
pub struct IndexQueue {
    buffer: Box<[CachePadded<AtomicU32>]>,
    head: CachePadded<AtomicU32>,
    tail: CachePadded<AtomicU32>,
}

impl IndexQueue {
    /// Largest value the queue can carry; one index is reserved as the
    /// in-band release sentinel
    pub const MAX_VALUE: u32 = u32::MAX - 1;

    /// Creates a queue with `capacity` cells
    ///
    /// # Errors
    /// `CapacityInvalid` when `capacity` exceeds half the `u32` index range.
    pub fn new(capacity: u32) -> MemoryResult<Self> {
        if capacity > MAX_CAPACITY {
            return Err(MemoryError::capacity_invalid(capacity, MAX_CAPACITY));
        }
        let buffer = (0..capacity)
            .map(|_| CachePadded::new(AtomicU32::new(EMPTY)))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Ok(Self {
            buffer,
            head: CachePadded::new(AtomicU32::new(0)),
            tail: CachePadded::new(AtomicU32::new(0)),
        })
    }

    /// Number of cells
    #[inline]
    pub fn capacity(&self) -> u32 {
        self.buffer.len() as u32
    }

    /// Snapshot of the number of queued values
    #[inline]
    pub fn len(&self) -> u32 {
        self.head
            .load(Ordering::Acquire)
            .wrapping_sub(self.tail.load(Ordering::Acquire))
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Attempts to append `value` to the queue
    pub fn try_enqueue(&self, value: u32) -> EnqueueOutcome {
        debug_assert!(value <= Self::MAX_VALUE);
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        // free-running counters: wrapping subtraction handles overflow
        if head.wrapping_sub(tail) == self.capacity() {
            return EnqueueOutcome::Full;
        }
        let cell = &self.buffer[(head % self.capacity()) as usize];
        if cell.load(Ordering::Acquire) != EMPTY {
            return EnqueueOutcome::Busy;
        }
        if self
            .head
            .compare_exchange(
                head,
                head.wrapping_add(1),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return EnqueueOutcome::Beaten;
        }
        // Exclusive publication right: only the head winner for this
        // position stores, and it observed the cell released beforehand.
        cell.store(value, Ordering::Release);
        EnqueueOutcome::Success
    }

    /// Attempts to remove the oldest value from the queue
    pub fn try_dequeue(&self) -> DequeueOutcome {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        if head == tail {
            return DequeueOutcome::Empty;
        }
        let cell = &self.buffer[(tail % self.capacity()) as usize];
        if cell.load(Ordering::Acquire) == EMPTY {
            return DequeueOutcome::Busy;
        }
        if self
            .tail
            .compare_exchange(
                tail,
                tail.wrapping_add(1),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return DequeueOutcome::Beaten;
        }
        let value = cell.swap(EMPTY, Ordering::AcqRel);
        // The tail winner saw the cell published before its CAS, and only
        // the tail winner for this position swaps it back.
        debug_assert_ne!(value, EMPTY);
        DequeueOutcome::Success(value)
    }

    #[cfg(test)]
    fn with_start_index(capacity: u32, start: u32) -> MemoryResult<Self> {
        let queue = Self::new(capacity)?;
        queue.head.store(start, Ordering::Release);
        queue.tail.store(start, Ordering::Release);
        Ok(queue)
    }
}

/// Deep snapshot of the queue state; meaningful only while no other thread
/// is operating on the source. Exists for test-only block cloning.
impl Clone for IndexQueue {
    fn clone(&self) -> Self {
        let buffer = self
            .buffer
            .iter()
            .map(|cell| CachePadded::new(AtomicU32::new(cell.load(Ordering::Acquire))))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            buffer,
            head: CachePadded::new(AtomicU32::new(self.head.load(Ordering::Acquire))),
            tail: CachePadded::new(AtomicU32::new(self.tail.load(Ordering::Acquire))),
        }
    }
}

impl PartialEq for IndexQueue {
    fn eq(&self, other: &Self) -> bool {
        self.head.load(Ordering::Acquire) == other.head.load(Ordering::Acquire)
            && self.tail.load(Ordering::Acquire) == other.tail.load(Ordering::Acquire)
            && self.buffer.len() == other.buffer.len()
            && self
                .buffer
                .iter()
                .zip(other.buffer.iter())
                .all(|(a, b)| a.load(Ordering::Acquire) == b.load(Ordering::Acquire))
    }
}

impl Eq for IndexQueue {}
