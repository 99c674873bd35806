//! Guard-byte MPMC bounded ring queue
//!
//! # Safety
//!
//! The queue is an array of cells indexed by two free-running `u32`
//! counters:
//!
//! - `head` is the next enqueue position, `tail` the next dequeue position;
//!   both only ever grow and wrap naturally through `u32` arithmetic.
//! - Winning the CAS on an index grants exclusive ownership of one cell for
//!   one write (producers) or one read (consumers).
//! - A per-cell guard byte closes the window between winning the index and
//!   touching the payload: producers publish with a release store of USED,
//!   consumers release the cell with a store of UNUSED after moving the
//!   value out.
//!
//! A cell is therefore always in exactly one of three states: released
//! (guard UNUSED, no value), published (guard USED, value initialized), or
//! transiently owned by the single index winner.

use core::cell::UnsafeCell;
use core::mem::MaybeUninit;
use core::sync::atomic::{AtomicU8, AtomicU16, AtomicU32, Ordering};

use crossbeam_utils::CachePadded;

use crate::error::{MemoryError, MemoryResult};
use crate::retry::try_and_ensure;

const UNUSED: u8 = 0;
const USED: u8 = 1;

/// Largest admissible capacity: `head - tail` must stay unambiguous across
/// index wraparound, so the cell count is capped at half the index range.
pub(crate) const MAX_CAPACITY: u32 = i32::MAX as u32;

#[derive(Debug)]
struct Cell<T> {
    guard: AtomicU8,
    value: UnsafeCell<MaybeUninit<T>>,
}

/// Why an enqueue attempt did not land; the rejected value is handed back
#[derive(Debug, PartialEq, Eq)]
pub enum EnqueueError<T> {
    /// `head − tail` reached capacity
    Full(T),
    /// The target cell is still owned by a consumer that has not released it
    Busy(T),
    /// Another producer won the head CAS
    Beaten(T),
}

impl<T> EnqueueError<T> {
    /// Recovers the value that was not enqueued
    pub fn into_value(self) -> T {
        match self {
            Self::Full(value) | Self::Busy(value) | Self::Beaten(value) => value,
        }
    }

    /// True when the failure is transient and a retry can succeed without
    /// any dequeue happening first
    pub fn is_transient(&self) -> bool {
        !matches!(self, Self::Full(_))
    }
}

/// Why a dequeue attempt came back empty-handed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DequeueError {
    /// `head == tail`
    Empty,
    /// The target cell's value has not been published yet
    Busy,
    /// Another consumer won the tail CAS
    Beaten,
}

impl DequeueError {
    /// True when the failure is transient and a retry can succeed without
    /// any enqueue happening first
    pub fn is_transient(self) -> bool {
        !matches!(self, Self::Empty)
    }
}

/// Bounded lock-free FIFO for any number of producers and consumers
///
/// Capacity is fixed at construction. Access goes through [`Producer`] and
/// [`Consumer`] handles; the handle counters enforce a configured ceiling
/// on concurrent users.
#[derive(Debug)]
pub struct MpmcRingQueue<T> {
    buffer: Box<[CachePadded<Cell<T>>]>,
    head: CachePadded<AtomicU32>,
    tail: CachePadded<AtomicU32>,
    producer_count: AtomicU16,
    consumer_count: AtomicU16,
    handle_limit: u16,
}

// SAFETY: the queue moves T values between threads through its cells, so T
// must be Send. The cells themselves are only touched under the index-CAS /
// guard-byte protocol described in the module header: a published cell is
// read by exactly one consumer, a released cell written by exactly one
// producer, and the guard's release/acquire pair orders the payload access.
unsafe impl<T: Send> Send for MpmcRingQueue<T> {}
unsafe impl<T: Send> Sync for MpmcRingQueue<T> {}

impl<T> MpmcRingQueue<T> {
    /// Creates a queue with `capacity` cells and a ceiling of
    /// `handle_limit` producers and `handle_limit` consumers.
    ///
    /// # Errors
    /// `CapacityInvalid` when `capacity` exceeds half the `u32` index
    /// range; the full check `head − tail == capacity` would otherwise be
    /// ambiguous after wraparound.
    pub fn new(capacity: u32, handle_limit: u16) -> MemoryResult<Self> {
        if capacity > MAX_CAPACITY {
            return Err(MemoryError::capacity_invalid(capacity, MAX_CAPACITY));
        }
        let buffer = (0..capacity)
            .map(|_| {
                CachePadded::new(Cell {
                    guard: AtomicU8::new(UNUSED),
                    value: UnsafeCell::new(MaybeUninit::uninit()),
                })
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Ok(Self {
            buffer,
            head: CachePadded::new(AtomicU32::new(0)),
            tail: CachePadded::new(AtomicU32::new(0)),
            producer_count: AtomicU16::new(0),
            consumer_count: AtomicU16::new(0),
            handle_limit,
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

    /// Claims a producer handle
    ///
    /// # Errors
    /// `HandleExhausted` once `handle_limit` producers have been claimed.
    pub fn get_producer(&self) -> MemoryResult<Producer<'_, T>> {
        claim_handle(&self.producer_count, self.handle_limit)?;
        Ok(Producer { queue: self })
    }

    /// Claims a consumer handle
    ///
    /// # Errors
    /// `HandleExhausted` once `handle_limit` consumers have been claimed.
    pub fn get_consumer(&self) -> MemoryResult<Consumer<'_, T>> {
        claim_handle(&self.consumer_count, self.handle_limit)?;
        Ok(Consumer { queue: self })
    }

    fn try_enqueue(&self, value: T) -> Result<(), EnqueueError<T>> {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        // free-running counters: wrapping subtraction handles overflow
        if head.wrapping_sub(tail) == self.capacity() {
            return Err(EnqueueError::Full(value));
        }
        let cell = &self.buffer[(head % self.capacity()) as usize];
        if cell.guard.load(Ordering::Acquire) != UNUSED {
            return Err(EnqueueError::Busy(value));
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
            return Err(EnqueueError::Beaten(value));
        }
        // SAFETY: winning the head CAS on a cell whose guard was UNUSED
        // grants exclusive write access until the guard is stored USED.
        // No reader touches the payload before observing USED (acquire),
        // which synchronizes with the release store below.
        unsafe {
            (*cell.value.get()).write(value);
        }
        cell.guard.store(USED, Ordering::Release);
        Ok(())
    }

    fn try_dequeue(&self) -> Result<T, DequeueError> {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        if head == tail {
            return Err(DequeueError::Empty);
        }
        let cell = &self.buffer[(tail % self.capacity()) as usize];
        if cell.guard.load(Ordering::Acquire) != USED {
            return Err(DequeueError::Busy);
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
            return Err(DequeueError::Beaten);
        }
        // Release the cell on every exit path: if moving the value out
        // unwinds, the guard still returns to UNUSED and the slot stays
        // usable.
        let value = try_and_ensure(
            // SAFETY: winning the tail CAS on a cell whose guard was USED
            // grants exclusive read access; the guard's earlier acquire
            // load synchronized with the producer's release store, so the
            // payload is fully initialized. The value is moved out exactly
            // once; the guard store below marks the cell uninitialized
            // again.
            || unsafe { (*cell.value.get()).assume_init_read() },
            || cell.guard.store(UNUSED, Ordering::Release),
        );
        Ok(value)
    }

    #[cfg(test)]
    fn with_start_index(capacity: u32, handle_limit: u16, start: u32) -> MemoryResult<Self> {
        let queue = Self::new(capacity, handle_limit)?;
        queue.head.store(start, Ordering::Release);
        queue.tail.store(start, Ordering::Release);
        Ok(queue)
    }
}

impl<T> Drop for MpmcRingQueue<T> {
    fn drop(&mut self) {
        let capacity = self.buffer.len() as u32;
        let head = *self.head.get_mut();
        let mut index = *self.tail.get_mut();
        while index != head {
            let cell = &mut self.buffer[(index % capacity) as usize];
            if *cell.guard.get_mut() == USED {
                // SAFETY: a published cell between tail and head holds an
                // initialized value nobody else can reach (&mut self).
                unsafe {
                    cell.value.get_mut().assume_init_drop();
                }
            }
            index = index.wrapping_add(1);
        }
    }
}

fn claim_handle(counter: &AtomicU16, limit: u16) -> MemoryResult<()> {
    let mut count = counter.load(Ordering::Acquire);
    loop {
        if count >= limit {
            return Err(MemoryError::handle_exhausted(limit));
        }
        match counter.compare_exchange(count, count + 1, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => return Ok(()),
            Err(current) => count = current,
        }
    }
}

/// Enqueue handle; copy it freely up to the queue's handle limit
#[derive(Debug)]
pub struct Producer<'a, T> {
    queue: &'a MpmcRingQueue<T>,
}

impl<T> Clone for Producer<'_, T> {
    fn clone(&self) -> Self {
        Self { queue: self.queue }
    }
}

impl<T> Producer<'_, T> {
    /// Attempts to move `value` into the queue; the value comes back inside
    /// the error when the attempt does not land.
    #[inline]
    pub fn try_enqueue(&self, value: T) -> Result<(), EnqueueError<T>> {
        self.queue.try_enqueue(value)
    }

    /// Clone-and-enqueue convenience for shared source values
    #[inline]
    pub fn try_enqueue_ref(&self, value: &T) -> Result<(), EnqueueError<T>>
    where
        T: Clone,
    {
        self.queue.try_enqueue(value.clone())
    }
}

/// Dequeue handle; copy it freely up to the queue's handle limit
pub struct Consumer<'a, T> {
    queue: &'a MpmcRingQueue<T>,
}

impl<T> Clone for Consumer<'_, T> {
    fn clone(&self) -> Self {
        Self { queue: self.queue }
    }
}

impl<T> Consumer<'_, T> {
    /// Attempts to move the oldest value out of the queue
    #[inline]
    pub fn try_dequeue(&self) -> Result<T, DequeueError> {
        self.queue.try_dequeue()
    }
}
