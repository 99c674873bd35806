//! Fixed-size slot arena with a lock-free free list
//!
//! # Safety
//!
//! A block owns one contiguous storage buffer divided into equally sized,
//! equally aligned slots. The only synchronization over that storage is the
//! free-list handoff: a slot index is either queued (the slot belongs to
//! the block) or dequeued (the slot belongs to exactly one caller), never
//! both. Callers get raw slot pointers and may read and write their slot
//! freely until they return it through [`Block::free`].

use core::cell::UnsafeCell;
use core::ptr::NonNull;

use tracing::warn;

use crate::error::{MemoryError, MemoryResult};
use crate::queue::{DequeueOutcome, EnqueueOutcome, IndexQueue};
use crate::retry::{TryState, retry_with_random_backoff};
use crate::utils::{align, calc_total_aligned_size};

/// Thread-shareable storage buffer with interior mutability
#[repr(transparent)]
struct SyncUnsafeCell<T: ?Sized>(UnsafeCell<T>);

// SAFETY: all access to the buffer is fenced by the free-list handoff —
// a slot is written only by the caller currently holding its index, and
// the queue's release/acquire pair orders the handoff itself. Disjoint
// slots never alias.
unsafe impl<T: ?Sized> Sync for SyncUnsafeCell<T> {}
// SAFETY: repr(transparent) over UnsafeCell<T>; moving the buffer moves
// plain bytes with no thread-local state attached.
unsafe impl<T: ?Sized + Send> Send for SyncUnsafeCell<T> {}

/// Fixed-capacity arena of uniform slots backed by an [`IndexQueue`]
///
/// The slot stride is the value size rounded up so that every slot — not
/// just the first — starts on the requested alignment. Construction is the
/// only allocation; the block never resizes, so issued addresses stay
/// valid until the block drops.
pub struct Block {
    /// Slot stride in bytes after the alignment round-up
    value_size: usize,
    capacity: u32,
    /// Bytes from `base` to the end of the last slot
    usable_size: usize,
    alignment: usize,
    storage: Box<SyncUnsafeCell<[u8]>>,
    base: *mut u8,
    free_list: IndexQueue,
}

// SAFETY: `base` points into the owned, heap-pinned storage; everything
// else is Send. See SyncUnsafeCell above for the aliasing argument.
unsafe impl Send for Block {}
// SAFETY: concurrent allocate/free go through the lock-free free list;
// slot contents are only touched by their current index holder.
unsafe impl Sync for Block {}

impl Block {
    /// Creates a block whose slots are aligned like pointers
    pub fn new(value_size: usize, capacity: u32) -> MemoryResult<Self> {
        Self::with_alignment(value_size, capacity, align_of::<*mut u8>())
    }

    /// Creates a block of `capacity` slots of `value_size` bytes, each slot
    /// starting on an `alignment` boundary.
    ///
    /// An alignment larger than the value size widens the slot stride to
    /// the alignment; the storage buffer carries one extra stride of slack
    /// to absorb the base-pointer round-up.
    ///
    /// # Errors
    /// - `InvalidValueSize` when `value_size` is 0
    /// - `CapacityInvalid` when `capacity` exceeds the free-list ceiling
    /// - `InvalidAlignment` when the buffer cannot host the alignment
    /// - `OutOfMemory` when the aligned buffer falls short of `capacity`
    ///   slots
    pub fn with_alignment(
        value_size: usize,
        capacity: u32,
        alignment: usize,
    ) -> MemoryResult<Self> {
        if value_size == 0 {
            return Err(MemoryError::InvalidValueSize);
        }
        let stride = calc_total_aligned_size(value_size, alignment, 1);
        let free_list = IndexQueue::new(capacity)?;
        if capacity == 0 {
            return Ok(Self {
                value_size: stride,
                capacity,
                usable_size: 0,
                alignment,
                storage: empty_storage(),
                base: core::ptr::null_mut(),
                free_list,
            });
        }
        // one stride of slack absorbs whatever the base round-up consumes
        let total_size = stride * (capacity as usize + 1);
        let storage = zeroed_storage(total_size);
        let raw_base = storage.0.get() as *mut u8;
        let mut space = total_size;
        let base = align(alignment, stride, raw_base, &mut space)
            .ok_or_else(|| MemoryError::invalid_alignment(alignment, total_size))?;
        if space / stride < capacity as usize {
            return Err(MemoryError::out_of_memory(total_size));
        }
        for index in 0..capacity {
            let outcome = free_list.try_enqueue(index);
            debug_assert_eq!(outcome, EnqueueOutcome::Success);
        }
        Ok(Self {
            value_size: stride,
            capacity,
            usable_size: stride * capacity as usize,
            alignment,
            storage,
            base,
            free_list,
        })
    }

    /// Slot stride in bytes (the value size after the alignment round-up)
    #[inline]
    pub fn value_size(&self) -> usize {
        self.value_size
    }

    /// Number of slots
    #[inline]
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Bytes from the base address to the end of the last slot
    #[inline]
    pub fn usable_size(&self) -> usize {
        self.usable_size
    }

    /// Aligned start of the slot storage; null for an empty block
    #[inline]
    pub fn base_address(&self) -> *const u8 {
        self.base
    }

    /// True for a block constructed with zero capacity
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.capacity == 0
    }

    /// Number of slots currently in the free list
    #[inline]
    pub fn free_slots(&self) -> u32 {
        self.free_list.len()
    }

    /// True when `pointer` falls inside this block's slot storage
    #[inline]
    pub fn in_range(&self, pointer: *const u8) -> bool {
        let addr = pointer as usize;
        let base = self.base as usize;
        !self.is_empty() && base <= addr && addr < base + self.usable_size
    }

    /// Claims a free slot and returns its address, or `None` when every
    /// slot is taken (or the block is empty).
    ///
    /// Contention on the free list is retried internally with random
    /// backoff; it is never surfaced.
    pub fn allocate(&self) -> Option<NonNull<u8>> {
        if self.is_empty() {
            return None;
        }
        let mut claimed = None;
        retry_with_random_backoff(|| match self.free_list.try_dequeue() {
            DequeueOutcome::Success(index) => {
                claimed = Some(index);
                TryState::Done
            }
            DequeueOutcome::Empty => TryState::Done,
            DequeueOutcome::Busy | DequeueOutcome::Beaten => TryState::Retry,
        });
        claimed.map(|index| {
            // SAFETY: index < capacity, so the offset lands on a slot start
            // inside the owned buffer; base is non-null for capacity > 0.
            unsafe { NonNull::new_unchecked(self.base.add(index as usize * self.value_size)) }
        })
    }

    /// Returns a slot to the block
    ///
    /// Null pointers and empty blocks are no-ops. A full free list means
    /// the slot was never handed out by this block; the index is dropped
    /// and logged rather than corrupting the queue.
    ///
    /// # Errors
    /// - `MisalignedFree` when `pointer` does not sit on a slot boundary
    /// - `PointerNotInBlock` when `pointer` is outside this block
    pub fn free(&self, pointer: *mut u8) -> MemoryResult<()> {
        if self.is_empty() || pointer.is_null() {
            return Ok(());
        }
        let offset = (pointer as usize).wrapping_sub(self.base as usize);
        if offset % self.value_size != 0 {
            return Err(MemoryError::misaligned_free(offset, self.value_size));
        }
        let slot = offset / self.value_size;
        if slot >= self.capacity as usize {
            return Err(MemoryError::pointer_not_in_block(
                slot,
                self.capacity as usize,
            ));
        }
        retry_with_random_backoff(|| match self.free_list.try_enqueue(slot as u32) {
            EnqueueOutcome::Success => TryState::Done,
            EnqueueOutcome::Full => {
                warn!(
                    slot,
                    capacity = self.capacity,
                    "free list full while releasing a slot; dropping the index"
                );
                TryState::Done
            }
            EnqueueOutcome::Busy | EnqueueOutcome::Beaten => TryState::Retry,
        });
        Ok(())
    }
}

/// Deep snapshot of storage and free-list state; meaningful only while no
/// other thread is operating on the source. Exists for test-time state
/// comparison.
impl Clone for Block {
    fn clone(&self) -> Self {
        if self.is_empty() {
            return Self {
                value_size: self.value_size,
                capacity: 0,
                usable_size: 0,
                alignment: self.alignment,
                storage: empty_storage(),
                base: core::ptr::null_mut(),
                free_list: self.free_list.clone(),
            };
        }
        let total_size = self.value_size * (self.capacity as usize + 1);
        let storage = zeroed_storage(total_size);
        let raw_base = storage.0.get() as *mut u8;
        let mut space = total_size;
        let base = align(self.alignment, self.value_size, raw_base, &mut space)
            .expect("clone reuses a layout that already fit");
        // SAFETY: both regions are owned, non-overlapping, and at least
        // usable_size bytes long; the source is quiescent by contract.
        unsafe {
            core::ptr::copy_nonoverlapping(self.base, base, self.usable_size);
        }
        Self {
            value_size: self.value_size,
            capacity: self.capacity,
            usable_size: self.usable_size,
            alignment: self.alignment,
            storage,
            base,
            free_list: self.free_list.clone(),
        }
    }
}

impl PartialEq for Block {
    fn eq(&self, other: &Self) -> bool {
        if self.value_size != other.value_size
            || self.capacity != other.capacity
            || self.usable_size != other.usable_size
        {
            return false;
        }
        if self.is_empty() {
            return self.free_list == other.free_list;
        }
        // SAFETY: reads of the usable regions of two quiescent blocks
        let contents_equal = unsafe {
            core::slice::from_raw_parts(self.base, self.usable_size)
                == core::slice::from_raw_parts(other.base, other.usable_size)
        };
        contents_equal && self.free_list == other.free_list
    }
}

impl core::fmt::Debug for Block {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Block")
            .field("value_size", &self.value_size)
            .field("capacity", &self.capacity)
            .field("usable_size", &self.usable_size)
            .field("base", &self.base)
            .field("free_slots", &self.free_slots())
            .finish()
    }
}

fn empty_storage() -> Box<SyncUnsafeCell<[u8]>> {
    zeroed_storage(0)
}

fn zeroed_storage(len: usize) -> Box<SyncUnsafeCell<[u8]>> {
    let boxed: Box<[u8]> = vec![0u8; len].into_boxed_slice();
    let ptr = Box::into_raw(boxed);
    // SAFETY: SyncUnsafeCell is repr(transparent) over UnsafeCell<[u8]>,
    // which is repr(transparent) over [u8]; the Box ownership transfers
    // through the cast unchanged.
    unsafe { Box::from_raw(ptr as *mut SyncUnsafeCell<[u8]>) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_value_size_is_rejected() {
        let err = Block::with_alignment(0, 3, 8).unwrap_err();
        assert_eq!(err, MemoryError::InvalidValueSize);
    }

    #[test]
    fn empty_block_never_allocates() {
        let block = Block::with_alignment(1, 0, 1).expect("empty block");
        assert!(block.is_empty());
        assert!(block.allocate().is_none());
        // freeing anything into an empty block is a no-op
        let mut local = 0u8;
        block.free(&mut local as *mut u8).expect("no-op");
    }

    #[test]
    fn allocates_to_capacity_then_refuses() {
        let block = Block::new(8, 3).expect("block");
        assert!(block.allocate().is_some());
        assert!(block.allocate().is_some());
        assert!(block.allocate().is_some());
        assert!(block.allocate().is_none());
    }

    #[test]
    fn oversized_alignment_widens_the_stride() {
        let block = Block::with_alignment(8, 3, 64).expect("block");
        assert_eq!(block.value_size(), 64);
        let mut pointers = Vec::new();
        for _ in 0..3 {
            let ptr = block.allocate().expect("slot");
            assert_eq!(ptr.as_ptr() as usize % 64, 0);
            pointers.push(ptr);
        }
        assert!(block.allocate().is_none());
        for ptr in pointers {
            block.free(ptr.as_ptr()).expect("free");
        }
    }

    #[test]
    fn every_pointer_is_aligned_and_in_range() {
        let block = Block::with_alignment(2, 16, 8).expect("block");
        while let Some(ptr) = block.allocate() {
            assert_eq!(ptr.as_ptr() as usize % 8, 0);
            assert!(block.in_range(ptr.as_ptr()));
        }
    }

    #[test]
    fn recycles_freed_slots() {
        let block = Block::with_alignment(4, 3, 4).expect("block");
        let first = block.allocate().expect("slot");
        let second = block.allocate().expect("slot");
        block.free(first.as_ptr()).expect("free");
        let third = block.allocate().expect("recycled slot");
        let fourth = block.allocate().expect("last slot");
        assert!(block.allocate().is_none());
        for ptr in [second, third, fourth] {
            block.free(ptr.as_ptr()).expect("free");
        }
        assert_eq!(block.free_slots(), 3);
    }

    #[test]
    fn free_rejects_mid_slot_pointers() {
        let block = Block::with_alignment(8, 4, 8).expect("block");
        let ptr = block.allocate().expect("slot");
        // SAFETY: stays inside the allocated slot
        let inside = unsafe { ptr.as_ptr().add(3) };
        let err = block.free(inside).unwrap_err();
        assert!(matches!(err, MemoryError::MisalignedFree { .. }));
        block.free(ptr.as_ptr()).expect("free");
    }

    #[test]
    fn free_rejects_foreign_pointers() {
        let block = Block::with_alignment(8, 4, 8).expect("block");
        let other = Block::with_alignment(8, 4, 8).expect("other block");
        let foreign = other.allocate().expect("slot");
        let err = block.free(foreign.as_ptr()).unwrap_err();
        assert!(err.is_free_path());
        other.free(foreign.as_ptr()).expect("free");
    }

    #[test]
    fn outstanding_allocations_shrink_the_free_list() {
        let block = Block::with_alignment(16, 8, 16).expect("block");
        let held: Vec<_> = (0..3).map(|_| block.allocate().expect("slot")).collect();
        assert_eq!(block.free_slots(), 5);
        for ptr in held {
            block.free(ptr.as_ptr()).expect("free");
        }
        assert_eq!(block.free_slots(), 8);
    }

    #[test]
    fn snapshot_clone_compares_equal() {
        let block = Block::with_alignment(8, 4, 8).expect("block");
        let kept = block.allocate().expect("slot");
        // SAFETY: writing the slot we hold
        unsafe { kept.as_ptr().cast::<u64>().write(0xDEAD_BEEF) };
        let copy = block.clone();
        assert_eq!(block, copy);
        // the copy holds its own storage and free list
        let from_copy = copy.allocate().expect("slot");
        assert!(copy.in_range(from_copy.as_ptr()));
        assert!(!block.in_range(from_copy.as_ptr()));
        assert_ne!(block, copy);
        copy.free(from_copy.as_ptr()).expect("free");
        block.free(kept.as_ptr()).expect("free");
    }

    #[test]
    fn concurrent_churn_never_oversubscribes() {
        use std::collections::HashSet;
        use std::sync::Arc;
        use std::thread;

        const CAPACITY: u32 = 8;
        const ROUNDS: usize = 5_000;

        let block = Arc::new(Block::with_alignment(8, CAPACITY, 8).expect("block"));
        let mut workers = Vec::new();
        for worker_id in 0..4u64 {
            let block = Arc::clone(&block);
            workers.push(thread::spawn(move || {
                for _ in 0..ROUNDS {
                    if let Some(ptr) = block.allocate() {
                        let cell = ptr.as_ptr().cast::<u64>();
                        // SAFETY: the slot belongs to this thread until freed
                        unsafe {
                            cell.write(worker_id);
                            assert_eq!(cell.read(), worker_id);
                        }
                        block.free(ptr.as_ptr()).expect("free");
                    }
                }
            }));
        }
        for worker in workers {
            worker.join().expect("worker thread");
        }
        // all slots returned, all distinct
        let mut seen = HashSet::new();
        while let Some(ptr) = block.allocate() {
            assert!(seen.insert(ptr.as_ptr() as usize));
        }
        assert_eq!(seen.len(), CAPACITY as usize);
    }
}
