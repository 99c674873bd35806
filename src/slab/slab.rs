//! Power-of-two bucket router over block lists
//!
//! The slab is a dense vector of buckets; bucket `i` serves total aligned
//! footprints up to `2^(e + i)` bytes, where `2^e` is the calibrated
//! smallest block size. Requests outside the configured range are refused
//! rather than forwarded to the host allocator.

use core::ptr::NonNull;
use std::sync::Arc;

use tracing::warn;

use crate::error::{MemoryError, MemoryResult};
use crate::slab::config::{BlockConfig, calibrate};
use crate::slab::list::BlockList;
use crate::utils::{calc_total_aligned_size, log2_ceil, pow2};

/// Concurrent sized-slab allocator
///
/// Built once from a calibrated bucket configuration; thereafter all
/// operations are lock-free and go through the buckets' block lists.
#[derive(Debug)]
pub struct SizedSlab {
    smallest_block_exponent: u32,
    buckets: Vec<BlockList>,
}

impl SizedSlab {
    /// Builds a slab from user bucket configs
    ///
    /// The configs pass through [`calibrate`] first, so the resulting
    /// buckets are strictly consecutive powers of two with no gaps.
    ///
    /// # Errors
    /// - `InvalidValueSize` when `configs` is empty or names a zero size
    /// - any block-construction error from the eager head blocks
    pub fn new(contingency_capacity: u32, configs: &[BlockConfig]) -> MemoryResult<Self> {
        if configs.is_empty() || configs.iter().any(|config| config.block_size == 0) {
            return Err(MemoryError::InvalidValueSize);
        }
        let calibrated = calibrate(contingency_capacity, configs);
        let smallest_block_exponent = log2_ceil(calibrated[0].block_size);
        let buckets = calibrated
            .iter()
            .map(BlockList::new)
            .collect::<MemoryResult<Vec<_>>>()?;
        Ok(Self {
            smallest_block_exponent,
            buckets,
        })
    }

    /// Exponent `e` of the smallest bucket size `2^e`
    #[inline]
    pub fn smallest_block_exponent(&self) -> u32 {
        self.smallest_block_exponent
    }

    /// Number of buckets
    #[inline]
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Iterator over the buckets, smallest size class first
    #[inline]
    pub fn buckets(&self) -> core::slice::Iter<'_, BlockList> {
        self.buckets.iter()
    }

    /// Index of the bucket serving a total aligned footprint of
    /// `allocation_size` bytes
    ///
    /// Sizes at or below the smallest bucket map to 0; an index at or past
    /// [`Self::bucket_count`] means the size is out of range.
    #[inline]
    pub fn find_block_bucket(&self, allocation_size: usize) -> usize {
        let exponent = log2_ceil(allocation_size);
        if allocation_size == 0 || exponent < self.smallest_block_exponent {
            // sub-minimum sizes round up into the first bucket
            0
        } else {
            (exponent - self.smallest_block_exponent) as usize
        }
    }

    /// Largest total footprint any bucket serves
    #[inline]
    pub fn max_allocation_size(&self) -> usize {
        pow2(self.smallest_block_exponent + self.buckets.len() as u32 - 1)
    }

    /// True when a single value of `value_size` bytes has a bucket
    #[inline]
    pub fn in_configured_range(&self, value_size: usize) -> bool {
        value_size != 0
            && self.find_block_bucket(calc_total_aligned_size(value_size, value_size, 1))
                < self.buckets.len()
    }

    /// The bucket that serves single values of `size` bytes
    ///
    /// # Errors
    /// `SlabFull` when no bucket covers the size.
    pub fn bucket_for(&self, size: usize) -> MemoryResult<&BlockList> {
        let bucket = self.find_block_bucket(calc_total_aligned_size(size, size, 1));
        self.buckets
            .get(bucket)
            .filter(|_| size != 0)
            .ok_or_else(|| MemoryError::slab_full(size))
    }

    /// Claims storage for `quantity` values of `value_size` bytes, each on
    /// a `value_alignment` boundary.
    ///
    /// Returns `None` for zero-sized requests and for footprints no bucket
    /// covers. The `hint` is accepted for allocator-API parity and not
    /// used for placement.
    pub fn allocate(
        &self,
        value_size: usize,
        value_alignment: usize,
        quantity: u32,
        hint: Option<NonNull<u8>>,
    ) -> Option<NonNull<u8>> {
        let _ = hint;
        let total_size = calc_total_aligned_size(value_size, value_alignment, quantity as usize);
        if total_size == 0 {
            return None;
        }
        let bucket = self.find_block_bucket(total_size);
        self.buckets.get(bucket)?.allocate()
    }

    /// Returns storage claimed through [`Self::allocate`] with the same
    /// size, alignment, and quantity.
    ///
    /// A pointer no bucket block claims is dropped silently (double-free
    /// or foreign pointer); a mid-slot pointer is an error.
    pub fn deallocate(
        &self,
        value_size: usize,
        value_alignment: usize,
        pointer: *mut u8,
        quantity: u32,
    ) -> MemoryResult<()> {
        let total_size = calc_total_aligned_size(value_size, value_alignment, quantity as usize);
        let bucket = self.find_block_bucket(total_size);
        match self.buckets.get(bucket) {
            Some(list) => list.deallocate(pointer).map(|_| ()),
            None => {
                warn!(
                    value_size,
                    quantity, "deallocate for a size no bucket serves; dropping the pointer"
                );
                Ok(())
            }
        }
    }

    /// Claims storage for `quantity` values of `T`
    pub fn allocate_typed<T>(&self, quantity: u32) -> Option<NonNull<T>> {
        self.allocate(size_of::<T>(), align_of::<T>(), quantity, None)
            .map(NonNull::cast)
    }

    /// Returns storage claimed through [`Self::allocate_typed`]
    pub fn deallocate_typed<T>(&self, pointer: NonNull<T>, quantity: u32) -> MemoryResult<()> {
        self.deallocate(
            size_of::<T>(),
            align_of::<T>(),
            pointer.cast().as_ptr(),
            quantity,
        )
    }

    /// Single-value untyped shorthand used by the `malloc` facade
    #[inline]
    pub fn malloc(&self, size: usize) -> Option<NonNull<u8>> {
        self.allocate(size, size, 1, None)
    }

    /// Single-value untyped shorthand used by the `free` facade
    #[inline]
    pub fn free(&self, pointer: *mut u8, size: usize) -> MemoryResult<()> {
        self.deallocate(size, size, pointer, 1)
    }

    /// Constructs `value` in slab storage behind an owning handle
    ///
    /// The handle returns the slot and runs the destructor on drop.
    ///
    /// # Errors
    /// `SlabFull` when no bucket serves `size_of::<T>()` (including
    /// zero-sized types, which the slab does not store).
    pub fn make_box<T>(&self, value: T) -> MemoryResult<SlabBox<'_, T>> {
        let Some(pointer) = self.allocate_typed::<T>(1) else {
            return Err(MemoryError::slab_full(size_of::<T>()));
        };
        // SAFETY: freshly claimed, properly aligned slot of at least
        // size_of::<T>() bytes; exclusively ours until published via the
        // returned handle.
        unsafe { pointer.as_ptr().write(value) };
        Ok(SlabBox {
            pointer,
            slab: self,
        })
    }

    /// Constructs `value` in slab storage behind a shared handle
    ///
    /// The reference count lives on the host heap (as any deleter-carrying
    /// shared owner's control block does); the value itself sits in the
    /// slab and is released when the last clone drops.
    ///
    /// # Errors
    /// `SlabFull` when no bucket serves `size_of::<T>()`.
    pub fn make_shared<T>(&self, value: T) -> MemoryResult<Arc<SlabBox<'_, T>>> {
        self.make_box(value).map(Arc::new)
    }

    /// Reconstructs the effective bucket configuration from live buckets
    pub fn block_configs(&self) -> Vec<BlockConfig> {
        self.buckets
            .iter()
            .map(|list| {
                let head_capacity = list
                    .iter()
                    .next()
                    .map(|block| block.capacity())
                    .unwrap_or_default();
                BlockConfig::with_growth(
                    list.value_size(),
                    head_capacity,
                    list.contingency_capacity(),
                    list.growth_factor(),
                )
            })
            .collect()
    }
}

/// Deep snapshot for test-time comparison; the source must be quiescent
impl Clone for SizedSlab {
    fn clone(&self) -> Self {
        Self {
            smallest_block_exponent: self.smallest_block_exponent,
            buckets: self.buckets.clone(),
        }
    }
}

impl PartialEq for SizedSlab {
    fn eq(&self, other: &Self) -> bool {
        self.smallest_block_exponent == other.smallest_block_exponent
            && self.buckets.len() == other.buckets.len()
            && self
                .buckets
                .iter()
                .zip(other.buckets.iter())
                .all(|(a, b)| a == b)
    }
}

/// Owning handle over a value constructed in slab storage
///
/// Dereferences to the value; dropping it runs the destructor and returns
/// the slot to the slab.
pub struct SlabBox<'slab, T> {
    pointer: NonNull<T>,
    slab: &'slab SizedSlab,
}

// SAFETY: the handle owns the T exclusively; sending it moves that
// ownership, which is sound exactly when T itself is Send. The slab
// reference is Sync (all slab operations are &self and thread-safe).
unsafe impl<T: Send> Send for SlabBox<'_, T> {}
// SAFETY: shared references to the handle only expose &T.
unsafe impl<T: Sync> Sync for SlabBox<'_, T> {}

impl<T> SlabBox<'_, T> {
    /// Moves the value out and returns the slot without running `T`'s
    /// destructor on the slab copy
    pub fn into_inner(self) -> T {
        // SAFETY: the slot holds a valid T; we forget self afterwards so
        // the value is moved out exactly once.
        let value = unsafe { self.pointer.as_ptr().read() };
        self.release_slot();
        core::mem::forget(self);
        value
    }

    fn release_slot(&self) {
        if let Err(error) = self.slab.deallocate_typed(self.pointer, 1) {
            // a destructor-adjacent path must not raise; mirror the free
            // path policy of logging and moving on
            warn!(%error, "slab handle failed to return its slot");
        }
    }
}

impl<T> core::ops::Deref for SlabBox<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the slot stays valid and exclusively owned for the
        // handle's lifetime
        unsafe { self.pointer.as_ref() }
    }
}

impl<T> core::ops::DerefMut for SlabBox<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: as above, with &mut self guaranteeing uniqueness
        unsafe { self.pointer.as_mut() }
    }
}

impl<T> Drop for SlabBox<'_, T> {
    fn drop(&mut self) {
        // SAFETY: the slot holds a valid T nobody else can reach
        unsafe { core::ptr::drop_in_place(self.pointer.as_ptr()) };
        self.release_slot();
    }
}

impl<T: core::fmt::Debug> core::fmt::Debug for SlabBox<'_, T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_tuple("SlabBox").field(&**self).finish()
    }
}
