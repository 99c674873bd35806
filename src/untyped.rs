//! `malloc`/`free` facade over a sized slab
//!
//! The typed slab API needs the caller to restate the size on free. This
//! facade removes that requirement by keeping an address map — a bitwise
//! trie from block base address to slot size — so `free` can recover the
//! owning size class from the pointer alone: the greatest recorded base at
//! or below the pointer is the block it came from.
//!
//! The trie's own nodes live in a second, dedicated slab, so the address
//! map never touches the host allocator after construction either.

use core::ptr::NonNull;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::MemoryResult;
use crate::slab::{BlockConfig, SizedSlab, calibrate};
use crate::trie::BitwiseTrie;

/// Spare growth headroom assumed when sizing the address-map slab
pub const GROWTH_CONTINGENCY: usize = 2;

type AddressMap = BitwiseTrie<usize, usize>;

/// Untyped allocator: a sized slab plus the base→size address map
pub struct UntypedAllocator {
    allocation_slab: SizedSlab,
    address_map: AddressMap,
}

impl UntypedAllocator {
    /// Builds the allocation slab from `configs` (calibrated with
    /// `default_capacity` as the contingency), sizes a node slab for the
    /// address map, and seeds the map with every existing block base.
    ///
    /// # Errors
    /// Propagates slab construction failures and address-map seeding
    /// failures.
    pub fn new(default_capacity: u32, configs: &[BlockConfig]) -> MemoryResult<Self> {
        let allocation_slab = SizedSlab::new(default_capacity, configs)?;
        let calibrated = calibrate(default_capacity, configs);
        let trie_configs = derive_trie_config(&calibrated);
        debug!(
            leaf_capacity = trie_configs[0].initial_capacity,
            branch_capacity = trie_configs[1].initial_capacity,
            "sizing the address-map slab"
        );
        let trie_slab = Arc::new(SizedSlab::new(default_capacity, &trie_configs)?);
        let allocator = Self {
            allocation_slab,
            address_map: AddressMap::new(trie_slab),
        };
        allocator.record_block_bases()?;
        Ok(allocator)
    }

    /// Number of blocks the address map currently tracks
    pub fn block_count(&self) -> usize {
        self.address_map.len()
    }

    /// Claims `size` bytes from the slab
    ///
    /// Returns `None` for sizes outside the configured bucket range. When
    /// the serving bucket had to grow, the new block's base address is
    /// recorded before the pointer is handed out, so a matching [`free`]
    /// can always resolve it.
    ///
    /// [`free`]: Self::free
    pub fn malloc(&self, size: usize) -> Option<NonNull<u8>> {
        if !self.allocation_slab.in_configured_range(size) {
            return None;
        }
        let bucket = self.allocation_slab.bucket_for(size).ok()?;
        let blocks_before = bucket.len();
        let result = self.allocation_slab.malloc(size);
        if bucket.len() > blocks_before {
            // recording every block is idempotent, which makes racing
            // growers safe: each walker covers the block it allocated from
            for block in bucket.iter() {
                if block.is_empty() {
                    continue;
                }
                if let Err(error) = self
                    .address_map
                    .emplace(block.base_address() as usize, block.value_size())
                {
                    warn!(%error, "address map missed a grown block");
                }
            }
        }
        result
    }

    /// Returns `pointer` to the slab, recovering its size class from the
    /// address map
    ///
    /// A pointer below every recorded block base is ignored apart from a
    /// log line.
    ///
    /// # Errors
    /// `MisalignedFree` when the pointer does not sit on a slot boundary
    /// of its block.
    pub fn free(&self, pointer: NonNull<u8>) -> MemoryResult<()> {
        let address = pointer.as_ptr() as usize;
        match self.address_map.find_less_equal(address) {
            Some((_, &value_size)) => self.allocation_slab.free(pointer.as_ptr(), value_size),
            None => {
                warn!(
                    address,
                    "freed pointer precedes every known block; dropping it"
                );
                Ok(())
            }
        }
    }

    fn record_block_bases(&self) -> MemoryResult<()> {
        for bucket in self.allocation_slab.buckets() {
            for block in bucket.iter() {
                if !block.is_empty() {
                    self.address_map
                        .emplace(block.base_address() as usize, block.value_size())?;
                }
            }
        }
        Ok(())
    }
}

fn derive_trie_config(alloc_configs: &[BlockConfig]) -> [BlockConfig; 2] {
    let leaves = alloc_configs.len() * GROWTH_CONTINGENCY;
    let branches = leaves * AddressMap::max_prefix_capacity();
    [
        BlockConfig::new(AddressMap::leaf_size(), leaves as u32),
        BlockConfig::new(AddressMap::branch_size(), branches as u32),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allocator() -> UntypedAllocator {
        UntypedAllocator::new(
            4,
            &[BlockConfig::new(16, 4), BlockConfig::new(64, 4)],
        )
        .expect("allocator")
    }

    #[test]
    fn rejects_unserved_sizes() {
        let allocator = allocator();
        assert!(allocator.malloc(0).is_none());
        assert!(allocator.malloc(65).is_none());
        assert!(allocator.malloc(64).is_some());
    }

    #[test]
    fn seeds_the_address_map_with_every_block() {
        let allocator = allocator();
        // buckets 16, 32, 64; the 32 gap bucket starts with an empty block
        assert_eq!(allocator.block_count(), 2);
    }

    #[test]
    fn malloc_free_recycles_the_same_address() {
        let allocator = UntypedAllocator::new(
            1,
            &[BlockConfig::new(16, 1), BlockConfig::new(32, 1)],
        )
        .expect("allocator");
        let first = allocator.malloc(16).expect("slot");
        allocator.free(first).expect("free");
        let second = allocator.malloc(16).expect("slot");
        assert_eq!(first, second);
    }

    #[test]
    fn free_routes_through_the_size_recovered_from_the_map() {
        let allocator = allocator();
        let small = allocator.malloc(10).expect("16-byte bucket");
        let large = allocator.malloc(40).expect("64-byte bucket");
        // SAFETY: slots are ours until freed
        unsafe {
            small.as_ptr().write_bytes(0xAA, 10);
            large.as_ptr().write_bytes(0xBB, 40);
        }
        allocator.free(small).expect("free");
        allocator.free(large).expect("free");
        // both buckets keep serving after the round trip
        let small_again = allocator.malloc(10).expect("slot");
        let large_again = allocator.malloc(40).expect("slot");
        assert_ne!(small_again, large_again);
        allocator.free(small_again).expect("free");
        allocator.free(large_again).expect("free");
    }

    #[test]
    fn growth_is_recorded_before_pointers_escape() {
        let allocator = UntypedAllocator::new(
            2,
            &[BlockConfig::new(16, 2)],
        )
        .expect("allocator");
        let mut held = Vec::new();
        for _ in 0..20 {
            held.push(allocator.malloc(16).expect("grows on demand"));
        }
        assert!(allocator.block_count() > 1);
        for pointer in held {
            allocator.free(pointer).expect("free resolves grown blocks");
        }
        // everything came back: the original capacity is reachable again
        let reclaimed = allocator.malloc(16).expect("slot");
        allocator.free(reclaimed).expect("free");
    }

    #[test]
    fn free_of_an_unknown_low_pointer_is_dropped() {
        let allocator = allocator();
        // the lowest possible non-null pointer is far below any heap block
        let bogus = NonNull::new(8usize as *mut u8).expect("non-null");
        allocator.free(bogus).expect("silently dropped");
    }

    #[test]
    fn concurrent_malloc_free_churn() {
        use std::sync::Arc as StdArc;
        use std::thread;

        let allocator = StdArc::new(
            UntypedAllocator::new(8, &[BlockConfig::new(16, 8), BlockConfig::new(64, 8)])
                .expect("allocator"),
        );
        let mut workers = Vec::new();
        for worker_id in 0..4usize {
            let allocator = StdArc::clone(&allocator);
            workers.push(thread::spawn(move || {
                let size = if worker_id % 2 == 0 { 16 } else { 64 };
                for _ in 0..2_000 {
                    let pointer = allocator.malloc(size).expect("grows on demand");
                    // SAFETY: the slot is ours until freed
                    unsafe {
                        pointer.as_ptr().write(worker_id as u8);
                        assert_eq!(pointer.as_ptr().read(), worker_id as u8);
                    }
                    allocator.free(pointer).expect("free");
                }
            }));
        }
        for worker in workers {
            worker.join().expect("worker thread");
        }
    }
}
