//! # slabcore
//!
//! Concurrent memory infrastructure: a sized-slab allocator built on
//! lock-free blocks, the MPMC bounded ring queue that powers their free
//! lists, and a bitwise radix trie that lets an untyped `malloc`/`free`
//! facade recover allocation sizes from bare pointers.
//!
//! ## Layers
//!
//! - [`queue`] — bounded lock-free MPMC FIFOs: a guard-byte ring for
//!   arbitrary payloads and an atomic-payload ring for slot indices
//! - [`slab`] — fixed-size [`slab::Block`] arenas, append-only
//!   [`slab::BlockList`] growth, and the power-of-two-bucketed
//!   [`slab::SizedSlab`] router
//! - [`trie`] — [`trie::BitwiseTrie`], an integer-keyed radix-2 prefix
//!   tree allocated entirely inside a slab
//! - [`untyped`] — [`untyped::UntypedAllocator`], `malloc`/`free` over a
//!   slab plus an address-map trie
//! - [`tagged`], [`retry`], [`utils`] — the pointer-packing, contention
//!   recovery, and size arithmetic underneath it all
//!
//! ## Quick start
//!
//! ```rust
//! use slabcore::prelude::*;
//!
//! // a slab serving 16- and 64-byte values, growing on demand
//! let slab = SizedSlab::new(4, &[BlockConfig::new(16, 32), BlockConfig::new(64, 8)])?;
//!
//! // typed, owned construction in slab storage
//! let value = slab.make_box(42u64)?;
//! assert_eq!(*value, 42);
//! drop(value); // destructor runs, slot returns to the slab
//!
//! // raw allocation for hand-managed storage
//! let raw = slab.allocate(48, 8, 1, None).expect("served by the 64-byte bucket");
//! slab.deallocate(48, 8, raw.as_ptr(), 1)?;
//! # Ok::<(), slabcore::MemoryError>(())
//! ```
//!
//! ## Guarantees
//!
//! - Block storage never moves: issued addresses stay valid until the
//!   owning slab drops, even across bucket growth.
//! - Core operations are lock-free; contention is absorbed by internal
//!   retry with random backoff and never surfaces to callers.
//! - Argument violations surface as [`MemoryError`]; free-path anomalies
//!   (double frees, foreign pointers) are dropped and logged instead of
//!   unbalancing ownership.

#![warn(clippy::all)]
#![warn(clippy::perf)]
#![warn(rust_2018_idioms)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
// inline(always) on small alignment/bit helpers is intentional for hot paths
#![allow(clippy::inline_always)]
// Cast truncation in index/capacity code is reviewed per-site
#![allow(clippy::cast_possible_truncation)]

pub mod error;
pub mod queue;
pub mod retry;
pub mod slab;
pub mod tagged;
pub mod trie;
pub mod untyped;
pub mod utils;

pub use crate::error::{MemoryError, MemoryResult};

/// Convenient re-exports of commonly used types
pub mod prelude {
    pub use crate::error::{MemoryError, MemoryResult};
    pub use crate::queue::{IndexQueue, MpmcRingQueue};
    pub use crate::retry::{TryState, retry_with_random_backoff, try_and_ensure};
    pub use crate::slab::{Block, BlockConfig, BlockList, SizedSlab, SlabBox, calibrate};
    pub use crate::tagged::{AtomicTaggedPtr, TaggedPtr};
    pub use crate::trie::{BitwiseTrie, TrieKey};
    pub use crate::untyped::UntypedAllocator;
}
