//! Error types for slabcore
//!
//! Uses thiserror for clean, idiomatic Rust error definitions. Concurrency
//! contention (busy/beaten queue outcomes) is never surfaced here; it is
//! consumed by internal retry. Errors cover argument violations and
//! invariant breaks only.

use thiserror::Error;

use tracing::error;

/// Memory infrastructure errors
#[must_use = "errors should be handled"]
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MemoryError {
    // --- Block construction ---
    #[error("host allocator could not provide {size} bytes of block storage")]
    OutOfMemory { size: usize },

    #[error("block value size cannot be 0")]
    InvalidValueSize,

    #[error("alignment {alignment} exceeds the block's total storage of {available} bytes")]
    InvalidAlignment { alignment: usize, available: usize },

    // --- Block free path ---
    #[error("freed pointer at offset {offset} does not sit on a {value_size}-byte slot boundary")]
    MisalignedFree { offset: usize, value_size: usize },

    #[error("freed pointer at slot {slot} is outside this block's {capacity} slots")]
    PointerNotInBlock { slot: usize, capacity: usize },

    // --- Tagged pointer ---
    #[error("pointer {addr:#x} is not 4-byte aligned and cannot carry a tag")]
    UnalignedTaggedPointer { addr: usize },

    // --- Ring queue ---
    #[error("queue handle limit of {limit} exhausted")]
    HandleExhausted { limit: u16 },

    #[error("queue capacity {capacity} exceeds the index ceiling of {max}")]
    CapacityInvalid { capacity: u32, max: u32 },

    // --- Slab factories ---
    #[error("no slab bucket serves a value of {size} bytes")]
    SlabFull { size: usize },
}

impl MemoryError {
    /// Stable code for log correlation
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::OutOfMemory { .. } => "SLAB:BLOCK:OOM",
            Self::InvalidValueSize => "SLAB:BLOCK:VALUE_SIZE",
            Self::InvalidAlignment { .. } => "SLAB:BLOCK:ALIGN",
            Self::MisalignedFree { .. } => "SLAB:FREE:MISALIGNED",
            Self::PointerNotInBlock { .. } => "SLAB:FREE:RANGE",
            Self::UnalignedTaggedPointer { .. } => "SLAB:TAGGED:ALIGN",
            Self::HandleExhausted { .. } => "SLAB:QUEUE:HANDLES",
            Self::CapacityInvalid { .. } => "SLAB:QUEUE:CAPACITY",
            Self::SlabFull { .. } => "SLAB:MAKE:FULL",
        }
    }

    /// True for errors raised by the free path (the caller handed a bad
    /// pointer; allocator state is untouched)
    #[must_use]
    pub fn is_free_path(&self) -> bool {
        matches!(
            self,
            Self::MisalignedFree { .. } | Self::PointerNotInBlock { .. }
        )
    }

    // ------------------------------------------------------------------
    // Convenience constructors
    // ------------------------------------------------------------------

    /// Create an out-of-memory error for a failed storage request
    pub fn out_of_memory(size: usize) -> Self {
        error!(size, "block storage allocation failed");
        Self::OutOfMemory { size }
    }

    /// Create an invalid-alignment error
    pub fn invalid_alignment(alignment: usize, available: usize) -> Self {
        Self::InvalidAlignment {
            alignment,
            available,
        }
    }

    /// Create a misaligned-free error
    pub fn misaligned_free(offset: usize, value_size: usize) -> Self {
        Self::MisalignedFree { offset, value_size }
    }

    /// Create a pointer-not-in-block error
    pub fn pointer_not_in_block(slot: usize, capacity: usize) -> Self {
        Self::PointerNotInBlock { slot, capacity }
    }

    /// Create an unaligned-tagged-pointer error
    pub fn unaligned_tagged_pointer(addr: usize) -> Self {
        Self::UnalignedTaggedPointer { addr }
    }

    /// Create a handle-exhausted error
    pub fn handle_exhausted(limit: u16) -> Self {
        Self::HandleExhausted { limit }
    }

    /// Create a capacity error for a queue that cannot index its cells
    pub fn capacity_invalid(capacity: u32, max: u32) -> Self {
        Self::CapacityInvalid { capacity, max }
    }

    /// Create a slab-full error for an unserved size
    pub fn slab_full(size: usize) -> Self {
        Self::SlabFull { size }
    }
}

/// Result alias used throughout the crate
pub type MemoryResult<T> = Result<T, MemoryError>;
