//! Lock-free append-only list of blocks sharing one value size
//!
//! A bucket grows by appending blocks, never by resizing one, so every
//! address a block has issued stays valid for the bucket's lifetime. The
//! chain is a singly linked list whose only mutable field is the tail's
//! `next` pointer: it transitions from null to non-null exactly once, via
//! CAS, and is permanent from then on. Readers traverse with acquire loads
//! and need no locks.

use core::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use core::ptr::NonNull;

use tracing::{debug, warn};

use crate::error::{MemoryError, MemoryResult};
use crate::retry::Backoff;
use crate::slab::block::Block;
use crate::slab::config::BlockConfig;

/// One link in the chain: a block and the next pointer that publishes its
/// successor
#[derive(Debug)]
pub struct Node {
    block: Block,
    next: AtomicPtr<Node>,
}

impl Node {
    fn boxed(value_size: usize, capacity: u32) -> MemoryResult<Box<Node>> {
        Ok(Box::new(Node {
            // slots in a bucket are aligned to their own value size
            block: Block::with_alignment(value_size, capacity, value_size)?,
            next: AtomicPtr::new(core::ptr::null_mut()),
        }))
    }

    /// The block this link owns
    #[inline]
    pub fn block(&self) -> &Block {
        &self.block
    }
}

/// Result of trying to publish a successor behind the tail
pub enum AppendOutcome {
    /// The CAS landed; the list now owns the node
    Appended,
    /// Another thread published first; ownership returns to the caller
    Beaten(Box<Node>),
}

/// Walking position inside a [`BlockList`]
///
/// The cursor never outlives the list and only ever moves forward; a
/// published node is immutable apart from its `next` pointer, so the
/// borrowed block stays valid indefinitely.
pub struct Cursor<'a> {
    list: &'a BlockList,
    node: &'a Node,
}

impl<'a> Cursor<'a> {
    /// The block at the current position
    #[inline]
    pub fn block(&self) -> &'a Block {
        &self.node.block
    }

    /// True when no successor has been published yet
    #[inline]
    pub fn is_last(&self) -> bool {
        self.node.next.load(Ordering::Acquire).is_null()
    }

    /// Moves to the successor; returns false at the tail
    pub fn advance(&mut self) -> bool {
        let next = self.node.next.load(Ordering::Acquire);
        if next.is_null() {
            return false;
        }
        // SAFETY: a non-null next pointer is permanent and points to a node
        // owned by this list; the acquire load synchronizes with the
        // publishing CAS, so the node is fully initialized.
        self.node = unsafe { &*next };
        true
    }

    /// Publishes `successor` behind this node
    ///
    /// Valid only at the tail: the CAS swings `next` from null to the new
    /// node, transferring ownership to the list. When another thread has
    /// already published, the node comes back in [`AppendOutcome::Beaten`].
    pub fn try_append(&self, successor: Box<Node>) -> AppendOutcome {
        let raw = Box::into_raw(successor);
        match self.node.next.compare_exchange(
            core::ptr::null_mut(),
            raw,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                self.list.node_count.fetch_add(1, Ordering::Release);
                AppendOutcome::Appended
            }
            // SAFETY: the CAS failed, so the list never saw `raw`; the box
            // round-trips intact to the caller.
            Err(_) => AppendOutcome::Beaten(unsafe { Box::from_raw(raw) }),
        }
    }
}

/// Iterator over the blocks of a [`BlockList`]
pub struct Iter<'a> {
    node: Option<&'a Node>,
}

impl<'a> Iterator for Iter<'a> {
    type Item = &'a Block;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.node?;
        let next = node.next.load(Ordering::Acquire);
        // SAFETY: same argument as Cursor::advance
        self.node = if next.is_null() {
            None
        } else {
            Some(unsafe { &*next })
        };
        Some(&node.block)
    }
}

/// Lock-free singly linked list of same-sized blocks
///
/// The head block is constructed eagerly from the configured initial
/// capacity; further blocks are appended on demand and never removed while
/// the list is alive.
#[derive(Debug)]
pub struct BlockList {
    value_size: usize,
    contingency_capacity: u32,
    growth_factor: u32,
    node_count: AtomicUsize,
    head: Box<Node>,
}

impl BlockList {
    /// Builds the list and its eager head block from `config`
    pub fn new(config: &BlockConfig) -> MemoryResult<Self> {
        Ok(Self {
            value_size: config.block_size,
            contingency_capacity: config.contingency_capacity,
            growth_factor: config.growth_factor.max(2),
            node_count: AtomicUsize::new(1),
            head: Node::boxed(config.block_size, config.initial_capacity)?,
        })
    }

    /// Value size shared by every block in the list
    #[inline]
    pub fn value_size(&self) -> usize {
        self.value_size
    }

    /// Capacity used when an empty bucket must produce its first real block
    #[inline]
    pub fn contingency_capacity(&self) -> u32 {
        self.contingency_capacity
    }

    /// Capacity multiplier applied to each appended block
    #[inline]
    pub fn growth_factor(&self) -> u32 {
        self.growth_factor
    }

    /// Number of blocks currently published
    #[inline]
    pub fn len(&self) -> usize {
        self.node_count.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        false // the head node always exists
    }

    /// Cursor at the eagerly constructed head node
    #[inline]
    pub fn cursor(&self) -> Cursor<'_> {
        Cursor {
            list: self,
            node: &self.head,
        }
    }

    /// Iterator over all published blocks
    #[inline]
    pub fn iter(&self) -> Iter<'_> {
        Iter {
            node: Some(&self.head),
        }
    }

    /// Constructs an unlinked node carrying a block of this list's value
    /// size, ready for [`Cursor::try_append`]
    pub fn create_node(&self, capacity: u32) -> MemoryResult<Box<Node>> {
        Node::boxed(self.value_size, capacity)
    }

    /// Claims a slot from the first block that has one, growing the list
    /// when every published block is full.
    ///
    /// The appended block's capacity is the tail block's capacity times the
    /// growth factor (the contingency capacity when the tail is an empty
    /// placeholder). Growth failures are logged and surface as `None`.
    pub fn allocate(&self) -> Option<NonNull<u8>> {
        let mut cursor = self.cursor();
        let mut backoff = Backoff::new();
        loop {
            if let Some(pointer) = cursor.block().allocate() {
                return Some(pointer);
            }
            if cursor.advance() {
                continue;
            }
            let tail_capacity = cursor.block().capacity();
            let next_capacity = if tail_capacity == 0 {
                self.contingency_capacity
            } else {
                tail_capacity.saturating_mul(self.growth_factor)
            };
            if next_capacity == 0 {
                warn!(
                    value_size = self.value_size,
                    "bucket cannot grow: no contingency capacity configured"
                );
                return None;
            }
            let node = match self.create_node(next_capacity) {
                Ok(node) => node,
                Err(error) => {
                    warn!(
                        value_size = self.value_size,
                        capacity = next_capacity,
                        %error,
                        "bucket growth failed"
                    );
                    return None;
                }
            };
            match cursor.try_append(node) {
                AppendOutcome::Appended => {
                    debug!(
                        value_size = self.value_size,
                        capacity = next_capacity,
                        blocks = self.len(),
                        "bucket grew"
                    );
                }
                AppendOutcome::Beaten(_) => {
                    // someone else published a block; walk into it instead
                    backoff.spin();
                }
            }
            cursor.advance();
        }
    }

    /// Returns `pointer` to the block that issued it
    ///
    /// The first block whose range covers the pointer receives the free;
    /// a pointer no block claims is dropped silently apart from a log line
    /// (double-free of a recycled slot or a foreign pointer).
    ///
    /// # Errors
    /// Propagates `MisalignedFree` from the owning block.
    pub fn deallocate(&self, pointer: *mut u8) -> MemoryResult<bool> {
        for block in self.iter() {
            if block.in_range(pointer) {
                return block.free(pointer).map(|()| true);
            }
        }
        warn!(
            value_size = self.value_size,
            pointer = pointer as usize,
            "no block claims the freed pointer; dropping it"
        );
        Ok(false)
    }
}

impl Drop for BlockList {
    fn drop(&mut self) {
        // detach and free the chain iteratively; a deep bucket must not
        // recurse through nested node drops
        let mut next = self.head.next.swap(core::ptr::null_mut(), Ordering::Acquire);
        while !next.is_null() {
            // SAFETY: appended nodes are exclusively owned by the chain and
            // unreachable once detached here (&mut self).
            let node = unsafe { Box::from_raw(next) };
            next = node.next.swap(core::ptr::null_mut(), Ordering::Acquire);
        }
    }
}

/// Deep snapshot for test-time comparison; the source must be quiescent
impl Clone for BlockList {
    fn clone(&self) -> Self {
        let head = Box::new(Node {
            block: self.head.block.clone(),
            next: AtomicPtr::new(core::ptr::null_mut()),
        });
        let copy = Self {
            value_size: self.value_size,
            contingency_capacity: self.contingency_capacity,
            growth_factor: self.growth_factor,
            node_count: AtomicUsize::new(self.len()),
            head,
        };
        let mut tail: &Node = &copy.head;
        for block in self.iter().skip(1) {
            let node = Box::into_raw(Box::new(Node {
                block: block.clone(),
                next: AtomicPtr::new(core::ptr::null_mut()),
            }));
            tail.next.store(node, Ordering::Release);
            // SAFETY: just stored; exclusively owned by the copy
            tail = unsafe { &*node };
        }
        copy
    }
}

impl PartialEq for BlockList {
    fn eq(&self, other: &Self) -> bool {
        if self.value_size != other.value_size || self.len() != other.len() {
            return false;
        }
        self.iter().zip(other.iter()).all(|(a, b)| a == b)
    }
}
