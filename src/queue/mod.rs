//! Bounded lock-free MPMC queues
//!
//! Two renditions of the same ring protocol live here:
//!
//! - [`MpmcRingQueue`] carries arbitrary payloads; each cell pairs the value
//!   with a guard byte that orders the payload write against readers.
//! - [`IndexQueue`] carries `u32` slot indices in a bare atomic cell with a
//!   reserved sentinel instead of a guard byte. Every allocator block uses
//!   one as its free list.
//!
//! Both report transient outcomes (busy, beaten) instead of blocking;
//! callers that must not surface contention loop through
//! [`crate::retry::retry_with_random_backoff`].

mod index;
mod mpmc;

pub use index::{DequeueOutcome, EnqueueOutcome, IndexQueue};
pub use mpmc::{Consumer, DequeueError, EnqueueError, MpmcRingQueue, Producer};
