//! # smallheap-core
//!
//! A thread-safe, size-class segregated small-block heap in front of a
//! general-purpose allocator.
//!
//! Three layers, leaf first:
//! - [`provider`]: page providers — reserve/commit/decommit of fixed-size
//!   pages from one contiguous address reservation.
//! - [`pool`] + [`page_table`]: one pool per size class, sharing a
//!   page-status table; lock-free free-list fast path, mutex-guarded
//!   bump/claim slow path.
//! - [`heap`] + [`dispatch`]: size-to-pool routing per tier, and the
//!   top-level [`StdMemAlloc`] that composes tiers in priority order in
//!   front of the general heap.
//!
//! Pointer provenance is always recovered by address arithmetic against
//! the page-status table — no per-allocation metadata exists below page
//! granularity.

pub mod dispatch;
pub mod free_list;
pub mod general;
pub mod global_alloc;
pub mod heap;
pub mod page_table;
pub mod pool;
pub mod provider;
pub mod size_class;
pub mod stats;

pub use dispatch::{
    default_fail_handler, AllocatorConfig, MemAllocFailHandler, StdMemAlloc,
};
pub use general::GeneralHeap;
pub use global_alloc::{global, GlobalSmallHeap};
pub use heap::SmallBlockHeap;
pub use pool::Pool;
pub use provider::{
    ArrayProvider, PageProvider, ProviderConfig, ProviderCounters, ProviderError,
};
#[cfg(unix)]
pub use provider::{FixedProvider, VirtualProvider};
pub use size_class::{MAX_BLOCK, MIN_BLOCK, NUM_CLASSES};
pub use stats::{HeapReport, PoolReport};
