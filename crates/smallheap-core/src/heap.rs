//! Small block heap: one pool per size class behind a single reservation.
//!
//! Routes a byte size to the right pool through the dense class lookup,
//! and maps a client pointer back to its pool through the page-status
//! table — ownership is a range check plus one atomic owner load, never a
//! side table.

use crate::page_table::PageTable;
use crate::pool::Pool;
use crate::provider::{PageProvider, ProviderError};
use crate::size_class::{self, MAX_BLOCK, NUM_CLASSES};
use crate::stats::{HeapReport, PoolReport};
use std::ptr::NonNull;
use std::sync::Arc;

/// A complete small-block tier.
pub struct SmallBlockHeap<P: PageProvider> {
    table: Arc<PageTable<P>>,
    pools: Box<[Pool<P>]>,
}

impl<P: PageProvider> SmallBlockHeap<P> {
    /// Builds the tier: reserves the provider's range and lays out one
    /// pool per size class.
    pub fn new(provider: P) -> Result<Self, ProviderError> {
        if provider.page_size() < MAX_BLOCK {
            return Err(ProviderError::InvalidConfig(
                "page_size must be at least the largest size class",
            ));
        }
        let table = Arc::new(PageTable::new(provider)?);
        let pools = (0..NUM_CLASSES)
            .map(|i| Pool::new(Arc::clone(&table), i as u32, size_class::class_size(i)))
            .collect();
        Ok(Self { table, pools })
    }

    /// Whether `size` falls in this tier's serviceable range. Callers
    /// must check before calling [`alloc`](Self::alloc).
    #[inline]
    pub fn should_use(&self, size: usize) -> bool {
        size <= MAX_BLOCK
    }

    /// Whether `ptr` lies on a page owned by any pool of this tier.
    #[inline]
    pub fn is_owner(&self, ptr: *const u8) -> bool {
        self.find_pool(ptr).is_some()
    }

    /// The pool owning the page `ptr` points into, if any.
    pub fn find_pool(&self, ptr: *const u8) -> Option<&Pool<P>> {
        let index = self.table.page_index_of(ptr)?;
        let owner = self.table.status(index).owner();
        if owner == 0 {
            return None;
        }
        Some(&self.pools[(owner - 1) as usize])
    }

    /// Allocates at least `size` bytes from the matching pool. `None`
    /// when the size is out of range or the tier is out of pages.
    pub fn alloc(&self, size: usize) -> Option<NonNull<u8>> {
        let class = size_class::class_index(size.max(1))?;
        self.pools[class].alloc()
    }

    /// Allocates with an alignment guarantee above the natural 8 bytes,
    /// by picking a class whose size is a multiple of `align`.
    pub fn alloc_aligned(&self, size: usize, align: usize) -> Option<NonNull<u8>> {
        let class = size_class::class_index_aligned(size.max(1), align)?;
        self.pools[class].alloc()
    }

    /// Returns `ptr` to its owning pool.
    ///
    /// # Safety
    /// `ptr` must be a live block previously returned by this tier.
    pub unsafe fn free(&self, ptr: NonNull<u8>) {
        match self.find_pool(ptr.as_ptr()) {
            // Safety: contract forwarded from the caller.
            Some(pool) => unsafe { pool.free(ptr) },
            None => debug_assert!(false, "free of unowned pointer {ptr:p}"),
        }
    }

    /// The block size backing `ptr` — the allocator's answer for
    /// `GetSize`, which may exceed the originally requested size.
    pub fn get_size(&self, ptr: *const u8) -> Option<usize> {
        self.find_pool(ptr).map(Pool::block_size)
    }

    /// Resizes within the tier. Returns `ptr` unchanged while `size`
    /// still fits its current block (shrinking over-allocation is
    /// retained silently); otherwise moves the contents to the right
    /// class. `None` when `size` is out of this tier's range or the tier
    /// is out of pages — the old block is untouched in that case.
    ///
    /// # Safety
    /// `ptr` must be a live block previously returned by this tier.
    pub unsafe fn realloc(&self, ptr: NonNull<u8>, size: usize) -> Option<NonNull<u8>> {
        let block = self.get_size(ptr.as_ptr())?;
        if size <= block {
            return Some(ptr);
        }
        let new = self.alloc(size)?;
        // Safety: both blocks are live and at least `block` bytes; the
        // ranges cannot overlap because `new` is not `ptr`.
        unsafe {
            std::ptr::copy_nonoverlapping(ptr.as_ptr(), new.as_ptr(), block.min(size));
            self.free(ptr);
        }
        Some(new)
    }

    /// Aggregate committed/allocated byte counts across all pools.
    pub fn usage(&self) -> (usize, usize) {
        let mut committed = 0;
        let mut allocated = 0;
        for pool in &self.pools {
            committed += pool.committed_size();
            allocated += pool.count_allocated_blocks() * pool.block_size();
        }
        (committed, allocated)
    }

    /// Compacts every pool. Returns total bytes released.
    pub fn compact(&self, incremental: bool) -> usize {
        self.pools.iter().map(|p| p.compact(incremental)).sum()
    }

    /// Validates every pool. See [`Pool::validate`] for the contract.
    pub fn validate(&self) -> bool {
        self.pools.iter().all(Pool::validate)
    }

    /// Snapshot of per-pool counters for stats output.
    pub fn report(&self, tag: &str) -> HeapReport {
        HeapReport {
            tag: tag.to_string(),
            page_size: self.table.page_size(),
            reserved_bytes: self.table.page_count() * self.table.page_size(),
            pools: self
                .pools
                .iter()
                .map(|p| PoolReport {
                    block_size: p.block_size(),
                    free_blocks: p.count_free_blocks(),
                    committed_blocks: p.count_committed_blocks(),
                    allocated_blocks: p.count_allocated_blocks(),
                    committed_bytes: p.committed_size(),
                })
                .collect(),
        }
    }

    #[cfg(test)]
    pub(crate) fn pool_for_size(&self, size: usize) -> &Pool<P> {
        &self.pools[size_class::class_index(size).unwrap()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{ArrayProvider, ProviderConfig};

    fn heap(pages: usize) -> SmallBlockHeap<ArrayProvider> {
        let config = ProviderConfig {
            page_size: 16 * 1024,
            total_size: 16 * 1024 * pages,
            min_reserve_pages: 0,
            physical: false,
        };
        SmallBlockHeap::new(ArrayProvider::new(config, true).unwrap()).unwrap()
    }

    #[test]
    fn test_rejects_page_size_below_max_class() {
        let config = ProviderConfig {
            page_size: 1024,
            total_size: 16 * 1024,
            min_reserve_pages: 0,
            physical: false,
        };
        assert!(SmallBlockHeap::new(ArrayProvider::new(config, true).unwrap()).is_err());
    }

    #[test]
    fn test_should_use_range() {
        let h = heap(8);
        assert!(h.should_use(1));
        assert!(h.should_use(8));
        assert!(h.should_use(MAX_BLOCK));
        assert!(!h.should_use(MAX_BLOCK + 1));
    }

    #[test]
    fn test_alloc_routes_to_matching_class() {
        let h = heap(8);
        let p = h.alloc(64).unwrap();
        assert_eq!(h.get_size(p.as_ptr()), Some(64));
        let q = h.alloc(65).unwrap();
        assert_eq!(h.get_size(q.as_ptr()), Some(72));
        unsafe {
            h.free(p);
            h.free(q);
        }
    }

    #[test]
    fn test_get_size_over_reports() {
        let h = heap(8);
        for &size in &[1, 7, 9, 100, 1000, 2047] {
            let p = h.alloc(size).unwrap();
            let got = h.get_size(p.as_ptr()).unwrap();
            assert!(got >= size, "get_size({size}) = {got}");
            unsafe { h.free(p) };
        }
    }

    #[test]
    fn test_size_monotonicity() {
        let h = heap(8);
        let mut last = 0;
        for size in 1..=MAX_BLOCK {
            let block = h.pool_for_size(size).block_size();
            assert!(block >= last, "size {size}");
            last = block;
        }
    }

    #[test]
    fn test_is_owner_rejects_foreign_pointers() {
        let h = heap(8);
        let ours = h.alloc(32).unwrap();
        assert!(h.is_owner(ours.as_ptr()));

        let foreign = Box::new([0u8; 64]);
        assert!(!h.is_owner(foreign.as_ptr()));
        assert_eq!(h.get_size(foreign.as_ptr()), None);
        unsafe { h.free(ours) };
    }

    #[test]
    fn test_is_owner_rejects_unclaimed_page() {
        let h = heap(8);
        // No allocation yet: every page is unowned, so even in-range
        // addresses are not owned.
        let in_range = h.table.base().as_ptr();
        assert!(!h.is_owner(in_range));
    }

    #[test]
    fn test_realloc_within_block_is_identity() {
        let h = heap(8);
        let p = h.alloc(60).unwrap(); // 64-byte class
        assert_eq!(unsafe { h.realloc(p, 64) }, Some(p));
        assert_eq!(unsafe { h.realloc(p, 8) }, Some(p)); // shrink retained
        unsafe { h.free(p) };
    }

    #[test]
    fn test_realloc_growth_copies_contents() {
        let h = heap(8);
        let p = h.alloc(64).unwrap();
        for i in 0..64u8 {
            unsafe { p.as_ptr().add(i as usize).write(i) };
        }
        let q = unsafe { h.realloc(p, 512) }.unwrap();
        assert_ne!(q, p);
        for i in 0..64u8 {
            assert_eq!(unsafe { q.as_ptr().add(i as usize).read() }, i);
        }
        // The old block went back to its pool's free list.
        assert_eq!(h.pool_for_size(64).count_allocated_blocks(), 0);
        unsafe { h.free(q) };
    }

    #[test]
    fn test_usage_tracks_commit_and_alloc() {
        let h = heap(8);
        let (committed0, allocated0) = h.usage();
        assert_eq!((committed0, allocated0), (0, 0));
        let p = h.alloc(256).unwrap();
        let (committed, allocated) = h.usage();
        assert_eq!(committed, 16 * 1024);
        assert_eq!(allocated, 256);
        unsafe { h.free(p) };
    }

    #[test]
    fn test_report_shape() {
        let h = heap(8);
        let p = h.alloc(128).unwrap();
        let report = h.report("primary");
        assert_eq!(report.pools.len(), NUM_CLASSES);
        let line = report
            .pools
            .iter()
            .find(|r| r.block_size == 128)
            .unwrap();
        assert_eq!(line.allocated_blocks, 1);
        unsafe { h.free(p) };
    }
}
