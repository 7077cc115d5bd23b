//! Top-level allocator dispatch.
//!
//! [`StdMemAlloc`] is the single allocation entry point: it routes each
//! request to the small-block tiers in priority order (primary fixed
//! heap, optional secondary fixed heap, virtual fallback heap) and lets
//! everything else land in the general tier. Frees and size queries walk
//! the same tiers with `is_owner` to find the pointer's home.
//!
//! Allocation failure is the only recoverable error: the dispatcher
//! compacts, invokes the registered failure handler, and retries while
//! the handler reports reclaimed bytes.

use crate::general::GeneralHeap;
use crate::heap::SmallBlockHeap;
use crate::provider::{ProviderConfig, ProviderError};
use crate::size_class::MIN_BLOCK;
use crate::stats::HeapReport;
use parking_lot::Mutex;
use std::io::{self, Write};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

#[cfg(unix)]
use crate::provider::{FixedProvider, VirtualProvider};

#[cfg(not(unix))]
use crate::provider::ArrayProvider;

/// Replaceable allocation-failure handler. Receives the failed request
/// size; returns the number of bytes it managed to free elsewhere (0
/// means "give up, fail the allocation").
pub type MemAllocFailHandler = fn(usize) -> usize;

/// The default handler frees nothing.
pub fn default_fail_handler(_size: usize) -> usize {
    0
}

/// Whole-allocator configuration: one provider per small tier plus the
/// general-tier budget.
#[derive(Debug, Clone)]
pub struct AllocatorConfig {
    /// Primary tier, committed up front.
    pub primary: ProviderConfig,
    /// Optional secondary fixed tier, tried after the primary.
    pub secondary: Option<ProviderConfig>,
    /// Virtual fallback tier, committed on demand.
    pub fallback: Option<ProviderConfig>,
    /// Byte budget for the general tier. `None` is unbounded; a budget
    /// models configurations that have no real fallback allocator.
    pub general_budget: Option<usize>,
}

impl Default for AllocatorConfig {
    /// The original PC layout: 48 MiB fixed primary, 32 MiB virtual
    /// fallback, unbounded general tier, no secondary.
    fn default() -> Self {
        Self {
            primary: ProviderConfig::fixed_default(),
            secondary: None,
            fallback: Some(ProviderConfig::virtual_default()),
            general_budget: None,
        }
    }
}

impl AllocatorConfig {
    /// A small footprint for tests and tools: one 1 MiB fixed tier and a
    /// 1 MiB virtual fallback.
    pub fn reduced() -> Self {
        Self {
            primary: ProviderConfig {
                page_size: 16 * 1024,
                total_size: 1024 * 1024,
                min_reserve_pages: 0,
                physical: false,
            },
            secondary: None,
            fallback: Some(ProviderConfig {
                page_size: 16 * 1024,
                total_size: 1024 * 1024,
                min_reserve_pages: 0,
                physical: false,
            }),
            general_budget: None,
        }
    }
}

#[cfg(unix)]
type PrimaryHeap = SmallBlockHeap<FixedProvider>;
#[cfg(unix)]
type FallbackHeap = SmallBlockHeap<VirtualProvider>;

#[cfg(not(unix))]
type PrimaryHeap = SmallBlockHeap<ArrayProvider>;
#[cfg(not(unix))]
type FallbackHeap = SmallBlockHeap<ArrayProvider>;

fn make_fixed_heap(config: ProviderConfig) -> Result<PrimaryHeap, ProviderError> {
    #[cfg(unix)]
    {
        SmallBlockHeap::new(FixedProvider::new(config)?)
    }
    #[cfg(not(unix))]
    {
        SmallBlockHeap::new(ArrayProvider::new(config, false)?)
    }
}

fn make_virtual_heap(config: ProviderConfig) -> Result<FallbackHeap, ProviderError> {
    #[cfg(unix)]
    {
        SmallBlockHeap::new(VirtualProvider::new(config)?)
    }
    #[cfg(not(unix))]
    {
        SmallBlockHeap::new(ArrayProvider::new(config, true)?)
    }
}

/// The process allocator: small-block tiers in front of a general heap.
pub struct StdMemAlloc {
    primary: PrimaryHeap,
    secondary: Option<PrimaryHeap>,
    fallback: Option<FallbackHeap>,
    general: GeneralHeap,
    fail_handler: Mutex<MemAllocFailHandler>,
    /// Size of the most recent failed request, for diagnostics.
    last_failed_size: AtomicUsize,
    /// Re-entry guard for compact-on-fail.
    in_compact: AtomicBool,
}

impl StdMemAlloc {
    /// Builds every configured tier. A reservation failure here is the
    /// startup-time fatal error of the design: the caller gets the error
    /// and no allocator.
    pub fn new(config: AllocatorConfig) -> Result<Self, ProviderError> {
        Ok(Self {
            primary: make_fixed_heap(config.primary)?,
            secondary: config.secondary.map(make_fixed_heap).transpose()?,
            fallback: config.fallback.map(make_virtual_heap).transpose()?,
            general: GeneralHeap::new(config.general_budget),
            fail_handler: Mutex::new(default_fail_handler),
            last_failed_size: AtomicUsize::new(0),
            in_compact: AtomicBool::new(false),
        })
    }

    /// Allocates at least `size` bytes. On exhaustion the failure
    /// handler decides between retry and `None`.
    pub fn alloc(&self, size: usize) -> Option<NonNull<u8>> {
        let size = size.max(1);
        loop {
            if let Some(ptr) = self.try_alloc(size) {
                return Some(ptr);
            }
            if self.handle_failure(size) == 0 {
                return None;
            }
        }
    }

    /// Allocates with an explicit alignment. Alignments within the
    /// small-tier guarantee take the normal path; larger ones pick an
    /// aligned size class or fall through to the general tier.
    pub fn alloc_aligned(&self, size: usize, align: usize) -> Option<NonNull<u8>> {
        debug_assert!(align.is_power_of_two());
        if align <= MIN_BLOCK {
            return self.alloc(size);
        }
        let size = size.max(1);
        loop {
            if let Some(ptr) = self.try_alloc_aligned(size, align) {
                return Some(ptr);
            }
            if self.handle_failure(size) == 0 {
                return None;
            }
        }
    }

    fn try_alloc(&self, size: usize) -> Option<NonNull<u8>> {
        if self.primary.should_use(size) {
            if let Some(ptr) = self.primary.alloc(size) {
                return Some(ptr);
            }
            if let Some(ptr) = self.secondary.as_ref().and_then(|h| h.alloc(size)) {
                return Some(ptr);
            }
            if let Some(ptr) = self.fallback.as_ref().and_then(|h| h.alloc(size)) {
                return Some(ptr);
            }
        }
        self.general.alloc(size)
    }

    fn try_alloc_aligned(&self, size: usize, align: usize) -> Option<NonNull<u8>> {
        if self.primary.should_use(size) {
            if let Some(ptr) = self.primary.alloc_aligned(size, align) {
                return Some(ptr);
            }
            if let Some(ptr) = self
                .secondary
                .as_ref()
                .and_then(|h| h.alloc_aligned(size, align))
            {
                return Some(ptr);
            }
            if let Some(ptr) = self
                .fallback
                .as_ref()
                .and_then(|h| h.alloc_aligned(size, align))
            {
                return Some(ptr);
            }
        }
        self.general.alloc_aligned(size, align)
    }

    fn handle_failure(&self, size: usize) -> usize {
        self.last_failed_size.store(size, Ordering::Relaxed);
        self.compact_on_fail();
        let handler = *self.fail_handler.lock();
        handler(size)
    }

    fn compact_on_fail(&self) {
        // One compaction at a time; a failing allocation inside the
        // compaction path must not recurse into it.
        if self.in_compact.swap(true, Ordering::Acquire) {
            return;
        }
        self.compact(false);
        self.in_compact.store(false, Ordering::Release);
    }

    /// Frees `ptr`. No-op on null. Freeing a pointer not owned by any
    /// tier is undefined behavior; debug builds assert.
    ///
    /// # Safety
    /// `ptr` must be null or a live block returned by this allocator,
    /// and must not be used after this call.
    pub unsafe fn free(&self, ptr: *mut u8) {
        let Some(block) = NonNull::new(ptr) else {
            return;
        };
        // Safety: contract forwarded from the caller.
        unsafe {
            if self.primary.is_owner(ptr) {
                self.primary.free(block);
            } else if let Some(h) = self.secondary.as_ref().filter(|h| h.is_owner(ptr)) {
                h.free(block);
            } else if let Some(h) = self.fallback.as_ref().filter(|h| h.is_owner(ptr)) {
                h.free(block);
            } else if !self.general.free(block) {
                debug_assert!(false, "free of pointer not owned by any tier: {ptr:p}");
            }
        }
    }

    /// The allocator's internal block size for `ptr`, which may exceed
    /// the originally requested size. 0 for null or unknown pointers.
    pub fn get_size(&self, ptr: *const u8) -> usize {
        if ptr.is_null() {
            return 0;
        }
        if let Some(size) = self.primary.get_size(ptr) {
            return size;
        }
        if let Some(size) = self.secondary.as_ref().and_then(|h| h.get_size(ptr)) {
            return size;
        }
        if let Some(size) = self.fallback.as_ref().and_then(|h| h.get_size(ptr)) {
            return size;
        }
        self.general.get_size(ptr).unwrap_or(0)
    }

    /// Whether `ptr` is a live allocation of any tier.
    pub fn owns(&self, ptr: *const u8) -> bool {
        self.primary.is_owner(ptr)
            || self.secondary.as_ref().is_some_and(|h| h.is_owner(ptr))
            || self.fallback.as_ref().is_some_and(|h| h.is_owner(ptr))
            || self.general.owns(ptr)
    }

    /// Resizes `ptr` to `size` bytes. Null behaves as `alloc`; zero
    /// behaves as `free` and returns `None`. While the new size fits the
    /// block's current capacity the pointer is returned unchanged.
    ///
    /// # Safety
    /// `ptr` must be null or a live block returned by this allocator.
    /// On success the old pointer is no longer valid (unless returned
    /// unchanged); on failure it is untouched.
    pub unsafe fn realloc(&self, ptr: *mut u8, size: usize) -> Option<NonNull<u8>> {
        let Some(block) = NonNull::new(ptr) else {
            return self.alloc(size);
        };
        if size == 0 {
            // Safety: contract forwarded from the caller.
            unsafe { self.free(ptr) };
            return None;
        }

        // In-tier resize keeps the pointer when the new size still fits.
        // Safety (both branches): contract forwarded from the caller.
        if self.primary.is_owner(ptr) && self.primary.should_use(size) {
            if let Some(moved) = unsafe { self.primary.realloc(block, size) } {
                return Some(moved);
            }
        } else if let Some(h) = self.secondary.as_ref().filter(|h| h.is_owner(ptr)) {
            if h.should_use(size) {
                if let Some(moved) = unsafe { h.realloc(block, size) } {
                    return Some(moved);
                }
            }
        } else if let Some(h) = self.fallback.as_ref().filter(|h| h.is_owner(ptr)) {
            if h.should_use(size) {
                if let Some(moved) = unsafe { h.realloc(block, size) } {
                    return Some(moved);
                }
            }
        }

        let old_size = self.get_size(ptr);
        if old_size >= size {
            return Some(block);
        }
        let moved = self.alloc(size)?;
        // Safety: both blocks are live; `moved` is distinct from `block`.
        unsafe {
            std::ptr::copy_nonoverlapping(block.as_ptr(), moved.as_ptr(), old_size.min(size));
            self.free(ptr);
        }
        Some(moved)
    }

    /// Aligned counterpart of [`realloc`](Self::realloc). The pointer is
    /// kept when the new size fits and the block already satisfies
    /// `align`.
    ///
    /// # Safety
    /// Same contract as [`realloc`](Self::realloc).
    pub unsafe fn realloc_aligned(
        &self,
        ptr: *mut u8,
        size: usize,
        align: usize,
    ) -> Option<NonNull<u8>> {
        debug_assert!(align.is_power_of_two());
        if align <= MIN_BLOCK {
            // Safety: contract forwarded from the caller.
            return unsafe { self.realloc(ptr, size) };
        }
        let Some(block) = NonNull::new(ptr) else {
            return self.alloc_aligned(size, align);
        };
        if size == 0 {
            // Safety: contract forwarded from the caller.
            unsafe { self.free(ptr) };
            return None;
        }
        let old_size = self.get_size(ptr);
        if old_size >= size && (ptr as usize) % align == 0 {
            return Some(block);
        }
        let moved = self.alloc_aligned(size, align)?;
        // Safety: both blocks are live; `moved` is distinct from `block`.
        unsafe {
            std::ptr::copy_nonoverlapping(block.as_ptr(), moved.as_ptr(), old_size.min(size));
            self.free(ptr);
        }
        Some(moved)
    }

    /// Installs a new allocation-failure handler and returns the old
    /// one. Single global slot, last write wins.
    pub fn set_alloc_fail_handler(&self, handler: MemAllocFailHandler) -> MemAllocFailHandler {
        std::mem::replace(&mut *self.fail_handler.lock(), handler)
    }

    /// Size of the most recent failed allocation request, 0 if none.
    pub fn memory_alloc_failed(&self) -> usize {
        self.last_failed_size.load(Ordering::Relaxed)
    }

    /// Best-effort decommit of unused pages across all tiers. Returns
    /// bytes released.
    pub fn compact(&self, incremental: bool) -> usize {
        let mut released = self.primary.compact(incremental);
        if let Some(h) = &self.secondary {
            released += h.compact(incremental);
        }
        if let Some(h) = &self.fallback {
            released += h.compact(incremental);
        }
        released
    }

    /// Committed and allocated byte totals: small tiers plus the general
    /// tier (whose commit equals its allocation).
    pub fn global_memory_status(&self) -> (usize, usize) {
        let mut committed = 0;
        let mut allocated = 0;
        for report in self.reports() {
            committed += report.committed_bytes();
            allocated += report.allocated_bytes();
        }
        let general = self.general.allocated_bytes();
        (committed + general, allocated + general)
    }

    /// Per-tier stats snapshots, priority order.
    pub fn reports(&self) -> Vec<HeapReport> {
        let mut reports = vec![self.primary.report("primary")];
        if let Some(h) = &self.secondary {
            reports.push(h.report("secondary"));
        }
        if let Some(h) = &self.fallback {
            reports.push(h.report("fallback"));
        }
        reports
    }

    /// Human-readable stats for every tier plus the general heap.
    pub fn dump_stats(&self, w: &mut dyn Write) -> io::Result<()> {
        for report in self.reports() {
            report.write_text(w)?;
        }
        writeln!(
            w,
            "General heap: {} allocations, {} KiB",
            self.general.allocation_count(),
            self.general.allocated_bytes() / 1024
        )
    }

    /// Writes each tier's stats to `<base>_sbh_<tag>.txt`.
    pub fn dump_stats_file_base(&self, base: &str) -> io::Result<()> {
        for report in self.reports() {
            let path = format!("{base}_sbh_{}.txt", report.tag);
            let mut file = std::fs::File::create(path)?;
            report.write_text(&mut file)?;
        }
        Ok(())
    }

    /// Consistency walk over every tier. Quiescent callers only; see
    /// [`crate::pool::Pool::validate`].
    pub fn validate(&self) -> bool {
        self.primary.validate()
            && self.secondary.as_ref().is_none_or(SmallBlockHeap::validate)
            && self.fallback.as_ref().is_none_or(SmallBlockHeap::validate)
    }

    #[cfg(test)]
    pub(crate) fn primary(&self) -> &PrimaryHeap {
        &self.primary
    }

    #[cfg(test)]
    pub(crate) fn general(&self) -> &GeneralHeap {
        &self.general
    }

    /// Allocation restricted to the small tiers, for the `GlobalAlloc`
    /// adapter: never touches the general tier (whose bookkeeping maps
    /// allocate) and never loops on the failure handler.
    pub(crate) fn small_alloc(&self, size: usize) -> Option<NonNull<u8>> {
        if let Some(ptr) = self.primary.alloc(size) {
            return Some(ptr);
        }
        if let Some(ptr) = self.secondary.as_ref().and_then(|h| h.alloc(size)) {
            return Some(ptr);
        }
        self.fallback.as_ref().and_then(|h| h.alloc(size))
    }

    /// Frees a block known to live in a small tier.
    ///
    /// # Safety
    /// `ptr` must be a live block for which
    /// [`is_small_owner`](Self::is_small_owner) returned true.
    pub(crate) unsafe fn small_free(&self, ptr: NonNull<u8>) {
        // Safety: contract forwarded from the caller.
        unsafe {
            if self.primary.is_owner(ptr.as_ptr()) {
                self.primary.free(ptr);
            } else if let Some(h) = self
                .secondary
                .as_ref()
                .filter(|h| h.is_owner(ptr.as_ptr()))
            {
                h.free(ptr);
            } else if let Some(h) = self
                .fallback
                .as_ref()
                .filter(|h| h.is_owner(ptr.as_ptr()))
            {
                h.free(ptr);
            } else {
                debug_assert!(false, "small_free of unowned pointer {ptr:p}");
            }
        }
    }

    /// Whether `ptr` lives in one of the small-block tiers (as opposed
    /// to the general tier or a foreign allocator).
    pub fn is_small_owner(&self, ptr: *const u8) -> bool {
        self.primary.is_owner(ptr)
            || self.secondary.as_ref().is_some_and(|h| h.is_owner(ptr))
            || self.fallback.as_ref().is_some_and(|h| h.is_owner(ptr))
    }

    pub(crate) fn small_block_size(&self, ptr: *const u8) -> Option<usize> {
        self.primary
            .get_size(ptr)
            .or_else(|| self.secondary.as_ref().and_then(|h| h.get_size(ptr)))
            .or_else(|| self.fallback.as_ref().and_then(|h| h.get_size(ptr)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::size_class::MAX_BLOCK;
    use std::sync::atomic::AtomicUsize as TestCounter;

    fn allocator() -> StdMemAlloc {
        StdMemAlloc::new(AllocatorConfig::reduced()).unwrap()
    }

    #[test]
    fn test_basic_lifecycle() {
        let a = allocator();
        let p1 = a.alloc(64).unwrap();
        assert!(a.get_size(p1.as_ptr()) >= 64);
        unsafe { a.free(p1.as_ptr()) };
        let p2 = a.alloc(64).unwrap();
        // Reuse is permitted, not required; either way p2 is live.
        assert!(a.get_size(p2.as_ptr()) >= 64);
        unsafe { a.free(p2.as_ptr()) };
    }

    #[test]
    fn test_free_null_is_noop() {
        let a = allocator();
        unsafe { a.free(std::ptr::null_mut()) };
    }

    #[test]
    fn test_zero_size_alloc_is_serviced() {
        let a = allocator();
        let p = a.alloc(0).unwrap();
        assert!(a.get_size(p.as_ptr()) >= 1);
        unsafe { a.free(p.as_ptr()) };
    }

    #[test]
    fn test_out_of_range_passthrough() {
        let a = allocator();
        let p = a.alloc(MAX_BLOCK + 1).unwrap();
        // Must not be served by any small tier.
        assert!(!a.is_small_owner(p.as_ptr()));
        assert!(a.general().owns(p.as_ptr()));
        assert!(a.get_size(p.as_ptr()) >= MAX_BLOCK + 1);
        unsafe { a.free(p.as_ptr()) };
    }

    #[test]
    fn test_no_false_ownership_of_general_pointers() {
        let a = allocator();
        for &size in &[MAX_BLOCK + 1, 16 * 1024, 1024 * 1024] {
            let p = a.alloc(size).unwrap();
            assert!(!a.primary().is_owner(p.as_ptr()));
            unsafe { a.free(p.as_ptr()) };
        }
    }

    #[test]
    fn test_small_sizes_stay_in_small_tiers() {
        let a = allocator();
        for &size in &[1, 8, 100, 2048] {
            let p = a.alloc(size).unwrap();
            assert!(a.is_small_owner(p.as_ptr()), "size {size}");
            unsafe { a.free(p.as_ptr()) };
        }
    }

    #[test]
    fn test_realloc_null_acts_as_alloc() {
        let a = allocator();
        let p = unsafe { a.realloc(std::ptr::null_mut(), 128) }.unwrap();
        assert!(a.get_size(p.as_ptr()) >= 128);
        unsafe { a.free(p.as_ptr()) };
    }

    #[test]
    fn test_realloc_zero_acts_as_free() {
        let a = allocator();
        let p = a.alloc(128).unwrap();
        assert!(unsafe { a.realloc(p.as_ptr(), 0) }.is_none());
        // The slot went back to its pool.
        assert_eq!(a.primary().pool_for_size(128).count_allocated_blocks(), 0);
    }

    #[test]
    fn test_realloc_grows_across_tiers() {
        let a = allocator();
        let p = a.alloc(100).unwrap();
        for i in 0..100u8 {
            unsafe { p.as_ptr().add(i as usize).write(i) };
        }
        // Growth beyond the small-tier ceiling moves to the general tier.
        let q = unsafe { a.realloc(p.as_ptr(), 100_000) }.unwrap();
        assert!(a.general().owns(q.as_ptr()));
        for i in 0..100u8 {
            assert_eq!(unsafe { q.as_ptr().add(i as usize).read() }, i);
        }
        unsafe { a.free(q.as_ptr()) };
    }

    #[test]
    fn test_realloc_shrink_keeps_pointer() {
        let a = allocator();
        let p = a.alloc(2048).unwrap();
        assert_eq!(unsafe { a.realloc(p.as_ptr(), 10) }, Some(p));
        unsafe { a.free(p.as_ptr()) };
    }

    #[test]
    fn test_aligned_alloc() {
        let a = allocator();
        for &align in &[16usize, 64, 512, 4096] {
            let p = a.alloc_aligned(100, align).unwrap();
            assert_eq!(p.as_ptr() as usize % align, 0, "align {align}");
            unsafe { a.free(p.as_ptr()) };
        }
        // 512-byte alignment is expressible as a size class, so it stays
        // in the small tiers; 4096 is not.
        let p = a.alloc_aligned(100, 512).unwrap();
        assert!(a.is_small_owner(p.as_ptr()));
        let q = a.alloc_aligned(100, 4096).unwrap();
        assert!(a.general().owns(q.as_ptr()));
        unsafe {
            a.free(p.as_ptr());
            a.free(q.as_ptr());
        }
    }

    #[test]
    fn test_realloc_aligned_preserves_alignment_and_contents() {
        let a = allocator();
        let p = a.alloc_aligned(100, 256).unwrap();
        for i in 0..100u8 {
            unsafe { p.as_ptr().add(i as usize).write(i) };
        }
        // Fits and is aligned: identity.
        assert_eq!(unsafe { a.realloc_aligned(p.as_ptr(), 128, 256) }, Some(p));
        // Growth keeps the alignment and the bytes.
        let q = unsafe { a.realloc_aligned(p.as_ptr(), 8192, 256) }.unwrap();
        assert_eq!(q.as_ptr() as usize % 256, 0);
        for i in 0..100u8 {
            assert_eq!(unsafe { q.as_ptr().add(i as usize).read() }, i);
        }
        unsafe { a.free(q.as_ptr()) };
    }

    #[test]
    fn test_fail_handler_invoked_and_replaced() {
        static CALLS: TestCounter = TestCounter::new(0);
        fn counting_handler(_size: usize) -> usize {
            CALLS.fetch_add(1, Ordering::Relaxed);
            0
        }

        let a = StdMemAlloc::new(AllocatorConfig {
            general_budget: Some(1024),
            ..AllocatorConfig::reduced()
        })
        .unwrap();
        let old = a.set_alloc_fail_handler(counting_handler);
        assert_eq!(old as usize, default_fail_handler as usize);

        // Exceeds every small tier and the general budget.
        assert!(a.alloc(1024 * 1024).is_none());
        assert_eq!(CALLS.load(Ordering::Relaxed), 1);
        assert_eq!(a.memory_alloc_failed(), 1024 * 1024);
    }

    #[test]
    fn test_global_memory_status_moves_with_allocs() {
        let a = allocator();
        let (_, allocated0) = a.global_memory_status();
        let p = a.alloc(1024).unwrap();
        let (committed, allocated) = a.global_memory_status();
        assert!(committed >= 16 * 1024);
        assert_eq!(allocated, allocated0 + 1024);
        unsafe { a.free(p.as_ptr()) };
    }

    #[test]
    fn test_dump_stats_renders() {
        let a = allocator();
        let p = a.alloc(300).unwrap();
        let mut out = Vec::new();
        a.dump_stats(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("[primary]"));
        assert!(text.contains("320")); // the 300-byte request's class
        unsafe { a.free(p.as_ptr()) };
    }

    #[test]
    fn test_validate_after_churn() {
        let a = allocator();
        let mut live = Vec::new();
        for size in (1..=MAX_BLOCK).step_by(37) {
            live.push(a.alloc(size).unwrap().as_ptr());
        }
        for (i, ptr) in live.iter().enumerate() {
            if i % 2 == 0 {
                unsafe { a.free(*ptr) };
            }
        }
        assert!(a.validate());
        for (i, ptr) in live.iter().enumerate() {
            if i % 2 != 0 {
                unsafe { a.free(*ptr) };
            }
        }
        assert!(a.validate());
    }
}
