//! Process-global allocator instance and `GlobalAlloc` adapter.
//!
//! A drop-in allocator for a legacy codebase must stay globally
//! reachable: [`global`] lazily constructs one [`StdMemAlloc`] for the
//! process. [`GlobalSmallHeap`] layers Rust's `GlobalAlloc` contract on
//! top of it so a binary can route every boxed allocation through the
//! small-block tiers.
//!
//! Bootstrap rule: allocations made while the global instance is being
//! constructed (including the instance's own tables) fall through to the
//! system allocator. They are freed correctly later because `dealloc`
//! routes by ownership, not by provenance guesswork.

use crate::dispatch::{AllocatorConfig, StdMemAlloc};
use crate::size_class::{MAX_BLOCK, MIN_BLOCK};
use std::alloc::{GlobalAlloc, Layout, System};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;

static GLOBAL: OnceLock<StdMemAlloc> = OnceLock::new();

/// Set before the global instance starts constructing; re-entrant
/// allocations observe it and use the system allocator instead.
static BOOTSTRAPPING: AtomicBool = AtomicBool::new(false);

/// The process-wide allocator, constructed on first use with the default
/// configuration.
///
/// # Panics
/// Panics if the initial tier reservations fail — the startup-time fatal
/// error of the design; there is no degraded mode without a primary
/// tier.
pub fn global() -> &'static StdMemAlloc {
    GLOBAL.get_or_init(|| {
        BOOTSTRAPPING.store(true, Ordering::Release);
        StdMemAlloc::new(AllocatorConfig::default())
            .expect("small-block heap reservation failed at startup")
    })
}

/// Like [`global`], but returns `None` instead of re-entering while the
/// instance is still under construction.
fn try_global() -> Option<&'static StdMemAlloc> {
    if let Some(alloc) = GLOBAL.get() {
        return Some(alloc);
    }
    if BOOTSTRAPPING.swap(true, Ordering::AcqRel) {
        return None;
    }
    Some(global())
}

/// `GlobalAlloc` adapter over the process allocator.
///
/// Small, naturally-aligned layouts go to the small-block tiers;
/// everything else (large sizes, alignments above 8, bootstrap traffic)
/// goes to the system allocator. `dealloc` picks the destination by
/// asking the tiers who owns the pointer.
pub struct GlobalSmallHeap;

unsafe impl GlobalAlloc for GlobalSmallHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() <= MIN_BLOCK && layout.size() <= MAX_BLOCK {
            if let Some(alloc) = try_global() {
                if let Some(block) = alloc.small_alloc(layout.size().max(1)) {
                    return block.as_ptr();
                }
            }
        }
        // Safety: caller upholds the GlobalAlloc contract.
        unsafe { System.alloc(layout) }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        if let Some(alloc) = GLOBAL.get() {
            if alloc.is_small_owner(ptr) {
                // Safety: ownership verified; ptr is live per the
                // GlobalAlloc contract.
                unsafe {
                    alloc.small_free(std::ptr::NonNull::new_unchecked(ptr));
                }
                return;
            }
        }
        // Safety: the pointer came from System.alloc with this layout.
        unsafe { System.dealloc(ptr, layout) }
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let small_owner = GLOBAL.get().filter(|a| a.is_small_owner(ptr));
        let Some(alloc) = small_owner else {
            // Safety: System pointers stay with System.
            return unsafe { System.realloc(ptr, layout, new_size) };
        };
        if new_size <= alloc.small_block_size(ptr).unwrap_or(0) && new_size > 0 {
            return ptr;
        }
        let Ok(new_layout) = Layout::from_size_align(new_size, layout.align()) else {
            return std::ptr::null_mut();
        };
        // Safety: forwarding the GlobalAlloc contract; the new block is
        // distinct from the old one.
        unsafe {
            let new_ptr = GlobalAlloc::alloc(self, new_layout);
            if !new_ptr.is_null() {
                std::ptr::copy_nonoverlapping(ptr, new_ptr, layout.size().min(new_size));
                GlobalAlloc::dealloc(self, ptr, layout);
            }
            new_ptr
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_global_is_one_instance() {
        let a = global() as *const StdMemAlloc;
        let b = global() as *const StdMemAlloc;
        assert_eq!(a, b);
    }

    #[test]
    fn test_adapter_routes_small_layouts_to_tiers() {
        let adapter = GlobalSmallHeap;
        let layout = Layout::from_size_align(64, 8).unwrap();
        let ptr = unsafe { adapter.alloc(layout) };
        assert!(!ptr.is_null());
        assert!(global().is_small_owner(ptr));
        unsafe { adapter.dealloc(ptr, layout) };
    }

    #[test]
    fn test_adapter_routes_large_and_aligned_to_system() {
        let adapter = GlobalSmallHeap;
        for layout in [
            Layout::from_size_align(MAX_BLOCK + 1, 8).unwrap(),
            Layout::from_size_align(64, 64).unwrap(),
        ] {
            let ptr = unsafe { adapter.alloc(layout) };
            assert!(!ptr.is_null());
            assert!(!global().is_small_owner(ptr));
            unsafe { adapter.dealloc(ptr, layout) };
        }
    }

    #[test]
    fn test_adapter_realloc_grows_out_of_small_tier() {
        let adapter = GlobalSmallHeap;
        let layout = Layout::from_size_align(32, 8).unwrap();
        let ptr = unsafe { adapter.alloc(layout) };
        unsafe {
            for i in 0..32 {
                ptr.add(i).write(i as u8);
            }
        }
        let grown = unsafe { adapter.realloc(ptr, layout, MAX_BLOCK * 4) };
        assert!(!grown.is_null());
        assert!(!global().is_small_owner(grown));
        unsafe {
            for i in 0..32 {
                assert_eq!(grown.add(i).read(), i as u8);
            }
            adapter.dealloc(
                grown,
                Layout::from_size_align(MAX_BLOCK * 4, 8).unwrap(),
            );
        }
    }

    #[test]
    fn test_adapter_realloc_within_block_keeps_pointer() {
        let adapter = GlobalSmallHeap;
        let layout = Layout::from_size_align(60, 4).unwrap();
        let ptr = unsafe { adapter.alloc(layout) };
        assert!(global().is_small_owner(ptr));
        // 60 lives in the 64-byte class; 64 still fits.
        let same = unsafe { adapter.realloc(ptr, layout, 64) };
        assert_eq!(same, ptr);
        unsafe { adapter.dealloc(same, Layout::from_size_align(64, 4).unwrap()) };
    }
}
