//! Intrusive lock-free free list.
//!
//! Freed blocks double as list nodes: the first `usize` of a freed block
//! stores the next pointer, so the list costs no memory beyond the blocks
//! themselves. The head is a 128-bit `(generation, pointer)` word updated
//! with double-width compare-and-swap; the generation makes every
//! successful transition unique, so a node that is popped, handed out,
//! freed, and pushed back at the same address can never satisfy a stale
//! CAS (no ABA).
//!
//! Generation parity doubles as a pop reservation: even = stable, odd =
//! a popper holds the top node pinned while it reads the link word.
//! Pushers and other poppers spin while the head is odd. The link word is
//! therefore only ever read while its node cannot leave the list.

use portable_atomic::AtomicU128;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

/// `(generation, pointer)` packed for double-width CAS.
///
/// Bits `[127:64]` hold the generation, bits `[63:0]` the full virtual
/// address. No stolen pointer bits, no assumptions about VA width.
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
struct TaggedHead(u128);

impl TaggedHead {
    const NULL: Self = Self(0);

    #[inline]
    fn new(ptr: *mut u8, generation: u64) -> Self {
        Self(u128::from(generation) << 64 | (ptr as usize as u128))
    }

    #[inline]
    fn ptr(self) -> *mut u8 {
        (self.0 as usize) as *mut u8
    }

    #[inline]
    fn generation(self) -> u64 {
        (self.0 >> 64) as u64
    }

    #[inline]
    fn is_reserved(self) -> bool {
        self.generation() & 1 == 1
    }
}

impl std::fmt::Debug for TaggedHead {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TaggedHead({:p}, gen={})", self.ptr(), self.generation())
    }
}

/// Restores an even generation if a popper unwinds between reserving the
/// head and committing the new one.
struct PopReservation<'a> {
    head: &'a AtomicU128,
    old: TaggedHead,
    committed: bool,
}

impl Drop for PopReservation<'_> {
    fn drop(&mut self) {
        if !self.committed {
            let restored =
                TaggedHead::new(self.old.ptr(), self.old.generation().wrapping_add(2));
            self.head.store(restored.0, Ordering::Release);
        }
    }
}

/// Lock-free intrusive stack of fixed-size free blocks.
///
/// Safe for any number of concurrent pushers and poppers. The blocks
/// linked through it must be at least `size_of::<usize>()` bytes and
/// aligned for `usize`; every small-tier block satisfies both.
pub struct FreeList {
    head: AtomicU128,
    /// Approximate length, relaxed. Diagnostics only.
    len: AtomicUsize,
}

impl FreeList {
    pub const fn new() -> Self {
        Self {
            head: AtomicU128::new(TaggedHead::NULL.0),
            len: AtomicUsize::new(0),
        }
    }

    /// Pointer to a node's link word (its first `usize`).
    #[inline]
    unsafe fn link_of(node: *mut u8) -> *mut AtomicUsize {
        debug_assert!(
            (node as usize) % std::mem::align_of::<AtomicUsize>() == 0,
            "free-list node is not link-aligned: {node:p}"
        );
        node.cast::<AtomicUsize>()
    }

    /// Pushes `node` onto the list.
    ///
    /// # Safety
    /// `node` must point to a block of at least `size_of::<usize>()`
    /// writable bytes, aligned for `usize`, exclusively owned by the
    /// caller, and must remain valid until popped.
    pub unsafe fn push(&self, node: NonNull<u8>) {
        let node_ptr = node.as_ptr();
        loop {
            let old = TaggedHead(self.head.load(Ordering::Acquire));
            if old.is_reserved() {
                std::hint::spin_loop();
                continue;
            }
            // Safety: caller owns the node; it is not yet published.
            unsafe {
                (*Self::link_of(node_ptr)).store(old.ptr() as usize, Ordering::Relaxed);
            }
            let new = TaggedHead::new(node_ptr, old.generation().wrapping_add(2));
            if self
                .head
                .compare_exchange_weak(old.0, new.0, Ordering::Release, Ordering::Relaxed)
                .is_ok()
            {
                self.len.fetch_add(1, Ordering::Relaxed);
                return;
            }
        }
    }

    /// Pops the most recently pushed node, or `None` if the list is empty.
    ///
    /// The returned block is exclusively owned by the caller.
    pub fn pop(&self) -> Option<NonNull<u8>> {
        loop {
            let old = TaggedHead(self.head.load(Ordering::Acquire));
            if old.ptr().is_null() {
                return None;
            }
            if old.is_reserved() {
                std::hint::spin_loop();
                continue;
            }
            // Reserve (even -> odd): pins the top node so its link word
            // stays readable. Pushers and poppers spin until commit.
            let reserved = TaggedHead::new(old.ptr(), old.generation().wrapping_add(1));
            if self
                .head
                .compare_exchange_weak(old.0, reserved.0, Ordering::Acquire, Ordering::Relaxed)
                .is_err()
            {
                continue;
            }

            let mut guard = PopReservation {
                head: &self.head,
                old,
                committed: false,
            };

            // Safety: the reservation pins old.ptr(); no other thread can
            // pop it or hand it to a client while the head is odd.
            let next =
                unsafe { (*Self::link_of(old.ptr())).load(Ordering::Relaxed) as *mut u8 };

            // Commit (odd -> even). Cannot fail while we hold the
            // reservation; a failure here means the head was overwritten
            // behind our back.
            let committed = TaggedHead::new(next, old.generation().wrapping_add(2));
            let res = self.head.compare_exchange(
                reserved.0,
                committed.0,
                Ordering::Release,
                Ordering::Relaxed,
            );
            debug_assert!(res.is_ok(), "free-list pop reservation broken");
            guard.committed = true;

            self.len.fetch_sub(1, Ordering::Relaxed);
            return NonNull::new(old.ptr());
        }
    }

    /// Approximate number of nodes on the list. Relaxed; may be stale
    /// under concurrent mutation.
    #[inline]
    pub fn approx_len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    /// Current top-of-list pointer, for validation walks.
    ///
    /// Only meaningful while the list is quiescent; a concurrent pop can
    /// invalidate the returned pointer at any time.
    pub fn head_ptr(&self) -> *mut u8 {
        TaggedHead(self.head.load(Ordering::Acquire)).ptr()
    }

    /// Reads a node's link word, for validation walks.
    ///
    /// # Safety
    /// `node` must currently be linked on this list and the list must be
    /// quiescent for the duration of the walk.
    pub unsafe fn next_of(node: *mut u8) -> *mut u8 {
        // Safety: upheld by caller.
        unsafe { (*Self::link_of(node)).load(Ordering::Relaxed) as *mut u8 }
    }
}

impl Default for FreeList {
    fn default() -> Self {
        Self::new()
    }
}
