//! Small block pool: one size class, many threads.
//!
//! The fast path is a lock-free pop from the pool's free list. The slow
//! path (bump-allocating from the active page, or claiming a fresh page
//! from the shared table) runs under the pool's commit mutex, which is
//! never held across anything but page bookkeeping and the provider's
//! commit call.
//!
//! Page lifecycle: `NOT_COMMITTED -> COMMITTED(n live blocks) ->
//! NOT_COMMITTED`. Decommit happens only inside [`Pool::compact`], only
//! when every block ever carved from the page is present in the drained
//! free list and the page's live counter reads zero — both re-checked
//! under the commit mutex, which is the quiescence guarantee against a
//! racing pop.

use crate::free_list::FreeList;
use crate::page_table::{PageTable, NO_PAGE};
use crate::provider::PageProvider;
use parking_lot::Mutex;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Pages examined per incremental compaction call.
const COMPACT_PAGE_BATCH: usize = 16;

/// Bump state for the most recently claimed page. Only touched under the
/// commit mutex.
struct BumpState {
    /// Next carve address; 0 while no active page exists.
    cursor: usize,
    /// One past the last carvable address of the active page.
    limit: usize,
    /// Index of the active page, [`NO_PAGE`] if none.
    active_page: u32,
}

/// Allocator for a single block size.
pub struct Pool<P: PageProvider> {
    table: Arc<PageTable<P>>,
    /// Owner tag in the page table (pool index + 1).
    owner_tag: u32,
    block_size: usize,
    blocks_per_page: usize,
    free_list: FreeList,
    /// Head of this pool's page chain. Written under the commit mutex,
    /// read anywhere.
    first_page: AtomicU32,
    committed_pages: AtomicU32,
    bump: Mutex<BumpState>,
}

impl<P: PageProvider> Pool<P> {
    pub(crate) fn new(table: Arc<PageTable<P>>, index: u32, block_size: usize) -> Self {
        debug_assert!(block_size >= std::mem::size_of::<usize>());
        debug_assert!(block_size <= table.page_size());
        Self {
            owner_tag: index + 1,
            block_size,
            blocks_per_page: table.page_size() / block_size,
            free_list: FreeList::new(),
            first_page: AtomicU32::new(NO_PAGE),
            committed_pages: AtomicU32::new(0),
            bump: Mutex::new(BumpState {
                cursor: 0,
                limit: 0,
                active_page: NO_PAGE,
            }),
            table,
        }
    }

    /// The fixed size class serviced by this pool.
    #[inline]
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Allocates one block. `None` means the provider could not produce
    /// another page — the out-of-memory condition surfaced to the heap.
    pub fn alloc(&self) -> Option<NonNull<u8>> {
        if let Some(block) = self.free_list.pop() {
            self.note_reused(block);
            return Some(block);
        }

        let mut bump = self.bump.lock();
        // A free may have landed while we waited for the mutex.
        if let Some(block) = self.free_list.pop() {
            self.note_reused(block);
            return Some(block);
        }
        loop {
            if bump.cursor != 0 && bump.cursor + self.block_size <= bump.limit {
                let addr = bump.cursor;
                bump.cursor += self.block_size;
                let status = self.table.status(bump.active_page as usize);
                status.note_block_carved();
                status.note_block_allocated();
                // Safety: addr is inside a committed page, never zero.
                return Some(unsafe { NonNull::new_unchecked(addr as *mut u8) });
            }

            let index = self.table.claim_page(self.owner_tag)?;
            let status = self.table.status(index as usize);
            status.set_next_in_pool(self.first_page.load(Ordering::Relaxed));
            self.first_page.store(index, Ordering::Release);
            self.committed_pages.fetch_add(1, Ordering::Relaxed);

            let base = self.table.page_base(index).as_ptr() as usize;
            bump.cursor = base;
            bump.limit = base + self.blocks_per_page * self.block_size;
            bump.active_page = index;
        }
    }

    /// Returns a block to the pool.
    ///
    /// # Safety
    /// `block` must have been returned by this pool's `alloc` and must
    /// not be used after this call. Passing any other pointer is
    /// undefined behavior, as for any allocator.
    pub unsafe fn free(&self, block: NonNull<u8>) {
        // Safety: ownership of the block transfers back to the list.
        unsafe { self.free_list.push(block) };
        match self.table.page_index_of(block.as_ptr()) {
            Some(index) => self.table.status(index).note_block_freed(),
            None => debug_assert!(false, "freed block {block:p} is outside the tier"),
        }
    }

    fn note_reused(&self, block: NonNull<u8>) {
        match self.table.page_index_of(block.as_ptr()) {
            Some(index) => self.table.status(index).note_block_allocated(),
            None => debug_assert!(false, "free list produced {block:p} outside the tier"),
        }
    }

    /// Free blocks immediately reusable without touching the provider:
    /// the free list plus the uncarved remainder of the active page.
    /// Approximate under concurrent mutation.
    pub fn count_free_blocks(&self) -> usize {
        let bump_remaining = {
            let bump = self.bump.lock();
            if bump.cursor == 0 {
                0
            } else {
                (bump.limit - bump.cursor) / self.block_size
            }
        };
        self.free_list.approx_len() + bump_remaining
    }

    /// Total block capacity of this pool's committed pages.
    pub fn count_committed_blocks(&self) -> usize {
        self.committed_pages.load(Ordering::Relaxed) as usize * self.blocks_per_page
    }

    /// Live client blocks. Approximate under concurrent mutation.
    pub fn count_allocated_blocks(&self) -> usize {
        let mut total: i64 = 0;
        let mut cur = self.first_page.load(Ordering::Acquire);
        let mut walked = 0;
        while cur != NO_PAGE && walked <= self.table.page_count() {
            let status = self.table.status(cur as usize);
            total += i64::from(status.allocated().max(0));
            cur = status.next_in_pool();
            walked += 1;
        }
        total.max(0) as usize
    }

    /// Bytes of committed pages owned by this pool.
    pub fn committed_size(&self) -> usize {
        self.committed_pages.load(Ordering::Relaxed) as usize * self.table.page_size()
    }

    /// Decommits pages with no live and no outstanding blocks. Returns
    /// bytes released to the provider. `incremental` bounds the pages
    /// examined per call. No-op for fixed (non-virtual) providers.
    ///
    /// Allocation-free: drained blocks are parked on per-page intrusive
    /// drain lists, so compaction is safe even when this allocator backs
    /// the process's global allocator.
    pub fn compact(&self, incremental: bool) -> usize {
        if !self.table.is_virtual() {
            return 0;
        }
        let bump = self.bump.lock();

        // Drain the free list onto per-page drain lists. Anything drained
        // is unreachable to racing allocs; anything a racing free pushes
        // afterwards just waits for the next compaction.
        while let Some(block) = self.free_list.pop() {
            match self.table.page_index_of(block.as_ptr()) {
                // Safety: we hold the commit mutex and own the drained block.
                Some(index) => unsafe { self.table.status(index).scratch_push(block) },
                None => debug_assert!(false, "free list produced {block:p} outside the tier"),
            }
        }

        // A page is reclaimable only when every block ever carved from it
        // sits on its drain list and its live counter reads zero: a block
        // popped by a racing alloc is missing from the drain list, so the
        // count check doubles as the quiescence guarantee.
        let mut bytes_released = 0usize;
        let mut examined = 0usize;
        let mut prev = NO_PAGE;
        let mut cur = self.first_page.load(Ordering::Relaxed);
        while cur != NO_PAGE {
            let status = self.table.status(cur as usize);
            let next = status.next_in_pool();
            let in_budget = !incremental || examined < COMPACT_PAGE_BATCH;
            examined += 1;

            let reclaimable = in_budget
                && cur != bump.active_page
                && status.allocated() == 0
                && status.scratch_count() == status.carved();

            if reclaimable && self.table.release_page(cur) {
                status.scratch_reset();
                if prev == NO_PAGE {
                    self.first_page.store(next, Ordering::Relaxed);
                } else {
                    self.table.status(prev as usize).set_next_in_pool(next);
                }
                self.committed_pages.fetch_sub(1, Ordering::Relaxed);
                bytes_released += self.table.page_size();
                cur = next;
                continue;
            }
            prev = cur;
            cur = next;
        }

        // Blocks on surviving pages go back on the list.
        let mut cur = self.first_page.load(Ordering::Relaxed);
        while cur != NO_PAGE {
            let status = self.table.status(cur as usize);
            // Safety: commit mutex held; drained blocks are ours.
            unsafe {
                status.scratch_drain(|block| self.free_list.push(block));
            }
            cur = status.next_in_pool();
        }

        drop(bump);
        bytes_released
    }

    /// Walks every page and free-list entry, checking that the pool's
    /// accounting is self-consistent. Returns `false` on any violation.
    ///
    /// Requires a quiescent pool; concurrent allocs/frees make the walk
    /// itself racy. Debug/diagnostic use only.
    pub fn validate(&self) -> bool {
        let bump = self.bump.lock();

        let mut total_carved: u64 = 0;
        let mut total_allocated: i64 = 0;
        let mut chain_pages = 0usize;
        let mut cur = self.first_page.load(Ordering::Acquire);
        while cur != NO_PAGE {
            chain_pages += 1;
            if chain_pages > self.table.page_count() {
                return false; // cycle
            }
            let status = self.table.status(cur as usize);
            if status.owner() != self.owner_tag {
                return false;
            }
            let allocated = status.allocated();
            if allocated < 0 {
                return false;
            }
            let carved = status.carved();
            if carved as usize > self.blocks_per_page {
                return false;
            }
            total_carved += u64::from(carved);
            total_allocated += i64::from(allocated);
            cur = status.next_in_pool();
        }
        if chain_pages != self.committed_pages.load(Ordering::Relaxed) as usize {
            return false;
        }

        let mut free_count: u64 = 0;
        let mut node = self.free_list.head_ptr();
        while !node.is_null() {
            free_count += 1;
            if free_count > total_carved {
                return false; // longer than everything ever carved: cycle or corruption
            }
            let Some(index) = self.table.page_index_of(node) else {
                return false;
            };
            let status = self.table.status(index);
            if status.owner() != self.owner_tag {
                return false;
            }
            let offset = node as usize - self.table.page_base(index as u32).as_ptr() as usize;
            if offset % self.block_size != 0 {
                return false;
            }
            if (offset / self.block_size) as u32 >= status.carved() {
                return false; // points into never-carved territory
            }
            // Safety: node lies in a committed page owned by this pool and
            // the pool is quiescent per this function's contract.
            node = unsafe { FreeList::next_of(node) };
        }

        drop(bump);
        free_count + total_allocated.max(0) as u64 == total_carved
    }
}
