//! Page providers.
//!
//! A provider owns one contiguous address reservation and hands it to a
//! page table as fixed-size pages. Two shapes exist:
//! - *virtual*: pages transition between committed and reserved-only
//!   individually (`commit`/`decommit` do real work);
//! - *fixed*: the whole range is committed once at reservation time and
//!   `commit`/`decommit` report failure, which the pool layer treats as
//!   "nothing to do".
//!
//! Reservation happens once, at table construction; failure there is a
//! startup-time error with no recovery path.

use std::ptr::NonNull;
use thiserror::Error;

/// Errors from the page-provider layer.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// The initial address-range reservation failed. Fatal to the tier.
    #[error("address range reservation of {size} bytes failed: {source}")]
    ReservationFailed {
        size: usize,
        #[source]
        source: std::io::Error,
    },
    /// Rejected configuration (zero sizes, non-power-of-two page size,
    /// total not a multiple of the page size).
    #[error("invalid provider configuration: {0}")]
    InvalidConfig(&'static str),
}

/// Recognized provider options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProviderConfig {
    /// Page size in bytes. Power of two.
    pub page_size: usize,
    /// Total address-range size in bytes. Multiple of `page_size`.
    pub total_size: usize,
    /// Committed pages compaction will not go below.
    pub min_reserve_pages: usize,
    /// Platform hint: prefer physically-backed memory. Carried through,
    /// never interpreted by the core algorithm.
    pub physical: bool,
}

impl ProviderConfig {
    /// Layout of the original primary tier: 48 MiB of 16 KiB pages,
    /// committed up front.
    pub fn fixed_default() -> Self {
        Self {
            page_size: 16 * 1024,
            total_size: 48 * 1024 * 1024,
            min_reserve_pages: 0,
            physical: true,
        }
    }

    /// Layout of the original fallback tier: 32 MiB of 64 KiB pages,
    /// committed on demand.
    pub fn virtual_default() -> Self {
        Self {
            page_size: 64 * 1024,
            total_size: 32 * 1024 * 1024,
            min_reserve_pages: 4,
            physical: false,
        }
    }

    pub(crate) fn check(&self) -> Result<(), ProviderError> {
        if self.page_size == 0 || !self.page_size.is_power_of_two() {
            return Err(ProviderError::InvalidConfig(
                "page_size must be a nonzero power of two",
            ));
        }
        if self.total_size == 0 || self.total_size % self.page_size != 0 {
            return Err(ProviderError::InvalidConfig(
                "total_size must be a nonzero multiple of page_size",
            ));
        }
        Ok(())
    }
}

/// Supplies and reclaims pages of a fixed size from a fixed-size total
/// address reservation.
pub trait PageProvider {
    /// Page size in bytes.
    fn page_size(&self) -> usize;

    /// Total reservation size in bytes.
    fn total_size(&self) -> usize;

    /// Committed pages compaction will not go below.
    fn min_reserve_pages(&self) -> usize;

    /// Whether pages can be committed/decommitted individually.
    fn is_virtual(&self) -> bool;

    /// Reserves the entire address range. Called exactly once, at page
    /// table construction.
    fn reserve(&mut self) -> Result<NonNull<u8>, ProviderError>;

    /// Backs one page with memory. Reports `false` on failure (which for
    /// a fixed provider is the permanent answer).
    fn commit(&self, page: NonNull<u8>) -> bool;

    /// Returns one page's backing to the OS, keeping the address range
    /// reserved. Reports `false` on failure.
    fn decommit(&self, page: NonNull<u8>) -> bool;

    /// Tears down the reservation made by `reserve`.
    ///
    /// # Safety
    /// No pointer into the range may be dereferenced afterwards.
    unsafe fn release(&mut self, base: NonNull<u8>);
}

#[cfg(unix)]
mod unix {
    use super::{NonNull, PageProvider, ProviderConfig, ProviderError};
    use std::io;

    unsafe fn map(size: usize, prot: libc::c_int) -> Result<NonNull<u8>, ProviderError> {
        // Safety: FFI call to mmap.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                prot,
                libc::MAP_PRIVATE | libc::MAP_ANON,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(ProviderError::ReservationFailed {
                size,
                source: io::Error::last_os_error(),
            });
        }
        NonNull::new(ptr.cast::<u8>()).ok_or_else(|| ProviderError::ReservationFailed {
            size,
            source: io::Error::other("mmap returned null"),
        })
    }

    /// On-demand provider: reserve `PROT_NONE`, commit `mprotect(RW)`,
    /// decommit `MADV_FREE` + `mprotect(PROT_NONE)`.
    pub struct VirtualProvider {
        config: ProviderConfig,
    }

    impl VirtualProvider {
        pub fn new(config: ProviderConfig) -> Result<Self, ProviderError> {
            config.check()?;
            Ok(Self { config })
        }
    }

    impl PageProvider for VirtualProvider {
        fn page_size(&self) -> usize {
            self.config.page_size
        }

        fn total_size(&self) -> usize {
            self.config.total_size
        }

        fn min_reserve_pages(&self) -> usize {
            self.config.min_reserve_pages
        }

        fn is_virtual(&self) -> bool {
            true
        }

        fn reserve(&mut self) -> Result<NonNull<u8>, ProviderError> {
            // Safety: fresh anonymous mapping, no aliasing.
            unsafe { map(self.config.total_size, libc::PROT_NONE) }
        }

        fn commit(&self, page: NonNull<u8>) -> bool {
            // Safety: FFI call to mprotect on a page inside our reservation.
            unsafe {
                libc::mprotect(
                    page.as_ptr().cast::<libc::c_void>(),
                    self.config.page_size,
                    libc::PROT_READ | libc::PROT_WRITE,
                ) == 0
            }
        }

        fn decommit(&self, page: NonNull<u8>) -> bool {
            // MADV_FREE marks the pages for lazy reclamation; the protection
            // change makes any stale access fault instead of reading junk.
            // Safety: FFI calls on a page inside our reservation.
            unsafe {
                if libc::madvise(
                    page.as_ptr().cast::<libc::c_void>(),
                    self.config.page_size,
                    libc::MADV_FREE,
                ) != 0
                {
                    return false;
                }
                libc::mprotect(
                    page.as_ptr().cast::<libc::c_void>(),
                    self.config.page_size,
                    libc::PROT_NONE,
                ) == 0
            }
        }

        unsafe fn release(&mut self, base: NonNull<u8>) {
            // Safety: base came from our reserve(); caller guarantees no
            // live pointers into the range.
            unsafe {
                libc::munmap(base.as_ptr().cast::<libc::c_void>(), self.config.total_size);
            }
        }
    }

    /// Committed-up-front provider. `commit`/`decommit` always report
    /// failure; the pool layer skips page transitions for it.
    pub struct FixedProvider {
        config: ProviderConfig,
    }

    impl FixedProvider {
        pub fn new(config: ProviderConfig) -> Result<Self, ProviderError> {
            config.check()?;
            Ok(Self { config })
        }
    }

    impl PageProvider for FixedProvider {
        fn page_size(&self) -> usize {
            self.config.page_size
        }

        fn total_size(&self) -> usize {
            self.config.total_size
        }

        fn min_reserve_pages(&self) -> usize {
            self.config.total_size / self.config.page_size
        }

        fn is_virtual(&self) -> bool {
            false
        }

        fn reserve(&mut self) -> Result<NonNull<u8>, ProviderError> {
            // Safety: fresh anonymous mapping, no aliasing.
            let base = unsafe {
                map(self.config.total_size, libc::PROT_READ | libc::PROT_WRITE)
            }?;
            #[cfg(target_os = "linux")]
            if self.config.physical {
                // Ask for immediate physical backing; the hint is advisory.
                // Safety: FFI call on our own mapping.
                unsafe {
                    libc::madvise(
                        base.as_ptr().cast::<libc::c_void>(),
                        self.config.total_size,
                        libc::MADV_WILLNEED,
                    );
                }
            }
            Ok(base)
        }

        fn commit(&self, _page: NonNull<u8>) -> bool {
            false
        }

        fn decommit(&self, _page: NonNull<u8>) -> bool {
            false
        }

        unsafe fn release(&mut self, base: NonNull<u8>) {
            // Safety: base came from our reserve(); caller guarantees no
            // live pointers into the range.
            unsafe {
                libc::munmap(base.as_ptr().cast::<libc::c_void>(), self.config.total_size);
            }
        }
    }
}

#[cfg(unix)]
pub use unix::{FixedProvider, VirtualProvider};

/// Shared view of an [`ArrayProvider`]'s transition counters. Clones
/// stay live after the provider moves into a page table, so tests can
/// observe commit/decommit traffic from outside.
#[derive(Clone, Default)]
pub struct ProviderCounters {
    commits: std::sync::Arc<std::sync::atomic::AtomicUsize>,
    decommits: std::sync::Arc<std::sync::atomic::AtomicUsize>,
}

impl ProviderCounters {
    /// Successful `commit` calls so far.
    pub fn commits(&self) -> usize {
        self.commits.load(std::sync::atomic::Ordering::Relaxed)
    }

    /// Successful `decommit` calls so far.
    pub fn decommits(&self) -> usize {
        self.decommits.load(std::sync::atomic::Ordering::Relaxed)
    }
}

/// Heap-backed provider for tests and non-unix targets.
///
/// "Commit"/"decommit" only flip bookkeeping; the backing allocation is
/// always accessible. Counts its transitions so tests can assert on the
/// page-reclaim contract.
pub struct ArrayProvider {
    config: ProviderConfig,
    virtual_pages: bool,
    base: Option<NonNull<u8>>,
    counters: ProviderCounters,
}

// Safety: the base pointer is owned exclusively by this provider (handed
// out only through the PageProvider contract) and the counters are
// atomic.
unsafe impl Send for ArrayProvider {}
unsafe impl Sync for ArrayProvider {}

impl ArrayProvider {
    pub fn new(config: ProviderConfig, virtual_pages: bool) -> Result<Self, ProviderError> {
        config.check()?;
        Ok(Self {
            config,
            virtual_pages,
            base: None,
            counters: ProviderCounters::default(),
        })
    }

    /// A handle onto this provider's transition counters.
    pub fn counters(&self) -> ProviderCounters {
        self.counters.clone()
    }

    /// Number of successful `commit` calls so far.
    pub fn commit_count(&self) -> usize {
        self.counters.commits()
    }

    /// Number of successful `decommit` calls so far.
    pub fn decommit_count(&self) -> usize {
        self.counters.decommits()
    }

    fn layout(&self) -> std::alloc::Layout {
        // Page-size alignment keeps block-address arithmetic identical to
        // the mmap-backed providers.
        std::alloc::Layout::from_size_align(self.config.total_size, self.config.page_size)
            .expect("provider config was validated at construction")
    }
}

impl PageProvider for ArrayProvider {
    fn page_size(&self) -> usize {
        self.config.page_size
    }

    fn total_size(&self) -> usize {
        self.config.total_size
    }

    fn min_reserve_pages(&self) -> usize {
        self.config.min_reserve_pages
    }

    fn is_virtual(&self) -> bool {
        self.virtual_pages
    }

    fn reserve(&mut self) -> Result<NonNull<u8>, ProviderError> {
        // Safety: layout has nonzero size.
        let ptr = unsafe { std::alloc::alloc_zeroed(self.layout()) };
        let base = NonNull::new(ptr).ok_or_else(|| ProviderError::ReservationFailed {
            size: self.config.total_size,
            source: std::io::Error::new(std::io::ErrorKind::OutOfMemory, "alloc returned null"),
        })?;
        self.base = Some(base);
        Ok(base)
    }

    fn commit(&self, _page: NonNull<u8>) -> bool {
        if !self.virtual_pages {
            return false;
        }
        self.counters
            .commits
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        true
    }

    fn decommit(&self, _page: NonNull<u8>) -> bool {
        if !self.virtual_pages {
            return false;
        }
        self.counters
            .decommits
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        true
    }

    unsafe fn release(&mut self, base: NonNull<u8>) {
        debug_assert_eq!(Some(base), self.base);
        // Safety: base was allocated in reserve() with the same layout.
        unsafe { std::alloc::dealloc(base.as_ptr(), self.layout()) };
        self.base = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_rejects_bad_page_size() {
        let config = ProviderConfig {
            page_size: 3000,
            total_size: 30000,
            min_reserve_pages: 0,
            physical: false,
        };
        assert!(matches!(
            config.check(),
            Err(ProviderError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_config_rejects_unaligned_total() {
        let config = ProviderConfig {
            page_size: 4096,
            total_size: 4096 * 3 + 1,
            min_reserve_pages: 0,
            physical: false,
        };
        assert!(config.check().is_err());
    }

    #[test]
    fn test_array_provider_counts_transitions() {
        let config = ProviderConfig {
            page_size: 4096,
            total_size: 4096 * 4,
            min_reserve_pages: 0,
            physical: false,
        };
        let mut provider = ArrayProvider::new(config, true).unwrap();
        let base = provider.reserve().unwrap();
        assert_eq!(base.as_ptr() as usize % 4096, 0);

        let page = base;
        assert!(provider.commit(page));
        assert!(provider.decommit(page));
        assert_eq!(provider.commit_count(), 1);
        assert_eq!(provider.decommit_count(), 1);

        unsafe { provider.release(base) };
    }

    #[test]
    fn test_array_provider_fixed_mode_refuses_transitions() {
        let config = ProviderConfig {
            page_size: 4096,
            total_size: 4096 * 2,
            min_reserve_pages: 0,
            physical: true,
        };
        let mut provider = ArrayProvider::new(config, false).unwrap();
        let base = provider.reserve().unwrap();
        assert!(!provider.commit(base));
        assert!(!provider.decommit(base));
        unsafe { provider.release(base) };
    }

    #[cfg(unix)]
    #[test]
    fn test_virtual_provider_commit_write_decommit() {
        let config = ProviderConfig {
            page_size: 16 * 1024,
            total_size: 64 * 1024,
            min_reserve_pages: 0,
            physical: false,
        };
        let mut provider = VirtualProvider::new(config).unwrap();
        let base = provider.reserve().unwrap();

        assert!(provider.commit(base));
        // Safety: the page was just committed read-write.
        unsafe {
            base.as_ptr().write(0xA5);
            assert_eq!(base.as_ptr().read(), 0xA5);
        }
        assert!(provider.decommit(base));
        // Recommit must produce an accessible page again.
        assert!(provider.commit(base));
        unsafe {
            base.as_ptr().write(0x5A);
            assert_eq!(base.as_ptr().read(), 0x5A);
        }

        unsafe { provider.release(base) };
    }

    #[cfg(unix)]
    #[test]
    fn test_fixed_provider_is_committed_up_front() {
        let config = ProviderConfig {
            page_size: 16 * 1024,
            total_size: 32 * 1024,
            min_reserve_pages: 0,
            physical: false,
        };
        let mut provider = FixedProvider::new(config).unwrap();
        let base = provider.reserve().unwrap();
        // Writable with no commit call; commit/decommit report failure.
        unsafe {
            base.as_ptr().write(1);
            base.as_ptr().add(16 * 1024).write(2);
        }
        assert!(!provider.commit(base));
        assert!(!provider.decommit(base));
        assert_eq!(
            provider.min_reserve_pages(),
            provider.total_size() / provider.page_size()
        );
        unsafe { provider.release(base) };
    }
}
