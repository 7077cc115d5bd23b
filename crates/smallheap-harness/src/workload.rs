//! Workload drivers.
//!
//! Deterministic, bounded pressure on a dedicated allocator instance —
//! not a fuzz campaign. Every driver finishes by proving conservation:
//! zero live allocations and a clean validation walk.

use serde::Serialize;
use smallheap_core::{AllocatorConfig, ProviderConfig, StdMemAlloc, MAX_BLOCK};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Barrier};
use std::time::Instant;
use thiserror::Error;

/// Harness-level failures.
#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("allocator construction failed: {0}")]
    Construction(#[from] smallheap_core::ProviderError),
    #[error("allocation failed at size {0} during workload")]
    Exhausted(usize),
    #[error("conservation violated: {allocated} bytes still allocated after teardown")]
    Conservation { allocated: usize },
    #[error("validation walk failed after workload")]
    Validation,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Stress workload parameters.
#[derive(Debug, Clone, Serialize)]
pub struct StressSpec {
    pub threads: usize,
    pub steps: usize,
    pub slots: usize,
    pub seed: u64,
    /// Primary tier megabytes (fallback gets the same).
    pub tier_mb: usize,
}

impl Default for StressSpec {
    fn default() -> Self {
        Self {
            threads: 4,
            steps: 50_000,
            slots: 64,
            seed: 1,
            tier_mb: 4,
        }
    }
}

impl StressSpec {
    pub fn config(&self) -> AllocatorConfig {
        let tier = ProviderConfig {
            page_size: 16 * 1024,
            total_size: self.tier_mb * 1024 * 1024,
            min_reserve_pages: 0,
            physical: false,
        };
        AllocatorConfig {
            primary: tier,
            secondary: None,
            fallback: Some(tier),
            general_budget: None,
        }
    }
}

/// Stress results.
#[derive(Debug, Clone, Serialize)]
pub struct StressReport {
    pub threads: usize,
    pub steps: usize,
    pub allocs: u64,
    pub frees: u64,
    pub elapsed_ms: u64,
    pub committed_bytes: usize,
    pub released_by_compact: usize,
}

/// Churn results.
#[derive(Debug, Clone, Serialize)]
pub struct ChurnReport {
    pub passes: usize,
    pub peak_committed: usize,
    pub committed_after_compact: usize,
    pub released_bytes: usize,
    pub elapsed_ms: u64,
}

#[derive(Clone, Copy)]
pub(crate) struct XorShift64 {
    state: u64,
}

impl XorShift64 {
    pub(crate) fn new(seed: u64) -> Self {
        Self {
            state: seed.max(1),
        }
    }

    pub(crate) fn next_u64(&mut self) -> u64 {
        // xorshift64*
        let mut x = self.state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.state = x;
        x.wrapping_mul(0x2545_F491_4F6C_DD1D)
    }

    pub(crate) fn gen_range(&mut self, low: usize, high_inclusive: usize) -> usize {
        low + (self.next_u64() as usize % (high_inclusive - low + 1))
    }
}

/// Runs `threads` workers doing seeded random alloc/free pairs against a
/// fresh allocator, then verifies conservation and validation.
pub fn run_stress(spec: &StressSpec) -> Result<StressReport, HarnessError> {
    let alloc = Arc::new(StdMemAlloc::new(spec.config())?);
    let started = Instant::now();
    let allocs = Arc::new(AtomicU64::new(0));
    let frees = Arc::new(AtomicU64::new(0));
    let barrier = Arc::new(Barrier::new(spec.threads));

    let handles: Vec<_> = (0..spec.threads)
        .map(|t| {
            let alloc = Arc::clone(&alloc);
            let allocs = Arc::clone(&allocs);
            let frees = Arc::clone(&frees);
            let barrier = Arc::clone(&barrier);
            let spec = spec.clone();
            std::thread::spawn(move || -> Result<(), HarnessError> {
                let mut rng = XorShift64::new(spec.seed ^ (t as u64).wrapping_mul(0x9E37_79B9));
                let mut slots = vec![0usize; spec.slots];
                barrier.wait();
                for _ in 0..spec.steps {
                    let slot = rng.gen_range(0, spec.slots - 1);
                    if slots[slot] == 0 {
                        // One request in ten crosses into the general tier.
                        let size = if rng.gen_range(0, 9) == 0 {
                            rng.gen_range(MAX_BLOCK + 1, MAX_BLOCK * 8)
                        } else {
                            rng.gen_range(1, MAX_BLOCK)
                        };
                        let block =
                            alloc.alloc(size).ok_or(HarnessError::Exhausted(size))?;
                        // Stamp the block so cross-thread reuse shows up as
                        // a corrupted stamp.
                        unsafe { block.as_ptr().write(slot as u8) };
                        slots[slot] = block.as_ptr() as usize;
                        allocs.fetch_add(1, Ordering::Relaxed);
                    } else {
                        let ptr = slots[slot] as *mut u8;
                        assert_eq!(unsafe { ptr.read() }, slot as u8, "stamp mismatch");
                        unsafe { alloc.free(ptr) };
                        slots[slot] = 0;
                        frees.fetch_add(1, Ordering::Relaxed);
                    }
                }
                for &addr in slots.iter().filter(|&&a| a != 0) {
                    unsafe { alloc.free(addr as *mut u8) };
                    frees.fetch_add(1, Ordering::Relaxed);
                }
                Ok(())
            })
        })
        .collect();

    for handle in handles {
        handle.join().expect("worker panicked")?;
    }

    let (committed_bytes, allocated) = alloc.global_memory_status();
    if allocated != 0 {
        return Err(HarnessError::Conservation { allocated });
    }
    if !alloc.validate() {
        return Err(HarnessError::Validation);
    }
    let released_by_compact = alloc.compact(false);

    Ok(StressReport {
        threads: spec.threads,
        steps: spec.steps,
        allocs: allocs.load(Ordering::Relaxed),
        frees: frees.load(Ordering::Relaxed),
        elapsed_ms: started.elapsed().as_millis() as u64,
        committed_bytes,
        released_by_compact,
    })
}

/// Sweeps every size class `passes` times on one thread, freeing all
/// blocks between passes, then compacts and reports the reclaim.
pub fn run_churn(passes: usize, tier_mb: usize) -> Result<ChurnReport, HarnessError> {
    let spec = StressSpec {
        tier_mb,
        ..StressSpec::default()
    };
    let alloc = StdMemAlloc::new(spec.config())?;
    let started = Instant::now();
    let mut peak_committed = 0;

    for _ in 0..passes.max(1) {
        let mut live = Vec::new();
        for size in (1..=MAX_BLOCK).step_by(7) {
            let block = alloc.alloc(size).ok_or(HarnessError::Exhausted(size))?;
            live.push(block.as_ptr() as usize);
        }
        let (committed, _) = alloc.global_memory_status();
        peak_committed = peak_committed.max(committed);
        for addr in live {
            unsafe { alloc.free(addr as *mut u8) };
        }
    }

    let released_bytes = alloc.compact(false);
    let (committed_after_compact, allocated) = alloc.global_memory_status();
    if allocated != 0 {
        return Err(HarnessError::Conservation { allocated });
    }
    if !alloc.validate() {
        return Err(HarnessError::Validation);
    }

    Ok(ChurnReport {
        passes: passes.max(1),
        peak_committed,
        committed_after_compact,
        released_bytes,
        elapsed_ms: started.elapsed().as_millis() as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stress_small_run_conserves() {
        let report = run_stress(&StressSpec {
            threads: 2,
            steps: 2_000,
            slots: 16,
            seed: 42,
            tier_mb: 2,
        })
        .unwrap();
        assert_eq!(report.threads, 2);
        assert!(report.allocs > 0);
        assert_eq!(report.allocs, report.frees);
    }

    #[test]
    fn test_stress_is_deterministic_in_op_counts() {
        let spec = StressSpec {
            threads: 1,
            steps: 1_000,
            slots: 8,
            seed: 7,
            tier_mb: 2,
        };
        let a = run_stress(&spec).unwrap();
        let b = run_stress(&spec).unwrap();
        assert_eq!(a.allocs, b.allocs);
        assert_eq!(a.frees, b.frees);
    }

    #[test]
    fn test_churn_completes_and_conserves() {
        let report = run_churn(2, 1).unwrap();
        assert_eq!(report.passes, 2);
        assert!(report.peak_committed > 0);
        assert!(report.committed_after_compact <= report.peak_committed);
    }

    #[test]
    fn test_xorshift_is_deterministic() {
        let mut a = XorShift64::new(99);
        let mut b = XorShift64::new(99);
        for _ in 0..100 {
            assert_eq!(a.next_u64(), b.next_u64());
        }
    }
}
