//! Diagnostic snapshots and stats rendering.
//!
//! Counter values come from relaxed atomic reads and may be transiently
//! inconsistent with each other under concurrent mutation. They feed
//! human-readable output and telemetry, never allocation decisions.

use std::io::{self, Write};

/// One pool's counters at a point in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolReport {
    pub block_size: usize,
    pub free_blocks: usize,
    pub committed_blocks: usize,
    pub allocated_blocks: usize,
    pub committed_bytes: usize,
}

/// One tier's counters at a point in time.
#[derive(Debug, Clone)]
pub struct HeapReport {
    /// Tier label ("primary", "secondary", "fallback").
    pub tag: String,
    pub page_size: usize,
    pub reserved_bytes: usize,
    pub pools: Vec<PoolReport>,
}

impl HeapReport {
    /// Total committed bytes across all pools.
    pub fn committed_bytes(&self) -> usize {
        self.pools.iter().map(|p| p.committed_bytes).sum()
    }

    /// Total allocated bytes (block-size granularity) across all pools.
    pub fn allocated_bytes(&self) -> usize {
        self.pools
            .iter()
            .map(|p| p.allocated_blocks * p.block_size)
            .sum()
    }

    /// Writes the tier's stats as a text table, pools with no committed
    /// pages elided.
    pub fn write_text(&self, w: &mut dyn Write) -> io::Result<()> {
        writeln!(
            w,
            "Small block heap [{}]: {} KiB reserved, {} KiB pages",
            self.tag,
            self.reserved_bytes / 1024,
            self.page_size / 1024
        )?;
        writeln!(
            w,
            "{:>10} {:>10} {:>10} {:>10} {:>12}",
            "blocksize", "allocated", "free", "committed", "bytes"
        )?;
        for pool in self.pools.iter().filter(|p| p.committed_blocks > 0) {
            writeln!(
                w,
                "{:>10} {:>10} {:>10} {:>10} {:>12}",
                pool.block_size,
                pool.allocated_blocks,
                pool.free_blocks,
                pool.committed_blocks,
                pool.committed_bytes
            )?;
        }
        writeln!(
            w,
            "Total: {} KiB committed, {} KiB allocated",
            self.committed_bytes() / 1024,
            self.allocated_bytes() / 1024
        )
    }
}
