//! Stress and diagnostics harness for the smallheap allocator.
//!
//! This crate provides:
//! - Workload drivers: deterministic multi-threaded stress and
//!   single-threaded churn over a dedicated allocator instance
//! - Conservation checks: every workload ends by proving the allocator
//!   returned to its empty state
//! - Structured logging: JSONL records for machine consumption next to
//!   the human summaries

pub mod structured_log;
pub mod workload;

pub use structured_log::{LogEmitter, LogEntry, LogLevel, Outcome};
pub use workload::{ChurnReport, HarnessError, StressReport, StressSpec};
