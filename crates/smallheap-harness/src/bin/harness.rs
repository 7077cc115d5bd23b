//! CLI entrypoint for the smallheap harness.

use std::path::PathBuf;
use std::time::Instant;

use clap::{Parser, Subcommand};
use serde_json::json;
use smallheap_harness::{
    workload, LogEmitter, LogEntry, LogLevel, Outcome, StressSpec,
};

/// Stress and diagnostics tooling for the smallheap allocator.
#[derive(Debug, Parser)]
#[command(name = "smallheap-harness")]
#[command(about = "Stress/stats harness for the smallheap allocator")]
struct Cli {
    /// Write JSONL logs to this file instead of stdout.
    #[arg(long, global = true)]
    log: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Multi-threaded random alloc/free pressure with conservation checks.
    Stress {
        #[arg(long, default_value_t = 4)]
        threads: usize,
        /// Operations per thread.
        #[arg(long, default_value_t = 50_000)]
        steps: usize,
        /// Live-pointer slots per thread.
        #[arg(long, default_value_t = 64)]
        slots: usize,
        #[arg(long, default_value_t = 1)]
        seed: u64,
        /// Small-tier size in MiB (primary and fallback each).
        #[arg(long, default_value_t = 4)]
        tier_mb: usize,
    },
    /// Single-threaded size sweep, then compaction.
    Churn {
        #[arg(long, default_value_t = 4)]
        passes: usize,
        #[arg(long, default_value_t = 4)]
        tier_mb: usize,
    },
    /// Run a scripted workload and dump allocator stats.
    Stats {
        /// Write per-tier stats files with this base name instead of
        /// printing to stdout.
        #[arg(long)]
        file_base: Option<String>,
    },
    /// Run a workload, then a full validation walk. Exits nonzero on any
    /// inconsistency.
    Validate {
        #[arg(long, default_value_t = 10_000)]
        steps: usize,
    },
}

fn emitter(cli: &Cli) -> std::io::Result<LogEmitter> {
    match &cli.log {
        Some(path) => LogEmitter::to_file(path),
        None => Ok(LogEmitter::to_stdout()),
    }
}

fn main() {
    let cli = Cli::parse();
    let started = Instant::now();
    let mut log = match emitter(&cli) {
        Ok(log) => log,
        Err(err) => {
            eprintln!("cannot open log sink: {err}");
            std::process::exit(2);
        }
    };
    let elapsed = |started: Instant| started.elapsed().as_millis() as u64;

    let result = match cli.command {
        Command::Stress {
            threads,
            steps,
            slots,
            seed,
            tier_mb,
        } => {
            let spec = StressSpec {
                threads,
                steps,
                slots,
                seed,
                tier_mb,
            };
            workload::run_stress(&spec).map(|report| {
                let entry = LogEntry::new(LogLevel::Info, "stress.done", elapsed(started))
                    .with_outcome(Outcome::Pass)
                    .with_fields(serde_json::to_value(&report).unwrap_or_default());
                let _ = log.emit(&entry);
                println!(
                    "stress: {} threads x {} steps, {} allocs / {} frees in {} ms ({} KiB committed, {} KiB compacted away)",
                    report.threads,
                    report.steps,
                    report.allocs,
                    report.frees,
                    report.elapsed_ms,
                    report.committed_bytes / 1024,
                    report.released_by_compact / 1024,
                );
            })
        }
        Command::Churn { passes, tier_mb } => {
            workload::run_churn(passes, tier_mb).map(|report| {
                let entry = LogEntry::new(LogLevel::Info, "churn.done", elapsed(started))
                    .with_outcome(Outcome::Pass)
                    .with_fields(serde_json::to_value(&report).unwrap_or_default());
                let _ = log.emit(&entry);
                println!(
                    "churn: {} passes, peak {} KiB committed, {} KiB after compact ({} KiB released) in {} ms",
                    report.passes,
                    report.peak_committed / 1024,
                    report.committed_after_compact / 1024,
                    report.released_bytes / 1024,
                    report.elapsed_ms,
                );
            })
        }
        Command::Stats { file_base } => run_stats(file_base.as_deref()),
        Command::Validate { steps } => {
            let spec = StressSpec {
                threads: 2,
                steps,
                slots: 32,
                seed: 0xC0FFEE,
                tier_mb: 2,
            };
            workload::run_stress(&spec).map(|_| {
                let entry = LogEntry::new(LogLevel::Info, "validate.done", elapsed(started))
                    .with_outcome(Outcome::Pass);
                let _ = log.emit(&entry);
                println!("validate: clean after {steps} steps");
            })
        }
    };

    if let Err(err) = result {
        let entry = LogEntry::new(LogLevel::Error, "run.failed", elapsed(started))
            .with_outcome(Outcome::Fail)
            .with_fields(json!({ "error": err.to_string() }));
        let _ = log.emit(&entry);
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

/// Allocates a spread across every size class plus some general-tier
/// sizes, dumps stats while the blocks are live, then tears down.
fn run_stats(file_base: Option<&str>) -> Result<(), workload::HarnessError> {
    use smallheap_core::{AllocatorConfig, StdMemAlloc, MAX_BLOCK};

    let alloc = StdMemAlloc::new(AllocatorConfig::reduced())?;
    let mut live = Vec::new();
    for size in (8..=MAX_BLOCK).step_by(8) {
        let block = alloc
            .alloc(size)
            .ok_or(workload::HarnessError::Exhausted(size))?;
        live.push(block.as_ptr() as usize);
    }
    for size in [MAX_BLOCK * 2, MAX_BLOCK * 16] {
        let block = alloc
            .alloc(size)
            .ok_or(workload::HarnessError::Exhausted(size))?;
        live.push(block.as_ptr() as usize);
    }

    match file_base {
        Some(base) => alloc.dump_stats_file_base(base)?,
        None => {
            let mut stdout = std::io::stdout();
            alloc.dump_stats(&mut stdout)?;
        }
    }

    for addr in live {
        unsafe { alloc.free(addr as *mut u8) };
    }
    if !alloc.validate() {
        return Err(workload::HarnessError::Validation);
    }
    Ok(())
}
