use std::fmt::Write;
use std::path::Path;
use std::time::Duration;

use crate::summary::Operation;
use crate::walk::{ItemKind, TransferPlan};

const MIB: u64 = 1024 * 1024;

/// Nominal throughput used to estimate a copy.
pub const COPY_THROUGHPUT: u64 = 100 * MIB;
/// Nominal throughput used to estimate a delete.
pub const DELETE_THROUGHPUT: u64 = 200 * MIB;
/// Entries listed before the remainder is summarized.
pub const PREVIEW_LIMIT: usize = 10;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Estimate {
    pub entries: usize,
    pub directories: usize,
    pub total_bytes: u64,
    pub duration: Duration,
}

pub fn estimate(plan: &TransferPlan, operation: Operation) -> Estimate {
    let throughput = match operation {
        Operation::Copy => COPY_THROUGHPUT,
        Operation::Delete => DELETE_THROUGHPUT,
    };
    Estimate {
        entries: plan.entries().count(),
        directories: plan.directories().count(),
        total_bytes: plan.total_bytes,
        duration: Duration::from_secs_f64(plan.total_bytes as f64 / throughput as f64),
    }
}

fn format_estimate(duration: Duration) -> String {
    if duration < Duration::from_secs(1) {
        "< 1s".to_string()
    } else {
        format!(
            "~{}",
            humantime::format_duration(Duration::from_secs(duration.as_secs()))
        )
    }
}

/// The dry-run summary: totals, estimated time and a preview of the planned entries.
pub fn report(plan: &TransferPlan, operation: Operation, destination: Option<&Path>) -> String {
    let estimate = estimate(plan, operation);
    let verb = match operation {
        Operation::Copy => "copied",
        Operation::Delete => "deleted",
    };
    let noun = match operation {
        Operation::Copy => "copy",
        Operation::Delete => "delete",
    };
    let mut text = String::new();
    // writing to a String cannot fail
    let _ = writeln!(text, "🔍 Dry-run mode - no files will be {verb}");
    let _ = writeln!(text);
    let _ = writeln!(text, "Summary:");
    let _ = writeln!(text, "  Files to {noun}: {}", estimate.entries);
    if estimate.directories > 0 {
        let _ = writeln!(text, "  Directories: {}", estimate.directories);
    }
    let _ = writeln!(
        text,
        "  Total size: {}",
        bytesize::ByteSize(estimate.total_bytes)
    );
    let _ = writeln!(
        text,
        "  Estimated time: {}",
        format_estimate(estimate.duration)
    );
    if let Some(destination) = destination {
        let _ = writeln!(text, "  Destination: {}", destination.display());
    }
    if estimate.entries > 0 {
        let _ = writeln!(text);
        let _ = writeln!(
            text,
            "Files to {noun} (showing first {}):",
            PREVIEW_LIMIT.min(estimate.entries)
        );
        for item in plan.entries().take(PREVIEW_LIMIT) {
            let size = match item.kind {
                ItemKind::Symlink => "symlink".to_string(),
                _ => bytesize::ByteSize(item.size).to_string(),
            };
            let _ = writeln!(text, "  → {} ({})", item.source.display(), size);
        }
        if estimate.entries > PREVIEW_LIMIT {
            let _ = writeln!(
                text,
                "  ...and {} more files",
                estimate.entries - PREVIEW_LIMIT
            );
        }
    }
    if operation == Operation::Delete && estimate.directories > 0 {
        let _ = writeln!(text);
        let _ = writeln!(text, "Directories to delete:");
        for item in plan.directories().take(PREVIEW_LIMIT) {
            let _ = writeln!(text, "  → {}/", item.source.display());
        }
        if estimate.directories > PREVIEW_LIMIT {
            let _ = writeln!(
                text,
                "  ...and {} more directories",
                estimate.directories - PREVIEW_LIMIT
            );
        }
    }
    text
}
