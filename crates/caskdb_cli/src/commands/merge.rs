//! Merge command implementation.

use super::format_size;
use caskdb_core::{Engine, MergeResult};
use serde::Serialize;
use std::path::Path;
use tracing::info;

/// Merge summary.
#[derive(Debug, Serialize)]
pub struct MergeSummary {
    /// Store path.
    pub path: String,
    /// Immutable segments consumed.
    pub segments_merged: usize,
    /// Segments written.
    pub output_segments: Vec<u64>,
    /// Records examined.
    pub records_scanned: u64,
    /// Live records copied.
    pub records_kept: u64,
    /// Records dropped.
    pub records_dropped: u64,
    /// Bytes before the merge.
    pub bytes_before: u64,
    /// Bytes after the merge.
    pub bytes_after: u64,
    /// Bytes freed.
    pub bytes_reclaimed: u64,
}

impl MergeSummary {
    fn new(path: &Path, result: &MergeResult) -> Self {
        Self {
            path: path.display().to_string(),
            segments_merged: result.segments_merged,
            output_segments: result.output_segments.iter().map(|id| id.as_u64()).collect(),
            records_scanned: result.records_scanned,
            records_kept: result.records_kept,
            records_dropped: result.records_dropped,
            bytes_before: result.bytes_before,
            bytes_after: result.bytes_after,
            bytes_reclaimed: result.bytes_reclaimed(),
        }
    }
}

/// Runs the merge command.
pub fn run(path: &Path, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let summary = merge(path)?;

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&summary)?),
        _ => print_text_output(&summary),
    }

    Ok(())
}

pub(crate) fn merge(path: &Path) -> Result<MergeSummary, Box<dyn std::error::Error>> {
    if !path.is_dir() {
        return Err(format!("No store found at {:?}", path).into());
    }

    let engine = Engine::open(path)?;
    info!(path = %path.display(), "merging store");
    let result = engine.merge()?;
    engine.close()?;

    Ok(MergeSummary::new(path, &result))
}

fn print_text_output(summary: &MergeSummary) {
    println!("Merged store at {}", summary.path);
    println!();
    println!("  Segments merged:  {}", summary.segments_merged);
    println!("  Segments written: {}", summary.output_segments.len());
    println!("  Records scanned:  {}", summary.records_scanned);
    println!("  Records kept:     {}", summary.records_kept);
    println!("  Records dropped:  {}", summary.records_dropped);
    println!(
        "  Size:             {} -> {}",
        format_size(summary.bytes_before),
        format_size(summary.bytes_after)
    );
    println!("  Reclaimed:        {}", format_size(summary.bytes_reclaimed));
}
