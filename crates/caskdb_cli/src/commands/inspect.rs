//! Inspect command implementation.

use super::format_size;
use caskdb_core::dir::{self, LOCK_FILE};
use caskdb_core::recovery::{self, LoadSource};
use caskdb_core::KeyDir;
use serde::Serialize;
use std::path::Path;

/// Store inspection result.
#[derive(Debug, Serialize)]
pub struct InspectResult {
    /// Store path.
    pub path: String,
    /// Number of data files.
    pub segment_count: usize,
    /// Number of hint files.
    pub hint_count: usize,
    /// Total data file bytes.
    pub data_size: u64,
    /// Total hint file bytes.
    pub hint_size: u64,
    /// Entries across all data files.
    pub record_count: u64,
    /// Keys whose newest entry is a value.
    pub live_keys: usize,
    /// Keys whose newest entry is a tombstone.
    pub deleted_keys: usize,
    /// Whether a lock file is present.
    pub locked: bool,
    /// Leftover merge output files.
    pub merge_artifacts: usize,
    /// Per-segment details (if requested).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub segments: Option<Vec<SegmentInfo>>,
}

/// Details of one segment.
#[derive(Debug, Serialize)]
pub struct SegmentInfo {
    /// Segment id.
    pub id: u64,
    /// Data file bytes.
    pub data_size: u64,
    /// Hint file bytes, if a hint file exists.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint_size: Option<u64>,
    /// Entries in the segment.
    pub records: u64,
    /// Whether the index was built from the hint file.
    pub loaded_from_hint: bool,
    /// Offset where reading stopped early.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub damaged_at: Option<u64>,
}

/// Runs the inspect command.
pub fn run(
    path: &Path,
    show_segments: bool,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut result = inspect(path)?;
    if !show_segments {
        result.segments = None;
    }

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&result)?),
        _ => print_text_output(&result),
    }

    Ok(())
}

pub(crate) fn inspect(path: &Path) -> Result<InspectResult, Box<dyn std::error::Error>> {
    if !path.is_dir() {
        return Err(format!("No store found at {:?}", path).into());
    }

    let listing = dir::list_segments(path)?;
    let keydir = KeyDir::new();

    let mut result = InspectResult {
        path: path.display().to_string(),
        segment_count: listing.data_ids.len(),
        hint_count: listing.hint_ids.len(),
        data_size: 0,
        hint_size: 0,
        record_count: 0,
        live_keys: 0,
        deleted_keys: 0,
        locked: path.join(LOCK_FILE).exists(),
        merge_artifacts: listing.merge_artifacts.len(),
        segments: None,
    };

    let mut segments = Vec::with_capacity(listing.data_ids.len());
    for &id in &listing.data_ids {
        let data_size = std::fs::metadata(dir::data_path(path, id))?.len();
        let hint_size = if listing.has_hint(id) {
            Some(std::fs::metadata(dir::hint_path(path, id))?.len())
        } else {
            None
        };

        let load = recovery::load_segment(path, id, true, &keydir)?;

        result.data_size += data_size;
        result.hint_size += hint_size.unwrap_or(0);
        result.record_count += load.records;

        segments.push(SegmentInfo {
            id: id.as_u64(),
            data_size,
            hint_size,
            records: load.records,
            loaded_from_hint: load.source == LoadSource::Hints,
            damaged_at: load.stop.map(|stop| stop.offset),
        });
    }

    result.live_keys = keydir.live_len();
    result.deleted_keys = keydir.len() - result.live_keys;
    result.segments = Some(segments);

    Ok(result)
}

fn print_text_output(result: &InspectResult) {
    println!("Store: {}", result.path);
    println!();
    println!("Files:");
    println!(
        "  Data:           {} files, {}",
        result.segment_count,
        format_size(result.data_size)
    );
    println!(
        "  Hints:          {} files, {}",
        result.hint_count,
        format_size(result.hint_size)
    );
    println!(
        "  Total:          {}",
        format_size(result.data_size + result.hint_size)
    );
    println!();
    println!("Contents:");
    println!("  Records:        {}", result.record_count);
    println!("  Live keys:      {}", result.live_keys);
    println!("  Deleted keys:   {}", result.deleted_keys);
    println!();
    println!("State:");
    println!(
        "  Lock file:      {}",
        if result.locked { "present" } else { "absent" }
    );
    if result.merge_artifacts > 0 {
        println!("  Merge leftovers: {}", result.merge_artifacts);
    }

    if let Some(segments) = &result.segments {
        println!();
        println!("Segments:");
        for segment in segments {
            let hint = match segment.hint_size {
                Some(size) => format_size(size),
                None => "-".to_string(),
            };
            let source = if segment.loaded_from_hint { "hint" } else { "data" };
            print!(
                "  {:<12} data {:>10}  hint {:>10}  {:>8} records ({})",
                segment.id,
                format_size(segment.data_size),
                hint,
                segment.records,
                source
            );
            match segment.damaged_at {
                Some(offset) => println!("  damaged at {}", offset),
                None => println!(),
            }
        }
    }
}
