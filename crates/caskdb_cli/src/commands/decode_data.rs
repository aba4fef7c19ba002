//! Decode-data command implementation.

use super::{describe_stop, display_bytes, format_size, segment_id_of};
use caskdb_core::segment::DataScanner;
use caskdb_storage::FileBackend;
use serde::Serialize;
use std::path::Path;

/// One decoded entry.
#[derive(Debug, Serialize)]
pub struct DecodedEntry {
    /// Byte offset of the record.
    pub offset: u64,
    /// Entry timestamp in seconds.
    pub timestamp: u32,
    /// Key, as text or hex.
    pub key: String,
    /// Value, as text or hex; absent for tombstones.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    /// Value length in bytes.
    pub value_size: usize,
    /// Whether the entry is a deletion marker.
    pub tombstone: bool,
}

/// Decode result.
#[derive(Debug, Serialize)]
pub struct DecodeDataResult {
    /// File that was decoded.
    pub file: String,
    /// File size in bytes.
    pub size: u64,
    /// Entries read, up to the limit.
    pub entries: Vec<DecodedEntry>,
    /// Where and why the scan stopped early.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stopped: Option<String>,
}

/// Runs the decode-data command.
pub fn run(file: &Path, limit: Option<usize>, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let result = decode(file, limit)?;

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&result)?),
        _ => print_text_output(&result),
    }

    Ok(())
}

pub(crate) fn decode(
    file: &Path,
    limit: Option<usize>,
) -> Result<DecodeDataResult, Box<dyn std::error::Error>> {
    let backend = FileBackend::open_read_only(file)?;
    let mut scanner = DataScanner::new(&backend, segment_id_of(file))?;
    let limit = limit.unwrap_or(usize::MAX);

    let mut entries = Vec::new();
    for scanned in scanner.by_ref().take(limit) {
        let scanned = scanned?;
        let entry = scanned.entry;
        entries.push(DecodedEntry {
            offset: scanned.offset,
            timestamp: entry.timestamp.as_u32(),
            key: display_bytes(&entry.key),
            value: (!entry.tombstone).then(|| display_bytes(&entry.value)),
            value_size: entry.value.len(),
            tombstone: entry.tombstone,
        });
    }

    let stopped = scanner
        .stop()
        .map(|stop| format!("{} at offset {}", describe_stop(&stop.kind), stop.offset));

    Ok(DecodeDataResult {
        file: file.display().to_string(),
        size: scanner.total_size(),
        entries,
        stopped,
    })
}

fn print_text_output(result: &DecodeDataResult) {
    println!("Data file: {} ({})", result.file, format_size(result.size));
    println!();

    for entry in &result.entries {
        match &entry.value {
            Some(value) => println!(
                "{:>10}  ts={:<10}  {} = {}",
                entry.offset, entry.timestamp, entry.key, value
            ),
            None => println!(
                "{:>10}  ts={:<10}  {} (deleted)",
                entry.offset, entry.timestamp, entry.key
            ),
        }
    }

    println!();
    println!("{} entries", result.entries.len());
    if let Some(stopped) = &result.stopped {
        println!("Scan stopped: {}", stopped);
    }
}
