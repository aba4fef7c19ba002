//! Decode-hint command implementation.

use super::{describe_stop, display_bytes, format_size};
use caskdb_core::codec::decode_entry;
use caskdb_core::segment::HintScanner;
use caskdb_storage::{FileBackend, StorageBackend};
use serde::Serialize;
use std::path::Path;

/// One decoded hint record.
#[derive(Debug, Serialize)]
pub struct DecodedHint {
    /// Byte offset of the hint record.
    pub offset: u64,
    /// Entry timestamp in seconds.
    pub timestamp: u32,
    /// Key, as text or hex.
    pub key: String,
    /// Value length in bytes.
    pub value_size: u32,
    /// Whether the entry is a deletion marker.
    pub tombstone: bool,
    /// Offset of the entry in the data file.
    pub value_position: u32,
    /// Value resolved from the data file, when one was given.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    /// Why the value could not be resolved.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Decode result.
#[derive(Debug, Serialize)]
pub struct DecodeHintResult {
    /// Hint file that was decoded.
    pub file: String,
    /// Hint file size in bytes.
    pub size: u64,
    /// Hint records read.
    pub hints: Vec<DecodedHint>,
    /// Where and why the scan stopped early.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stopped: Option<String>,
}

/// Runs the decode-hint command.
pub fn run(
    hint: &Path,
    data: Option<&Path>,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let result = decode(hint, data)?;

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&result)?),
        _ => print_text_output(&result),
    }

    Ok(())
}

pub(crate) fn decode(
    hint: &Path,
    data: Option<&Path>,
) -> Result<DecodeHintResult, Box<dyn std::error::Error>> {
    let backend = FileBackend::open_read_only(hint)?;
    let data = data.map(FileBackend::open_read_only).transpose()?;
    let mut scanner = HintScanner::new(&backend)?;

    let mut hints = Vec::new();
    for scanned in scanner.by_ref() {
        let scanned = scanned?;
        let header = scanned.header;
        let mut decoded = DecodedHint {
            offset: scanned.offset,
            timestamp: header.timestamp.as_u32(),
            key: display_bytes(&scanned.key),
            value_size: header.value_size,
            tombstone: header.tombstone,
            value_position: header.value_position,
            value: None,
            error: None,
        };

        if let Some(data) = &data {
            match resolve(data, u64::from(header.value_position), header.entry_len(), &scanned.key) {
                Ok(value) => decoded.value = value,
                Err(message) => decoded.error = Some(message),
            }
        }
        hints.push(decoded);
    }

    let stopped = scanner
        .stop()
        .map(|stop| format!("{} at offset {}", describe_stop(&stop.kind), stop.offset));

    Ok(DecodeHintResult {
        file: hint.display().to_string(),
        size: backend.size()?,
        hints,
        stopped,
    })
}

/// Reads and verifies the entry a hint points at.
fn resolve(
    data: &FileBackend,
    position: u64,
    len: u64,
    key: &[u8],
) -> Result<Option<String>, String> {
    let len = usize::try_from(len).map_err(|_| "entry length overflows".to_string())?;
    let bytes = data
        .read_at(position, len)
        .map_err(|e| format!("read failed: {e}"))?;
    let entry = decode_entry(&bytes).map_err(|e| e.to_string())?;
    if entry.key != key {
        return Err("data entry has a different key".to_string());
    }
    Ok((!entry.tombstone).then(|| display_bytes(&entry.value)))
}

fn print_text_output(result: &DecodeHintResult) {
    println!("Hint file: {} ({})", result.file, format_size(result.size));
    println!();

    for hint in &result.hints {
        let state = if hint.tombstone { " (deleted)" } else { "" };
        println!(
            "{:>10}  ts={:<10}  pos={:<10}  size={:<8}  {}{}",
            hint.offset, hint.timestamp, hint.value_position, hint.value_size, hint.key, state
        );
        if let Some(value) = &hint.value {
            println!("{:>12}= {}", "", value);
        }
        if let Some(error) = &hint.error {
            println!("{:>12}✗ {}", "", error);
        }
    }

    println!();
    println!("{} hints", result.hints.len());
    if let Some(stopped) = &result.stopped {
        println!("Scan stopped: {}", stopped);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use caskdb_core::codec::{encode_entry, encode_hint, encode_tombstone};
    use caskdb_core::Timestamp;

    #[test]
    fn resolves_values_through_the_data_file() {
        let dir = tempfile::tempdir().unwrap();
        let data_path = dir.path().join("3.data");
        let hint_path = dir.path().join("3.hint");

        let first = encode_entry(b"k1", b"hello", Timestamp::new(7)).unwrap();
        let second = encode_tombstone(b"k2", Timestamp::new(8)).unwrap();
        let mut data = first.clone();
        data.extend(&second);
        std::fs::write(&data_path, &data).unwrap();

        let mut hints = encode_hint(Timestamp::new(7), b"k1", 5, false, 0).unwrap();
        hints.extend(encode_hint(Timestamp::new(8), b"k2", 0, true, first.len() as u32).unwrap());
        // Points at the tombstone but claims a different key.
        hints.extend(encode_hint(Timestamp::new(8), b"zz", 0, true, first.len() as u32).unwrap());
        std::fs::write(&hint_path, &hints).unwrap();

        let result = decode(&hint_path, Some(&data_path)).unwrap();
        assert_eq!(result.hints.len(), 3);
        assert_eq!(result.hints[0].value.as_deref(), Some("hello"));
        assert!(result.hints[1].tombstone);
        assert!(result.hints[1].value.is_none());
        assert!(result.hints[1].error.is_none());
        assert!(result.hints[2].error.is_some());
        assert!(result.stopped.is_none());

        let without_data = decode(&hint_path, None).unwrap();
        assert!(without_data.hints.iter().all(|h| h.value.is_none()));
    }
}
