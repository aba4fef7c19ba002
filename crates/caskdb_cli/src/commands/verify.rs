//! Verify command implementation.

use super::describe_stop;
use caskdb_core::dir;
use caskdb_core::recovery;
use caskdb_core::segment::DataScanner;
use caskdb_storage::{FileBackend, StorageBackend};
use std::path::Path;

/// Verification result.
#[derive(Debug)]
pub struct VerifyResult {
    /// Number of data files checked.
    pub segments_checked: usize,
    /// Number of hint files checked.
    pub hints_checked: usize,
    /// Number of entries whose checksum matched.
    pub valid_records: u64,
    /// List of errors found.
    pub errors: Vec<String>,
}

impl VerifyResult {
    fn new() -> Self {
        Self {
            segments_checked: 0,
            hints_checked: 0,
            valid_records: 0,
            errors: Vec::new(),
        }
    }

    fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Runs the verify command.
pub fn run(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    println!("Verifying store at {:?}", path);
    println!();

    let result = verify(path)?;

    println!("  Data files checked: {}", result.segments_checked);
    println!("  Hint files checked: {}", result.hints_checked);
    println!("  Valid records:      {}", result.valid_records);
    for error in &result.errors {
        println!("  ✗ {}", error);
    }

    println!();
    if result.is_ok() {
        println!("✓ Store verification passed");
        Ok(())
    } else {
        println!("✗ Store verification failed");
        Err("Verification failed".into())
    }
}

pub(crate) fn verify(path: &Path) -> Result<VerifyResult, Box<dyn std::error::Error>> {
    if !path.is_dir() {
        return Err(format!("No store found at {:?}", path).into());
    }

    let listing = dir::list_segments(path)?;
    let mut result = VerifyResult::new();

    for &id in &listing.data_ids {
        result.segments_checked += 1;
        let backend = FileBackend::open_read_only(&dir::data_path(path, id))?;
        let data_len = backend.size()?;

        let mut scanner = DataScanner::new(&backend, id)?;
        for scanned in scanner.by_ref() {
            scanned?;
            result.valid_records += 1;
        }
        if let Some(stop) = scanner.stop() {
            result.errors.push(format!(
                "segment {}: {} at offset {} of {}",
                id,
                describe_stop(&stop.kind),
                stop.offset,
                data_len
            ));
        }

        if listing.has_hint(id) {
            result.hints_checked += 1;
            if recovery::read_valid_hints(path, id, data_len)?.is_none() {
                result
                    .errors
                    .push(format!("segment {}: hint file does not match data file", id));
            }
        }
    }

    for artifact in &listing.merge_artifacts {
        result
            .errors
            .push(format!("leftover merge output {}", artifact.display()));
    }

    if let Some(ids) = dir::read_retire_marker(path)? {
        result.errors.push(format!(
            "unfinished merge retirement of {} segments; the next open completes it",
            ids.len()
        ));
    }

    Ok(result)
}
