//! Open-time KeyDir rebuild.
//!
//! Every immutable segment is loaded from its hint file when the hint file
//! is present and consistent with the data file, and from a full data-file
//! scan otherwise. The active segment of a crashed writer is always
//! scanned, truncated at its torn tail and given a fresh hint file.
//!
//! ## Hint validation
//!
//! Hints carry no checksum, so a hint file is trusted only if:
//!
//! 1. it parses to the end without a torn or impossible record
//! 2. every hint points at a range inside the data file, in ascending order
//! 3. the last hinted entry ends exactly at the end of the data file
//!
//! Anything else falls back to scanning the data file, which verifies every
//! checksum and stops at the first bad record.

use crate::dir::{self, SegmentListing};
use crate::error::{CoreError, CoreResult};
use crate::keydir::{KeyDir, KeyDirEntry};
use crate::segment::{ActiveSegment, DataScanner, HintScanner, ScanStop, ScannedEntry, ScannedHint};
use crate::types::SegmentId;
use caskdb_storage::{FileBackend, StorageBackend};
use std::path::Path;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// How often, in records, long scans check the recovery deadline.
const DEADLINE_CHECK_INTERVAL: u64 = 1024;

/// Where a segment's index entries came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadSource {
    /// The hint file.
    Hints,
    /// A full scan of the data file.
    Data,
}

/// Result of loading one segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentLoad {
    /// Which file was read.
    pub source: LoadSource,
    /// Records fed to the KeyDir.
    pub records: u64,
    /// Where a data scan stopped early.
    pub stop: Option<ScanStop>,
}

/// Summary of an open-time recovery.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Segments loaded, the resumed active segment included.
    pub segments: usize,
    /// Segments loaded from hint files.
    pub from_hints: usize,
    /// Segments loaded by scanning data files.
    pub from_data: usize,
    /// Records fed to the KeyDir.
    pub records: u64,
    /// Segments whose scan stopped at a torn or corrupt record.
    pub damaged: usize,
    /// Crashed active segment that was reopened.
    pub resumed_active: Option<SegmentId>,
}

/// Output of [`recover`].
#[derive(Debug)]
pub struct Recovered {
    /// Reopened active segment of a crashed writer, if any.
    pub active: Option<ActiveSegment>,
    /// Immutable segment ids, ascending.
    pub sealed: Vec<SegmentId>,
    /// What was done.
    pub report: RecoveryReport,
}

struct Deadline {
    start: Instant,
    limit: Duration,
}

impl Deadline {
    fn new(limit: Duration) -> Self {
        Self {
            start: Instant::now(),
            limit,
        }
    }

    fn check(&self) -> CoreResult<()> {
        if self.limit.is_zero() {
            return Ok(());
        }
        let elapsed = self.start.elapsed();
        if elapsed > self.limit {
            return Err(CoreError::RecoveryTimeout {
                elapsed_ms: elapsed.as_millis(),
            });
        }
        Ok(())
    }
}

/// Rebuilds `keydir` from every segment in `listing`.
///
/// `resume` names the active segment recorded by a crashed writer; it is
/// reopened for appends instead of being sealed.
///
/// # Errors
///
/// - [`CoreError::RecoveryTimeout`] if `timeout` is non-zero and exceeded
/// - I/O errors
pub fn recover(
    dir: &Path,
    listing: &SegmentListing,
    resume: Option<SegmentId>,
    keydir: &KeyDir,
    timeout: Duration,
) -> CoreResult<Recovered> {
    let deadline = Deadline::new(timeout);
    let mut report = RecoveryReport::default();
    let mut active = None;
    let mut sealed = Vec::with_capacity(listing.data_ids.len());

    for &id in &listing.data_ids {
        deadline.check()?;
        report.segments += 1;

        if Some(id) == resume {
            let mut records = 0;
            let resumed = ActiveSegment::resume(dir, id, |segment_id, scanned| {
                records += 1;
                keydir.put(&scanned.entry.key, keydir_entry(segment_id, scanned));
            })?;
            if let Some(segment) = resumed {
                report.from_data += 1;
                report.records += records;
                report.resumed_active = Some(id);
                active = Some(segment);
                continue;
            }
            // Sealed below; entries already indexed are re-read with the
            // same timestamps and leave the KeyDir unchanged.
        }

        let load = load_segment_with(dir, id, listing.has_hint(id), keydir, &deadline)?;
        match load.source {
            LoadSource::Hints => report.from_hints += 1,
            LoadSource::Data => report.from_data += 1,
        }
        if load.stop.is_some() {
            report.damaged += 1;
        }
        report.records += load.records;
        sealed.push(id);
    }

    if let Some(id) = resume {
        if active.is_none() && !listing.data_ids.contains(&id) {
            warn!(segment = %id, "lock file names an active segment that no longer exists");
        }
    }

    debug!(
        segments = report.segments,
        from_hints = report.from_hints,
        from_data = report.from_data,
        records = report.records,
        elapsed_ms = deadline.start.elapsed().as_millis() as u64,
        "recovery complete"
    );

    Ok(Recovered {
        active,
        sealed,
        report,
    })
}

/// Feeds one immutable segment into `keydir`.
///
/// With `prefer_hints` the hint file is tried first; a missing or
/// inconsistent hint file falls back to scanning the data file.
///
/// # Errors
///
/// Returns I/O errors; corruption is reported in [`SegmentLoad::stop`].
pub fn load_segment(
    dir: &Path,
    id: SegmentId,
    prefer_hints: bool,
    keydir: &KeyDir,
) -> CoreResult<SegmentLoad> {
    load_segment_with(dir, id, prefer_hints, keydir, &Deadline::new(Duration::ZERO))
}

fn load_segment_with(
    dir: &Path,
    id: SegmentId,
    prefer_hints: bool,
    keydir: &KeyDir,
    deadline: &Deadline,
) -> CoreResult<SegmentLoad> {
    let data = FileBackend::open_read_only(&dir::data_path(dir, id))?;

    if prefer_hints {
        if let Some(hints) = read_valid_hints(dir, id, data.size()?)? {
            let records = hints.len() as u64;
            for hint in hints {
                keydir.put(&hint.key, hint_entry(id, &hint));
            }
            debug!(segment = %id, records, "loaded segment from hint file");
            return Ok(SegmentLoad {
                source: LoadSource::Hints,
                records,
                stop: None,
            });
        }
    }

    let mut scanner = DataScanner::new(&data, id)?;
    let mut records = 0u64;
    for scanned in scanner.by_ref() {
        let scanned = scanned?;
        keydir.put(&scanned.entry.key, keydir_entry(id, &scanned));
        records += 1;
        if records % DEADLINE_CHECK_INTERVAL == 0 {
            deadline.check()?;
        }
    }

    let stop = scanner.stop().cloned();
    if let Some(stop) = &stop {
        warn!(
            segment = %id,
            offset = stop.offset,
            kind = ?stop.kind,
            size = scanner.total_size(),
            "data scan stopped early; ignoring the rest of the segment"
        );
    }
    debug!(segment = %id, records, "loaded segment from data file");

    Ok(SegmentLoad {
        source: LoadSource::Data,
        records,
        stop,
    })
}

/// Reads the hint file of `id` if it exists and is consistent with a data
/// file of `data_len` bytes.
///
/// # Errors
///
/// Returns I/O errors other than a missing hint file.
pub fn read_valid_hints(
    dir: &Path,
    id: SegmentId,
    data_len: u64,
) -> CoreResult<Option<Vec<ScannedHint>>> {
    let path = dir::hint_path(dir, id);
    if !path.exists() {
        return Ok(None);
    }
    let backend = FileBackend::open_read_only(&path)?;

    let mut scanner = HintScanner::new(&backend)?;
    let mut hints = Vec::new();
    for hint in scanner.by_ref() {
        hints.push(hint?);
    }

    let verdict = match scanner.stop() {
        Some(stop) => Err(format!("hint file unreadable at offset {}", stop.offset)),
        None => validate_hints(&hints, data_len),
    };
    match verdict {
        Ok(()) => Ok(Some(hints)),
        Err(reason) => {
            warn!(segment = %id, %reason, "hint file rejected; scanning data file");
            Ok(None)
        }
    }
}

fn validate_hints(hints: &[ScannedHint], data_len: u64) -> Result<(), String> {
    let mut expected_min = 0u64;
    for hint in hints {
        let start = u64::from(hint.header.value_position);
        let end = hint.header.entry_end();
        if start < expected_min {
            return Err(format!("hint at {} points backwards", hint.offset));
        }
        if end > data_len {
            return Err(format!(
                "hint at {} points past the data file ({end} > {data_len})",
                hint.offset
            ));
        }
        expected_min = end;
    }
    if expected_min != data_len {
        return Err(format!(
            "hints cover {expected_min} of {data_len} data bytes"
        ));
    }
    Ok(())
}

/// KeyDir entry for a scanned data record.
pub(crate) fn keydir_entry(segment_id: SegmentId, scanned: &ScannedEntry) -> KeyDirEntry {
    KeyDirEntry {
        segment_id,
        offset: scanned.offset,
        // Bounded to 31 bits by the codec.
        value_size: scanned.entry.value.len() as u32,
        timestamp: scanned.entry.timestamp,
        tombstone: scanned.entry.tombstone,
    }
}

/// KeyDir entry for a hint record.
pub(crate) fn hint_entry(segment_id: SegmentId, hint: &ScannedHint) -> KeyDirEntry {
    KeyDirEntry {
        segment_id,
        offset: u64::from(hint.header.value_position),
        value_size: hint.header.value_size,
        timestamp: hint.header.timestamp,
        tombstone: hint.header.tombstone,
    }
}
