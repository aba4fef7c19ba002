//! Merge (compaction) of immutable segments.
//!
//! A merge rewrites every immutable segment into fresh, compacted segments
//! holding only the entries the KeyDir still points at, then swaps them in.
//!
//! ## Invariants
//!
//! - A merge **MUST NOT** change what any `get` returns
//! - The active segment is never an input
//! - Originals are untouched until every output is durable and renamed
//! - A write that lands while the merge runs always wins over the copy
//!
//! ## Protocol
//!
//! 1. Snapshot the immutable segment ids
//! 2. For each input, walk its hint file (or its data file if the hint file
//!    is missing or inconsistent); keep a record iff the KeyDir points at
//!    exactly that segment, offset and timestamp, and it is not a tombstone
//! 3. Re-verify each kept record and append it to `<id>merge.data`, with
//!    its hint in `<id>merge.hint`; outputs rotate at `max_file_size`
//! 4. Fsync outputs, rename data then hint to their final names, fsync the
//!    directory
//! 5. Relocate each moved key with a compare-and-swap, sync the active
//!    segment, then retire inputs behind a retire marker
//! 6. Forget tombstones whose segment was retired
//!
//! A crash before step 4 leaves only `*merge.*` files, which the next open
//! deletes. Cancellation or any failure discards the outputs the same way.
//! A crash during step 5 leaves the retire marker, and the next open
//! finishes deleting every input it lists.

use crate::codec::{decode_entry, Entry};
use crate::dir::{self, sync_directory};
use crate::error::{CoreError, CoreResult};
use crate::keydir::{KeyDir, KeyDirEntry};
use crate::recovery::read_valid_hints;
use crate::segment::{hint_for, DataScanner, SegmentManager};
use crate::types::{SegmentId, Timestamp};
use caskdb_storage::{FileBackend, StorageBackend};
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

/// Statistics of a completed merge.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeResult {
    /// Immutable segments consumed.
    pub segments_merged: usize,
    /// Segments produced.
    pub output_segments: Vec<SegmentId>,
    /// Records examined.
    pub records_scanned: u64,
    /// Live records copied.
    pub records_kept: u64,
    /// Superseded records and tombstones dropped.
    pub records_dropped: u64,
    /// Data and hint bytes of the inputs.
    pub bytes_before: u64,
    /// Data and hint bytes of the outputs.
    pub bytes_after: u64,
}

impl MergeResult {
    /// Bytes freed on disk.
    #[must_use]
    pub fn bytes_reclaimed(&self) -> u64 {
        self.bytes_before.saturating_sub(self.bytes_after)
    }
}

/// A pending KeyDir update for a copied record.
struct Move {
    key: Vec<u8>,
    expected: KeyDirEntry,
    new: KeyDirEntry,
}

/// KeyDir changes applied once the outputs are committed.
#[derive(Default)]
struct Pending {
    moves: Vec<Move>,
    /// Current tombstones that live only in the inputs.
    tombstones: Vec<(Vec<u8>, KeyDirEntry)>,
}

/// What to do with one input record.
#[derive(Debug, PartialEq, Eq)]
enum Verdict {
    /// Current value: copy it.
    Keep(KeyDirEntry),
    /// Current tombstone: drop it and forget the key after retirement.
    Forget(KeyDirEntry),
    /// Superseded.
    Drop,
}

/// Relocates every moved key whose entry is unchanged; returns how many
/// moved.
fn apply_moves(keydir: &KeyDir, moves: &[Move]) -> u64 {
    moves
        .iter()
        .filter(|m| keydir.relocate(&m.key, &m.expected, m.new))
        .count() as u64
}

/// Removes tombstones that still sit where the merge found them; returns
/// how many were removed.
fn forget_tombstones(keydir: &KeyDir, tombstones: &[(Vec<u8>, KeyDirEntry)]) -> u64 {
    tombstones
        .iter()
        .filter(|(key, expected)| keydir.remove_if(key, expected))
        .count() as u64
}

struct OutputSegment {
    id: SegmentId,
    data: FileBackend,
    hint: FileBackend,
}

impl OutputSegment {
    fn create(dir: &Path, id: SegmentId) -> CoreResult<Self> {
        Ok(Self {
            id,
            data: FileBackend::create_new(&dir::merge_data_path(dir, id))?,
            hint: FileBackend::create_new(&dir::merge_hint_path(dir, id))?,
        })
    }
}

/// Output files of a merge in progress.
struct MergeOutput<'a> {
    segments: &'a SegmentManager,
    current: Option<OutputSegment>,
    done: Vec<OutputSegment>,
}

impl<'a> MergeOutput<'a> {
    fn new(segments: &'a SegmentManager) -> Self {
        Self {
            segments,
            current: None,
            done: Vec::new(),
        }
    }

    /// Appends a verified record; returns where it landed.
    fn append(&mut self, raw: &[u8], entry: &Entry) -> CoreResult<(SegmentId, u64)> {
        let full = match &self.current {
            Some(seg) => seg.data.size()? > self.segments.max_file_size(),
            None => true,
        };
        if full {
            let next = OutputSegment::create(self.segments.dir(), self.segments.allocate_id())?;
            if let Some(previous) = self.current.replace(next) {
                self.done.push(previous);
            }
        }
        let Some(seg) = self.current.as_mut() else {
            return Err(CoreError::merge_failed("no open output segment"));
        };

        let offset = seg.data.append(raw)?;
        seg.hint.append(&hint_for(entry, offset)?)?;
        Ok((seg.id, offset))
    }

    /// Makes every output durable under its final name.
    fn commit(self) -> CoreResult<(Vec<SegmentId>, u64)> {
        let dir = self.segments.dir();
        let mut ids = Vec::new();
        let mut bytes = 0;

        for mut seg in self.done.into_iter().chain(self.current) {
            seg.data.sync()?;
            seg.hint.sync()?;
            bytes += seg.data.size()? + seg.hint.size()?;
            drop(seg.data);
            drop(seg.hint);

            fs::rename(dir::merge_data_path(dir, seg.id), dir::data_path(dir, seg.id))?;
            fs::rename(dir::merge_hint_path(dir, seg.id), dir::hint_path(dir, seg.id))?;
            ids.push(seg.id);
        }
        sync_directory(dir)?;
        Ok((ids, bytes))
    }

    fn discard(self) {
        let dir = self.segments.dir().to_path_buf();
        drop(self);
        if let Err(e) = dir::remove_merge_artifacts(&dir) {
            warn!(error = %e, "failed to remove merge output; it will be removed on next open");
        }
    }
}

/// Runs merges over a segment set and its KeyDir.
///
/// Callers serialize merges; the engine holds a merge mutex around
/// [`Merger::run`].
pub struct Merger<'a> {
    segments: &'a SegmentManager,
    keydir: &'a KeyDir,
    shutdown: Option<&'a AtomicBool>,
}

impl<'a> Merger<'a> {
    /// Creates a merger.
    #[must_use]
    pub fn new(segments: &'a SegmentManager, keydir: &'a KeyDir) -> Self {
        Self {
            segments,
            keydir,
            shutdown: None,
        }
    }

    /// Also aborts when `shutdown` is set.
    #[must_use]
    pub fn abort_on(mut self, shutdown: &'a AtomicBool) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    fn check_cancel(&self, cancel: &AtomicBool) -> CoreResult<()> {
        if cancel.load(Ordering::Acquire) {
            return Err(CoreError::merge_failed("merge cancelled"));
        }
        if self.shutdown.is_some_and(|flag| flag.load(Ordering::Acquire)) {
            return Err(CoreError::merge_failed("engine is closing"));
        }
        Ok(())
    }

    /// Merges every immutable segment.
    ///
    /// `cancel` is polled between records; setting it aborts the merge.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::MergeFailed`] if the merge was cancelled, a live
    /// record failed verification, or an I/O error occurred. The outputs
    /// are discarded and the store is left as it was.
    pub fn run(&self, cancel: &AtomicBool) -> CoreResult<MergeResult> {
        let inputs = self.segments.sealed_ids();
        if inputs.is_empty() {
            debug!("no immutable segments to merge");
            return Ok(MergeResult::default());
        }

        let mut result = MergeResult {
            segments_merged: inputs.len(),
            ..MergeResult::default()
        };
        let mut output = MergeOutput::new(self.segments);
        let mut pending = Pending::default();

        for &id in &inputs {
            let copied = self
                .measure(id)
                .and_then(|bytes| {
                    result.bytes_before += bytes;
                    self.copy_segment(id, &mut output, &mut pending, &mut result, cancel)
                });
            if let Err(e) = copied {
                output.discard();
                return Err(match e {
                    e @ CoreError::MergeFailed { .. } => e,
                    other => CoreError::merge_failed(other.to_string()),
                });
            }
        }

        let (output_ids, bytes_after) = match output.commit() {
            Ok(committed) => committed,
            Err(e) => {
                // Renamed outputs duplicate live originals and are harmless;
                // the rest are discarded on next open.
                let _ = dir::remove_merge_artifacts(self.segments.dir());
                return Err(CoreError::merge_failed(e.to_string()));
            }
        };

        self.segments.install(&output_ids);
        let relocated = apply_moves(self.keydir, &pending.moves);

        // Records that superseded dropped ones may still be unsynced.
        self.segments
            .sync()
            .map_err(|e| CoreError::merge_failed(format!("syncing active segment: {e}")))?;
        self.segments
            .retire(&inputs)
            .map_err(|e| CoreError::merge_failed(format!("retiring inputs: {e}")))?;
        let forgotten = forget_tombstones(self.keydir, &pending.tombstones);

        result.output_segments = output_ids;
        result.bytes_after = bytes_after;

        info!(
            inputs = result.segments_merged,
            outputs = result.output_segments.len(),
            scanned = result.records_scanned,
            kept = result.records_kept,
            dropped = result.records_dropped,
            superseded_during_merge = result.records_kept - relocated,
            tombstones_forgotten = forgotten,
            bytes_before = result.bytes_before,
            bytes_after = result.bytes_after,
            "merge complete"
        );
        Ok(result)
    }

    fn measure(&self, id: SegmentId) -> CoreResult<u64> {
        let dir = self.segments.dir();
        let mut total = fs::metadata(dir::data_path(dir, id))?.len();
        if let Ok(meta) = fs::metadata(dir::hint_path(dir, id)) {
            total += meta.len();
        }
        Ok(total)
    }

    fn copy_segment(
        &self,
        id: SegmentId,
        output: &mut MergeOutput<'_>,
        pending: &mut Pending,
        result: &mut MergeResult,
        cancel: &AtomicBool,
    ) -> CoreResult<()> {
        let dir = self.segments.dir();
        let data = FileBackend::open_read_only(&dir::data_path(dir, id))?;

        if let Some(hints) = read_valid_hints(dir, id, data.size()?)? {
            for hint in hints {
                self.check_cancel(cancel)?;
                result.records_scanned += 1;
                let offset = u64::from(hint.header.value_position);
                let verdict =
                    self.judge(&hint.key, id, offset, hint.header.timestamp, hint.header.tombstone);
                let Some(expected) = Self::settle(verdict, &hint.key, pending, result) else {
                    continue;
                };

                let len = usize::try_from(hint.header.entry_len())
                    .map_err(|_| CoreError::merge_failed("record length overflows"))?;
                let raw = data.read_at(offset, len)?;
                let entry = decode_entry(&raw).map_err(|e| {
                    CoreError::merge_failed(e.at(id, offset).to_string())
                })?;
                if entry.key != hint.key {
                    return Err(CoreError::merge_failed(format!(
                        "hint for segment {id} offset {offset} names a different key"
                    )));
                }
                self.keep(&raw, entry, expected, output, pending)?;
                result.records_kept += 1;
            }
        } else {
            let mut scanner = DataScanner::new(&data, id)?;
            for scanned in scanner.by_ref() {
                self.check_cancel(cancel)?;
                let scanned = scanned?;
                result.records_scanned += 1;
                let entry = scanned.entry;
                let verdict =
                    self.judge(&entry.key, id, scanned.offset, entry.timestamp, entry.tombstone);
                let Some(expected) = Self::settle(verdict, &entry.key, pending, result) else {
                    continue;
                };
                // Scanned records are already verified; re-encoding
                // reproduces the original bytes.
                let raw = crate::codec::encode_entry(&entry.key, &entry.value, entry.timestamp)?;
                self.keep(&raw, entry, expected, output, pending)?;
                result.records_kept += 1;
            }
            if let Some(stop) = scanner.stop() {
                warn!(
                    segment = %id,
                    offset = stop.offset,
                    kind = ?stop.kind,
                    "merge input ends in an unreadable record; nothing after it is live"
                );
            }
        }

        debug!(segment = %id, "merged segment");
        Ok(())
    }

    /// Decides the fate of the record of `key` at this location.
    fn judge(
        &self,
        key: &[u8],
        segment_id: SegmentId,
        offset: u64,
        timestamp: Timestamp,
        tombstone: bool,
    ) -> Verdict {
        match self.keydir.get(key) {
            Some(current)
                if current.segment_id == segment_id
                    && current.offset == offset
                    && current.timestamp == timestamp
                    && current.tombstone == tombstone =>
            {
                if tombstone {
                    Verdict::Forget(current)
                } else {
                    Verdict::Keep(current)
                }
            }
            _ => Verdict::Drop,
        }
    }

    /// Records a dropped verdict; returns the entry to copy for a kept one.
    fn settle(
        verdict: Verdict,
        key: &[u8],
        pending: &mut Pending,
        result: &mut MergeResult,
    ) -> Option<KeyDirEntry> {
        match verdict {
            Verdict::Keep(expected) => Some(expected),
            Verdict::Forget(expected) => {
                pending.tombstones.push((key.to_vec(), expected));
                result.records_dropped += 1;
                None
            }
            Verdict::Drop => {
                result.records_dropped += 1;
                None
            }
        }
    }

    fn keep(
        &self,
        raw: &[u8],
        entry: Entry,
        expected: KeyDirEntry,
        output: &mut MergeOutput<'_>,
        pending: &mut Pending,
    ) -> CoreResult<()> {
        let (segment_id, offset) = output.append(raw, &entry)?;
        pending.moves.push(Move {
            new: KeyDirEntry {
                segment_id,
                offset,
                ..expected
            },
            expected,
            key: entry.key,
        });
        Ok(())
    }
}
