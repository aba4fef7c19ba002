//! Engine facade.

use crate::codec::{decode_entry, encode_entry, encode_tombstone};
use crate::config::Config;
use crate::dir::{self, LockHandle, SegmentIdAllocator};
use crate::error::{CoreError, CoreResult};
use crate::keydir::{KeyDir, KeyDirEntry};
use crate::merge::{MergeResult, Merger};
use crate::recovery::{self, RecoveryReport};
use crate::segment::{ActiveSegment, HintMeta, SegmentManager};
use crate::stats::{EngineStats, StatsSnapshot};
use crate::types::{SegmentId, Timestamp};
use parking_lot::Mutex;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, info};

/// The storage engine handle.
///
/// `Engine` is the only entry point external callers need. It owns the
/// directory lock, the KeyDir and the segment set.
///
/// # Opening
///
/// ```rust,ignore
/// use caskdb_core::{Config, Engine};
/// use std::path::Path;
///
/// let engine = Engine::open_with_config(Path::new("my_store"), Config::default())?;
/// engine.put(b"user:1", b"alice")?;
/// assert_eq!(engine.get(b"user:1")?, Some(b"alice".to_vec()));
/// engine.close()?;
/// ```
///
/// # Concurrency
///
/// An engine can be shared across threads (`Arc<Engine>`). Writes are
/// serialized; reads run in parallel with writes and with a merge.
///
/// # Timestamps
///
/// `put` and `delete` stamp entries with a write clock that never repeats
/// or goes backwards: `max(now, last + 1)`, seeded from the newest entry
/// found at open. Explicit timestamps are accepted through
/// [`Engine::put_with_timestamp`] and [`Engine::delete_with_timestamp`]; a
/// write older than what the key already holds is rejected without touching
/// disk.
pub struct Engine {
    /// Store directory.
    dir: PathBuf,
    /// Configuration.
    config: Config,
    /// Index of every key.
    keydir: Arc<KeyDir>,
    /// Segment set and writer lock.
    segments: SegmentManager,
    /// Counters.
    stats: Arc<EngineStats>,
    /// Last timestamp handed out; held across each write.
    clock: Mutex<Timestamp>,
    /// Held while a merge runs.
    merge_lock: Mutex<()>,
    /// Set once by `close`; running merges abort on it.
    closed: AtomicBool,
    /// What open-time recovery did.
    recovery: RecoveryReport,
}

impl Engine {
    /// Opens a store with default configuration.
    ///
    /// # Errors
    ///
    /// See [`Engine::open_with_config`].
    pub fn open(path: &Path) -> CoreResult<Self> {
        Self::open_with_config(path, Config::default())
    }

    /// Opens a store.
    ///
    /// The method:
    /// - Creates the directory if missing (unless `create_if_missing` is false)
    /// - Acquires the writer lock, taking over a stale one
    /// - Finishes deleting the inputs of an interrupted merge and deletes
    ///   its unfinished output
    /// - Rebuilds the KeyDir from hint and data files
    /// - Reopens the crashed active segment or creates a new one
    ///
    /// # Errors
    ///
    /// - [`CoreError::InvalidConfig`] for an unusable configuration
    /// - [`CoreError::LockHeld`] if another writer is live
    /// - [`CoreError::RecoveryTimeout`] if recovery exceeds its budget
    /// - [`CoreError::NotFound`] if the directory is missing and may not be
    ///   created
    /// - I/O errors
    pub fn open_with_config(path: &Path, config: Config) -> CoreResult<Self> {
        config.validate()?;

        if !path.exists() {
            if !config.create_if_missing {
                return Err(CoreError::not_found(format!(
                    "store directory {}",
                    path.display()
                )));
            }
            fs::create_dir_all(path)?;
        }

        let lock = LockHandle::acquire(path)?;
        let retired = dir::finish_retirement(path)?;
        let discarded = dir::remove_merge_artifacts(path)?;
        let listing = dir::list_segments(path)?;
        let allocator = SegmentIdAllocator::new(listing.max_id());

        let keydir = Arc::new(KeyDir::new());
        let recovered = recovery::recover(
            path,
            &listing,
            lock.recovered_active(),
            &keydir,
            config.recovery_timeout,
        )?;

        let active = match recovered.active {
            Some(active) => active,
            None => ActiveSegment::create(path, allocator.next())?,
        };
        let active_id = active.id();

        let stats = Arc::new(EngineStats::new());
        let segments = SegmentManager::new(
            path,
            &config,
            allocator,
            Arc::clone(&stats),
            lock,
            active,
            recovered.sealed,
        )?;

        let last = keydir.max_timestamp().unwrap_or_default();
        info!(
            path = %path.display(),
            keys = keydir.live_len(),
            segments = recovered.report.segments,
            from_hints = recovered.report.from_hints,
            from_data = recovered.report.from_data,
            discarded_merge_files = discarded,
            retired_merge_inputs = retired,
            active = %active_id,
            "engine opened"
        );

        Ok(Self {
            dir: path.to_path_buf(),
            config,
            keydir,
            segments,
            stats,
            clock: Mutex::new(last),
            merge_lock: Mutex::new(()),
            closed: AtomicBool::new(false),
            recovery: recovered.report,
        })
    }

    /// Store directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.dir
    }

    /// Configuration the engine was opened with.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// What open-time recovery did.
    #[must_use]
    pub fn recovery_report(&self) -> &RecoveryReport {
        &self.recovery
    }

    /// Returns whether the engine is open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> CoreResult<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(CoreError::Closed)
        }
    }

    /// Stores `value` under `key`.
    ///
    /// # Errors
    ///
    /// - [`CoreError::InvalidArgument`] for an empty key or oversized value
    /// - [`CoreError::Closed`] after close
    /// - I/O errors
    pub fn put(&self, key: &[u8], value: &[u8]) -> CoreResult<()> {
        self.ensure_open()?;
        let mut clock = self.clock.lock();
        let timestamp = next_timestamp(*clock)?;
        *clock = timestamp;
        self.write_locked(key, Some(value), timestamp)?;
        Ok(())
    }

    /// Stores `value` under `key` with an explicit timestamp.
    ///
    /// Returns `false`, without writing, if the key already holds an entry
    /// at `timestamp` or later.
    ///
    /// # Errors
    ///
    /// Same as [`Engine::put`].
    pub fn put_with_timestamp(
        &self,
        key: &[u8],
        value: &[u8],
        timestamp: Timestamp,
    ) -> CoreResult<bool> {
        self.ensure_open()?;
        let mut clock = self.clock.lock();
        let applied = self.write_locked(key, Some(value), timestamp)?;
        *clock = (*clock).max(timestamp);
        Ok(applied)
    }

    /// Deletes `key`.
    ///
    /// Deleting an absent key is a no-op.
    ///
    /// # Errors
    ///
    /// - [`CoreError::InvalidArgument`] for an empty key
    /// - [`CoreError::Closed`] after close
    /// - I/O errors
    pub fn delete(&self, key: &[u8]) -> CoreResult<()> {
        self.ensure_open()?;
        let mut clock = self.clock.lock();
        if !self.is_live(key) {
            return validate_key(key);
        }
        let timestamp = next_timestamp(*clock)?;
        *clock = timestamp;
        self.write_locked(key, None, timestamp)?;
        Ok(())
    }

    /// Deletes `key` with an explicit timestamp.
    ///
    /// Returns `false`, without writing, if the key is absent or already
    /// holds an entry at `timestamp` or later.
    ///
    /// # Errors
    ///
    /// Same as [`Engine::delete`].
    pub fn delete_with_timestamp(&self, key: &[u8], timestamp: Timestamp) -> CoreResult<bool> {
        self.ensure_open()?;
        let mut clock = self.clock.lock();
        if !self.is_live(key) {
            validate_key(key)?;
            return Ok(false);
        }
        let applied = self.write_locked(key, None, timestamp)?;
        *clock = (*clock).max(timestamp);
        Ok(applied)
    }

    fn is_live(&self, key: &[u8]) -> bool {
        self.keydir.get(key).is_some_and(|e| !e.tombstone)
    }

    /// Appends one entry and indexes it. The clock mutex must be held.
    fn write_locked(
        &self,
        key: &[u8],
        value: Option<&[u8]>,
        timestamp: Timestamp,
    ) -> CoreResult<bool> {
        if let Some(current) = self.keydir.get(key) {
            if current.timestamp >= timestamp {
                debug!(timestamp = %timestamp, current = %current.timestamp, "rejecting stale write");
                return Ok(false);
            }
        }

        let record = match value {
            Some(value) => encode_entry(key, value, timestamp)?,
            None => encode_tombstone(key, timestamp)?,
        };
        // Bounded to 31 bits by the codec.
        let value_size = value.map_or(0, |v| v.len() as u32);
        let tombstone = value.is_none();

        let at = self.segments.append(
            &record,
            &HintMeta {
                key,
                timestamp,
                value_size,
                tombstone,
            },
        )?;

        self.keydir.put(
            key,
            KeyDirEntry {
                segment_id: at.segment_id,
                offset: at.offset,
                value_size,
                timestamp,
                tombstone,
            },
        );

        if tombstone {
            self.stats.record_delete(record.len() as u64);
        } else {
            self.stats.record_write(record.len() as u64);
        }
        Ok(true)
    }

    /// Returns the value stored under `key`.
    ///
    /// A key that was never written, or was deleted, yields `Ok(None)`.
    ///
    /// # Errors
    ///
    /// - [`CoreError::CorruptRecord`] if the entry fails verification
    /// - [`CoreError::NotFound`] if the index points at a missing segment
    /// - [`CoreError::Closed`] after close
    pub fn get(&self, key: &[u8]) -> CoreResult<Option<Vec<u8>>> {
        self.ensure_open()?;
        let mut retried = false;

        loop {
            let Some(entry) = self.keydir.get(key) else {
                return Ok(None);
            };
            if entry.tombstone {
                return Ok(None);
            }

            let len = usize::try_from(entry.record_len(key.len()))
                .map_err(|_| CoreError::invalid_argument("entry too large for this platform"))?;

            let raw = match self.segments.read_at(entry.segment_id, entry.offset, len) {
                Ok(raw) => raw,
                // A merge may have retired the segment after the lookup.
                Err(CoreError::NotFound { .. }) if !retried => {
                    retried = true;
                    self.stats.record_read_retry();
                    continue;
                }
                Err(e) => return Err(e),
            };

            let decoded = decode_entry(&raw).map_err(|e| {
                self.stats.record_corrupt_read();
                e.at(entry.segment_id, entry.offset)
            })?;
            if decoded.key != key {
                self.stats.record_corrupt_read();
                return Err(CoreError::corrupt_record(
                    entry.segment_id,
                    entry.offset,
                    "entry holds a different key than the index expects",
                ));
            }

            self.stats.record_read(decoded.value.len() as u64);
            return Ok(Some(decoded.value));
        }
    }

    /// Returns whether `key` holds a value.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Closed`] after close.
    pub fn contains_key(&self, key: &[u8]) -> CoreResult<bool> {
        self.ensure_open()?;
        Ok(self.is_live(key))
    }

    /// Every key holding a value, sorted.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Closed`] after close.
    pub fn keys(&self) -> CoreResult<Vec<Vec<u8>>> {
        self.ensure_open()?;
        Ok(self.keydir.keys())
    }

    /// Number of keys holding a value.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Closed`] after close.
    pub fn len(&self) -> CoreResult<usize> {
        self.ensure_open()?;
        Ok(self.keydir.live_len())
    }

    /// Returns whether no key holds a value.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Closed`] after close.
    pub fn is_empty(&self) -> CoreResult<bool> {
        Ok(self.len()? == 0)
    }

    /// Ids of every segment, active included, ascending.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Closed`] after close.
    pub fn segment_ids(&self) -> CoreResult<Vec<SegmentId>> {
        self.ensure_open()?;
        Ok(self.segments.segment_ids())
    }

    /// Total bytes of every data and hint file.
    ///
    /// # Errors
    ///
    /// - [`CoreError::Closed`] after close
    /// - I/O errors
    pub fn disk_size(&self) -> CoreResult<u64> {
        self.ensure_open()?;
        self.segments.disk_size()
    }

    /// Fsyncs the active data and hint files.
    ///
    /// # Errors
    ///
    /// - [`CoreError::Closed`] after close
    /// - I/O errors
    pub fn sync(&self) -> CoreResult<()> {
        self.ensure_open()?;
        self.segments.sync()
    }

    /// Returns a snapshot of the engine counters.
    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Merges every immutable segment.
    ///
    /// # Errors
    ///
    /// - [`CoreError::MergeFailed`] if another merge is running or this one
    ///   could not complete
    /// - [`CoreError::Closed`] after close
    pub fn merge(&self) -> CoreResult<MergeResult> {
        self.merge_with_cancel(&AtomicBool::new(false))
    }

    /// Merges every immutable segment, aborting when `cancel` is set.
    ///
    /// # Errors
    ///
    /// Same as [`Engine::merge`]; cancellation yields
    /// [`CoreError::MergeFailed`].
    pub fn merge_with_cancel(&self, cancel: &AtomicBool) -> CoreResult<MergeResult> {
        self.ensure_open()?;
        let Some(_guard) = self.merge_lock.try_lock() else {
            return Err(CoreError::merge_failed("another merge is already running"));
        };
        self.ensure_open()?;

        let result = Merger::new(&self.segments, &self.keydir)
            .abort_on(&self.closed)
            .run(cancel)?;
        self.stats.record_merge();
        Ok(result)
    }

    /// Runs a merge on a background thread.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the thread cannot be spawned.
    pub fn spawn_merge(self: &Arc<Self>) -> CoreResult<MergeTask> {
        let engine = Arc::clone(self);
        let cancel = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&cancel);

        let handle = thread::Builder::new()
            .name("caskdb-merge".to_string())
            .spawn(move || engine.merge_with_cancel(&flag))?;

        Ok(MergeTask { cancel, handle })
    }

    /// Closes the engine.
    ///
    /// Waits for a running merge to abort, syncs the active segment,
    /// deletes it if it never received a write, and releases the lock.
    /// Closing twice is a no-op.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if syncing or cleanup fails.
    pub fn close(&self) -> CoreResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let _merge = self.merge_lock.lock();
        let _clock = self.clock.lock();

        self.segments.close()?;
        info!(path = %self.dir.display(), keys = self.keydir.live_len(), "engine closed");
        Ok(())
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

/// A merge running on a background thread.
#[derive(Debug)]
pub struct MergeTask {
    cancel: Arc<AtomicBool>,
    handle: JoinHandle<CoreResult<MergeResult>>,
}

impl MergeTask {
    /// Asks the merge to stop at the next record.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Release);
    }

    /// Returns whether the merge thread has finished.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Waits for the merge and returns its outcome.
    ///
    /// # Errors
    ///
    /// Returns the merge error, or [`CoreError::MergeFailed`] if the merge
    /// thread panicked.
    pub fn join(self) -> CoreResult<MergeResult> {
        self.handle
            .join()
            .map_err(|_| CoreError::merge_failed("merge thread panicked"))?
    }
}

fn next_timestamp(last: Timestamp) -> CoreResult<Timestamp> {
    last.checked_next()
        .map(|next| next.max(Timestamp::now()))
        .ok_or_else(|| CoreError::invalid_argument("write clock exhausted the 32-bit timestamp range"))
}

fn validate_key(key: &[u8]) -> CoreResult<()> {
    if key.is_empty() {
        return Err(CoreError::invalid_argument("key must not be empty"));
    }
    Ok(())
}
