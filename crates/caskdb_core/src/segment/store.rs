//! Active segment and read handles.

use super::{hint_for, hint_position, DataScanner, ScanStop, ScannedEntry, StopKind};
use crate::codec::encode_hint;
use crate::config::Config;
use crate::dir::{self, remove_if_exists, LockHandle, SegmentIdAllocator, SegmentListing};
use crate::error::{CoreError, CoreResult};
use crate::stats::EngineStats;
use crate::types::{SegmentId, Timestamp};
use caskdb_storage::{FileBackend, StorageBackend, StorageError};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// The writable segment: data and hint files opened for append.
#[derive(Debug)]
pub struct ActiveSegment {
    id: SegmentId,
    data: FileBackend,
    hint: FileBackend,
}

impl ActiveSegment {
    /// Creates a brand-new empty segment.
    ///
    /// # Errors
    ///
    /// Fails if either file already exists or cannot be created.
    pub fn create(dir: &Path, id: SegmentId) -> CoreResult<Self> {
        let data = FileBackend::create_new(&dir::data_path(dir, id))?;
        let hint = FileBackend::create_new(&dir::hint_path(dir, id))?;
        dir::sync_directory(dir)?;
        Ok(Self { id, data, hint })
    }

    /// Reopens the active segment of a writer that crashed.
    ///
    /// A torn record at the end of the data file is cut off and the hint
    /// file is regenerated from the surviving entries. `on_entry` sees
    /// every entry before the first unreadable record, in file order.
    ///
    /// Returns `None`, leaving both files untouched, if the scan stops at a
    /// record that is complete but fails verification: entries past it may
    /// still be intact, so the segment must be sealed rather than appended
    /// to.
    ///
    /// # Errors
    ///
    /// Returns I/O errors from scanning, truncating or rewriting.
    pub fn resume<F>(dir: &Path, id: SegmentId, mut on_entry: F) -> CoreResult<Option<Self>>
    where
        F: FnMut(SegmentId, &ScannedEntry),
    {
        let mut data = FileBackend::open(&dir::data_path(dir, id))?;
        let mut hints = Vec::new();

        let (valid_len, stop) = {
            let mut scanner = DataScanner::new(&data, id)?;
            for scanned in scanner.by_ref() {
                let scanned = scanned?;
                hints.extend_from_slice(&hint_for(&scanned.entry, scanned.offset)?);
                on_entry(id, &scanned);
            }
            (scanner.valid_len(), scanner.stop().cloned())
        };

        match stop {
            None => {}
            Some(ScanStop {
                offset,
                kind: StopKind::Torn,
            }) => {
                warn!(
                    segment = %id,
                    offset,
                    size = data.size()?,
                    "truncating torn tail of crashed active segment"
                );
                data.truncate(valid_len)?;
            }
            Some(ScanStop {
                offset,
                kind: StopKind::Corrupt(reason),
            }) => {
                warn!(
                    segment = %id,
                    offset,
                    %reason,
                    "crashed active segment holds a corrupt record; sealing it"
                );
                return Ok(None);
            }
        }

        let mut hint = FileBackend::open(&dir::hint_path(dir, id))?;
        hint.truncate(0)?;
        hint.append(&hints)?;
        hint.sync()?;

        debug!(segment = %id, size = valid_len, "resumed active segment");
        Ok(Some(Self { id, data, hint }))
    }

    /// Segment id.
    #[must_use]
    pub fn id(&self) -> SegmentId {
        self.id
    }

    /// Current data file size.
    ///
    /// # Errors
    ///
    /// Returns an error if the file metadata cannot be read.
    pub fn size(&self) -> CoreResult<u64> {
        Ok(self.data.size()?)
    }

    fn sync(&mut self) -> CoreResult<()> {
        self.data.sync()?;
        self.hint.sync()?;
        Ok(())
    }
}

/// Fields of the hint record written beside an entry.
#[derive(Debug, Clone, Copy)]
pub struct HintMeta<'a> {
    /// Entry key.
    pub key: &'a [u8],
    /// Entry timestamp.
    pub timestamp: Timestamp,
    /// Value length.
    pub value_size: u32,
    /// Whether the entry is a tombstone.
    pub tombstone: bool,
}

/// Where an append landed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Appended {
    /// Segment that received the entry.
    pub segment_id: SegmentId,
    /// Offset of the entry header.
    pub offset: u64,
}

#[derive(Debug)]
struct ActiveState {
    segment: ActiveSegment,
    lock: LockHandle,
}

/// Owns the segment set of an open store.
///
/// # Thread Safety
///
/// Appends serialize on the active-segment mutex. Reads never touch it:
/// they go through shared read-only handles, one per segment, opened on
/// first use and cached until the segment is retired by a merge.
#[derive(Debug)]
pub struct SegmentManager {
    dir: PathBuf,
    max_file_size: u64,
    sync_on_write: bool,
    allocator: SegmentIdAllocator,
    stats: Arc<EngineStats>,
    active: Mutex<Option<ActiveState>>,
    active_id: AtomicU64,
    sealed: RwLock<BTreeSet<SegmentId>>,
    readers: RwLock<HashMap<SegmentId, Arc<FileBackend>>>,
}

impl SegmentManager {
    /// Takes ownership of the writer lock and the active segment.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock file cannot be updated.
    pub fn new(
        dir: &Path,
        config: &Config,
        allocator: SegmentIdAllocator,
        stats: Arc<EngineStats>,
        mut lock: LockHandle,
        active: ActiveSegment,
        sealed: impl IntoIterator<Item = SegmentId>,
    ) -> CoreResult<Self> {
        lock.record_active(active.id)?;
        allocator.observe(active.id);
        let active_id = AtomicU64::new(active.id.as_u64());

        Ok(Self {
            dir: dir.to_path_buf(),
            max_file_size: config.max_file_size,
            sync_on_write: config.sync_on_write,
            allocator,
            stats,
            active: Mutex::new(Some(ActiveState {
                segment: active,
                lock,
            })),
            active_id,
            sealed: RwLock::new(sealed.into_iter().collect()),
            readers: RwLock::new(HashMap::new()),
        })
    }

    /// Store directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Rotation threshold.
    #[must_use]
    pub fn max_file_size(&self) -> u64 {
        self.max_file_size
    }

    /// Id of the active segment.
    #[must_use]
    pub fn active_id(&self) -> SegmentId {
        SegmentId::new(self.active_id.load(Ordering::Acquire))
    }

    /// Immutable segment ids, ascending.
    #[must_use]
    pub fn sealed_ids(&self) -> Vec<SegmentId> {
        self.sealed.read().iter().copied().collect()
    }

    /// Every segment id, active included, ascending.
    #[must_use]
    pub fn segment_ids(&self) -> Vec<SegmentId> {
        let mut ids = self.sealed_ids();
        ids.push(self.active_id());
        ids.sort_unstable();
        ids
    }

    /// Returns a fresh segment id.
    pub fn allocate_id(&self) -> SegmentId {
        self.allocator.next()
    }

    /// Lists segment files on disk.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the directory cannot be read.
    pub fn list_segments(&self) -> CoreResult<SegmentListing> {
        dir::list_segments(&self.dir)
    }

    /// Returns whether the manager still accepts writes.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.active.lock().is_some()
    }

    /// Appends an encoded entry and its hint to the active segment.
    ///
    /// Rotates first if the active data file has grown past the threshold;
    /// an entry is never split across segments.
    ///
    /// # Errors
    ///
    /// - [`CoreError::Closed`] after [`SegmentManager::close`]
    /// - I/O errors from the append
    pub fn append(&self, record: &[u8], meta: &HintMeta<'_>) -> CoreResult<Appended> {
        let mut guard = self.active.lock();
        let state = guard.as_mut().ok_or(CoreError::Closed)?;

        if state.segment.size()? > self.max_file_size {
            self.rotate(state)?;
        }

        let segment = &mut state.segment;
        let offset = segment.data.append(record)?;
        let hint = encode_hint(
            meta.timestamp,
            meta.key,
            meta.value_size,
            meta.tombstone,
            hint_position(offset)?,
        )?;
        segment.hint.append(&hint)?;

        if self.sync_on_write {
            segment.sync()?;
        }

        Ok(Appended {
            segment_id: segment.id,
            offset,
        })
    }

    fn rotate(&self, state: &mut ActiveState) -> CoreResult<()> {
        let next = ActiveSegment::create(&self.dir, self.allocator.next())?;
        state.segment.sync()?;
        state.lock.record_active(next.id)?;

        let next_id = next.id;
        let sealed = std::mem::replace(&mut state.segment, next);
        self.sealed.write().insert(sealed.id);
        self.active_id.store(next_id.as_u64(), Ordering::Release);
        self.stats.record_rotation();

        debug!(sealed = %sealed.id, active = %next_id, "rotated active segment");
        Ok(())
    }

    /// Reads `len` bytes at `offset` of segment `segment_id`'s data file.
    ///
    /// # Errors
    ///
    /// - [`CoreError::NotFound`] if the segment is unknown or gone, or the
    ///   range runs past the end of the file
    /// - I/O errors
    pub fn read_at(&self, segment_id: SegmentId, offset: u64, len: usize) -> CoreResult<Vec<u8>> {
        let reader = self.reader(segment_id)?;
        reader.read_at(offset, len).map_err(|e| match e {
            StorageError::ReadPastEnd { offset, len, size } => CoreError::not_found(format!(
                "range {offset}+{len} past end of segment {segment_id} ({size} bytes)"
            )),
            other => other.into(),
        })
    }

    fn is_known(&self, segment_id: SegmentId) -> bool {
        segment_id == self.active_id() || self.sealed.read().contains(&segment_id)
    }

    fn reader(&self, segment_id: SegmentId) -> CoreResult<Arc<FileBackend>> {
        if let Some(reader) = self.readers.read().get(&segment_id) {
            return Ok(Arc::clone(reader));
        }

        let mut readers = self.readers.write();
        if let Some(reader) = readers.get(&segment_id) {
            return Ok(Arc::clone(reader));
        }
        if !self.is_known(segment_id) {
            return Err(CoreError::not_found(format!("segment {segment_id}")));
        }

        let path = dir::data_path(&self.dir, segment_id);
        let backend = match FileBackend::open_read_only(&path) {
            Ok(backend) => Arc::new(backend),
            Err(StorageError::Io(e)) if e.kind() == io::ErrorKind::NotFound => {
                return Err(CoreError::not_found(format!("segment {segment_id}")));
            }
            Err(e) => return Err(e.into()),
        };
        readers.insert(segment_id, Arc::clone(&backend));
        Ok(backend)
    }

    /// Adds freshly merged segments to the immutable set.
    pub fn install(&self, ids: &[SegmentId]) {
        let mut sealed = self.sealed.write();
        for &id in ids {
            self.allocator.observe(id);
            sealed.insert(id);
        }
    }

    /// Forgets `ids`, drops their cached handles and deletes their files.
    ///
    /// The ids are first written to a retire marker, so a crash part-way
    /// through is completed by the next open and never leaves a subset of
    /// the segments behind.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the marker cannot be written or a file
    /// cannot be removed. If the marker write fails nothing is changed.
    pub fn retire(&self, ids: &[SegmentId]) -> CoreResult<()> {
        if ids.is_empty() {
            return Ok(());
        }
        dir::write_retire_marker(&self.dir, ids)?;

        {
            let mut sealed = self.sealed.write();
            for id in ids {
                sealed.remove(id);
            }
        }
        {
            let mut readers = self.readers.write();
            for id in ids {
                readers.remove(id);
            }
        }

        for &id in ids {
            remove_if_exists(&dir::data_path(&self.dir, id))?;
            remove_if_exists(&dir::hint_path(&self.dir, id))?;
        }
        dir::sync_directory(&self.dir)?;
        dir::remove_retire_marker(&self.dir)
    }

    /// Fsyncs the active data and hint files.
    ///
    /// # Errors
    ///
    /// - [`CoreError::Closed`] after close
    /// - I/O errors
    pub fn sync(&self) -> CoreResult<()> {
        let mut guard = self.active.lock();
        let state = guard.as_mut().ok_or(CoreError::Closed)?;
        state.segment.sync()
    }

    /// Total bytes of every data and hint file.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if file metadata cannot be read.
    pub fn disk_size(&self) -> CoreResult<u64> {
        let mut total = 0;
        for id in self.segment_ids() {
            for path in [dir::data_path(&self.dir, id), dir::hint_path(&self.dir, id)] {
                match fs::metadata(&path) {
                    Ok(meta) => total += meta.len(),
                    // Retired by a concurrent merge.
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }
        Ok(total)
    }

    /// Syncs and releases the active segment and the writer lock.
    ///
    /// An active segment that never received a write is deleted. Calling
    /// `close` twice is a no-op.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if syncing or cleanup fails; the lock file is
    /// then left behind and the next open treats it as a crash.
    pub fn close(&self) -> CoreResult<()> {
        let Some(state) = self.active.lock().take() else {
            return Ok(());
        };
        let ActiveState { mut segment, lock } = state;

        segment.sync()?;
        let id = segment.id;
        let empty = segment.size()? == 0;
        drop(segment);
        self.readers.write().clear();

        if empty {
            remove_if_exists(&dir::data_path(&self.dir, id))?;
            remove_if_exists(&dir::hint_path(&self.dir, id))?;
            dir::sync_directory(&self.dir)?;
            debug!(segment = %id, "removed empty active segment");
        }

        lock.release()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{decode_entry, encode_entry, HEADER_SIZE};
    use crate::dir::LOCK_FILE;
    use crate::segment::HintScanner;
    use tempfile::tempdir;

    fn manager(dir: &Path, max_file_size: u64) -> SegmentManager {
        let lock = LockHandle::acquire(dir).unwrap();
        let allocator = SegmentIdAllocator::new(None);
        let active = ActiveSegment::create(dir, allocator.next()).unwrap();
        SegmentManager::new(
            dir,
            &Config::default().max_file_size(max_file_size),
            allocator,
            Arc::new(EngineStats::new()),
            lock,
            active,
            Vec::new(),
        )
        .unwrap()
    }

    fn put(mgr: &SegmentManager, key: &[u8], value: &[u8], ts: u32) -> Appended {
        let record = encode_entry(key, value, Timestamp::new(ts)).unwrap();
        let meta = HintMeta {
            key,
            timestamp: Timestamp::new(ts),
            value_size: value.len() as u32,
            tombstone: false,
        };
        mgr.append(&record, &meta).unwrap()
    }

    #[test]
    fn append_and_read_back() {
        let temp = tempdir().unwrap();
        let mgr = manager(temp.path(), 1 << 20);

        let first = put(&mgr, b"a", b"1", 100);
        let second = put(&mgr, b"b", b"22", 101);
        assert_eq!(first.offset, 0);
        assert_eq!(second.offset, (HEADER_SIZE + 2) as u64);
        assert_eq!(first.segment_id, mgr.active_id());

        let bytes = mgr.read_at(second.segment_id, second.offset, HEADER_SIZE + 3).unwrap();
        assert_eq!(decode_entry(&bytes).unwrap().value, b"22");
    }

    #[test]
    fn read_past_end_is_not_found() {
        let temp = tempdir().unwrap();
        let mgr = manager(temp.path(), 1 << 20);
        let at = put(&mgr, b"a", b"1", 100);

        assert!(matches!(
            mgr.read_at(at.segment_id, 0, 4096),
            Err(CoreError::NotFound { .. })
        ));
        assert!(matches!(
            mgr.read_at(SegmentId::new(1), 0, 1),
            Err(CoreError::NotFound { .. })
        ));
    }

    #[test]
    fn rotation_seals_segment() {
        let temp = tempdir().unwrap();
        let mgr = manager(temp.path(), 64);

        let mut locations = Vec::new();
        for i in 0..10u32 {
            locations.push(put(&mgr, format!("key{i}").as_bytes(), &[7u8; 20], 100 + i));
        }

        let ids = mgr.segment_ids();
        assert!(ids.len() >= 2);
        assert_eq!(*ids.last().unwrap(), mgr.active_id());
        assert_eq!(mgr.sealed_ids().len(), ids.len() - 1);

        // Every entry starts within the threshold of its segment.
        for at in &locations {
            assert!(at.offset <= 64);
            let bytes = mgr.read_at(at.segment_id, at.offset, HEADER_SIZE + 4 + 20).unwrap();
            assert!(decode_entry(&bytes).is_ok());
        }

        let lock = fs::read_to_string(temp.path().join(LOCK_FILE)).unwrap();
        assert!(lock.ends_with(&format!("\t{}.data", mgr.active_id())));
    }

    #[test]
    fn hint_file_mirrors_data_file() {
        let temp = tempdir().unwrap();
        let mgr = manager(temp.path(), 1 << 20);
        put(&mgr, b"a", b"1", 100);
        put(&mgr, b"bb", b"", 101);
        mgr.sync().unwrap();

        let hint = FileBackend::open_read_only(&dir::hint_path(temp.path(), mgr.active_id())).unwrap();
        let hints: Vec<_> = HintScanner::new(&hint)
            .unwrap()
            .map(Result::unwrap)
            .collect();
        assert_eq!(hints.len(), 2);
        assert_eq!(hints[1].key, b"bb");
        assert_eq!(u64::from(hints[1].header.value_position), (HEADER_SIZE + 2) as u64);
    }

    #[test]
    fn close_removes_empty_active_and_lock() {
        let temp = tempdir().unwrap();
        let mgr = manager(temp.path(), 1 << 20);
        let id = mgr.active_id();

        mgr.close().unwrap();
        assert!(!dir::data_path(temp.path(), id).exists());
        assert!(!temp.path().join(LOCK_FILE).exists());
        assert!(!mgr.is_open());
        assert!(mgr.close().is_ok());

        let meta = HintMeta {
            key: b"a",
            timestamp: Timestamp::new(1),
            value_size: 0,
            tombstone: false,
        };
        assert!(matches!(mgr.append(b"", &meta), Err(CoreError::Closed)));
    }

    #[test]
    fn close_keeps_written_active() {
        let temp = tempdir().unwrap();
        let mgr = manager(temp.path(), 1 << 20);
        put(&mgr, b"a", b"1", 100);
        let id = mgr.active_id();

        mgr.close().unwrap();
        assert!(dir::data_path(temp.path(), id).exists());
        assert!(dir::hint_path(temp.path(), id).exists());
    }

    #[test]
    fn resume_truncates_torn_tail_and_rebuilds_hints() {
        let temp = tempdir().unwrap();
        let id = SegmentId::new(500);
        {
            let mut seg = ActiveSegment::create(temp.path(), id).unwrap();
            seg.data.append(&encode_entry(b"a", b"1", Timestamp::new(1)).unwrap()).unwrap();
            seg.data.append(&encode_entry(b"b", b"2", Timestamp::new(2)).unwrap()).unwrap();
            let torn = encode_entry(b"c", b"333", Timestamp::new(3)).unwrap();
            seg.data.append(&torn[..10]).unwrap();
            // Hint file left empty, as if the crash hit before any hint write.
        }

        let mut seen = Vec::new();
        let seg = ActiveSegment::resume(temp.path(), id, |_, e| seen.push(e.entry.key.clone()))
            .unwrap()
            .unwrap();
        assert_eq!(seen, vec![b"a".to_vec(), b"b".to_vec()]);
        assert_eq!(seg.size().unwrap(), 2 * (HEADER_SIZE as u64 + 2));

        let hint_len = fs::metadata(dir::hint_path(temp.path(), id)).unwrap().len();
        assert_eq!(hint_len, 2 * (crate::codec::HINT_HEADER_SIZE as u64 + 1));
    }

    #[test]
    fn resume_refuses_segment_with_corrupt_record() {
        let temp = tempdir().unwrap();
        let id = SegmentId::new(500);
        let first = encode_entry(b"a", b"alpha", Timestamp::new(1)).unwrap();
        let second = encode_entry(b"b", b"bravo", Timestamp::new(2)).unwrap();
        {
            let mut seg = ActiveSegment::create(temp.path(), id).unwrap();
            seg.data.append(&first).unwrap();
            seg.data.append(&second).unwrap();
            seg.hint.append(&hint_for(&decode_entry(&first).unwrap(), 0).unwrap()).unwrap();
            seg.sync().unwrap();
        }
        let data_path = dir::data_path(temp.path(), id);
        let mut bytes = fs::read(&data_path).unwrap();
        bytes[HEADER_SIZE + 1] ^= 0xff;
        fs::write(&data_path, &bytes).unwrap();
        let hint_before = fs::read(dir::hint_path(temp.path(), id)).unwrap();

        let mut seen = 0;
        let resumed = ActiveSegment::resume(temp.path(), id, |_, _| seen += 1).unwrap();
        assert!(resumed.is_none());
        assert_eq!(seen, 0);

        // Neither file was rewritten.
        assert_eq!(fs::read(&data_path).unwrap(), bytes);
        assert_eq!(fs::read(dir::hint_path(temp.path(), id)).unwrap(), hint_before);
    }

    #[test]
    fn retire_deletes_files() {
        let temp = tempdir().unwrap();
        let mgr = manager(temp.path(), 32);
        let first = put(&mgr, b"a", &[1u8; 40], 1);
        put(&mgr, b"b", b"2", 2);
        assert!(mgr.sealed_ids().contains(&first.segment_id));

        // Warm the reader cache, then retire.
        mgr.read_at(first.segment_id, 0, HEADER_SIZE).unwrap();
        mgr.retire(&[first.segment_id]).unwrap();

        assert!(!dir::data_path(temp.path(), first.segment_id).exists());
        assert!(!temp.path().join(dir::RETIRE_FILE).exists());
        assert!(matches!(
            mgr.read_at(first.segment_id, 0, HEADER_SIZE),
            Err(CoreError::NotFound { .. })
        ));
    }

    #[test]
    fn disk_size_counts_all_files() {
        let temp = tempdir().unwrap();
        let mgr = manager(temp.path(), 1 << 20);
        assert_eq!(mgr.disk_size().unwrap(), 0);
        put(&mgr, b"a", b"1", 1);
        assert_eq!(
            mgr.disk_size().unwrap(),
            (HEADER_SIZE + 2 + crate::codec::HINT_HEADER_SIZE + 1) as u64
        );
    }
}
