//! Store directory layout, single-writer lock and segment naming.
//!
//! ```text
//! <dir>/
//! ├─ bitcask.lock          # "<pid>\t<active_id>.data", held with an OS lock
//! ├─ <id>.data             # entry log of segment <id>
//! ├─ <id>.hint             # hint log of segment <id>
//! ├─ <id>merge.data        # merge output, transient
//! ├─ <id>merge.hint        # merge output, transient
//! └─ merge.retire          # merge inputs still to delete, transient
//! ```
//!
//! The lock file is created with exclusive-create semantics. Its presence
//! alone does not prove a live writer: a crashed process leaves it behind.
//! The OS advisory lock taken on it decides: if nobody holds it, the lock
//! file is stale and the recorded active segment is handed back so the new
//! writer can resume it.

use crate::error::{CoreError, CoreResult};
use crate::types::{unix_secs, SegmentId};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::warn;

/// Name of the single-writer lock file.
pub const LOCK_FILE: &str = "bitcask.lock";
/// Suffix of segment data files.
pub const DATA_SUFFIX: &str = ".data";
/// Suffix of segment hint files.
pub const HINT_SUFFIX: &str = ".hint";
/// Suffix of merge-output data files.
pub const MERGE_DATA_SUFFIX: &str = "merge.data";
/// Suffix of merge-output hint files.
pub const MERGE_HINT_SUFFIX: &str = "merge.hint";
/// Lists the merge inputs being deleted, one id per line.
pub const RETIRE_FILE: &str = "merge.retire";
/// Staging name of [`RETIRE_FILE`] until it is complete.
pub const RETIRE_TEMP_FILE: &str = "merge.retire.tmp";

/// Path of the data file of segment `id`.
#[must_use]
pub fn data_path(dir: &Path, id: SegmentId) -> PathBuf {
    dir.join(format!("{id}{DATA_SUFFIX}"))
}

/// Path of the hint file of segment `id`.
#[must_use]
pub fn hint_path(dir: &Path, id: SegmentId) -> PathBuf {
    dir.join(format!("{id}{HINT_SUFFIX}"))
}

/// Path of the merge-output data file that will become segment `id`.
#[must_use]
pub fn merge_data_path(dir: &Path, id: SegmentId) -> PathBuf {
    dir.join(format!("{id}{MERGE_DATA_SUFFIX}"))
}

/// Path of the merge-output hint file that will become segment `id`.
#[must_use]
pub fn merge_hint_path(dir: &Path, id: SegmentId) -> PathBuf {
    dir.join(format!("{id}{MERGE_HINT_SUFFIX}"))
}

/// What a directory entry is, judged by its name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    /// `<id>.data`
    Data(SegmentId),
    /// `<id>.hint`
    Hint(SegmentId),
    /// `<id>merge.data`
    MergeData(SegmentId),
    /// `<id>merge.hint`
    MergeHint(SegmentId),
    /// `bitcask.lock`
    Lock,
}

/// Classifies a file name; `None` for files the store does not own.
#[must_use]
pub fn classify(name: &str) -> Option<FileKind> {
    if name == LOCK_FILE {
        return Some(FileKind::Lock);
    }
    // Merge suffixes first: "7merge.data" also ends with ".data".
    if let Some(stem) = name.strip_suffix(MERGE_DATA_SUFFIX) {
        return parse_id(stem).map(FileKind::MergeData);
    }
    if let Some(stem) = name.strip_suffix(MERGE_HINT_SUFFIX) {
        return parse_id(stem).map(FileKind::MergeHint);
    }
    if let Some(stem) = name.strip_suffix(DATA_SUFFIX) {
        return parse_id(stem).map(FileKind::Data);
    }
    if let Some(stem) = name.strip_suffix(HINT_SUFFIX) {
        return parse_id(stem).map(FileKind::Hint);
    }
    None
}

fn parse_id(stem: &str) -> Option<SegmentId> {
    if stem.is_empty() || !stem.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    stem.parse().ok().map(SegmentId::new)
}

/// Segment files found in a directory.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SegmentListing {
    /// Ids with a data file, ascending.
    pub data_ids: Vec<SegmentId>,
    /// Ids with a hint file, ascending.
    pub hint_ids: Vec<SegmentId>,
    /// Leftover merge outputs.
    pub merge_artifacts: Vec<PathBuf>,
}

impl SegmentListing {
    /// Returns whether segment `id` has a hint file.
    #[must_use]
    pub fn has_hint(&self, id: SegmentId) -> bool {
        self.hint_ids.binary_search(&id).is_ok()
    }

    /// Greatest id seen in any segment or merge file name.
    #[must_use]
    pub fn max_id(&self) -> Option<SegmentId> {
        let merge_ids = self.merge_artifacts.iter().filter_map(|p| {
            match p.file_name().and_then(|n| n.to_str()).and_then(classify) {
                Some(FileKind::MergeData(id) | FileKind::MergeHint(id)) => Some(id),
                _ => None,
            }
        });
        self.data_ids
            .iter()
            .chain(self.hint_ids.iter())
            .copied()
            .chain(merge_ids)
            .max()
    }
}

/// Lists segment files in `dir`.
///
/// The lock file and files the store does not own are ignored.
///
/// # Errors
///
/// Returns an I/O error if the directory cannot be read.
pub fn list_segments(dir: &Path) -> CoreResult<SegmentListing> {
    let mut listing = SegmentListing::default();

    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };

        match classify(name) {
            Some(FileKind::Data(id)) => listing.data_ids.push(id),
            Some(FileKind::Hint(id)) => listing.hint_ids.push(id),
            Some(FileKind::MergeData(_) | FileKind::MergeHint(_)) => {
                listing.merge_artifacts.push(entry.path());
            }
            Some(FileKind::Lock) | None => {}
        }
    }

    listing.data_ids.sort_unstable();
    listing.hint_ids.sort_unstable();
    listing.merge_artifacts.sort();
    Ok(listing)
}

/// Paths of `*merge.data` and `*merge.hint` files in `dir`, sorted.
///
/// # Errors
///
/// Returns an I/O error if the directory cannot be read.
pub fn list_merge_artifacts(dir: &Path) -> CoreResult<Vec<PathBuf>> {
    Ok(list_segments(dir)?.merge_artifacts)
}

/// Deletes leftover merge outputs from an interrupted merge.
///
/// Returns the number of files removed.
///
/// # Errors
///
/// Returns an I/O error if listing or removal fails.
pub fn remove_merge_artifacts(dir: &Path) -> CoreResult<usize> {
    let artifacts = list_merge_artifacts(dir)?;
    for path in &artifacts {
        warn!(path = %path.display(), "discarding partial merge output");
        fs::remove_file(path)?;
    }
    if !artifacts.is_empty() {
        sync_directory(dir)?;
    }
    Ok(artifacts.len())
}

/// Durably records that segments `ids` are about to be deleted.
///
/// Once this returns, [`finish_retirement`] deletes every listed segment
/// even if the caller crashes part-way through. Merge inputs must vanish
/// together: a tombstone and the value it shadows may sit in different
/// inputs.
///
/// # Errors
///
/// Returns an I/O error if the marker cannot be written.
pub fn write_retire_marker(dir: &Path, ids: &[SegmentId]) -> CoreResult<()> {
    let staging = dir.join(RETIRE_TEMP_FILE);
    let mut file = File::create(&staging)?;
    for id in ids {
        writeln!(file, "{id}")?;
    }
    file.sync_all()?;
    drop(file);

    fs::rename(&staging, dir.join(RETIRE_FILE))?;
    sync_directory(dir)
}

/// Reads the segment ids listed by a pending retire marker.
///
/// # Errors
///
/// - [`CoreError::Malformed`] if a line is not a segment id
/// - I/O errors other than a missing marker
pub fn read_retire_marker(dir: &Path) -> CoreResult<Option<Vec<SegmentId>>> {
    let contents = match fs::read_to_string(dir.join(RETIRE_FILE)) {
        Ok(contents) => contents,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    contents
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            line.trim()
                .parse::<u64>()
                .map(SegmentId::new)
                .map_err(|_| CoreError::malformed(format!("retire marker line {line:?}")))
        })
        .collect::<CoreResult<Vec<_>>>()
        .map(Some)
}

/// Removes the retire marker once every listed segment is gone.
///
/// # Errors
///
/// Returns an I/O error if removal or the directory sync fails.
pub fn remove_retire_marker(dir: &Path) -> CoreResult<()> {
    remove_if_exists(&dir.join(RETIRE_FILE))?;
    sync_directory(dir)
}

/// Completes a retirement interrupted by a crash.
///
/// Deletes the data and hint files of every segment the marker lists, then
/// the marker itself. A staging marker is only discarded: nothing was
/// deleted before it became complete. Returns the number of segments
/// listed.
///
/// # Errors
///
/// Returns an I/O error or [`CoreError::Malformed`] for an unreadable
/// marker.
pub fn finish_retirement(dir: &Path) -> CoreResult<usize> {
    remove_if_exists(&dir.join(RETIRE_TEMP_FILE))?;

    let Some(ids) = read_retire_marker(dir)? else {
        return Ok(0);
    };
    for &id in &ids {
        warn!(segment = %id, "finishing interrupted merge: deleting input segment");
        remove_if_exists(&data_path(dir, id))?;
        remove_if_exists(&hint_path(dir, id))?;
    }
    sync_directory(dir)?;
    remove_retire_marker(dir)?;
    Ok(ids.len())
}

/// Deletes `path`, treating a missing file as success.
pub(crate) fn remove_if_exists(path: &Path) -> CoreResult<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Syncs the directory so file creations, renames and deletions are durable.
#[cfg(unix)]
pub fn sync_directory(dir: &Path) -> CoreResult<()> {
    File::open(dir)?.sync_all()?;
    Ok(())
}

/// Syncs the directory so file creations, renames and deletions are durable.
///
/// NTFS journals metadata; there is no directory handle to fsync.
#[cfg(not(unix))]
pub fn sync_directory(_dir: &Path) -> CoreResult<()> {
    Ok(())
}

/// Hands out strictly increasing segment ids.
///
/// Ids start from the wall clock in seconds, but never repeat or go
/// backwards: when several segments are created within one second the
/// allocator moves past the clock.
#[derive(Debug)]
pub struct SegmentIdAllocator {
    last: AtomicU64,
}

impl SegmentIdAllocator {
    /// Creates an allocator that will only return ids above `floor`.
    #[must_use]
    pub fn new(floor: Option<SegmentId>) -> Self {
        Self {
            last: AtomicU64::new(floor.map_or(0, SegmentId::as_u64)),
        }
    }

    /// Returns a fresh id.
    pub fn next(&self) -> SegmentId {
        let now = unix_secs();
        let mut last = self.last.load(Ordering::Acquire);
        loop {
            let candidate = now.max(last + 1);
            match self
                .last
                .compare_exchange(last, candidate, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return SegmentId::new(candidate),
                Err(actual) => last = actual,
            }
        }
    }

    /// Raises the floor so later ids exceed `id`.
    pub fn observe(&self, id: SegmentId) {
        self.last.fetch_max(id.as_u64(), Ordering::AcqRel);
    }
}

/// Exclusive writer lock on a store directory.
///
/// Dropping the handle releases the OS lock but leaves the file behind,
/// which the next writer treats as a crash. Call [`LockHandle::release`]
/// on a clean shutdown.
#[derive(Debug)]
pub struct LockHandle {
    path: PathBuf,
    file: File,
    recovered_active: Option<SegmentId>,
}

impl LockHandle {
    /// Acquires the writer lock on `dir`.
    ///
    /// # Errors
    ///
    /// - [`CoreError::LockHeld`] if a live writer holds the lock
    /// - I/O errors creating or reading the lock file
    pub fn acquire(dir: &Path) -> CoreResult<Self> {
        let path = dir.join(LOCK_FILE);

        match OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(file) => {
                if file.try_lock_exclusive().is_err() {
                    return Err(CoreError::LockHeld { pid: 0 });
                }
                Ok(Self {
                    path,
                    file,
                    recovered_active: None,
                })
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Self::take_over(path),
            Err(e) => Err(e.into()),
        }
    }

    fn take_over(path: PathBuf) -> CoreResult<Self> {
        let mut file = OpenOptions::new().read(true).write(true).open(&path)?;
        let mut raw = Vec::new();
        file.read_to_end(&mut raw)?;
        let (pid, active) = parse_lock_contents(&String::from_utf8_lossy(&raw));

        if file.try_lock_exclusive().is_err() {
            return Err(CoreError::LockHeld {
                pid: pid.unwrap_or(0),
            });
        }

        warn!(
            path = %path.display(),
            stale_pid = pid.unwrap_or(0),
            active = ?active,
            "taking over stale lock file from a writer that did not shut down cleanly"
        );

        Ok(Self {
            path,
            file,
            recovered_active: active,
        })
    }

    /// Active segment recorded by a crashed previous writer, if any.
    #[must_use]
    pub fn recovered_active(&self) -> Option<SegmentId> {
        self.recovered_active
    }

    /// Records this process and its active segment in the lock file.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the lock file cannot be rewritten.
    pub fn record_active(&mut self, id: SegmentId) -> CoreResult<()> {
        let contents = format!("{}\t{id}{DATA_SUFFIX}", std::process::id());
        self.file.set_len(0)?;
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(contents.as_bytes())?;
        self.file.sync_data()?;
        Ok(())
    }

    /// Removes the lock file and releases the lock.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the file cannot be removed.
    pub fn release(self) -> CoreResult<()> {
        fs::remove_file(&self.path)?;
        // The OS lock goes with the descriptor.
        drop(self.file);
        Ok(())
    }
}

/// Parses `<pid>\t<id>.data`; either half may be missing or garbled.
fn parse_lock_contents(contents: &str) -> (Option<u32>, Option<SegmentId>) {
    let mut parts = contents.trim().splitn(2, '\t');
    let pid = parts.next().and_then(|p| p.trim().parse().ok());
    let active = parts
        .next()
        .and_then(|name| match classify(name.trim()) {
            Some(FileKind::Data(id)) => Some(id),
            _ => None,
        });
    (pid, active)
}
