//! Engine statistics.
//!
//! ```rust,ignore
//! let engine = Engine::open(path, Config::default())?;
//! engine.put(b"k", b"v")?;
//!
//! let stats = engine.stats();
//! println!("writes: {}, rotations: {}", stats.writes, stats.rotations);
//! ```

use std::sync::atomic::{AtomicU64, Ordering};

/// Live engine counters.
///
/// All counters are atomic and monotonically increasing; they can be read
/// while operations are in progress.
#[derive(Debug, Default)]
pub struct EngineStats {
    reads: AtomicU64,
    writes: AtomicU64,
    deletes: AtomicU64,
    bytes_written: AtomicU64,
    bytes_read: AtomicU64,
    rotations: AtomicU64,
    merges: AtomicU64,
    corrupt_reads: AtomicU64,
    read_retries: AtomicU64,
}

impl EngineStats {
    /// Creates zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_read(&self, bytes: u64) {
        self.reads.fetch_add(1, Ordering::Relaxed);
        self.bytes_read.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn record_write(&self, bytes: u64) {
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.bytes_written.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn record_delete(&self, bytes: u64) {
        self.deletes.fetch_add(1, Ordering::Relaxed);
        self.bytes_written.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn record_rotation(&self) {
        self.rotations.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_merge(&self) {
        self.merges.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_corrupt_read(&self) {
        self.corrupt_reads.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_read_retry(&self) {
        self.read_retries.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns a point-in-time copy of every counter.
    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            rotations: self.rotations.load(Ordering::Relaxed),
            merges: self.merges.load(Ordering::Relaxed),
            corrupt_reads: self.corrupt_reads.load(Ordering::Relaxed),
            read_retries: self.read_retries.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time snapshot of engine statistics.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    /// Successful `get` calls that found a value.
    pub reads: u64,
    /// `put` calls.
    pub writes: u64,
    /// `delete` calls.
    pub deletes: u64,
    /// Bytes appended to data files by puts and deletes.
    pub bytes_written: u64,
    /// Value bytes returned by reads.
    pub bytes_read: u64,
    /// Active segment rotations.
    pub rotations: u64,
    /// Completed merges.
    pub merges: u64,
    /// Reads that hit a corrupt record.
    pub corrupt_reads: u64,
    /// Reads retried after racing with a merge.
    pub read_retries: u64,
}
