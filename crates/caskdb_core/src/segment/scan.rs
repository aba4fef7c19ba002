//! Sequential scanners over data and hint files.
//!
//! Both scanners read through a fixed-size window so memory stays bounded
//! regardless of segment size; only a record larger than the window forces
//! a one-off bigger read.
//!
//! A scan ends in one of three ways:
//!
//! - the end of the file is reached cleanly
//! - a torn record (header or payload running past the end of the file)
//! - a corrupt record (checksum failure, impossible sizes)
//!
//! Torn and corrupt endings are not errors: the scanner stops, records a
//! [`ScanStop`] and yields nothing further. Callers decide whether to
//! truncate there or merely log. Only I/O failures are yielded as `Err`.

use crate::codec::{
    decode_entry, decode_entry_header, decode_hint, Entry, HintHeader, HEADER_SIZE,
    HINT_HEADER_SIZE,
};
use crate::error::CoreResult;
use crate::types::SegmentId;
use caskdb_storage::StorageBackend;

/// Read window for sequential scans.
const READ_BUFFER_SIZE: usize = 64 * 1024; // 64 KB

/// Why a scan ended before the end of the file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopKind {
    /// A record runs past the end of the file.
    Torn,
    /// A record failed verification.
    Corrupt(String),
}

/// Where and why a scan ended early.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanStop {
    /// Offset of the first record that was not yielded.
    pub offset: u64,
    /// Reason the scan stopped.
    pub kind: StopKind,
}

/// Windowed reader shared by both scanners.
struct Window<'a> {
    backend: &'a dyn StorageBackend,
    total_size: u64,
    pos: u64,
    buffer: Vec<u8>,
    buffer_start: u64,
}

impl<'a> Window<'a> {
    fn new(backend: &'a dyn StorageBackend) -> CoreResult<Self> {
        Ok(Self {
            backend,
            total_size: backend.size()?,
            pos: 0,
            buffer: Vec::new(),
            buffer_start: 0,
        })
    }

    /// Returns the next `len` bytes without consuming them, or `None` if the
    /// file ends first.
    fn peek(&mut self, len: usize) -> CoreResult<Option<&[u8]>> {
        let end = self.pos + len as u64;
        if end > self.total_size {
            return Ok(None);
        }

        let buffer_end = self.buffer_start + self.buffer.len() as u64;
        if self.pos < self.buffer_start || end > buffer_end {
            let want = len.max(READ_BUFFER_SIZE) as u64;
            let read_len = want.min(self.total_size - self.pos) as usize;
            self.buffer = self.backend.read_at(self.pos, read_len)?;
            self.buffer_start = self.pos;
        }

        let start = (self.pos - self.buffer_start) as usize;
        Ok(Some(&self.buffer[start..start + len]))
    }

    fn advance(&mut self, len: u64) {
        self.pos += len;
    }
}

/// An entry yielded by [`DataScanner`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedEntry {
    /// Offset of the entry header.
    pub offset: u64,
    /// The verified entry.
    pub entry: Entry,
}

impl ScannedEntry {
    /// Length of the on-disk record.
    #[must_use]
    pub fn record_len(&self) -> u64 {
        (HEADER_SIZE + self.entry.key.len() + self.entry.value.len()) as u64
    }

    /// Offset just past the record.
    #[must_use]
    pub fn end(&self) -> u64 {
        self.offset + self.record_len()
    }
}

/// Streams verified entries out of a data file.
///
/// Padding records are skipped.
pub struct DataScanner<'a> {
    window: Window<'a>,
    segment_id: SegmentId,
    stop: Option<ScanStop>,
    finished: bool,
}

impl<'a> DataScanner<'a> {
    /// Starts a scan at offset 0.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend size cannot be determined.
    pub fn new(backend: &'a dyn StorageBackend, segment_id: SegmentId) -> CoreResult<Self> {
        Ok(Self {
            window: Window::new(backend)?,
            segment_id,
            stop: None,
            finished: false,
        })
    }

    /// Segment being scanned.
    #[must_use]
    pub fn segment_id(&self) -> SegmentId {
        self.segment_id
    }

    /// Size of the file when the scan started.
    #[must_use]
    pub fn total_size(&self) -> u64 {
        self.window.total_size
    }

    /// Why the scan stopped early, if it did.
    #[must_use]
    pub fn stop(&self) -> Option<&ScanStop> {
        self.stop.as_ref()
    }

    /// Length of the valid prefix read so far.
    ///
    /// After the scan is exhausted this is where a torn or corrupt file
    /// should be truncated.
    #[must_use]
    pub fn valid_len(&self) -> u64 {
        self.stop
            .as_ref()
            .map_or(self.window.pos, |stop| stop.offset)
    }

    fn halt(&mut self, offset: u64, kind: StopKind) {
        self.stop = Some(ScanStop { offset, kind });
        self.finished = true;
    }

    fn read_next(&mut self) -> CoreResult<Option<ScannedEntry>> {
        loop {
            if self.finished {
                return Ok(None);
            }
            let offset = self.window.pos;
            if offset == self.window.total_size {
                self.finished = true;
                return Ok(None);
            }

            let Some(bytes) = self.window.peek(HEADER_SIZE)? else {
                self.halt(offset, StopKind::Torn);
                return Ok(None);
            };
            let mut header_bytes = [0u8; HEADER_SIZE];
            header_bytes.copy_from_slice(bytes);
            let header = decode_entry_header(&header_bytes);

            if header.is_padding() {
                self.window.advance(HEADER_SIZE as u64);
                continue;
            }
            if header.key_size == 0 {
                self.halt(offset, StopKind::Corrupt("entry with empty key".to_string()));
                return Ok(None);
            }

            let record_len = header.record_len();
            if offset + record_len > self.window.total_size {
                self.halt(offset, StopKind::Torn);
                return Ok(None);
            }

            let Some(bytes) = self.window.peek(record_len as usize)? else {
                self.halt(offset, StopKind::Torn);
                return Ok(None);
            };
            match decode_entry(bytes) {
                Ok(entry) => {
                    self.window.advance(record_len);
                    return Ok(Some(ScannedEntry { offset, entry }));
                }
                Err(e) if e.is_corruption() => {
                    self.halt(offset, StopKind::Corrupt(e.to_string()));
                    return Ok(None);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl Iterator for DataScanner<'_> {
    type Item = CoreResult<ScannedEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.read_next() {
            Ok(Some(entry)) => Some(Ok(entry)),
            Ok(None) => None,
            Err(e) => {
                self.finished = true;
                Some(Err(e))
            }
        }
    }
}

/// A hint yielded by [`HintScanner`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedHint {
    /// Offset of the hint record within the hint file.
    pub offset: u64,
    /// Parsed header.
    pub header: HintHeader,
    /// Key bytes.
    pub key: Vec<u8>,
}

/// Streams hint records out of a hint file.
///
/// Hints carry no checksum; they are validated against the data file by
/// the caller.
pub struct HintScanner<'a> {
    window: Window<'a>,
    stop: Option<ScanStop>,
    finished: bool,
}

impl<'a> HintScanner<'a> {
    /// Starts a scan at offset 0.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend size cannot be determined.
    pub fn new(backend: &'a dyn StorageBackend) -> CoreResult<Self> {
        Ok(Self {
            window: Window::new(backend)?,
            stop: None,
            finished: false,
        })
    }

    /// Why the scan stopped early, if it did.
    #[must_use]
    pub fn stop(&self) -> Option<&ScanStop> {
        self.stop.as_ref()
    }

    fn halt(&mut self, offset: u64, kind: StopKind) {
        self.stop = Some(ScanStop { offset, kind });
        self.finished = true;
    }

    fn read_next(&mut self) -> CoreResult<Option<ScannedHint>> {
        if self.finished {
            return Ok(None);
        }
        let offset = self.window.pos;
        if offset == self.window.total_size {
            self.finished = true;
            return Ok(None);
        }

        let Some(bytes) = self.window.peek(HINT_HEADER_SIZE)? else {
            self.halt(offset, StopKind::Torn);
            return Ok(None);
        };
        let mut header_bytes = [0u8; HINT_HEADER_SIZE];
        header_bytes.copy_from_slice(bytes);
        let header = decode_hint(&header_bytes);

        if header.key_size == 0 {
            self.halt(offset, StopKind::Corrupt("hint with empty key".to_string()));
            return Ok(None);
        }
        if header.tombstone && header.value_size != 0 {
            self.halt(offset, StopKind::Corrupt("tombstone hint carries a value".to_string()));
            return Ok(None);
        }

        let record_len = header.record_len();
        if offset + record_len > self.window.total_size {
            self.halt(offset, StopKind::Torn);
            return Ok(None);
        }

        let Some(bytes) = self.window.peek(record_len as usize)? else {
            self.halt(offset, StopKind::Torn);
            return Ok(None);
        };
        let key = bytes[HINT_HEADER_SIZE..].to_vec();
        self.window.advance(record_len);

        Ok(Some(ScannedHint {
            offset,
            header,
            key,
        }))
    }
}

impl Iterator for HintScanner<'_> {
    type Item = CoreResult<ScannedHint>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.read_next() {
            Ok(Some(hint)) => Some(Ok(hint)),
            Ok(None) => None,
            Err(e) => {
                self.finished = true;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{encode_entry, encode_hint, encode_tombstone};
    use crate::types::Timestamp;
    use caskdb_storage::InMemoryBackend;

    fn data_file(records: &[(&[u8], &[u8])]) -> (InMemoryBackend, Vec<u64>) {
        let mut backend = InMemoryBackend::new();
        let mut offsets = Vec::new();
        for (i, (key, value)) in records.iter().enumerate() {
            let buf = encode_entry(key, value, Timestamp::new(100 + i as u32)).unwrap();
            offsets.push(backend.append(&buf).unwrap());
        }
        (backend, offsets)
    }

    #[test]
    fn scans_all_entries_in_order() {
        let (backend, offsets) = data_file(&[(b"a", b"1"), (b"b", b"22"), (b"c", b"")]);
        let mut scanner = DataScanner::new(&backend, SegmentId::new(1)).unwrap();

        let entries: Vec<_> = scanner.by_ref().map(Result::unwrap).collect();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[1].entry.key, b"b");
        assert_eq!(entries[1].entry.value, b"22");
        let found: Vec<u64> = entries.iter().map(|e| e.offset).collect();
        assert_eq!(found, offsets);

        assert!(scanner.stop().is_none());
        assert_eq!(scanner.valid_len(), backend.size().unwrap());
    }

    #[test]
    fn empty_file_yields_nothing() {
        let backend = InMemoryBackend::new();
        let mut scanner = DataScanner::new(&backend, SegmentId::new(1)).unwrap();
        assert!(scanner.next().is_none());
        assert!(scanner.stop().is_none());
        assert_eq!(scanner.valid_len(), 0);
    }

    #[test]
    fn padding_is_skipped() {
        let mut backend = InMemoryBackend::new();
        backend.append(&encode_entry(b"a", b"1", Timestamp::new(1)).unwrap()).unwrap();
        backend.append(&[0u8; HEADER_SIZE]).unwrap();
        backend.append(&encode_tombstone(b"a", Timestamp::new(2)).unwrap()).unwrap();

        let entries: Vec<_> = DataScanner::new(&backend, SegmentId::new(1))
            .unwrap()
            .map(Result::unwrap)
            .collect();
        assert_eq!(entries.len(), 2);
        assert!(entries[1].entry.tombstone);
        assert_eq!(entries[1].offset, entries[0].end() + HEADER_SIZE as u64);
    }

    #[test]
    fn torn_tail_stops_scan() {
        let (mut backend, offsets) = data_file(&[(b"a", b"1"), (b"b", b"2")]);
        let partial = encode_entry(b"c", b"33333", Timestamp::new(9)).unwrap();
        backend.append(&partial[..partial.len() - 3]).unwrap();

        let mut scanner = DataScanner::new(&backend, SegmentId::new(1)).unwrap();
        assert_eq!(scanner.by_ref().count(), 2);

        let stop = scanner.stop().unwrap();
        assert_eq!(stop.kind, StopKind::Torn);
        let tail = offsets[1] + entry_len_of(b"b", b"2");
        assert_eq!(stop.offset, tail);
        assert_eq!(scanner.valid_len(), tail);
    }

    #[test]
    fn torn_header_stops_scan() {
        let (mut backend, _) = data_file(&[(b"a", b"1")]);
        let before = backend.size().unwrap();
        backend.append(&[1, 2, 3]).unwrap();

        let mut scanner = DataScanner::new(&backend, SegmentId::new(1)).unwrap();
        assert_eq!(scanner.by_ref().count(), 1);
        assert_eq!(scanner.valid_len(), before);
    }

    #[test]
    fn corrupt_record_stops_scan() {
        let (backend, offsets) = data_file(&[(b"a", b"1"), (b"b", b"2"), (b"c", b"3")]);
        let mut bytes = backend.data().to_vec();
        let flip = offsets[1] as usize + HEADER_SIZE;
        bytes[flip] ^= 0xFF;
        let backend = InMemoryBackend::with_data(bytes);

        let mut scanner = DataScanner::new(&backend, SegmentId::new(4)).unwrap();
        let entries: Vec<_> = scanner.by_ref().map(Result::unwrap).collect();
        assert_eq!(entries.len(), 1);

        let stop = scanner.stop().unwrap();
        assert_eq!(stop.offset, offsets[1]);
        assert!(matches!(stop.kind, StopKind::Corrupt(_)));
    }

    #[test]
    fn records_larger_than_window() {
        let big = vec![0xAB; READ_BUFFER_SIZE * 2 + 17];
        let (backend, _) = data_file(&[(b"small", b"x"), (b"big", &big), (b"after", b"y")]);

        let entries: Vec<_> = DataScanner::new(&backend, SegmentId::new(1))
            .unwrap()
            .map(Result::unwrap)
            .collect();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[1].entry.value, big);
        assert_eq!(entries[2].entry.key, b"after");
    }

    #[test]
    fn hint_scan_and_torn_hint() {
        let mut backend = InMemoryBackend::new();
        backend
            .append(&encode_hint(Timestamp::new(1), b"a", 1, false, 0).unwrap())
            .unwrap();
        backend
            .append(&encode_hint(Timestamp::new(2), b"b", 0, true, 18).unwrap())
            .unwrap();
        let partial = encode_hint(Timestamp::new(3), b"ccc", 1, false, 34).unwrap();
        backend.append(&partial[..HINT_HEADER_SIZE + 1]).unwrap();

        let mut scanner = HintScanner::new(&backend).unwrap();
        let hints: Vec<_> = scanner.by_ref().map(Result::unwrap).collect();
        assert_eq!(hints.len(), 2);
        assert_eq!(hints[0].key, b"a");
        assert!(hints[1].header.tombstone);
        assert_eq!(hints[1].header.value_position, 18);
        assert_eq!(scanner.stop().unwrap().kind, StopKind::Torn);
    }

    #[test]
    fn hint_with_empty_key_is_corrupt() {
        let backend = InMemoryBackend::with_data(vec![0u8; HINT_HEADER_SIZE]);
        let mut scanner = HintScanner::new(&backend).unwrap();
        assert!(scanner.next().is_none());
        assert!(matches!(scanner.stop().unwrap().kind, StopKind::Corrupt(_)));
    }

    fn entry_len_of(key: &[u8], value: &[u8]) -> u64 {
        (HEADER_SIZE + key.len() + value.len()) as u64
    }
}
