//! Entry records: the unit of the append-only data log.

use super::{pack_value_size, read_u32, split_value_size};
use crate::error::{CoreError, CoreResult};
use crate::types::Timestamp;

/// Size of the fixed entry header.
/// checksum (4) + timestamp (4) + key_size (4) + value_size (4) = 16
pub const HEADER_SIZE: usize = 16;

/// Tombstone bit inside the `value_size` field.
pub const TOMBSTONE_FLAG: u32 = 0x8000_0000;

/// Largest value that fits beside the tombstone bit.
pub const MAX_VALUE_SIZE: usize = 0x7FFF_FFFF;

/// Parsed fixed header of an entry record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryHeader {
    /// Stored CRC-32 of the rest of the record.
    pub checksum: u32,
    /// Write time.
    pub timestamp: Timestamp,
    /// Key length in bytes.
    pub key_size: u32,
    /// Value length in bytes (flag bit removed).
    pub value_size: u32,
    /// Whether the entry deletes its key.
    pub tombstone: bool,
}

impl EntryHeader {
    /// Returns whether this is a padding record rather than an entry.
    #[must_use]
    pub const fn is_padding(&self) -> bool {
        self.key_size == 0 && self.value_size == 0 && !self.tombstone
    }

    /// Bytes following the header.
    #[must_use]
    pub const fn payload_len(&self) -> u64 {
        self.key_size as u64 + self.value_size as u64
    }

    /// Full record length, header included.
    #[must_use]
    pub const fn record_len(&self) -> u64 {
        entry_len(self.key_size, self.value_size)
    }
}

/// A fully decoded and checksum-verified entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    /// Write time.
    pub timestamp: Timestamp,
    /// Key bytes.
    pub key: Vec<u8>,
    /// Value bytes, empty for tombstones.
    pub value: Vec<u8>,
    /// Whether the entry deletes its key.
    pub tombstone: bool,
}

/// Length of an encoded entry with the given payload sizes.
#[must_use]
pub const fn entry_len(key_size: u32, value_size: u32) -> u64 {
    HEADER_SIZE as u64 + key_size as u64 + value_size as u64
}

/// CRC-32 used for entry checksums.
#[must_use]
pub fn compute_checksum(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}

/// Encodes a live entry.
///
/// # Errors
///
/// Returns [`CoreError::InvalidArgument`] for an empty key, a key longer
/// than `u32::MAX`, or a value longer than [`MAX_VALUE_SIZE`].
pub fn encode_entry(key: &[u8], value: &[u8], timestamp: Timestamp) -> CoreResult<Vec<u8>> {
    encode(key, value, timestamp, false)
}

/// Encodes a tombstone for `key`.
///
/// # Errors
///
/// Returns [`CoreError::InvalidArgument`] for an empty or oversized key.
pub fn encode_tombstone(key: &[u8], timestamp: Timestamp) -> CoreResult<Vec<u8>> {
    encode(key, &[], timestamp, true)
}

fn encode(key: &[u8], value: &[u8], timestamp: Timestamp, tombstone: bool) -> CoreResult<Vec<u8>> {
    if key.is_empty() {
        return Err(CoreError::invalid_argument("key must not be empty"));
    }
    let key_size = u32::try_from(key.len())
        .map_err(|_| CoreError::invalid_argument(format!("key of {} bytes is too large", key.len())))?;
    if value.len() > MAX_VALUE_SIZE {
        return Err(CoreError::invalid_argument(format!(
            "value of {} bytes exceeds maximum of {MAX_VALUE_SIZE} bytes",
            value.len()
        )));
    }
    // Checked above: fits in 31 bits.
    let value_size = value.len() as u32;

    let mut buf = Vec::with_capacity(HEADER_SIZE + key.len() + value.len());
    buf.extend_from_slice(&[0u8; 4]);
    buf.extend_from_slice(&timestamp.as_u32().to_le_bytes());
    buf.extend_from_slice(&key_size.to_le_bytes());
    buf.extend_from_slice(&pack_value_size(value_size, tombstone).to_le_bytes());
    buf.extend_from_slice(key);
    buf.extend_from_slice(value);

    let checksum = compute_checksum(&buf[4..]);
    buf[..4].copy_from_slice(&checksum.to_le_bytes());

    Ok(buf)
}

/// Parses the fixed header of an entry.
///
/// The caller then reads `payload_len()` further bytes.
#[must_use]
pub fn decode_entry_header(buf: &[u8; HEADER_SIZE]) -> EntryHeader {
    let (value_size, tombstone) = split_value_size(read_u32(buf, 12));
    EntryHeader {
        checksum: read_u32(buf, 0),
        timestamp: Timestamp::new(read_u32(buf, 4)),
        key_size: read_u32(buf, 8),
        value_size,
        tombstone,
    }
}

/// Decodes and verifies a complete entry.
///
/// Bytes past the end of the record are ignored, so a caller may pass a
/// larger buffer.
///
/// # Errors
///
/// - [`CoreError::Malformed`] if the buffer is shorter than the header
///   declares, or a tombstone carries a value
/// - [`CoreError::ChecksumMismatch`] if verification fails
pub fn decode_entry(buf: &[u8]) -> CoreResult<Entry> {
    let header_bytes: &[u8; HEADER_SIZE] = buf
        .get(..HEADER_SIZE)
        .and_then(|h| h.try_into().ok())
        .ok_or_else(|| CoreError::malformed(format!("entry of {} bytes has no header", buf.len())))?;
    let header = decode_entry_header(header_bytes);

    let record_len = usize::try_from(header.record_len())
        .map_err(|_| CoreError::malformed("entry length overflows address space"))?;
    if buf.len() < record_len {
        return Err(CoreError::malformed(format!(
            "entry declares {record_len} bytes, only {} available",
            buf.len()
        )));
    }

    let actual = compute_checksum(&buf[4..record_len]);
    if actual != header.checksum {
        return Err(CoreError::ChecksumMismatch {
            expected: header.checksum,
            actual,
        });
    }

    if header.tombstone && header.value_size != 0 {
        return Err(CoreError::malformed("tombstone carries a value"));
    }

    let key_end = HEADER_SIZE + header.key_size as usize;
    Ok(Entry {
        timestamp: header.timestamp,
        key: buf[HEADER_SIZE..key_end].to_vec(),
        value: buf[key_end..record_len].to_vec(),
        tombstone: header.tombstone,
    })
}
