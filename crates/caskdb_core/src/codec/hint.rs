//! Hint records: compact pointers into a data file.

use super::entry::{entry_len, MAX_VALUE_SIZE};
use super::{pack_value_size, read_u32, split_value_size};
use crate::error::{CoreError, CoreResult};
use crate::types::Timestamp;

/// Size of the fixed hint header.
/// timestamp (4) + key_size (4) + value_size (4) + value_position (4) = 16
pub const HINT_HEADER_SIZE: usize = 16;

/// Parsed fixed header of a hint record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HintHeader {
    /// Write time, mirrored from the entry.
    pub timestamp: Timestamp,
    /// Key length in bytes.
    pub key_size: u32,
    /// Value length in bytes (flag bit removed).
    pub value_size: u32,
    /// Whether the entry is a tombstone.
    pub tombstone: bool,
    /// Offset of the entry header within its data file.
    pub value_position: u32,
}

impl HintHeader {
    /// Full hint record length, key included.
    #[must_use]
    pub const fn record_len(&self) -> u64 {
        HINT_HEADER_SIZE as u64 + self.key_size as u64
    }

    /// Length of the data-file entry this hint points at.
    #[must_use]
    pub const fn entry_len(&self) -> u64 {
        entry_len(self.key_size, self.value_size)
    }

    /// Offset just past the pointed-at entry.
    #[must_use]
    pub const fn entry_end(&self) -> u64 {
        self.value_position as u64 + self.entry_len()
    }
}

/// Encodes a hint record.
///
/// # Errors
///
/// Returns [`CoreError::InvalidArgument`] if the key or value size cannot be
/// represented in the hint format.
pub fn encode_hint(
    timestamp: Timestamp,
    key: &[u8],
    value_size: u32,
    tombstone: bool,
    value_position: u32,
) -> CoreResult<Vec<u8>> {
    let key_size = u32::try_from(key.len())
        .map_err(|_| CoreError::invalid_argument(format!("key of {} bytes is too large", key.len())))?;
    if value_size as usize > MAX_VALUE_SIZE {
        return Err(CoreError::invalid_argument(format!(
            "value size {value_size} exceeds maximum of {MAX_VALUE_SIZE}"
        )));
    }

    let mut buf = Vec::with_capacity(HINT_HEADER_SIZE + key.len());
    buf.extend_from_slice(&timestamp.as_u32().to_le_bytes());
    buf.extend_from_slice(&key_size.to_le_bytes());
    buf.extend_from_slice(&pack_value_size(value_size, tombstone).to_le_bytes());
    buf.extend_from_slice(&value_position.to_le_bytes());
    buf.extend_from_slice(key);
    Ok(buf)
}

/// Parses the fixed header of a hint record.
///
/// The caller then reads `key_size` further bytes for the key.
#[must_use]
pub fn decode_hint(buf: &[u8; HINT_HEADER_SIZE]) -> HintHeader {
    let (value_size, tombstone) = split_value_size(read_u32(buf, 8));
    HintHeader {
        timestamp: Timestamp::new(read_u32(buf, 0)),
        key_size: read_u32(buf, 4),
        value_size,
        tombstone,
        value_position: read_u32(buf, 12),
    }
}
