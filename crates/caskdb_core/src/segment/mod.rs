//! Segment management.
//!
//! A segment is a `<id>.data` entry log plus its `<id>.hint` companion.
//! Exactly one segment is active and receives appends; every other segment
//! is immutable. When the active data file grows past the configured size
//! it is sealed and a fresh segment takes over.
//!
//! ## Components
//!
//! - [`SegmentManager`]: active segment, rotation, cached read handles
//! - [`DataScanner`] / [`HintScanner`]: sequential scans for recovery,
//!   merge and the diagnostic tools

mod scan;
mod store;

pub use scan::{DataScanner, HintScanner, ScanStop, ScannedEntry, ScannedHint, StopKind};
pub use store::{ActiveSegment, Appended, HintMeta, SegmentManager};

use crate::codec::{encode_hint, Entry};
use crate::error::{CoreError, CoreResult};

/// Converts a data-file offset into a hint `value_position`.
pub(crate) fn hint_position(offset: u64) -> CoreResult<u32> {
    u32::try_from(offset).map_err(|_| {
        CoreError::invalid_argument(format!("offset {offset} exceeds the 32-bit hint position"))
    })
}

/// Encodes the hint record for `entry` stored at `offset`.
pub(crate) fn hint_for(entry: &Entry, offset: u64) -> CoreResult<Vec<u8>> {
    // The codec already bounded the value to 31 bits.
    let value_size = entry.value.len() as u32;
    encode_hint(
        entry.timestamp,
        &entry.key,
        value_size,
        entry.tombstone,
        hint_position(offset)?,
    )
}
