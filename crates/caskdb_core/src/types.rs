//! Core type definitions for CaskDB.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Identifier of a segment (one data file plus its hint file).
///
/// Ids double as file name stems and are strictly increasing within a
/// directory; see [`crate::dir::SegmentIdAllocator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SegmentId(pub u64);

impl SegmentId {
    /// Creates a new segment id.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw id value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Write time of an entry, in seconds.
///
/// The authoritative recency marker: the KeyDir keeps, per key, the entry
/// with the greatest timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Timestamp(pub u32);

impl Timestamp {
    /// Creates a timestamp from raw seconds.
    #[must_use]
    pub const fn new(secs: u32) -> Self {
        Self(secs)
    }

    /// Returns the raw seconds value.
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Current wall-clock time, saturated into 32 bits.
    #[must_use]
    pub fn now() -> Self {
        Self(u32::try_from(unix_secs()).unwrap_or(u32::MAX))
    }

    /// Returns the next timestamp, or `None` at `u32::MAX`.
    #[must_use]
    pub const fn checked_next(self) -> Option<Self> {
        match self.0.checked_add(1) {
            Some(next) => Some(Self(next)),
            None => None,
        }
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t:{}", self.0)
    }
}

/// Seconds since the Unix epoch; 0 if the clock is before the epoch.
pub(crate) fn unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segment_id_ordering() {
        assert!(SegmentId::new(1) < SegmentId::new(2));
        assert_eq!(format!("{}", SegmentId::new(1_700_000_000)), "1700000000");
    }

    #[test]
    fn timestamp_next_saturates() {
        assert_eq!(Timestamp::new(5).checked_next(), Some(Timestamp::new(6)));
        assert_eq!(Timestamp::new(u32::MAX).checked_next(), None);
    }

    #[test]
    fn timestamp_now_is_recent() {
        // 2023-11-14, well after any plausible test clock skew.
        assert!(Timestamp::now().as_u32() > 1_700_000_000);
    }
}
