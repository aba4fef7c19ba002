//! Binary record formats for data and hint files.
//!
//! Every record starts with a fixed 16-byte header so a reader can always
//! fetch a bounded prefix, learn the payload lengths, and then fetch the
//! rest. That is what makes sequential segment scans possible without any
//! side index.
//!
//! ## Entry Record (`<id>.data`)
//!
//! ```text
//! | checksum (4) | timestamp (4) | key_size (4) | value_size (4) | key (N) | value (M) |
//! ```
//!
//! ## Hint Record (`<id>.hint`)
//!
//! ```text
//! | timestamp (4) | key_size (4) | value_size (4) | value_position (4) | key (N) |
//! ```
//!
//! All integers are little-endian. The checksum is CRC-32 over every byte
//! of the entry after the checksum field.
//!
//! `value_size` carries the tombstone flag in its top bit (`0x8000_0000`);
//! the low 31 bits are the value length. A header with `key_size == 0` and
//! `value_size == 0` is padding and is skipped by scanners. Empty keys are
//! rejected at encode time, so padding can never be confused with an entry.

mod entry;
mod hint;

pub use entry::{
    compute_checksum, decode_entry, decode_entry_header, encode_entry, encode_tombstone,
    entry_len, Entry, EntryHeader, HEADER_SIZE, MAX_VALUE_SIZE, TOMBSTONE_FLAG,
};
pub use hint::{decode_hint, encode_hint, HintHeader, HINT_HEADER_SIZE};

/// Reads a little-endian `u32` at `pos`.
///
/// Callers guarantee `buf.len() >= pos + 4`.
fn read_u32(buf: &[u8], pos: usize) -> u32 {
    u32::from_le_bytes([buf[pos], buf[pos + 1], buf[pos + 2], buf[pos + 3]])
}

/// Splits a raw `value_size` field into (length, tombstone).
const fn split_value_size(raw: u32) -> (u32, bool) {
    (raw & !TOMBSTONE_FLAG, raw & TOMBSTONE_FLAG != 0)
}

/// Packs a value length and tombstone flag into a `value_size` field.
const fn pack_value_size(len: u32, tombstone: bool) -> u32 {
    if tombstone {
        len | TOMBSTONE_FLAG
    } else {
        len
    }
}
