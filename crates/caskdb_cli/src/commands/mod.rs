//! CLI command implementations.

pub mod decode_data;
pub mod decode_hint;
pub mod inspect;
pub mod merge;
pub mod verify;

use caskdb_core::dir::{self, FileKind};
use caskdb_core::segment::StopKind;
use caskdb_core::SegmentId;
use std::path::Path;

/// Renders key or value bytes: UTF-8 text as is, anything else as hex.
pub(crate) fn display_bytes(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(text) if !text.chars().any(char::is_control) => text.to_string(),
        _ => {
            let hex: String = bytes.iter().map(|b| format!("{b:02x}")).collect();
            format!("0x{hex}")
        }
    }
}

/// Segment id encoded in a data file name, or 0 for foreign names.
pub(crate) fn segment_id_of(path: &Path) -> SegmentId {
    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
    match dir::classify(name) {
        Some(FileKind::Data(id) | FileKind::MergeData(id)) => id,
        _ => SegmentId::new(0),
    }
}

pub(crate) fn describe_stop(kind: &StopKind) -> String {
    match kind {
        StopKind::Torn => "torn record".to_string(),
        StopKind::Corrupt(message) => message.clone(),
    }
}

pub(crate) fn format_size(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.1} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}
