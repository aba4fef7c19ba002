//! # CaskDB Core
//!
//! Log-structured, single-writer key-value storage engine.
//!
//! Values are appended to an on-disk log of segments and a full in-memory
//! index (the KeyDir) maps every key to its newest entry. This crate
//! provides:
//! - Entry and hint record codec with CRC-32 verification
//! - KeyDir with last-write-wins resolution by timestamp
//! - Segment management with size-based rotation
//! - Crash recovery from hint files with data-file fallback
//! - Merge (compaction) of immutable segments
//! - The [`Engine`] facade
//!
//! ## Example
//!
//! ```rust,no_run
//! use caskdb_core::{Config, Engine};
//! use std::path::Path;
//!
//! let engine = Engine::open_with_config(Path::new("store"), Config::default())?;
//! engine.put(b"user:1", b"alice")?;
//! assert_eq!(engine.get(b"user:1")?, Some(b"alice".to_vec()));
//! engine.delete(b"user:1")?;
//! engine.close()?;
//! # Ok::<(), caskdb_core::CoreError>(())
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod codec;
mod config;
pub mod dir;
mod engine;
mod error;
pub mod keydir;
pub mod merge;
pub mod recovery;
pub mod segment;
mod stats;
mod types;

pub use codec::{Entry, EntryHeader, HintHeader};
pub use config::Config;
pub use engine::{Engine, MergeTask};
pub use error::{CoreError, CoreResult};
pub use keydir::{KeyDir, KeyDirEntry};
pub use merge::MergeResult;
pub use recovery::RecoveryReport;
pub use stats::{EngineStats, StatsSnapshot};
pub use types::{SegmentId, Timestamp};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
