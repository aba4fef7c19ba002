//! # CaskDB Storage
//!
//! Byte-store backends for CaskDB.
//!
//! Backends are **opaque append-only byte stores**. They know nothing about
//! entry records, hint records or segments; `caskdb_core` owns every file
//! format. A backend only has to:
//!
//! - append bytes at the current end and report where they landed
//! - read an exact range back
//! - flush and sync
//! - truncate a torn tail after a crash
//!
//! ## Available Backends
//!
//! - [`FileBackend`] - a single OS file (data or hint file of a segment)
//! - [`InMemoryBackend`] - a `Vec<u8>`, for tests
//!
//! ## Example
//!
//! ```rust
//! use caskdb_storage::{StorageBackend, InMemoryBackend};
//!
//! let mut backend = InMemoryBackend::new();
//! let offset = backend.append(b"hello world").unwrap();
//! let data = backend.read_at(offset, 11).unwrap();
//! assert_eq!(&data, b"hello world");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod file;
mod memory;

pub use backend::StorageBackend;
pub use error::{StorageError, StorageResult};
pub use file::FileBackend;
pub use memory::InMemoryBackend;
