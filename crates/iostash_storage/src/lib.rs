//! # iostash Storage
//!
//! Storage backend trait and implementations for iostash.
//!
//! This crate provides the lowest-level storage abstraction for the cache.
//! Storage backends are **opaque byte stores** - they do not interpret the
//! data they store.
//!
//! ## Design Principles
//!
//! - Backends are simple byte stores (positioned read, positioned write,
//!   truncate, flush)
//! - No knowledge of iostash file formats, journals, or phrases
//! - Must be `Send + Sync` for concurrent access
//! - iostash owns all file format interpretation
//!
//! Both on-disk regions of the cache (the journal and the data region) are
//! circular, so backends expose positioned writes rather than an append
//! operation.
//!
//! ## Available Backends
//!
//! - [`InMemoryBackend`] - For testing and ephemeral caches
//! - [`FileBackend`] - For persistent storage using OS file APIs
//!
//! ## Example
//!
//! ```rust
//! use iostash_storage::{StorageBackend, InMemoryBackend};
//!
//! let mut backend = InMemoryBackend::new();
//! backend.write_at(0, b"hello world").unwrap();
//! let data = backend.read_at(0, 11).unwrap();
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
