//! # iostash Core
//!
//! A journaled two-tier chunk cache: a bounded in-memory tier that spills
//! into a circular on-disk data region, with an append-only wrapping journal
//! used solely to rebuild the disk index after a crash.
//!
//! This crate provides:
//! - A memory tier with randomized eviction and durable tombstones
//! - A phrase-based journal writer with fixed-width validated records
//! - A circular disk store and its key-to-location index
//! - A crash-recovery loader that hash-verifies the journal against the
//!   data file and never partially trusts a damaged one
//! - A token-bucket IO governor driven by memory pressure
//! - A background scheduler that serializes all disk activity on one
//!   worker thread and serves asynchronous reads
//!
//! ## Quick start
//!
//! ```no_run
//! use iostash_core::{CacheConfig, ChunkCache, ContentKey, Scheduler};
//! use std::path::Path;
//!
//! let scheduler = Scheduler::new()?;
//! let cache = ChunkCache::open(Path::new("my_cache"), CacheConfig::default(), &scheduler)?;
//!
//! cache.put(ContentKey::new(1), b"some chunk".to_vec());
//! # Ok::<(), iostash_core::CoreError>(())
//! ```
//!
//! ## Durability model
//!
//! Writes are acknowledged by the memory tier and reach disk in governed
//! batches; the journal records each batch and is the sole source of truth
//! at recovery. A crash loses at most the batches whose journal records
//! were not yet flushed - never the integrity of what was: recovery
//! validates every trusted phrase against the actual data-file bytes and
//! drops the whole cache rather than trust a damaged journal.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod cache;
mod config;
mod disk;
mod error;
mod facade;
mod governor;
pub mod journal;
mod mem;
mod recovery;
mod scheduler;
mod types;

pub use cache::{Cache, Lookup};
pub use config::{CacheConfig, DemandBands, WriteRate};
pub use disk::{DiskCache, IndexEntry};
pub use error::{CoreError, CoreResult, GetStatus, PutStatus, ReadStatus};
pub use facade::{CacheUsage, ChunkCache};
pub use governor::{Governor, Grant, WindowEnd};
pub use mem::{MemCache, MemItem};
pub use scheduler::{MaterializeHandle, Scheduler};
pub use types::{Ailments, ContentKey, Marker, MARKER_BITS, MARKER_MAX, MARKER_SPAN};
