//! Storage backend trait definition.

use crate::error::StorageResult;

/// A low-level storage backend for iostash.
///
/// Storage backends are **opaque byte stores**. They provide simple
/// operations for reading, writing, and flushing data at explicit offsets.
/// iostash owns all file format interpretation - backends do not understand
/// journal records, phrases, or cache entries.
///
/// # Invariants
///
/// - `read_at` returns exactly the bytes previously written at that offset
/// - `write_at` may extend the storage; bytes between the old end and the
///   write offset read back as zero
/// - `flush` ensures all written data is durable
/// - Backends must be `Send + Sync` for concurrent access
///
/// # Implementors
///
/// - [`super::InMemoryBackend`] - For testing
/// - [`super::FileBackend`] - For persistent storage
pub trait StorageBackend: Send + Sync {
    /// Reads `len` bytes starting at `offset`.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The offset is beyond the current size
    /// - The read would extend beyond the current size
    /// - An I/O error occurs
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>>;

    /// Writes `data` starting at `offset`, extending the storage if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if an I/O error occurs.
    fn write_at(&mut self, offset: u64, data: &[u8]) -> StorageResult<()>;

    /// Flushes all pending writes to durable storage.
    ///
    /// After this returns successfully, all previously written data is
    /// guaranteed to survive process termination.
    ///
    /// # Errors
    ///
    /// Returns an error if the flush operation fails.
    fn flush(&mut self) -> StorageResult<()>;

    /// Returns the current size of the storage in bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the size cannot be determined.
    fn size(&self) -> StorageResult<u64>;

    /// Syncs all data and metadata to durable storage.
    ///
    /// This is a stronger guarantee than `flush` - it ensures that file
    /// metadata (size, timestamps) is also durable.
    ///
    /// # Errors
    ///
    /// Returns an error if the sync operation fails.
    fn sync(&mut self) -> StorageResult<()>;

    /// Truncates the storage to the given size.
    ///
    /// This removes all data after the specified offset. Truncating to zero
    /// is how a cache region is dropped.
    ///
    /// # Arguments
    ///
    /// * `new_size` - The new size of the storage (offset to truncate to)
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The truncation fails
    /// - `new_size` is greater than current size
    fn truncate(&mut self, new_size: u64) -> StorageResult<()>;
}
