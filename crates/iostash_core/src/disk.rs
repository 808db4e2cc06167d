//! Circular on-disk data store and its key-to-location index.

use crate::journal::{DataEntry, Journal, Phrase, MAX_DATA_CURSOR};
use crate::types::{Ailments, ContentKey};
use crate::ReadStatus;
use iostash_storage::StorageBackend;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use tracing::{trace, warn};

/// Data-region capacity is aligned down to this block size.
const DATA_BLOCK_ALIGN: u64 = 1 << 20;

/// Durable location of one chunk within the data region.
///
/// `data_cursor` is bounded by the 34-bit journal header field and `size` by
/// the 25-bit entry field; both bounds are enforced where entries are made.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    /// Byte offset of the chunk within the data file.
    pub data_cursor: u64,
    /// Chunk size in bytes.
    pub size: u32,
}

/// The disk index: key to location, plus a running byte total.
#[derive(Debug, Default)]
pub(crate) struct DataMap {
    pub(crate) map: HashMap<u64, IndexEntry>,
    pub(crate) mapped_bytes: u64,
}

impl DataMap {
    /// Removes entries overlapping `[base, base + size)`, which is about to
    /// be overwritten.
    ///
    /// `over_removal` is the carry from the previous prune: bytes already
    /// removed beyond what that prune strictly needed. Returns the new
    /// carry, so consecutive small writes do not re-scan the map.
    fn prune(&mut self, base: u64, size: u32, over_removal: u32) -> u32 {
        let mut removed = i64::from(over_removal);
        if removed >= i64::from(size) {
            return over_removal - size;
        }

        let a0 = base as i64;
        let a1 = base as i64 + i64::from(size);

        let mut overage: i64 = 0;
        let mut carry = 0u32;
        let mut doomed = Vec::new();

        for (&key, candidate) in &self.map {
            let b0 = candidate.data_cursor as i64;
            let b1 = candidate.data_cursor as i64 + i64::from(candidate.size);

            let outside = b0 >= a1 || b1 <= a0;
            if outside {
                continue;
            }

            doomed.push(key);
            overage = overage.max(b1 - a1);
            removed += b1 - b0;
            if removed - overage >= i64::from(size) {
                carry = overage as u32;
                break;
            }
        }

        for key in doomed {
            if let Some(entry) = self.map.remove(&key) {
                self.mapped_bytes -= u64::from(entry.size);
            }
        }

        carry
    }

    /// Records a closed phrase's entries, keyed by content key.
    ///
    /// The first entry's offset carries the partial bias: subtracting it
    /// from the base maps an item completed across several phrases back to
    /// where its first byte actually landed. Zero-size entries remove their
    /// key; the zero key (identity padding, unkeyed partial slices) is
    /// skipped.
    pub(crate) fn insert_phrase(&mut self, base: u64, entries: &[DataEntry], max_data_size: u64) {
        let mut bias = entries.first().map_or(0, |entry| entry.offset);

        let mut total: i64 = 0;
        for entry in entries {
            let mut entry = *entry;
            entry.offset -= bias;
            total += self.insert_one(base.saturating_sub(u64::from(bias)), entry, max_data_size);
            bias = 0;
        }

        self.mapped_bytes = self.mapped_bytes.saturating_add_signed(total);
    }

    fn insert_one(&mut self, base: u64, entry: DataEntry, max_data_size: u64) -> i64 {
        if entry.key == 0 {
            return 0;
        }

        if entry.size == 0 {
            return match self.map.remove(&entry.key) {
                Some(prev) => -i64::from(prev.size),
                None => 0,
            };
        }

        let data_cursor = base + u64::from(entry.offset);
        if data_cursor >= max_data_size {
            warn!(key = entry.key, data_cursor, "index entry out of range; skipped");
            return 0;
        }

        let prev = self.map.insert(
            entry.key,
            IndexEntry {
                data_cursor,
                size: entry.size,
            },
        );
        i64::from(entry.size) - prev.map_or(0, |prev| i64::from(prev.size))
    }
}

/// Worker-side mutable state: backends, journal, and file cursors.
///
/// Only the background thread mutates this; the mutex exists for the
/// occasional cross-thread read (materialize, usage) rather than for
/// write-write contention.
pub(crate) struct DiskState {
    pub(crate) data: Option<Box<dyn StorageBackend>>,
    pub(crate) journal: Journal,
    pub(crate) data_cursor: u64,
    pub(crate) over_removal: u32,
}

/// Bounded, wrapping byte region plus a key-to-location index, with
/// structural bookkeeping delegated to the journal.
pub struct DiskCache {
    pub(crate) index: RwLock<DataMap>,
    pub(crate) state: Mutex<DiskState>,
    pub(crate) max_data_size: u64,
}

impl DiskCache {
    /// Creates a disk store over the given data backend and journal.
    ///
    /// The data region gets `disk_quota` minus the journal's budget,
    /// aligned down to a 1 MiB block and capped at the 34-bit cursor bound
    /// (16 GiB). `None` for the data backend degrades the store to
    /// index-only mode.
    #[must_use]
    pub fn new(data: Option<Box<dyn StorageBackend>>, journal: Journal, disk_quota: u64) -> Self {
        let max_data_size = disk_quota
            .saturating_sub(u64::from(journal.max_size()))
            .min(MAX_DATA_CURSOR + 1)
            & !(DATA_BLOCK_ALIGN - 1);

        Self {
            index: RwLock::new(DataMap::default()),
            state: Mutex::new(DiskState {
                data,
                journal,
                data_cursor: 0,
                over_removal: 0,
            }),
            max_data_size,
        }
    }

    /// Degraded-state flags for both file handles.
    #[must_use]
    pub fn ailments(&self) -> Ailments {
        let state = self.state.lock();
        state.journal.ailments().merge(Ailments {
            no_data_handle: state.data.is_none(),
            ..Ailments::default()
        })
    }

    /// Data-region capacity in bytes.
    #[must_use]
    pub fn max_data_size(&self) -> u64 {
        self.max_data_size
    }

    /// Opens a phrase against the journal's remaining budget.
    #[must_use]
    pub fn open_phrase(&self, data_size: u32) -> Phrase {
        self.state.lock().journal.open_phrase(data_size)
    }

    /// Writes a phrase's staged bytes at the data cursor, updates the index
    /// (prune then insert), and closes the phrase into the journal.
    ///
    /// A failed data write discards the phrase's entries: the items are
    /// lost, not corrupted, and neither index nor journal record them.
    pub fn close_phrase(&self, mut phrase: Phrase) {
        let mut state = self.state.lock();

        if phrase.data_size() == 0 {
            state.journal.close_phrase(phrase, 0);
            return;
        }

        if state.data.is_none() {
            phrase.discard_entries();
            state.journal.close_phrase(phrase, 0);
            return;
        }

        let write_size = phrase.data_size();
        let base = state.data_cursor;
        debug_assert!(base + u64::from(write_size) <= self.max_data_size);

        let write_ok = match state.data.as_mut() {
            Some(data) => match data.write_at(base, phrase.payload()) {
                Ok(()) => true,
                Err(err) => {
                    warn!(%err, "data region write failed; dropping phrase");
                    false
                }
            },
            None => false,
        };

        if !write_ok {
            phrase.discard_entries();
            state.journal.close_phrase(phrase, 0);
            return;
        }

        {
            let mut index = self.index.write();
            let carry = state.over_removal;
            state.over_removal = index.prune(base, write_size, carry);
            index.insert_phrase(base, phrase.entries(), self.max_data_size);
        }

        state.journal.close_phrase(phrase, base);
        state.data_cursor += u64::from(write_size);
    }

    /// Whether the key is present in the disk index.
    #[must_use]
    pub fn has(&self, key: ContentKey) -> bool {
        self.index.read().map.contains_key(&key.as_u64())
    }

    /// Removes the key from the disk index. The bytes stay on disk until
    /// overwritten; only the mapping is gone.
    pub fn evict(&self, key: ContentKey) -> bool {
        let mut index = self.index.write();
        match index.map.remove(&key.as_u64()) {
            Some(entry) => {
                index.mapped_bytes -= u64::from(entry.size);
                true
            }
            None => false,
        }
    }

    /// Reads a chunk's bytes into `out`, starting `offset` bytes in.
    ///
    /// An empty `out` is resized to the remaining chunk length; a pre-sized
    /// `out` caps the read at its length.
    pub fn materialize(&self, key: ContentKey, out: &mut Vec<u8>, offset: u32) -> ReadStatus {
        let state = self.state.lock();

        let Some(data) = state.data.as_ref() else {
            return ReadStatus::FileNotOpen;
        };

        let (entry_cursor, mut read_size) = {
            let index = self.index.read();
            let Some(entry) = index.map.get(&key.as_u64()) else {
                return ReadStatus::NotFound;
            };
            (entry.data_cursor, entry.size.saturating_sub(offset))
        };

        if out.is_empty() {
            out.resize(read_size as usize, 0);
        }
        read_size = read_size.min(out.len() as u32);

        let file_size = data.size().unwrap_or(0);
        let read_at = entry_cursor + u64::from(offset);
        if read_at + u64::from(read_size) > file_size {
            return ReadStatus::ReadError;
        }

        match data.read_at(read_at, read_size as usize) {
            Ok(bytes) => {
                out.truncate(bytes.len());
                out.copy_from_slice(&bytes);
                ReadStatus::Ok
            }
            Err(err) => {
                warn!(%err, %key, "data region read failed");
                ReadStatus::ReadError
            }
        }
    }

    /// Syncs the data file and flushes the journal. Returns the number of
    /// journal bytes committed.
    pub fn flush(&self) -> u32 {
        let mut state = self.state.lock();

        if let Some(data) = state.data.as_mut() {
            if let Err(err) = data.sync() {
                warn!(%err, "data region sync failed");
            }
        }

        let written = state.journal.flush();

        trace!(
            mapped_kib = self.index.read().mapped_bytes >> 10,
            entries = self.index.read().map.len(),
            data_cursor = state.data_cursor,
            journal_cursor = state.journal.cursor(),
            marker = state.journal.marker().get(),
            "flushed"
        );

        written
    }

    /// Discards everything: files truncated, index cleared, cursors reset.
    pub fn drop_cache(&self) {
        let mut state = self.state.lock();
        let mut index = self.index.write();

        if let Some(data) = state.data.as_mut() {
            if let Err(err) = data.truncate(0) {
                warn!(%err, "failed truncating data file");
            }
        }
        state.journal.drop_all();

        state.data_cursor = 0;
        state.over_removal = 0;
        index.map.clear();
        index.mapped_bytes = 0;
    }

    /// Distance from the data cursor to the wrap point, wrapping first if
    /// the cursor has reached capacity.
    ///
    /// Callers use this to truncate a write short of the wrap rather than
    /// splitting it across the boundary.
    pub fn remaining_until_wrap(&self) -> u64 {
        let mut state = self.state.lock();
        if state.data_cursor >= self.max_data_size {
            state.data_cursor = 0;
            state.over_removal = 0;
        }
        self.max_data_size - state.data_cursor
    }

    /// Indexed bytes and data-region capacity.
    #[must_use]
    pub fn usage(&self) -> (u64, u64) {
        (self.index.read().mapped_bytes, self.max_data_size)
    }

    /// Visits every indexed entry.
    pub fn visit(&self, mut visitor: impl FnMut(ContentKey, u32)) -> usize {
        let index = self.index.read();
        for (&key, entry) in &index.map {
            visitor(ContentKey::new(key), entry.size);
        }
        index.map.len()
    }
}

impl std::fmt::Debug for DiskCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let index = self.index.read();
        f.debug_struct("DiskCache")
            .field("entries", &index.map.len())
            .field("mapped_bytes", &index.mapped_bytes)
            .field("max_data_size", &self.max_data_size)
            .finish_non_exhaustive()
    }
}
