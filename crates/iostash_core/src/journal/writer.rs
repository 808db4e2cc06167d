//! Journal writer and phrase staging.

use crate::error::CoreResult;
use crate::journal::record::{
    phrase_hash, DataEntry, PhraseHeader, HASH_WINDOW, JOURNAL_MAGIC, MAX_ENTRY_OFFSET,
    MAX_ENTRY_SIZE, RECORD_SIZE,
};
use crate::types::{Ailments, ContentKey, Marker};
use iostash_storage::StorageBackend;
use tracing::warn;

/// One open batch of writes.
///
/// A phrase owns a staging buffer for the payload bytes it will hand to the
/// data region and the journal entries describing them. It is opened against
/// the journal's remaining record budget and closed (or discarded) exactly
/// once.
#[derive(Debug)]
pub struct Phrase {
    staging: Vec<u8>,
    entries: Vec<DataEntry>,
    remaining: u32,
}

impl Phrase {
    /// Appends an item to the phrase.
    ///
    /// `partial_bias` is non-zero only for the slice that completes an item
    /// whose earlier bytes were written by previous phrases; it backdates
    /// the entry's offset and size so the index maps the item to its true
    /// base. Returns whether the phrase can take more entries.
    pub fn add(&mut self, key: ContentKey, data: &[u8], partial_bias: u32) -> bool {
        debug_assert!(self.remaining > 0);
        let size = data.len() as u32;
        debug_assert!(size + partial_bias <= MAX_ENTRY_SIZE);

        self.entries.push(DataEntry {
            key: key.as_u64(),
            offset: self.staging.len() as u32 + partial_bias,
            size: size + partial_bias,
            entry_count: 0,
        });
        self.remaining -= 1;

        self.staging.extend_from_slice(data);

        self.remaining > 0
    }

    /// Whether an item of `size` bytes with the given bias can be added
    /// without exhausting the entry budget or overflowing the record's
    /// offset and size fields.
    #[must_use]
    pub fn fits(&self, size: usize, partial_bias: u32) -> bool {
        self.remaining > 0
            && self.staging.len() as u32 + partial_bias <= MAX_ENTRY_OFFSET
            && size as u32 + partial_bias <= MAX_ENTRY_SIZE
    }

    /// Bytes staged so far.
    #[must_use]
    pub fn data_size(&self) -> u32 {
        self.staging.len() as u32
    }

    /// Entries added so far.
    #[must_use]
    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    /// Remaining entry budget.
    #[must_use]
    pub fn remaining_entries(&self) -> u32 {
        self.remaining
    }

    /// The staged payload bytes.
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.staging
    }

    /// The staged entries.
    #[must_use]
    pub fn entries(&self) -> &[DataEntry] {
        &self.entries
    }

    /// Forgets all entries, keeping the phrase valid for a no-op close.
    ///
    /// Used when the data-region write failed: the journal must not record
    /// entries for bytes that never landed.
    pub fn discard_entries(&mut self) {
        self.entries.clear();
    }
}

/// Builds and persists phrases in a bounded, wrapping region of the journal
/// file.
pub struct Journal {
    backend: Option<Box<dyn StorageBackend>>,
    staged: Vec<u8>,
    cursor: u32,
    marker: Marker,
    max_size: u32,
}

impl Journal {
    /// Creates a journal over `backend` with a byte budget of `max_size`,
    /// aligned down to a whole-record multiple.
    ///
    /// `None` for the backend puts the journal in a degraded mode where
    /// flushes are skipped; see [`Ailments`].
    #[must_use]
    pub fn new(backend: Option<Box<dyn StorageBackend>>, max_size: u32) -> Self {
        Self {
            backend,
            staged: Vec::new(),
            cursor: 0,
            marker: Marker::new(0),
            max_size: max_size & !(RECORD_SIZE as u32 - 1),
        }
    }

    /// Degraded-state flags.
    #[must_use]
    pub fn ailments(&self) -> Ailments {
        Ailments {
            no_journal_handle: self.backend.is_none(),
            ..Ailments::default()
        }
    }

    /// The journal's byte budget.
    #[must_use]
    pub fn max_size(&self) -> u32 {
        self.max_size
    }

    /// Current write offset within the journal file.
    #[must_use]
    pub fn cursor(&self) -> u32 {
        self.cursor
    }

    /// Marker the next closed phrase will carry.
    #[must_use]
    pub fn marker(&self) -> Marker {
        self.marker
    }

    /// Opens a phrase expected to stage around `data_size` payload bytes.
    ///
    /// The phrase's entry budget is what is left of the journal region after
    /// the records already staged this batch, minus the phrase's own header
    /// slot, capped at the 16-bit entry count.
    #[must_use]
    pub fn open_phrase(&self, data_size: u32) -> Phrase {
        debug_assert_eq!(self.cursor as usize % RECORD_SIZE, 0);

        let slots = (self.max_size - self.cursor) as usize / RECORD_SIZE;
        let reserved = self.staged.len() / RECORD_SIZE + 1;
        let max_entries = slots.saturating_sub(reserved).min(usize::from(u16::MAX));

        Phrase {
            staging: Vec::with_capacity(data_size as usize),
            entries: Vec::new(),
            remaining: max_entries as u32,
        }
    }

    /// Closes a phrase, staging its header and entries for the next flush.
    ///
    /// A phrase with no entries discards its reservation. `data_cursor` is
    /// the data-region offset its payload was written to.
    pub fn close_phrase(&mut self, mut phrase: Phrase, data_cursor: u64) {
        if phrase.entries.is_empty() {
            return;
        }

        // A phrase minimally needs a header and one entry, so a single
        // trailing record slot is unusable; consume it with an identity
        // entry instead of stranding it.
        let staged_records = self.staged.len() / RECORD_SIZE;
        let phrase_records = 1 + phrase.entries.len();
        let phrase_end = self.cursor as usize + (staged_records + phrase_records) * RECORD_SIZE;
        if self.max_size as usize - phrase_end == RECORD_SIZE
            && phrase.entries.len() < usize::from(u16::MAX)
        {
            phrase.entries.push(DataEntry {
                key: 0,
                offset: phrase.staging.len() as u32,
                size: 0,
                entry_count: 0,
            });
        }

        // The count lives at both ends so a scan can validate the phrase
        // from either direction.
        let count = phrase.entries.len() as u16;
        if let Some(first) = phrase.entries.first_mut() {
            first.entry_count = count;
        }
        if let Some(last) = phrase.entries.last_mut() {
            last.entry_count = count;
        }

        let hash_len = phrase.staging.len().min(HASH_WINDOW);
        let header = PhraseHeader {
            magic: JOURNAL_MAGIC,
            hash: phrase_hash(&phrase.staging[..hash_len], self.marker.get()),
            marker: self.marker,
            data_cursor,
        };

        self.staged.extend_from_slice(&header.encode());
        for entry in &phrase.entries {
            self.staged.extend_from_slice(&entry.encode());
        }

        self.marker = self.marker.next();
    }

    /// Writes the staged records to the journal file at the current cursor,
    /// wrapping the cursor at capacity. Returns the number of staged bytes.
    ///
    /// With no usable handle the write is skipped; the staged records are
    /// dropped and only durability is lost.
    pub fn flush(&mut self) -> u32 {
        if self.staged.is_empty() {
            return 0;
        }

        let size = self.staged.len() as u32;
        debug_assert!(self.cursor + size <= self.max_size);

        if let Some(backend) = self.backend.as_mut() {
            match backend.write_at(u64::from(self.cursor), &self.staged) {
                Ok(()) => {
                    if let Err(err) = backend.flush() {
                        warn!(%err, "journal file flush failed");
                    }
                    self.cursor += size;
                }
                Err(err) => warn!(%err, "journal write failed; phrase records lost"),
            }
        }

        // A flush can land exactly on the end of the region; wrap
        // immediately in that case.
        if self.cursor >= self.max_size {
            self.cursor = 0;
        }

        self.staged.clear();

        size
    }

    /// Discards all journal state, truncating the file.
    pub fn drop_all(&mut self) {
        if let Some(backend) = self.backend.as_mut() {
            if let Err(err) = backend.truncate(0) {
                warn!(%err, "failed truncating journal file");
            }
        }
        self.cursor = 0;
        self.staged.clear();
    }

    /// Reads the entire journal file, or `None` in degraded mode.
    pub(crate) fn snapshot(&self) -> CoreResult<Option<Vec<u8>>> {
        let Some(backend) = self.backend.as_ref() else {
            return Ok(None);
        };
        let size = backend.size()?;
        Ok(Some(backend.read_at(0, size as usize)?))
    }

    /// Primes cursor and marker from recovered state.
    pub(crate) fn prime(&mut self, cursor: u32, marker: Marker) {
        self.cursor = if cursor >= self.max_size { 0 } else { cursor };
        self.marker = marker;
    }
}

impl std::fmt::Debug for Journal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Journal")
            .field("cursor", &self.cursor)
            .field("marker", &self.marker)
            .field("max_size", &self.max_size)
            .field("staged_bytes", &self.staged.len())
            .finish_non_exhaustive()
    }
}
