//! Crash-recovery loader.
//!
//! Reconstructs the disk index purely from the journal file. The journal is
//! scanned from both ends for structurally valid phrases, the candidates are
//! ordered by wrap-aware marker, trimmed to one continuous run that fits the
//! data region, and then validated against the actual data-file bytes with
//! the marker-seeded phrase hash. Only the validated run is replayed.
//!
//! ## Recovery policy
//!
//! Recovery never partially trusts a damaged journal. Tolerated conditions:
//!
//! - **Missing or empty journal**: recovery yields an empty cache.
//! - **Stale phrases**: journal entries whose data-region bytes were
//!   overwritten by a later wrap fail the hash check and everything older
//!   than them is rejected with them.
//! - **Torn tail**: a phrase cut off mid-write fails structural validation
//!   and is simply not discovered.
//!
//! Abort conditions (the **entire cache is dropped and reinitialized**):
//!
//! - No structurally valid phrase in a non-empty journal
//! - Data file larger than the configured region, or journal file larger
//!   than the configured journal budget (the cache shrank between runs)
//! - Primed cursors landing outside their regions
//! - The data handle being unavailable while a journal exists

use crate::disk::DiskCache;
use crate::error::{CoreError, CoreResult};
use crate::journal::{
    phrase_hash, DataEntry, PhraseHeader, HASH_WINDOW, JOURNAL_MAGIC, RECORD_SIZE,
};
use tracing::debug;

/// One structurally validated phrase found in the journal buffer.
#[derive(Debug, Clone, Copy)]
struct Candidate {
    header: PhraseHeader,
    /// Byte offset of the first entry within the journal buffer.
    first_entry_at: usize,
    /// Entry records in the phrase, padding included.
    entry_count: usize,
    /// Payload bytes the phrase claims in the data region.
    data_size: u32,
    /// Byte offset just past the phrase.
    end: usize,
}

/// Attempts to parse a phrase at `at`.
///
/// Valid only if the header magic matches, the first and last entries agree
/// on the entry count, and the whole record span stays within the buffer.
fn parse_phrase(buf: &[u8], at: usize) -> Option<Candidate> {
    let header_end = at.checked_add(RECORD_SIZE)?;
    if header_end + RECORD_SIZE > buf.len() {
        return None;
    }

    let header = PhraseHeader::decode(&buf[at..header_end]).ok()?;
    if header.magic != JOURNAL_MAGIC {
        return None;
    }

    let first = DataEntry::decode(&buf[header_end..header_end + RECORD_SIZE]).ok()?;
    let entry_count = usize::from(first.entry_count);
    if entry_count == 0 {
        return None;
    }

    let end = header_end.checked_add(entry_count * RECORD_SIZE)?;
    if end > buf.len() {
        return None;
    }

    let last = DataEntry::decode(&buf[end - RECORD_SIZE..end]).ok()?;
    if usize::from(last.entry_count) != entry_count {
        return None;
    }

    Some(Candidate {
        header,
        first_entry_at: header_end,
        entry_count,
        data_size: last.offset + last.size,
        end,
    })
}

/// Collects phrase candidates scanning forward from the buffer start and
/// independently backward from its end. The scans may rediscover the same
/// phrases; duplicates are dropped after sorting.
fn discover(buf: &[u8]) -> Vec<Candidate> {
    let mut candidates = Vec::new();

    // Forward, until the first structural break.
    let mut at = 0;
    while let Some(candidate) = parse_phrase(buf, at) {
        at = candidate.end;
        candidates.push(candidate);
    }
    let left = at;

    // Backward from the end: each phrase's last entry tells us how far back
    // its header sits.
    let mut right = buf.len();
    while right >= left + 2 * RECORD_SIZE {
        let Ok(last) = DataEntry::decode(&buf[right - RECORD_SIZE..right]) else {
            break;
        };
        let span = (usize::from(last.entry_count) + 1) * RECORD_SIZE;
        let Some(header_at) = right.checked_sub(span) else {
            break;
        };
        if usize::from(last.entry_count) == 0 {
            break;
        }

        let Some(candidate) = parse_phrase(buf, header_at) else {
            break;
        };
        candidates.push(candidate);
        right = header_at;
    }

    candidates.sort_by(|a, b| {
        if a.header.marker.wraps_before(b.header.marker) {
            std::cmp::Ordering::Less
        } else if b.header.marker.wraps_before(a.header.marker) {
            std::cmp::Ordering::Greater
        } else {
            // Same marker: keep buffer order for deterministic dedup.
            a.first_entry_at.cmp(&b.first_entry_at)
        }
    });
    candidates.dedup_by_key(|candidate| candidate.first_entry_at);

    candidates
}

/// Index of the oldest candidate that is part of one continuous run ending
/// at the newest, within the data region's capacity.
fn basis_boundary(candidates: &[Candidate], max_data_size: u64) -> usize {
    let mut basis = candidates.len() - 1;
    let mut remaining = max_data_size as i64 - i64::from(candidates[basis].data_size);

    while basis > 0 {
        let newer = &candidates[basis];
        let older = &candidates[basis - 1];

        if older.header.marker.next() != newer.header.marker {
            break;
        }

        remaining -= i64::from(older.data_size);
        if remaining < 0 {
            break;
        }

        basis -= 1;
    }

    basis
}

impl DiskCache {
    /// Rebuilds the index from the journal.
    ///
    /// Returns `Ok(true)` when phrases were replayed, `Ok(false)` for a
    /// missing or empty journal.
    ///
    /// # Errors
    ///
    /// Returns `RecoveryAborted` on any structural or validation failure;
    /// the caller must respond by dropping the cache. Storage errors while
    /// reading the journal propagate as-is.
    pub fn load(&self) -> CoreResult<bool> {
        let mut state = self.state.lock();
        let mut index = self.index.write();

        let Some(buf) = state.journal.snapshot()? else {
            return Ok(false);
        };
        if buf.is_empty() {
            return Ok(false);
        }

        debug!(journal_bytes = buf.len(), "journal found");

        let candidates = discover(&buf);
        debug!(candidates = candidates.len(), "phrases discovered");

        if candidates.is_empty() {
            return Err(CoreError::recovery_aborted(
                "no valid phrase in non-empty journal",
            ));
        }

        let Some(data) = state.data.as_ref() else {
            return Err(CoreError::recovery_aborted("data file unavailable"));
        };

        let data_file_size = data.size()?;
        if data_file_size > self.max_data_size {
            return Err(CoreError::recovery_aborted(
                "existing data file exceeds configured region",
            ));
        }
        if buf.len() > state.journal.max_size() as usize {
            return Err(CoreError::recovery_aborted(
                "existing journal exceeds configured budget",
            ));
        }

        // From the basis boundary forward, the first phrase whose data-file
        // bytes still hash correctly becomes the trusted basis. Earlier
        // writes may be stale data overwritten without a matching journal
        // flush; a hash mismatch rejects them.
        let basis = basis_boundary(&candidates, self.max_data_size);
        let mut trusted = None;
        for (idx, candidate) in candidates.iter().enumerate().skip(basis) {
            let mut base = candidate.header.data_cursor;
            if base + u64::from(candidate.data_size) > self.max_data_size {
                base = 0;
            }

            let hash_len = (candidate.data_size as usize).min(HASH_WINDOW);
            if base + hash_len as u64 > data_file_size {
                continue;
            }
            let Ok(prefix) = data.read_at(base, hash_len) else {
                continue;
            };

            if phrase_hash(&prefix, candidate.header.marker.get()) == candidate.header.hash {
                trusted = Some(idx);
                break;
            }
        }

        // Replay every entry from the trusted basis forward, newest last so
        // later phrases win.
        let mut replayed = 0usize;
        if let Some(trusted) = trusted {
            for candidate in &candidates[trusted..] {
                let mut entries = Vec::with_capacity(candidate.entry_count);
                for i in 0..candidate.entry_count {
                    let at = candidate.first_entry_at + i * RECORD_SIZE;
                    entries.push(DataEntry::decode(&buf[at..at + RECORD_SIZE])?);
                }
                index.insert_phrase(candidate.header.data_cursor, &entries, self.max_data_size);
                replayed += entries.len();
            }
        }

        debug!(
            replayed,
            mapped_bytes = index.mapped_bytes,
            "journal replayed"
        );

        // Prime live cursors just past the newest phrase.
        let last = candidates[candidates.len() - 1];
        state
            .journal
            .prime(last.end as u32, last.header.marker.next());

        let data_cursor = last.header.data_cursor + u64::from(last.data_size);
        if data_cursor > self.max_data_size {
            return Err(CoreError::recovery_aborted("data cursor out of range"));
        }
        state.data_cursor = data_cursor;
        state.over_removal = 0;

        Ok(true)
    }
}
