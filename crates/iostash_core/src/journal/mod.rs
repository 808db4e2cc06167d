//! Append-only recovery journal.
//!
//! The journal is a bounded, wrapping region of a small file that records
//! batches of writes ("phrases") as fixed-size records. It exists solely so
//! the disk index can be rebuilt after a crash; chunk payloads live in the
//! separate data region.
//!
//! ## Journal format
//!
//! ```text
//! | PhraseHeader | DataEntry * N | PhraseHeader | DataEntry * N | ...
//! ```
//!
//! Every record is 16 bytes. A phrase's entry count is stored in both its
//! first and its last entry, so a scan can validate phrases walking forward
//! from the start of the file or backward from its end. Each header carries
//! a monotonic (mod 2^30) marker and a marker-seeded checksum of the first
//! bytes of the phrase's staged payload, which recovery uses to order
//! phrases and to reject journal entries whose data-region bytes have since
//! been overwritten by a wrap.
//!
//! ## Durability policy
//!
//! Phrases accumulate in memory and reach the file only on `flush`. A flush
//! with no usable file handle is skipped: the staged records are lost, but
//! in-memory state still advances - durability degrades, correctness of the
//! live index does not.

mod record;
mod writer;

pub use record::{
    phrase_hash, DataEntry, PhraseHeader, DATA_CURSOR_BITS, ENTRY_COUNT_BITS, HASH_WINDOW,
    JOURNAL_MAGIC, MAX_DATA_CURSOR, MAX_ENTRY_OFFSET, MAX_ENTRY_SIZE, OFFSET_BITS, RECORD_SIZE,
    SIZE_BITS,
};
pub use writer::{Journal, Phrase};
