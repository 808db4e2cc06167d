//! Core type definitions for iostash.

use std::fmt;

/// 64-bit key identifying a cached chunk.
///
/// Keys are a reduction of a larger content hash and are produced by the
/// caller. The zero key is reserved: the journal uses it for identity
/// padding and unkeyed partial slices, so `put` rejects it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ContentKey(pub u64);

impl ContentKey {
    /// The reserved zero key.
    pub const NONE: Self = Self(0);

    /// Creates a key from a raw 64-bit value.
    #[must_use]
    pub const fn new(key: u64) -> Self {
        Self(key)
    }

    /// Returns the raw key value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns `true` for the reserved zero key.
    #[must_use]
    pub const fn is_none(self) -> bool {
        self.0 == 0
    }

    /// Folds a wider content digest (20 bytes or more) into a 64-bit key.
    ///
    /// The first twenty digest bytes are combined as three little-endian
    /// words: `(w0 + w2) ^ w1`. Shorter digests are zero-extended.
    #[must_use]
    pub fn from_digest(digest: &[u8]) -> Self {
        let mut words = [0u64; 3];
        for (i, word) in words.iter_mut().enumerate() {
            let at = i * 8;
            if at >= digest.len() {
                break;
            }
            let mut raw = [0u8; 8];
            // The third word only covers digest bytes 16..20.
            let take = (digest.len() - at).min(if i == 2 { 4 } else { 8 });
            raw[..take].copy_from_slice(&digest[at..at + take]);
            *word = u64::from_le_bytes(raw);
        }
        Self(words[0].wrapping_add(words[2]) ^ words[1])
    }
}

impl Default for ContentKey {
    fn default() -> Self {
        Self::NONE
    }
}

impl fmt::Display for ContentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "key:{:016x}", self.0)
    }
}

/// Number of value bits in a phrase marker.
pub const MARKER_BITS: u32 = 30;

/// Exclusive upper bound of the marker space (2^30).
pub const MARKER_SPAN: u32 = 1 << MARKER_BITS;

/// Largest representable marker value.
pub const MARKER_MAX: u32 = MARKER_SPAN - 1;

/// Monotonic (mod 2^30) sequence number stamped on each journal phrase.
///
/// Markers order phrases and expose gaps after a journal wrap. Because the
/// space wraps, ordering is not plain integer comparison - see
/// [`Marker::wraps_before`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Marker(u32);

impl Marker {
    /// Number of value bits; equals [`MARKER_BITS`].
    pub const BITS: u32 = MARKER_BITS;

    /// Creates a marker, masking to the 30-bit value space.
    #[must_use]
    pub const fn new(value: u32) -> Self {
        Self(value & MARKER_MAX)
    }

    /// Returns the raw marker value.
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }

    /// Returns the next marker, wrapping at 2^30.
    #[must_use]
    pub const fn next(self) -> Self {
        if self.0 >= MARKER_MAX {
            Self(0)
        } else {
            Self(self.0 + 1)
        }
    }

    /// Wrap-aware "is older than" comparison.
    ///
    /// A marker in the high quarter of the value space is treated as older
    /// than one in the low quarter, so ordering survives the mod-2^30 wrap:
    /// `MARKER_MAX` sorts before `0`.
    #[must_use]
    pub fn wraps_before(self, other: Self) -> bool {
        const LOW_QUARTER: u32 = MARKER_SPAN / 4;
        const HIGH_QUARTER: u32 = 3 * (MARKER_SPAN / 4);

        let (l, r) = (self.0, other.0);
        let wrap = (l < LOW_QUARTER && r >= HIGH_QUARTER) || (r < LOW_QUARTER && l >= HIGH_QUARTER);
        (l < r) != wrap
    }
}

impl fmt::Display for Marker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "marker:{}", self.0)
    }
}

/// Degraded-state flags for the cache's file handles.
///
/// A cache whose journal or data handle could not be opened keeps serving
/// what it can (index-only mode); these flags let callers observe that.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Ailments {
    /// The journal file handle is unavailable; flushes lose durability.
    pub no_journal_handle: bool,
    /// The data file handle is unavailable; reads and writes of chunk
    /// payloads fail with `FileNotOpen`.
    pub no_data_handle: bool,
}

impl Ailments {
    /// Returns `true` when every handle is available.
    #[must_use]
    pub const fn is_healthy(self) -> bool {
        !self.no_journal_handle && !self.no_data_handle
    }

    /// Combines two sets of flags.
    #[must_use]
    pub const fn merge(self, other: Self) -> Self {
        Self {
            no_journal_handle: self.no_journal_handle || other.no_journal_handle,
            no_data_handle: self.no_data_handle || other.no_data_handle,
        }
    }
}
