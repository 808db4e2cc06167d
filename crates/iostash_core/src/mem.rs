//! Bounded in-memory tier of the cache.

use crate::types::ContentKey;
use bytes::Bytes;

/// Multiplier for the pseudo-random eviction walk.
const WALK_MULTIPLIER: usize = 0x9e37_79b1;

/// One resident item.
///
/// A zero-length `data` is a tombstone: an eviction that must still flow
/// through the journal so it is observable after a crash.
#[derive(Debug, Clone)]
pub struct MemItem {
    /// The item's content key. Zero for unkeyed partial slices.
    pub key: ContentKey,
    /// The item's payload.
    pub data: Bytes,
}

/// Bounded in-RAM map of key to bytes with randomized eviction and
/// tombstone markers.
///
/// Items live here between `put` and the flush that peels them onto disk.
/// The tier is not internally synchronized; callers wrap it in a lock.
#[derive(Debug)]
pub struct MemCache {
    max_size: u32,
    used_size: u32,
    items: Vec<MemItem>,
}

impl MemCache {
    /// Creates a tier with the given byte capacity.
    #[must_use]
    pub fn new(max_size: u32) -> Self {
        Self {
            max_size,
            used_size: 0,
            items: Vec::new(),
        }
    }

    /// Memory pressure as a fill percentage.
    #[must_use]
    pub fn demand(&self) -> u32 {
        if self.max_size == 0 {
            return 0;
        }
        ((u64::from(self.used_size) * 100) / u64::from(self.max_size)) as u32
    }

    /// Number of resident items, tombstones included.
    #[must_use]
    pub fn count(&self) -> usize {
        self.items.len()
    }

    /// Resident payload bytes.
    #[must_use]
    pub fn used(&self) -> u32 {
        self.used_size
    }

    /// The tier's byte capacity.
    #[must_use]
    pub fn capacity(&self) -> u32 {
        self.max_size
    }

    /// Looks up a live item. Tombstones read as absent.
    #[must_use]
    pub fn get(&self, key: ContentKey) -> Option<&Bytes> {
        for item in &self.items {
            if item.key == key {
                return if item.data.is_empty() {
                    None
                } else {
                    Some(&item.data)
                };
            }
        }
        None
    }

    /// Inserts an item, evicting others if the tier is over capacity.
    ///
    /// Returns `false` if the item is empty or larger than the whole tier.
    /// Re-putting a resident key is an accepted no-op: keys are content
    /// derived, so same key means same bytes.
    pub fn put(&mut self, key: ContentKey, data: Bytes) -> bool {
        if self.get(key).is_some() {
            return true;
        }

        let size = data.len() as u32;
        if size == 0 || self.max_size < size {
            return false;
        }

        if self.used_size + size > self.max_size {
            self.drop_random(size);
        }

        self.items.push(MemItem { key, data });
        self.used_size += size;
        true
    }

    /// Removes an item if resident.
    ///
    /// With `always` set, a tombstone is inserted regardless, so the
    /// eviction reaches the next flush even when nothing was resident here.
    pub fn evict(&mut self, key: ContentKey, always: bool) -> bool {
        let mut evicted = false;
        for i in 0..self.items.len() {
            if self.items[i].key != key {
                continue;
            }
            self.used_size -= self.items[i].data.len() as u32;
            self.items.swap_remove(i);
            evicted = true;
            break;
        }

        if always {
            self.items.push(MemItem {
                key,
                data: Bytes::new(),
            });
        }

        evicted
    }

    /// Removes items until at least `threshold` bytes are out, appending
    /// them to `out`. Returns the number of bytes removed.
    ///
    /// Items are sorted so that those peeled first are at the end: largest
    /// first, except tombstones, which always peel before anything else.
    pub fn peel(&mut self, threshold: u32, out: &mut Vec<MemItem>) -> u32 {
        self.items.sort_by(|a, b| {
            let (la, lb) = (a.data.len(), b.data.len());
            if la == 0 || lb == 0 {
                // Zero-size sorts last so it peels first.
                lb.cmp(&la)
            } else {
                la.cmp(&lb)
            }
        });

        let mut dropped: u32 = 0;
        while dropped < threshold {
            let Some(item) = self.items.pop() else {
                break;
            };
            dropped += item.data.len() as u32;
            out.push(item);
        }

        self.used_size -= dropped;
        dropped
    }

    /// Visits every resident item.
    pub fn visit(&self, mut visitor: impl FnMut(ContentKey, u32)) -> usize {
        for item in &self.items {
            visitor(item.key, item.data.len() as u32);
        }
        self.items.len()
    }

    /// Evicts pseudo-randomly walked items until `size` bytes are free.
    fn drop_random(&mut self, size: u32) {
        let mut walk = size as usize;
        let mut dropped: u32 = 0;
        let target = size.min(self.used_size);

        for _ in (0..self.items.len()).rev() {
            if dropped >= target {
                break;
            }

            let n = self.items.len();
            let index = if n > 1 {
                walk.wrapping_mul(WALK_MULTIPLIER) % n
            } else {
                0
            };

            walk = self.items[index].data.len();
            dropped += walk as u32;
            self.items.swap_remove(index);
        }

        self.used_size -= dropped;
    }
}
