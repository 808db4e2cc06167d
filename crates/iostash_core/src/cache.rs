//! Two-tier cache composite: memory tier + disk store + in-flight partial.

use crate::config::CacheConfig;
use crate::disk::DiskCache;
use crate::journal::{Journal, MAX_ENTRY_OFFSET};
use crate::mem::{MemCache, MemItem};
use crate::types::{Ailments, ContentKey};
use crate::ReadStatus;
use bytes::Bytes;
use iostash_storage::StorageBackend;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::{debug, warn};

/// Bytes of an item straddling two flush cycles.
///
/// While in flight the item lives in neither tier: its earlier slices are on
/// disk but unindexed, the rest is here. `key == NONE` means no partial.
#[derive(Debug, Default)]
struct Partial {
    key: ContentKey,
    data: Bytes,
    cursor: u32,
}

/// Memory-side state, guarded by one lock: the tier and the partial.
#[derive(Debug)]
struct MemSide {
    tier: MemCache,
    partial: Partial,
}

/// Where a key's bytes are resident.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    /// Resident in the memory tier or the in-flight partial.
    Memory(Bytes),
    /// Durable on disk; read it with [`Cache::materialize`].
    Disk,
    /// Not cached.
    Absent,
}

/// One two-tier cache instance.
///
/// All operations are synchronous; the background scheduler drives
/// [`Cache::write_mem_to_disk`] and [`Cache::flush`] and serves materialize
/// requests. Items are bounded to 2^23 - 1 bytes each - the journal's
/// offset field must be able to backdate an item completed across phrases.
pub struct Cache {
    mem: RwLock<MemSide>,
    disk: DiskCache,
    demand: AtomicU32,
}

impl Cache {
    /// Creates a cache over an existing disk store.
    #[must_use]
    pub fn new(memory_quota: u32, disk: DiskCache) -> Self {
        Self {
            mem: RwLock::new(MemSide {
                tier: MemCache::new(memory_quota),
                partial: Partial::default(),
            }),
            disk,
            demand: AtomicU32::new(0),
        }
    }

    /// Creates a cache from configuration and pre-opened backends.
    ///
    /// `None` backends degrade the corresponding concern; see [`Ailments`].
    #[must_use]
    pub fn with_backends(
        config: &CacheConfig,
        data: Option<Box<dyn StorageBackend>>,
        journal: Option<Box<dyn StorageBackend>>,
    ) -> Self {
        let journal = Journal::new(journal, config.journal_quota);
        let disk = DiskCache::new(data, journal, config.disk_quota);
        let cache = Self::new(config.memory_quota, disk);
        if config.drop_cache {
            cache.disk.drop_cache();
        }
        cache
    }

    /// Rebuilds the disk index from the journal.
    ///
    /// Any recovery failure drops the whole cache and starts empty; partial
    /// trust is never applied. Returns whether anything was recovered.
    pub fn load(&self) -> bool {
        match self.disk.load() {
            Ok(loaded) => loaded,
            Err(err) => {
                warn!(%err, "cache recovery failed; reinitializing empty");
                self.disk.drop_cache();
                false
            }
        }
    }

    /// Discards all cached state, on disk and in memory.
    pub fn drop_cache(&self) {
        {
            let mut mem = self.mem.write();
            mem.tier = MemCache::new(mem.tier.capacity());
            mem.partial = Partial::default();
        }
        self.demand.store(0, Ordering::Relaxed);
        self.disk.drop_cache();
    }

    /// Memory-tier fill percentage, readable without taking the lock.
    #[must_use]
    pub fn demand(&self) -> u32 {
        self.demand.load(Ordering::Relaxed)
    }

    /// Degraded-state flags.
    #[must_use]
    pub fn ailments(&self) -> Ailments {
        self.disk.ailments()
    }

    /// Whether the key is cached anywhere: disk index, memory tier, or the
    /// in-flight partial.
    #[must_use]
    pub fn has(&self, key: ContentKey) -> bool {
        if key.is_none() {
            return false;
        }
        if self.disk.has(key) {
            return true;
        }

        let mem = self.mem.read();
        mem.tier.get(key).is_some() || mem.partial.key == key
    }

    /// Looks the key up without touching the data file.
    ///
    /// Disk is checked first: it holds more data and is the likelier hit.
    #[must_use]
    pub fn get(&self, key: ContentKey) -> Lookup {
        if key.is_none() {
            return Lookup::Absent;
        }
        if self.disk.has(key) {
            return Lookup::Disk;
        }

        let mem = self.mem.read();
        if mem.partial.key == key {
            return Lookup::Memory(mem.partial.data.clone());
        }
        if let Some(data) = mem.tier.get(key) {
            return Lookup::Memory(data.clone());
        }
        Lookup::Absent
    }

    /// Inserts an item into the memory tier.
    ///
    /// Rejects the reserved zero key, empty payloads, payloads over the
    /// per-item bound, and payloads larger than the tier.
    pub fn put(&self, key: ContentKey, data: Bytes) -> bool {
        if key.is_none() || data.len() > MAX_ENTRY_OFFSET as usize {
            return false;
        }

        let mut mem = self.mem.write();
        let ok = mem.tier.put(key, data);
        if ok {
            self.demand.store(mem.tier.demand(), Ordering::Relaxed);
        }
        ok
    }

    /// Removes the key everywhere: disk index, memory tier, and the
    /// in-flight partial.
    ///
    /// When the key was disk-resident a tombstone is planted in the memory
    /// tier so the eviction reaches the journal at the next flush, even
    /// across a wraparound that could otherwise resurrect stale bytes.
    pub fn evict(&self, key: ContentKey) -> bool {
        if key.is_none() {
            return false;
        }
        let mut ok = self.disk.evict(key);

        let mut mem = self.mem.write();
        ok |= mem.tier.evict(key, ok);
        self.demand.store(mem.tier.demand(), Ordering::Relaxed);

        if mem.partial.key == key {
            mem.partial = Partial::default();
            ok = true;
        }

        ok
    }

    /// Reads a disk-resident chunk into `out`; see [`DiskCache::materialize`].
    pub fn materialize(&self, key: ContentKey, out: &mut Vec<u8>, offset: u32) -> ReadStatus {
        self.disk.materialize(key, out, offset)
    }

    /// Commits staged journal records and syncs the data file.
    pub fn flush(&self) -> u32 {
        self.disk.flush()
    }

    /// Indexed disk bytes and data-region capacity.
    #[must_use]
    pub fn usage(&self) -> (u64, u64) {
        self.disk.usage()
    }

    /// Visits every resident entry across both tiers and the partial.
    /// The visitor receives `(key, size, in_memory)`.
    pub fn visit(&self, mut visitor: impl FnMut(ContentKey, u32, bool)) -> usize {
        let mem = self.mem.read();
        let mut count = mem.tier.visit(|key, size| visitor(key, size, true));
        count += self.disk.visit(|key, size| visitor(key, size, false));
        if !mem.partial.key.is_none() {
            visitor(mem.partial.key, mem.partial.data.len() as u32, true);
            count += 1;
        }
        count
    }

    /// Moves up to `allowance` bytes from the memory tier to the disk store.
    ///
    /// Order of business:
    ///
    /// 1. The allowance is truncated at the data region's wrap point; a
    ///    write never straddles the wrap.
    /// 2. An in-flight partial drains first, continuing the previous call's
    ///    short flush. The slice that completes it carries a bias that
    ///    backdates its journal entry to the item's true base.
    /// 3. The memory tier peels items (tombstones first, then largest).
    /// 4. If the peel overshoots the allowance, the excess is re-wrapped
    ///    into a new partial for the next call rather than written.
    /// 5. The drained items are distributed across one or more phrases,
    ///    each bounded by the journal's remaining entry budget and the
    ///    record field widths.
    ///
    /// Returns the bytes actually staged for the data region.
    pub fn write_mem_to_disk(&self, allowance: u32) -> u32 {
        let mut allowance = allowance;
        let mut at_wrap = false;
        let until_wrap = self.disk.remaining_until_wrap();
        if until_wrap <= u64::from(allowance) {
            at_wrap = true;
            allowance = until_wrap as u32;
        }

        let mut partial_bias = 0u32;
        let mut items: Vec<MemItem> = Vec::new();
        let mut write_size = 0u32;
        {
            let mut mem = self.mem.write();

            // Drain the in-flight partial first.
            if !mem.partial.key.is_none() {
                let begin = mem.partial.cursor as usize;
                let end = (begin + allowance as usize).min(mem.partial.data.len());
                let slice = mem.partial.data.slice(begin..end);
                let slice_size = slice.len() as u32;

                mem.partial.cursor += slice_size;
                write_size += slice_size;

                let mut item = MemItem {
                    key: ContentKey::NONE,
                    data: slice,
                };
                if mem.partial.cursor as usize >= mem.partial.data.len() {
                    // Completed: the entry must map back to the item's base.
                    item.key = mem.partial.key;
                    partial_bias = mem.partial.data.len() as u32 - slice_size;
                    mem.partial = Partial::default();
                } else if at_wrap {
                    // The slices written so far sit just before the wrap
                    // point; the item must restart contiguously after it.
                    mem.partial.cursor = 0;
                }
                items.push(item);
            }

            if write_size < allowance {
                write_size += mem.tier.peel(allowance - write_size, &mut items);
                self.demand.store(mem.tier.demand(), Ordering::Relaxed);
            }

            // Re-wrap any overshoot into a new partial.
            let overshoot = write_size.saturating_sub(allowance);
            if overshoot > 0 {
                if let Some(item) = items.pop() {
                    let partial_size = item.data.len() - overshoot as usize;
                    items.push(MemItem {
                        key: ContentKey::NONE,
                        data: item.data.slice(..partial_size),
                    });
                    write_size -= overshoot;

                    mem.partial = Partial {
                        key: item.key,
                        cursor: if at_wrap { 0 } else { partial_size as u32 },
                        data: item.data,
                    };
                }
            }
        }

        if items.is_empty() {
            return 0;
        }
        debug_assert!(write_size <= allowance);

        // Distribute across phrases. Entry budget or field-width pressure
        // closes a phrase and opens the next; an exhausted journal region
        // drops whatever is left.
        let mut staged = 0u32;
        let mut remaining: u32 = write_size;
        let mut index = 0;
        'fill: while index < items.len() {
            let mut phrase = self.disk.open_phrase(remaining);
            if phrase.remaining_entries() == 0 {
                debug!(
                    dropped_items = items.len() - index,
                    "journal region exhausted; dropping peeled items"
                );
                break;
            }

            while index < items.len() {
                let item = &items[index];
                if !phrase.fits(item.data.len(), partial_bias) {
                    if phrase.entry_count() == 0 {
                        // Unplaceable even in a fresh phrase.
                        debug!(key = %item.key, "item exceeds phrase bounds; dropped");
                        staged += phrase.data_size();
                        remaining = remaining.saturating_sub(phrase.data_size());
                        self.disk.close_phrase(phrase);
                        break 'fill;
                    }
                    break;
                }
                let more = phrase.add(item.key, &item.data, partial_bias);
                partial_bias = 0;
                index += 1;
                if !more {
                    break;
                }
            }

            staged += phrase.data_size();
            remaining = remaining.saturating_sub(phrase.data_size());
            self.disk.close_phrase(phrase);
        }

        staged
    }
}

impl std::fmt::Debug for Cache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cache")
            .field("demand", &self.demand())
            .field("disk", &self.disk)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use iostash_storage::InMemoryBackend;

    fn config() -> CacheConfig {
        CacheConfig::new()
            .memory_quota(512 << 10)
            .disk_quota(8 << 20)
            .journal_quota(8 << 10)
    }

    fn cache_with(config: &CacheConfig) -> Cache {
        Cache::with_backends(
            config,
            Some(Box::new(InMemoryBackend::new())),
            Some(Box::new(InMemoryBackend::new())),
        )
    }

    fn cache() -> Cache {
        cache_with(&config())
    }

    /// Simulates a process restart: snapshots both files and rebuilds.
    fn restart(cache: &Cache, config: &CacheConfig) -> Cache {
        let state = cache.disk.state.lock();
        let journal_bytes = state.journal.snapshot().unwrap().unwrap();
        let data = state.data.as_ref().unwrap();
        let data_bytes = data.read_at(0, data.size().unwrap() as usize).unwrap();
        drop(state);

        let reborn = Cache::with_backends(
            config,
            Some(Box::new(InMemoryBackend::with_data(data_bytes))),
            Some(Box::new(InMemoryBackend::with_data(journal_bytes))),
        );
        reborn.load();
        reborn
    }

    fn pattern(len: usize, seed: u8) -> Bytes {
        Bytes::from(
            (0..len)
                .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
                .collect::<Vec<u8>>(),
        )
    }

    #[test]
    fn put_get_roundtrip_before_flush() {
        let cache = cache();
        let data = pattern(100, 7);
        assert!(cache.put(ContentKey::new(1), data.clone()));

        match cache.get(ContentKey::new(1)) {
            Lookup::Memory(found) => assert_eq!(found, data),
            other => panic!("expected memory hit, got {other:?}"),
        }
        assert!(cache.has(ContentKey::new(1)));
        assert_eq!(cache.get(ContentKey::new(2)), Lookup::Absent);
    }

    #[test]
    fn put_rejects_reserved_and_oversize() {
        let cache = cache();
        assert!(!cache.put(ContentKey::NONE, pattern(8, 0)));
        assert!(!cache.put(
            ContentKey::new(1),
            Bytes::from(vec![0u8; MAX_ENTRY_OFFSET as usize + 1])
        ));
    }

    #[test]
    fn write_moves_items_to_disk() {
        let cache = cache();
        let data = pattern(64, 3);
        cache.put(ContentKey::new(1), data.clone());

        assert!(cache.write_mem_to_disk(1 << 20) > 0);

        // The item left the memory tier and is now disk-resident.
        assert_eq!(cache.get(ContentKey::new(1)), Lookup::Disk);
        assert_eq!(cache.demand(), 0);

        let mut out = Vec::new();
        assert_eq!(
            cache.materialize(ContentKey::new(1), &mut out, 0),
            ReadStatus::Ok
        );
        assert_eq!(out, data);
    }

    #[test]
    fn write_with_zero_allowance_is_noop() {
        let cache = cache();
        cache.put(ContentKey::new(1), pattern(64, 1));
        assert_eq!(cache.write_mem_to_disk(0), 0);
        assert!(matches!(cache.get(ContentKey::new(1)), Lookup::Memory(_)));
    }

    #[test]
    fn durability_across_restart() {
        let config = config();
        let cache = cache_with(&config);
        let data = pattern(1000, 9);

        cache.put(ContentKey::new(42), data.clone());
        cache.write_mem_to_disk(1 << 20);
        cache.flush();

        let reborn = restart(&cache, &config);
        assert!(reborn.has(ContentKey::new(42)));

        let mut out = Vec::new();
        assert_eq!(
            reborn.materialize(ContentKey::new(42), &mut out, 0),
            ReadStatus::Ok
        );
        assert_eq!(out, data);
    }

    #[test]
    fn unflushed_phrases_do_not_survive_restart() {
        let config = config();
        let cache = cache_with(&config);
        cache.put(ContentKey::new(1), pattern(64, 2));
        cache.write_mem_to_disk(1 << 20);
        // No flush: the journal never saw the phrase.

        let reborn = restart(&cache, &config);
        assert!(!reborn.has(ContentKey::new(1)));
    }

    #[test]
    fn large_item_becomes_durable_across_small_allowances() {
        let config = config();
        let cache = cache_with(&config);
        let data = pattern(64 << 10, 5);
        cache.put(ContentKey::new(7), data.clone());

        // Drain a 64 KiB item with 16 KiB allowances; the partial spans
        // calls until the final slice completes it.
        let mut rounds = 0;
        while cache.get(ContentKey::new(7)) != Lookup::Disk {
            assert!(rounds < 16, "item never completed");
            cache.write_mem_to_disk(16 << 10);
            rounds += 1;
        }
        assert!(rounds > 1, "allowance was not actually partial");
        cache.flush();

        let mut out = Vec::new();
        assert_eq!(
            cache.materialize(ContentKey::new(7), &mut out, 0),
            ReadStatus::Ok
        );
        assert_eq!(out, data);

        // And it survives a restart.
        let reborn = restart(&cache, &config);
        let mut out = Vec::new();
        assert_eq!(
            reborn.materialize(ContentKey::new(7), &mut out, 0),
            ReadStatus::Ok
        );
        assert_eq!(out, data);
    }

    #[test]
    fn partial_item_is_still_readable_while_in_flight() {
        let cache = cache();
        let data = pattern(32 << 10, 6);
        cache.put(ContentKey::new(3), data.clone());

        cache.write_mem_to_disk(8 << 10);

        // Mid-flight the item lives in the partial, not the tier.
        assert!(cache.has(ContentKey::new(3)));
        match cache.get(ContentKey::new(3)) {
            Lookup::Memory(found) => assert_eq!(found, data),
            other => panic!("expected in-flight partial, got {other:?}"),
        }
    }

    #[test]
    fn evict_clears_memory_disk_and_partial() {
        let cache = cache();

        // Memory-resident evict.
        cache.put(ContentKey::new(1), pattern(16, 1));
        assert!(cache.evict(ContentKey::new(1)));
        assert!(!cache.has(ContentKey::new(1)));

        // Disk-resident evict.
        cache.put(ContentKey::new(2), pattern(16, 2));
        cache.write_mem_to_disk(1 << 20);
        assert_eq!(cache.get(ContentKey::new(2)), Lookup::Disk);
        assert!(cache.evict(ContentKey::new(2)));
        assert!(!cache.has(ContentKey::new(2)));

        // In-flight partial evict.
        cache.put(ContentKey::new(3), pattern(32 << 10, 3));
        cache.write_mem_to_disk(8 << 10);
        assert!(cache.evict(ContentKey::new(3)));
        assert!(!cache.has(ContentKey::new(3)));

        // Absent key.
        assert!(!cache.evict(ContentKey::new(99)));
    }

    #[test]
    fn evict_survives_restart_via_tombstone() {
        let config = config();
        let cache = cache_with(&config);

        cache.put(ContentKey::new(5), pattern(64, 5));
        cache.write_mem_to_disk(1 << 20);
        cache.flush();
        assert_eq!(cache.get(ContentKey::new(5)), Lookup::Disk);

        // Evict plants a tombstone; the next flush journals it.
        assert!(cache.evict(ContentKey::new(5)));
        cache.write_mem_to_disk(1 << 20);
        cache.flush();

        let reborn = restart(&cache, &config);
        assert!(!reborn.has(ContentKey::new(5)));
    }

    #[test]
    fn journal_wrap_keeps_bounded_validated_subset() {
        // A journal big enough for only a phrase or two forces many wraps.
        let config = CacheConfig::new()
            .memory_quota(4 << 20)
            .disk_quota(18 << 20)
            .journal_quota(2 << 10);
        let cache = cache_with(&config);

        let mut committed = Vec::new();
        for i in 0..2048u64 {
            let size = 1 + ((i as usize * 599) % (16 << 10));
            let data = pattern(size, i as u8);
            let key = ContentKey::new(i + 1);
            cache.put(key, data.clone());
            committed.push((key, data));
            cache.write_mem_to_disk(1 << 20);
            if i % 3 == 0 {
                cache.flush();
            }
        }
        cache.flush();

        let reborn = restart(&cache, &config);

        let (used, capacity) = reborn.usage();
        assert!(used <= capacity, "recovery indexed more than the region");

        // A bounded subset of the most recent items survives, every one of
        // them bit-exact.
        let mut found = 0;
        for (key, data) in &committed {
            let mut out = Vec::new();
            match reborn.materialize(*key, &mut out, 0) {
                ReadStatus::Ok => {
                    assert_eq!(&out, data, "recovered bytes differ for {key}");
                    found += 1;
                }
                ReadStatus::NotFound => {}
                other => panic!("unexpected status {other:?}"),
            }
        }
        assert!(found > 20, "too few items survived recovery: {found}");
        assert!(
            found < committed.len(),
            "wrapping should have lost the oldest items"
        );
    }

    #[test]
    fn data_region_wrap_truncates_writes() {
        // Tiny data region so the cursor wraps quickly.
        let config = CacheConfig::new()
            .memory_quota(2 << 20)
            .disk_quota((1 << 20) + (64 << 10))
            .journal_quota(64 << 10);
        let cache = cache_with(&config);
        assert_eq!(cache.disk.max_data_size(), 1 << 20);

        for i in 0..64u64 {
            cache.put(ContentKey::new(i + 1), pattern(96 << 10, i as u8));
            cache.write_mem_to_disk(1 << 20);
            cache.flush();
        }
        // Drain any in-flight partial left by a wrap truncation.
        for _ in 0..3 {
            cache.write_mem_to_disk(1 << 20);
        }
        cache.flush();

        // The cursor stayed within the region across several wraps and the
        // index never exceeded capacity.
        let state = cache.disk.state.lock();
        assert!(state.data_cursor <= 1 << 20);
        drop(state);
        let (used, capacity) = cache.usage();
        assert!(used <= capacity);

        // Recent items are still readable and intact.
        let mut out = Vec::new();
        assert_eq!(
            cache.materialize(ContentKey::new(64), &mut out, 0),
            ReadStatus::Ok
        );
        assert_eq!(out, pattern(96 << 10, 63));
    }

    #[test]
    fn usage_reports_mapped_bytes() {
        let cache = cache();
        let (used, capacity) = cache.usage();
        assert_eq!(used, 0);
        assert!(capacity > 0);

        cache.put(ContentKey::new(1), pattern(128, 1));
        cache.write_mem_to_disk(1 << 20);
        assert_eq!(cache.usage().0, 128);
    }

    #[test]
    fn visit_covers_both_tiers_and_partial() {
        let cache = cache();
        cache.put(ContentKey::new(1), pattern(16, 1));
        cache.write_mem_to_disk(1 << 20);
        cache.put(ContentKey::new(2), pattern(16, 2));
        cache.put(ContentKey::new(3), pattern(32 << 10, 3));
        cache.write_mem_to_disk(4 << 10); // leaves key 3 partial

        let mut mem_keys = Vec::new();
        let mut disk_keys = Vec::new();
        cache.visit(|key, _, in_memory| {
            if in_memory {
                mem_keys.push(key);
            } else {
                disk_keys.push(key);
            }
        });

        assert!(disk_keys.contains(&ContentKey::new(1)));
        assert!(mem_keys.contains(&ContentKey::new(3)));
    }

    #[test]
    fn drop_cache_forgets_everything() {
        let cache = cache();
        cache.put(ContentKey::new(1), pattern(64, 1));
        cache.write_mem_to_disk(1 << 20);
        cache.flush();
        cache.put(ContentKey::new(2), pattern(64, 2));

        cache.drop_cache();
        assert!(!cache.has(ContentKey::new(1)));
        assert!(!cache.has(ContentKey::new(2)));
        assert_eq!(cache.usage().0, 0);
        assert_eq!(cache.demand(), 0);
    }
}
