//! File-backed durability tests: every cache generation is a fresh process
//! as far as the cache can tell - only the files survive.

use bytes::Bytes;
use iostash_core::{Cache, CacheConfig, ContentKey, Lookup, ReadStatus};
use iostash_storage::FileBackend;
use std::path::Path;

fn config() -> CacheConfig {
    CacheConfig::new()
        .memory_quota(1 << 20)
        .disk_quota(8 << 20)
        .journal_quota(8 << 10)
}

fn open_cache(dir: &Path, config: &CacheConfig) -> Cache {
    let data = FileBackend::open(&dir.join("chunks.bin")).unwrap();
    let journal = FileBackend::open(&dir.join("chunks.jrn")).unwrap();
    let cache = Cache::with_backends(config, Some(Box::new(data)), Some(Box::new(journal)));
    cache.load();
    cache
}

fn pattern(len: usize, seed: u8) -> Bytes {
    Bytes::from(
        (0..len)
            .map(|i| (i as u8).wrapping_mul(197).wrapping_add(seed))
            .collect::<Vec<u8>>(),
    )
}

#[test]
fn survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let config = config();

    let payload = pattern(2000, 1);
    {
        let cache = open_cache(dir.path(), &config);
        assert!(cache.put(ContentKey::new(11), payload.clone()));
        cache.write_mem_to_disk(1 << 20);
        cache.flush();
    }

    let cache = open_cache(dir.path(), &config);
    assert!(cache.has(ContentKey::new(11)));

    let mut out = Vec::new();
    assert_eq!(
        cache.materialize(ContentKey::new(11), &mut out, 0),
        ReadStatus::Ok
    );
    assert_eq!(out, payload);
}

#[test]
fn eviction_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let config = config();

    {
        let cache = open_cache(dir.path(), &config);
        cache.put(ContentKey::new(1), pattern(100, 1));
        cache.put(ContentKey::new(2), pattern(100, 2));
        cache.write_mem_to_disk(1 << 20);
        cache.flush();

        cache.evict(ContentKey::new(1));
        cache.write_mem_to_disk(1 << 20);
        cache.flush();
    }

    let cache = open_cache(dir.path(), &config);
    assert!(!cache.has(ContentKey::new(1)));
    assert!(cache.has(ContentKey::new(2)));
}

#[test]
fn drop_on_init_discards_existing_state() {
    let dir = tempfile::tempdir().unwrap();
    let config = config();

    {
        let cache = open_cache(dir.path(), &config);
        cache.put(ContentKey::new(1), pattern(64, 1));
        cache.write_mem_to_disk(1 << 20);
        cache.flush();
    }

    let dropping = config.clone().drop_cache(true);
    let cache = open_cache(dir.path(), &dropping);
    assert!(!cache.has(ContentKey::new(1)));
    assert_eq!(cache.usage().0, 0);
}

#[test]
fn many_generations_with_journal_wraps() {
    let dir = tempfile::tempdir().unwrap();
    // A journal this small wraps every handful of phrases.
    let config = CacheConfig::new()
        .memory_quota(1 << 20)
        .disk_quota(8 << 20)
        .journal_quota(2 << 10);

    let mut committed = Vec::new();
    for generation in 0..8u64 {
        let cache = open_cache(dir.path(), &config);
        for i in 0..64u64 {
            let id = generation * 64 + i;
            let data = pattern(1 + ((id as usize * 131) % 4096), id as u8);
            let key = ContentKey::new(id + 1);
            assert!(cache.put(key, data.clone()));
            committed.push((key, data));
            cache.write_mem_to_disk(256 << 10);
            if i % 5 == 0 {
                cache.flush();
            }
        }
        cache.flush();
    }

    // The final generation must recover a bounded, hash-valid, bit-exact
    // subset of the most recently committed items.
    let cache = open_cache(dir.path(), &config);
    let (used, capacity) = cache.usage();
    assert!(used <= capacity);

    let mut found = 0;
    let mut newest_found = 0;
    for (i, (key, data)) in committed.iter().enumerate() {
        let mut out = Vec::new();
        match cache.materialize(*key, &mut out, 0) {
            ReadStatus::Ok => {
                assert_eq!(&out, data, "corrupt bytes for {key}");
                found += 1;
                newest_found = i;
            }
            ReadStatus::NotFound => {}
            other => panic!("unexpected status {other:?}"),
        }
    }

    assert!(found > 10, "too little survived: {found}");
    assert!(found < committed.len(), "wraps should have lost old items");
    // What survives is the recent tail, not some ancient region.
    assert!(newest_found >= committed.len() - 65);
}

#[test]
fn partial_item_completes_across_restart_boundary_calls() {
    let dir = tempfile::tempdir().unwrap();
    let config = config();

    let payload = pattern(256 << 10, 9);
    {
        let cache = open_cache(dir.path(), &config);
        cache.put(ContentKey::new(77), payload.clone());

        // Drain with small allowances until the item completes.
        for _ in 0..64 {
            cache.write_mem_to_disk(16 << 10);
            if cache.get(ContentKey::new(77)) == Lookup::Disk {
                break;
            }
        }
        assert_eq!(cache.get(ContentKey::new(77)), Lookup::Disk);
        cache.flush();
    }

    let cache = open_cache(dir.path(), &config);
    let mut out = Vec::new();
    assert_eq!(
        cache.materialize(ContentKey::new(77), &mut out, 0),
        ReadStatus::Ok
    );
    assert_eq!(out, payload);
}

#[test]
fn index_only_mode_without_backends() {
    let config = config();
    let cache = Cache::with_backends(&config, None, None);
    assert!(!cache.ailments().is_healthy());

    // The memory tier still works.
    assert!(cache.put(ContentKey::new(1), pattern(64, 1)));
    assert!(matches!(cache.get(ContentKey::new(1)), Lookup::Memory(_)));

    // Draining succeeds (items are lost, not corrupted) and disk reads
    // report the missing handle.
    cache.write_mem_to_disk(1 << 20);
    cache.flush();
    let mut out = Vec::new();
    assert_eq!(
        cache.materialize(ContentKey::new(1), &mut out, 0),
        ReadStatus::FileNotOpen
    );
}
