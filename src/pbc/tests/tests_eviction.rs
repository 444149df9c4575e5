//! LRU pressure, file eviction, and the delayed-GC grace cycle.

use crate::pbc::CacheOptions;
use crate::pbc::tests::helpers::*;

#[test]
fn lru_evicts_under_pressure_but_serves_everything() {
    // One tiny data set: 16 KiB = 4 slots of 4 KiB.
    let fx = CacheFixture::with_options(CacheOptions {
        capacity: 16 * 1024,
        dataset_size: 16 * 1024,
        block_size: 4 * 1024,
        clean_on_start: false,
    });
    let data = fx.seed_file("t/lg0/big.sst", 64 * 1024);

    // Touch 16 distinct blocks through 4 slots.
    for block in 0..16u64 {
        let offset = block * 4096;
        let mut buf = vec![0u8; 4096];
        let n = fx
            .cache
            .read("t/lg0/big.sst", 64 * 1024, offset, &mut buf)
            .unwrap();
        assert_eq!(&buf[..n], &data[offset as usize..offset as usize + n]);
    }

    let (_, _, _, _, evictions) = fx.cache.metrics.snapshot();
    assert!(evictions >= 12, "4 slots for 16 blocks must evict, saw {evictions}");
    assert!(fx.cache.resident_blocks() <= 4);
}

#[test]
fn evict_file_removes_every_key_of_its_fid() {
    let fx = CacheFixture::new();
    fx.seed_file("t/lg0/a.sst", 20_000);
    fx.seed_file("t/lg0/b.sst", 20_000);

    let mut buf = vec![0u8; 20_000];
    fx.cache.read("t/lg0/a.sst", 20_000, 0, &mut buf).unwrap();
    fx.cache.read("t/lg0/b.sst", 20_000, 0, &mut buf).unwrap();
    let resident_both = fx.cache.resident_blocks();

    fx.cache.evict_file("t/lg0/a.sst").unwrap();
    let resident_after = fx.cache.resident_blocks();
    assert!(resident_after < resident_both);

    // Re-reading the evicted file is a fresh miss.
    let (_, dfs_before, ..) = fx.cache.metrics.snapshot();
    fx.cache.read("t/lg0/a.sst", 20_000, 0, &mut buf).unwrap();
    let (_, dfs_after, ..) = fx.cache.metrics.snapshot();
    assert!(dfs_after > dfs_before);
}

#[test]
fn delayed_gc_defers_eviction_one_cycle() {
    let fx = CacheFixture::new();
    fx.seed_file("t/lg0/graced.sst", 8_192);
    let mut buf = vec![0u8; 8_192];
    fx.cache
        .read("t/lg0/graced.sst", 8_192, 0, &mut buf)
        .unwrap();
    let resident = fx.cache.resident_blocks();
    assert!(resident >= 2);

    // Under grace: the evict is deferred, blocks stay resident.
    fx.cache.mark_delayed_gc("t/lg0/graced.sst");
    fx.cache.evict_file("t/lg0/graced.sst").unwrap();
    assert_eq!(fx.cache.resident_blocks(), resident);

    // The next GC cycle executes the deferred evict.
    fx.cache.unmark_delayed_gc("t/lg0/graced.sst");
    fx.cache.run_gc_cycle().unwrap();
    assert_eq!(fx.cache.resident_blocks(), 0);
}

#[test]
fn evicting_unknown_file_is_a_no_op() {
    let fx = CacheFixture::new();
    fx.cache.evict_file("t/lg0/never-seen.sst").unwrap();
}
