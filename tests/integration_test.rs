use anyhow::Result;
use blockstore::storage::layout::{ALLOC_GROUP_COUNT, ALLOC_GROUP_SIZE, BLOCK_MASK};
use blockstore::storage::{
    Allocation, BlockCache, CacheConfig, Store, StoreConfig, StoreError, BLOCK_SIZE,
    MINI_FRAG_SIZE,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashSet;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tempfile::tempdir;

fn test_config() -> StoreConfig {
    StoreConfig::default().sync_on_flush(false)
}

#[test]
fn test_data_survives_reopen() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("data.db");
    std::fs::File::create(&path)?;
    let cache = BlockCache::new(CacheConfig::with_capacity(64));

    let payload: Vec<u8> = (0..100u8).collect();
    let address = {
        let store = Store::open(&cache, &path, test_config())?;
        let address = store.allocate_row()?.address();
        let block = store.write_block(address, 0, &payload)?;
        block.commit();
        drop(block);
        store.close()?;
        address
    };

    let store = Store::open(&cache, &path, test_config())?;
    assert_eq!(store.allocation(address >> 13), Some(Allocation::Row));

    let mut page = vec![0xffu8; BLOCK_SIZE];
    store.read_block_bytes(address, 0, &mut page)?;
    assert_eq!(&page[..100], &payload[..]);
    assert!(page[100..].iter().all(|&b| b == 0));

    store.close()?;
    Ok(())
}

#[test]
fn test_reads_see_unflushed_writes_under_eviction() -> Result<()> {
    let dir = tempdir()?;
    let cache = BlockCache::new(CacheConfig::with_capacity(4).max_capacity(4));
    // a slow, tiny queue keeps evicted pages in flight
    let config = test_config()
        .writer_queue_capacity(2)
        .writer_backpressure_timeout(Duration::from_millis(1));
    let store = Store::open(&cache, dir.path().join("ryow.db"), config)?;

    let mut addresses = Vec::new();
    for i in 0..40u8 {
        let block = store.allocate_row()?;
        block.write_lock()?.fill(i);
        block.set_dirty(0, BLOCK_SIZE);
        addresses.push(block.address());
    }

    for (i, &address) in addresses.iter().enumerate() {
        let mut page = vec![0u8; BLOCK_SIZE];
        store.read_block_bytes(address, 0, &mut page)?;
        assert!(page.iter().all(|&b| b == i as u8), "block {} stale", i);
    }

    assert!(store.wait_for_writes(Duration::from_secs(10)));
    store.close()?;
    Ok(())
}

#[test]
fn test_random_allocations_round_trip() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("random.db");
    let cache = BlockCache::new(CacheConfig::with_capacity(32));
    let mut rng = StdRng::seed_from_u64(7);

    let store = Store::open(&cache, &path, test_config())?;
    let mut live = Vec::new();

    for _ in 0..400 {
        if live.is_empty() || rng.gen_bool(0.6) {
            let block = if rng.gen_bool(0.5) {
                store.allocate_row()?
            } else {
                store.allocate_index_block()?
            };
            live.push(block.id());
        } else {
            let victim = live.swap_remove(rng.gen_range(0..live.len()));
            store.free_block(victim)?;
        }
    }

    let indexes: HashSet<u64> = live.iter().map(|id| id.index()).collect();
    assert_eq!(indexes.len(), live.len());

    let before = store.allocation_table();
    for (index, alloc) in before.iter().enumerate() {
        let index = index as u64;
        if index < 2 {
            assert_eq!(*alloc, Allocation::Used);
        } else if indexes.contains(&index) {
            assert!(matches!(alloc, Allocation::Row | Allocation::Index));
        } else {
            assert_eq!(*alloc, Allocation::Free, "block {} leaked", index);
        }
    }
    store.close()?;

    let store = Store::open(&cache, &path, test_config())?;
    assert_eq!(store.allocation_table(), before);
    store.close()?;
    Ok(())
}

#[test]
fn test_double_free_is_reported() -> Result<()> {
    let dir = tempdir()?;
    let cache = BlockCache::new(CacheConfig::with_capacity(16));
    let store = Store::open(&cache, dir.path().join("double.db"), test_config())?;

    let id = store.allocate_row()?.id();
    store.free_block(id)?;
    let err = store.free_block(id).unwrap_err();
    assert!(matches!(err, StoreError::DoubleFree { .. }));
    assert!(err.is_invariant_violation());

    store.close()?;
    Ok(())
}

#[test]
fn test_deallocate_on_last_release() -> Result<()> {
    let dir = tempdir()?;
    let cache = BlockCache::new(CacheConfig::with_capacity(16));
    let store = Store::open(&cache, dir.path().join("dealloc.db"), test_config())?;

    let block = store.allocate_row()?;
    let index = block.id().index();
    let second = store.read_block(block.address())?;

    block.deallocate();
    drop(block);
    // still pinned by the second reference
    assert_eq!(store.allocation(index), Some(Allocation::Row));

    drop(second);
    assert_eq!(store.allocation(index), Some(Allocation::Free));

    store.close()?;
    Ok(())
}

#[test]
fn test_growth_across_allocation_group() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("groups.db");
    let cache = BlockCache::new(CacheConfig::with_capacity(64));
    let store = Store::open(&cache, &path, test_config())?;

    let mut rows = HashSet::new();
    while store.block_count() <= ALLOC_GROUP_COUNT + 1 {
        rows.insert(store.allocate_row()?.id().index());
    }

    // the second table chunk was never handed out
    assert!(!rows.contains(&ALLOC_GROUP_COUNT));
    assert_eq!(store.allocation(ALLOC_GROUP_COUNT), Some(Allocation::Used));
    assert!(rows.contains(&(ALLOC_GROUP_COUNT + 1)));

    let before = store.allocation_table();
    store.close()?;

    let mut entry = [0u8; 2];
    let file = std::fs::read(&path)?;
    entry.copy_from_slice(&file[ALLOC_GROUP_SIZE as usize..ALLOC_GROUP_SIZE as usize + 2]);
    assert_eq!(entry, [Allocation::USED, 0]);

    let store = Store::open(&cache, &path, test_config())?;
    assert_eq!(store.allocation_table(), before);
    store.close()?;
    Ok(())
}

#[test]
fn test_concurrent_writers() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("concurrent.db");
    let cache = BlockCache::new(CacheConfig::with_capacity(32));
    let store = Store::open(&cache, &path, test_config())?;

    let per_thread = 25;
    let written: Vec<Vec<u64>> = thread::scope(|s| {
        let handles: Vec<_> = (0..8u8)
            .map(|t| {
                let store = Arc::clone(&store);
                s.spawn(move || -> Result<Vec<u64>> {
                    let mut addresses = Vec::new();
                    for i in 0..per_thread {
                        let address = store.allocate_row()?.address();
                        let block = store.write_block(address, 0, &[t, i as u8, 0xee])?;
                        block.commit();
                        addresses.push(address);
                    }
                    Ok(addresses)
                })
            })
            .collect();

        handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .collect::<Result<_>>()
    })?;

    let all: HashSet<u64> = written.iter().flatten().copied().collect();
    assert_eq!(all.len(), 8 * per_thread);
    store.close()?;

    let store = Store::open(&cache, &path, test_config())?;
    for (t, addresses) in written.iter().enumerate() {
        for (i, &address) in addresses.iter().enumerate() {
            let mut buf = [0u8; 3];
            store.read_block_bytes(address, 0, &mut buf)?;
            assert_eq!(buf, [t as u8, i as u8, 0xee]);
        }
    }
    store.close()?;
    Ok(())
}

#[test]
fn test_mini_fragments_survive_reopen() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("fragments.db");
    let cache = BlockCache::new(CacheConfig::with_capacity(16));

    let fragments = {
        let store = Store::open(&cache, &path, test_config())?;
        let fragments: Vec<u64> = (0..40)
            .map(|_| store.allocate_mini_fragment())
            .collect::<Result<_, _>>()?;

        for (i, &fragment) in fragments.iter().enumerate() {
            store.write_mini_fragment(fragment, 0, &[i as u8; MINI_FRAG_SIZE])?;
        }

        let blocks: HashSet<u64> = fragments.iter().map(|f| f & BLOCK_MASK).collect();
        assert_eq!(blocks.len(), 2);
        store.close()?;
        fragments
    };

    let store = Store::open(&cache, &path, test_config())?;
    for (i, &fragment) in fragments.iter().enumerate() {
        let mut buf = [0u8; MINI_FRAG_SIZE];
        store.read_mini_fragment(fragment, 0, &mut buf)?;
        assert!(buf.iter().all(|&b| b == i as u8));
    }

    store.delete_mini_fragment(fragments[3])?;
    assert_eq!(store.allocate_mini_fragment()?, fragments[3]);
    store.close()?;
    Ok(())
}

#[test]
fn test_stores_share_one_cache() -> Result<()> {
    let dir = tempdir()?;
    let cache = BlockCache::new(CacheConfig::with_capacity(8).max_capacity(8));
    let stores: Vec<Arc<Store>> = (0..3)
        .map(|i| Store::open(&cache, dir.path().join(format!("s{}.db", i)), test_config()))
        .collect::<Result<_, _>>()?;

    for round in 0..10u8 {
        for (s, store) in stores.iter().enumerate() {
            let address = store.allocate_row()?.address();
            store.write_block(address, 0, &[s as u8, round])?.commit();
        }
    }

    for (s, store) in stores.iter().enumerate() {
        let mut round = 0u8;
        let mut address = store.first_row_block(0);
        while let Some(current) = address {
            let mut buf = [0u8; 2];
            store.read_block_bytes(current, 0, &mut buf)?;
            assert_eq!(buf, [s as u8, round]);
            round += 1;
            address = store.first_row_block(current + BLOCK_SIZE as u64);
        }
        assert_eq!(round, 10);
    }

    for store in &stores {
        store.close()?;
    }
    assert!(cache.is_empty());
    Ok(())
}
