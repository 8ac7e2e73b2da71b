//! Benchmark: reservation fast path and pointer marking.
//!
//! A reservation that fits the per-shard cache never touches the global
//! pool; a refill (batch smaller than the request) does. Marking compares
//! one- and two-pointer extents through the immediate path against the
//! same update staged and committed as a transaction.

use cfs_mark::{
    AccountingConfig, DeviceConfig, MarkFlags, MemKeyStore, SpaceAccounting, Trigger,
};
use cfs_types::{BtreeId, DeviceIdx, ExtentPtr, Gen, JournalSeq, Key, KeyValue};
use criterion::{Criterion, black_box, criterion_group, criterion_main};

fn accounting(batch: u64) -> SpaceAccounting {
    let fs = SpaceAccounting::new(AccountingConfig {
        shard_count: 4,
        sectors_cache_batch: batch,
        ..AccountingConfig::default()
    })
    .expect("config");
    for d in 0..2 {
        fs.add_device(&DeviceConfig::new(DeviceIdx(d), 4096, 1024))
            .expect("device");
    }
    fs
}

fn extent(nr_ptrs: u8) -> Key {
    let ptrs = (0..nr_ptrs)
        .map(|d| ExtentPtr::new(DeviceIdx(d), 40 * 1024, Gen(0), 8))
        .collect();
    Key::extent(1, 0, 8, ptrs)
}

fn bench_reserve(c: &mut Criterion) {
    let cached = accounting(1 << 20);
    let refill = accounting(1);

    let mut group = c.benchmark_group("reserve");

    group.bench_function("cache_hit", |b| {
        b.iter(|| drop(black_box(cached.reserve(black_box(8), false))));
    });

    group.bench_function("pool_refill", |b| {
        b.iter(|| drop(black_box(refill.reserve(black_box(8), false))));
    });

    group.finish();
}

fn bench_mark_extent(c: &mut Criterion) {
    let fs = accounting(1024);
    let mut group = c.benchmark_group("mark_extent");

    for nr_ptrs in [1_u8, 2] {
        let k = extent(nr_ptrs);
        let gone = Key::new(k.pos, k.size, KeyValue::Deleted);
        fs.register_key_replicas(&k).expect("register");
        group.bench_function(format!("immediate_{nr_ptrs}ptr"), |b| {
            b.iter(|| {
                fs.mark_key(black_box(&k), MarkFlags::NONE).expect("insert");
                fs.mark(&k, &gone, Trigger::overwrite(0, -8)).expect("remove");
            });
        });
    }

    let store = MemKeyStore::new();
    let k = extent(2);
    let gone = Key::new(k.pos, k.size, KeyValue::Deleted);
    let mut seq = 0_u64;
    group.bench_function("transaction_2ptr", |b| {
        b.iter(|| {
            for key in [&k, &gone] {
                seq += 1;
                let mut res = fs.reserve(16, false).expect("reserve");
                fs.run_transaction(&store, JournalSeq(seq), Some(&mut res), |trans| {
                    trans.update(BtreeId::Extents, black_box(key.clone()));
                    Ok(())
                })
                .expect("commit");
            }
        });
    });

    group.finish();
}

criterion_group!(benches, bench_reserve, bench_mark_extent);
criterion_main!(benches);
