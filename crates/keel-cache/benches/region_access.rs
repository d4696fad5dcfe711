use criterion::{black_box, criterion_group, criterion_main, Criterion};
use keel_cache::{AccessType, CacheEntry, CacheKey, RegionAccess, RegionConfig, RegionFactory};
use serde_json::json;
use std::sync::Arc;

fn populate(factory: &RegionFactory, access: &RegionAccess, count: usize) -> Vec<CacheKey> {
    let keys: Vec<CacheKey> = (0..count)
        .map(|i| CacheKey::new("Order", format!("i:{}", i)))
        .collect();
    for (i, key) in keys.iter().enumerate() {
        access
            .put_from_load(
                key,
                CacheEntry::new(json!([i, "open", null]), Some(1)),
                factory.next_timestamp(),
                false,
            )
            .unwrap();
    }
    keys
}

fn bench_get(c: &mut Criterion) {
    let mut group = c.benchmark_group("region_get");

    for access_type in [AccessType::NonstrictReadWrite, AccessType::ReadWrite] {
        let factory = RegionFactory::new();
        let access = factory
            .build_access("Order", access_type, RegionConfig::default())
            .unwrap();
        let keys = populate(&factory, &access, 1000);

        group.bench_function(access_type.external_name(), |b| {
            b.iter(|| {
                let ts = factory.next_timestamp();
                for key in &keys {
                    black_box(access.get(black_box(key), ts).unwrap());
                }
            })
        });
    }

    group.finish();
}

fn bench_lock_update_cycle(c: &mut Criterion) {
    let factory = RegionFactory::new();
    let access = factory
        .build_access("Order", AccessType::ReadWrite, RegionConfig::default())
        .unwrap();
    let keys = populate(&factory, &access, 100);
    let mut version = 1u64;

    c.bench_function("read_write_lock_update", |b| {
        b.iter(|| {
            version += 1;
            for key in &keys {
                let lock = access.lock(key, Some(version - 1)).unwrap();
                access
                    .update(
                        key,
                        lock.as_ref(),
                        CacheEntry::new(json!([version]), Some(version)),
                        version,
                    )
                    .unwrap();
            }
        })
    });
}

fn bench_contended_keys(c: &mut Criterion) {
    c.bench_function("read_write_contended_get", |b| {
        let factory = Arc::new(RegionFactory::new());
        let access = factory
            .build_access("Order", AccessType::ReadWrite, RegionConfig::default())
            .unwrap();
        let keys = Arc::new(populate(&factory, &access, 64));

        b.iter(|| {
            let handles: Vec<_> = (0..4)
                .map(|_| {
                    let factory = factory.clone();
                    let access = access.clone();
                    let keys = keys.clone();
                    std::thread::spawn(move || {
                        let ts = factory.next_timestamp();
                        for key in keys.iter() {
                            black_box(access.get(key, ts).unwrap());
                        }
                    })
                })
                .collect();
            for handle in handles {
                handle.join().unwrap();
            }
        })
    });
}

criterion_group!(benches, bench_get, bench_lock_update_cycle, bench_contended_keys);
criterion_main!(benches);
