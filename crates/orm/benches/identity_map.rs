//! Load path benchmarks
//!
//! Compares the three sources an entity can come from: the context's identity map, the
//! second-level cache and the in-memory store.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use keel_orm::{
    AccessType, AttributeDescriptor, CacheMode, DatabaseValue, EntityDescriptor, MemoryDatabase,
    Metamodel, PersistenceConfig, PersistenceUnit,
};
use std::sync::Arc;
use tokio::runtime::Runtime;

const ROWS: i64 = 1_000;

fn unit() -> Arc<PersistenceUnit> {
    unit_with(PersistenceConfig::default())
}

fn unit_with(config: PersistenceConfig) -> Arc<PersistenceUnit> {
    let metamodel = Metamodel::builder()
        .entity(
            EntityDescriptor::new("Customer", "customers")
                .basic("name", "name")
                .version("version", "version")
                .cached(AccessType::ReadWrite),
        )
        .entity(
            EntityDescriptor::new("Order", "orders")
                .basic("total", "total")
                .attribute(AttributeDescriptor::many_to_one("customer", "Customer", "customer_id"))
                .cached(AccessType::ReadWrite),
        )
        .build()
        .expect("benchmark metamodel is valid");

    let db = Arc::new(MemoryDatabase::new());
    for id in 0..ROWS {
        db.insert(
            "customers",
            [
                ("id", DatabaseValue::Int64(id)),
                ("name", DatabaseValue::from(format!("customer {}", id))),
                ("version", DatabaseValue::Int64(1)),
            ],
        );
        db.insert(
            "orders",
            [
                ("id", DatabaseValue::Int64(id)),
                ("total", DatabaseValue::Int64(id * 10)),
                ("customer_id", DatabaseValue::Int64(id % 50)),
            ],
        );
    }

    PersistenceUnit::new(metamodel, config, db).expect("unit builds")
}

fn bench_identity_map(c: &mut Criterion) {
    let rt = Runtime::new().expect("tokio runtime");
    let unit = unit();
    let context = unit.open_context();
    rt.block_on(context.find("Order", 7)).expect("load succeeds");

    let context = &context;
    c.bench_function("identity_map_hit", |b| {
        b.to_async(&rt).iter(move || async move {
            black_box(context.find("Order", black_box(7)).await.expect("load succeeds"))
        })
    });
}

fn bench_cache_and_store(c: &mut Criterion) {
    let rt = Runtime::new().expect("tokio runtime");
    let unit = unit();
    rt.block_on(unit.open_context().find_many("Order", 0..ROWS))
        .expect("warm-up succeeds");

    let unit = &unit;
    let mut group = c.benchmark_group("fresh_context_load");
    for (label, mode) in [("cache", CacheMode::Normal), ("store", CacheMode::Ignore)] {
        group.bench_function(label, |b| {
            b.to_async(&rt).iter(move || async move {
                let context = unit.open_context();
                context.set_cache_mode(mode).expect("context is open");
                black_box(context.find("Order", black_box(500)).await.expect("load succeeds"))
            })
        });
    }
    group.finish();
}

fn bench_batch_proxies(c: &mut Criterion) {
    let rt = Runtime::new().expect("tokio runtime");
    let mut group = c.benchmark_group("proxy_batch_size");

    for &batch in &[1usize, 8, 32] {
        let unit = unit_with(PersistenceConfig {
            default_batch_fetch_size: batch,
            ..PersistenceConfig::default()
        });
        let unit = &unit;
        group.bench_with_input(BenchmarkId::from_parameter(batch), &batch, |b, _| {
            b.to_async(&rt).iter(move || async move {
                let context = unit.open_context();
                context.set_cache_mode(CacheMode::Ignore).expect("context is open");
                let orders = context.find_many("Order", 0..50).await.expect("load succeeds");
                for order in orders.iter().flatten() {
                    if let Some(customer) = order.reference("customer").expect("association") {
                        black_box(customer.initialize().await.expect("load succeeds"));
                    }
                }
            })
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_identity_map,
    bench_cache_and_store,
    bench_batch_proxies
);
criterion_main!(benches);
