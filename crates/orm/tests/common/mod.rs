#![allow(dead_code)]

use keel_orm::{
    AccessType, AttributeDescriptor, CacheEntry, CacheKey, CollectionDescriptor, ComparisonOp,
    DatabaseValue, EntityDescriptor, FetchMode, FetchProfile, FilterDefinition, IdKind,
    Identifier, MemoryDatabase, Metamodel, PersistenceConfig, PersistenceUnit,
};
use std::sync::Arc;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Customers own orders; orders point back at their customer. Countries never change;
/// employees reference each other (or themselves) through an eagerly fetched manager.
pub fn shop_metamodel(order_access: AccessType) -> Metamodel {
    Metamodel::builder()
        .filter(FilterDefinition::new("minTotal", "total", ComparisonOp::Ge, "min"))
        .fetch_profile(FetchProfile::new("with-customer").fetch("Order", "customer"))
        .entity(
            EntityDescriptor::new("Customer", "customers")
                .basic("name", "name")
                .version("version", "version")
                .attribute(AttributeDescriptor::one_to_many("orders", "Customer.orders"))
                .attribute(AttributeDescriptor::one_to_many("tickets", "Customer.tickets"))
                .cached(AccessType::ReadWrite),
        )
        .entity(
            EntityDescriptor::new("Order", "orders")
                .basic("total", "total")
                .version("version", "version")
                .attribute(AttributeDescriptor::many_to_one("customer", "Customer", "customer_id"))
                .filter("minTotal")
                .cached(order_access),
        )
        .entity(
            EntityDescriptor::new("Ticket", "tickets")
                .basic("subject", "subject")
                .attribute(AttributeDescriptor::many_to_one("customer", "Customer", "customer_id")),
        )
        .entity(
            EntityDescriptor::new("Country", "countries")
                .id("code", "code", IdKind::Text)
                .basic("name", "name")
                .cached(AccessType::ReadOnly),
        )
        .entity(
            EntityDescriptor::new("Employee", "employees")
                .basic("name", "name")
                .attribute(
                    AttributeDescriptor::many_to_one("manager", "Employee", "manager_id")
                        .with_fetch(FetchMode::Eager { join: false }),
                ),
        )
        .collection(
            CollectionDescriptor::new("Customer", "orders", "Order", "customer_id")
                .filter("minTotal")
                .cached(AccessType::ReadWrite)
                .batch_size(3),
        )
        .collection(
            CollectionDescriptor::new("Customer", "tickets", "Ticket", "customer_id").extra_lazy(),
        )
        .build()
        .expect("shop metamodel is valid")
}

pub fn seed(db: &MemoryDatabase) {
    for (id, name) in [(1i64, "Ada"), (2, "Grace"), (3, "Edsger")] {
        db.insert(
            "customers",
            [
                ("id", DatabaseValue::Int64(id)),
                ("name", DatabaseValue::from(name)),
                ("version", DatabaseValue::Int64(1)),
            ],
        );
    }
    for (id, total, version, customer) in [(42i64, 250i64, 3i64, 1i64), (43, 80, 1, 1), (44, 120, 1, 2)] {
        db.insert(
            "orders",
            [
                ("id", DatabaseValue::Int64(id)),
                ("total", DatabaseValue::Int64(total)),
                ("version", DatabaseValue::Int64(version)),
                ("customer_id", DatabaseValue::Int64(customer)),
            ],
        );
    }
    for (id, subject) in [(7i64, "Late delivery"), (8, "Wrong colour")] {
        db.insert(
            "tickets",
            [
                ("id", DatabaseValue::Int64(id)),
                ("subject", DatabaseValue::from(subject)),
                ("customer_id", DatabaseValue::Int64(1)),
            ],
        );
    }
    db.insert(
        "countries",
        [
            ("code", DatabaseValue::from("NZ")),
            ("name", DatabaseValue::from("New Zealand")),
        ],
    );
    for (id, name, manager) in [
        (1i64, "Alice", DatabaseValue::Int64(2)),
        (2, "Bob", DatabaseValue::Int64(1)),
        (3, "Carol", DatabaseValue::Null),
        (4, "Dana", DatabaseValue::Int64(4)),
    ] {
        db.insert(
            "employees",
            [
                ("id", DatabaseValue::Int64(id)),
                ("name", DatabaseValue::from(name)),
                ("manager_id", manager),
            ],
        );
    }
}

pub fn shop_with(order_access: AccessType, config: PersistenceConfig) -> (Arc<PersistenceUnit>, Arc<MemoryDatabase>) {
    init_tracing();
    let db = Arc::new(MemoryDatabase::new());
    seed(&db);
    let unit = PersistenceUnit::new(shop_metamodel(order_access), config, db.clone())
        .expect("persistence unit builds");
    (unit, db)
}

pub fn shop() -> (Arc<PersistenceUnit>, Arc<MemoryDatabase>) {
    shop_with(AccessType::ReadWrite, PersistenceConfig::default())
}

/// Entry a context opened now would read for `kind#id`
pub fn cached(unit: &PersistenceUnit, kind: &str, id: impl Into<Identifier>) -> Option<CacheEntry> {
    let entity = unit.metamodel().entity(kind).expect("known entity kind");
    let region = unit.entity_region(entity)?;
    let key = CacheKey::new(kind, id.into().cache_id());
    region
        .get(&key, unit.regions().next_timestamp())
        .expect("cache read succeeds")
}

/// Cached element ids of the `role` collection owned by `owner`
pub fn cached_collection(unit: &PersistenceUnit, role: &str, owner: i64) -> Option<CacheEntry> {
    let collection = unit.metamodel().collection(role).expect("known collection role");
    let region = unit.collection_region(collection)?;
    let key = CacheKey::new(role, Identifier::Int(owner).cache_id());
    region
        .get(&key, unit.regions().next_timestamp())
        .expect("cache read succeeds")
}
