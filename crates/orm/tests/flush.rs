mod common;

use keel_orm::{
    AccessType, CacheError, DatabaseValue, EntityStatus, FlushSummary, Identifier, OrmError,
    PersistenceConfig,
};

const STRATEGIES: [AccessType; 3] = [
    AccessType::ReadWrite,
    AccessType::NonstrictReadWrite,
    AccessType::Transactional,
];

fn total(db: &keel_orm::MemoryDatabase, id: i64) -> Option<DatabaseValue> {
    db.column_value("orders", "id", id, "total")
}

#[tokio::test]
async fn test_update_is_visible_to_later_contexts_under_every_strategy() {
    for access in STRATEGIES {
        let (unit, db) = common::shop_with(access, PersistenceConfig::default());

        let writer = unit.open_context();
        let order = writer.find("Order", 42).await.unwrap().unwrap();
        order.set("total", 300i64).unwrap();
        let summary = writer.flush().await.unwrap();

        assert_eq!(summary, FlushSummary { updated: 1, deleted: 0 }, "{access:?}");
        assert_eq!(order.version(), Some(4), "{access:?}");
        assert_eq!(total(&db, 42), Some(DatabaseValue::Int64(300)), "{access:?}");
        assert!(!writer.in_transaction());

        let reader = unit.open_context();
        let fresh = reader.find("Order", 42).await.unwrap().unwrap();
        assert_eq!(fresh.value("total").unwrap(), DatabaseValue::Int64(300), "{access:?}");
        assert_eq!(fresh.version(), Some(4), "{access:?}");
    }
}

#[tokio::test]
async fn test_cache_after_update_depends_on_strategy() {
    for access in STRATEGIES {
        let (unit, _db) = common::shop_with(access, PersistenceConfig::default());
        let writer = unit.open_context();
        let order = writer.find("Order", 42).await.unwrap().unwrap();
        order.set("total", 300i64).unwrap();
        writer.flush().await.unwrap();

        let cached = common::cached(&unit, "Order", 42).map(|entry| entry.version);
        match access {
            AccessType::NonstrictReadWrite => assert_eq!(cached, None),
            _ => assert_eq!(cached, Some(Some(4)), "{access:?}"),
        }
    }
}

#[tokio::test]
async fn test_rollback_restores_store_and_cache() {
    for access in STRATEGIES {
        let (unit, db) = common::shop_with(access, PersistenceConfig::default());
        let writer = unit.open_context();
        let order = writer.find("Order", 42).await.unwrap().unwrap();

        writer.begin().await.unwrap();
        order.set("total", 1i64).unwrap();
        writer.flush().await.unwrap();
        assert!(writer.in_transaction());
        writer.rollback().await.unwrap();

        assert_eq!(total(&db, 42), Some(DatabaseValue::Int64(250)), "{access:?}");
        assert_eq!(writer.status(&order), EntityStatus::Detached);
        assert!(!writer.is_managed("Order", 42).unwrap());

        let reader = unit.open_context();
        let fresh = reader.find("Order", 42).await.unwrap().unwrap();
        assert_eq!(fresh.value("total").unwrap(), DatabaseValue::Int64(250), "{access:?}");
        assert_eq!(fresh.version(), Some(3), "{access:?}");
    }
}

#[tokio::test]
async fn test_concurrent_change_fails_the_flush() {
    let (unit, db) = common::shop();
    let context = unit.open_context();
    let order = context.find("Order", 42).await.unwrap().unwrap();

    db.set_column("orders", "id", 42i64, "version", 9i64);
    order.set("total", 1i64).unwrap();

    let err = context.flush().await.unwrap_err();
    assert!(matches!(err, OrmError::StaleState { ref kind, .. } if kind == "Order"));
    assert!(!context.in_transaction());
    assert_eq!(total(&db, 42), Some(DatabaseValue::Int64(250)));
    assert_eq!(unit.statistics().snapshot().optimistic_failures, 1);

    let reader = unit.open_context();
    let fresh = reader.find("Order", 42).await.unwrap().unwrap();
    assert_eq!(fresh.version(), Some(9));
}

#[tokio::test]
async fn test_read_only_region_rejects_updates_before_any_write() {
    let (unit, db) = common::shop();
    let context = unit.open_context();
    let country = context.find("Country", "NZ").await.unwrap().unwrap();
    country.set("name", "Aotearoa").unwrap();

    let err = context.flush().await.unwrap_err();
    assert!(matches!(
        err,
        OrmError::Cache(CacheError::ReadOnlyViolation { .. })
    ));
    assert_eq!(db.write_count(), 0);
    assert_eq!(
        db.column_value("countries", "code", "NZ", "name"),
        Some(DatabaseValue::from("New Zealand"))
    );
}

#[tokio::test]
async fn test_read_only_region_allows_deletes() {
    let (unit, db) = common::shop_with(AccessType::ReadOnly, PersistenceConfig::default());
    let context = unit.open_context();
    let order = context.find("Order", 43).await.unwrap().unwrap();
    assert!(common::cached(&unit, "Order", 43).is_some());
    context.remove(&order).unwrap();

    assert_eq!(context.flush().await.unwrap().deleted, 1);
    assert_eq!(db.row_count("orders"), 2);
    assert!(common::cached(&unit, "Order", 43).is_none());
}

#[tokio::test]
async fn test_delete_removes_row_and_cached_state() {
    let (unit, db) = common::shop();
    let warm = unit.open_context();
    let customer = warm.find("Customer", 1).await.unwrap().unwrap();
    customer.collection("orders").unwrap().initialize().await.unwrap();
    warm.close().await.unwrap();
    assert!(common::cached_collection(&unit, "Customer.orders", 1).is_some());

    let context = unit.open_context();
    let order = context.find("Order", 43).await.unwrap().unwrap();
    context.remove(&order).unwrap();
    assert_eq!(context.status(&order), EntityStatus::Removed);
    assert!(context.find("Order", 43).await.unwrap().is_none());

    let summary = context.flush().await.unwrap();
    assert_eq!(summary.deleted, 1);
    assert_eq!(db.row_count("orders"), 2);
    assert_eq!(context.status(&order), EntityStatus::Detached);
    assert!(common::cached(&unit, "Order", 43).is_none());
    assert!(common::cached_collection(&unit, "Customer.orders", 1).is_none());

    let reader = unit.open_context();
    assert!(reader.find("Order", 43).await.unwrap().is_none());
    let customer = reader.find("Customer", 1).await.unwrap().unwrap();
    let ids = customer.collection("orders").unwrap().element_ids().await.unwrap();
    assert_eq!(ids, vec![Identifier::Int(42)]);
}

#[tokio::test]
async fn test_moving_an_element_evicts_both_owners() {
    let (unit, _db) = common::shop();
    let warm = unit.open_context();
    let customers = warm.find_many("Customer", [1, 2]).await.unwrap();
    for customer in customers.iter().flatten() {
        customer.collection("orders").unwrap().initialize().await.unwrap();
    }
    warm.close().await.unwrap();

    let context = unit.open_context();
    let order = context.find("Order", 43).await.unwrap().unwrap();
    order.set_reference("customer", Some(&Identifier::Int(2))).unwrap();
    context.flush().await.unwrap();

    assert!(common::cached_collection(&unit, "Customer.orders", 1).is_none());
    assert!(common::cached_collection(&unit, "Customer.orders", 2).is_none());

    let reader = unit.open_context();
    let grace = reader.find("Customer", 2).await.unwrap().unwrap();
    let ids = grace.collection("orders").unwrap().element_ids().await.unwrap();
    assert_eq!(ids, vec![Identifier::Int(43), Identifier::Int(44)]);
}

#[tokio::test]
async fn test_refresh_reloads_state_and_cache() {
    let (unit, db) = common::shop();
    let context = unit.open_context();
    let order = context.find("Order", 42).await.unwrap().unwrap();

    db.set_column("orders", "id", 42i64, "total", 999i64);
    db.set_column("orders", "id", 42i64, "version", 4i64);
    context.refresh(&order).await.unwrap();

    assert_eq!(order.value("total").unwrap(), DatabaseValue::Int64(999));
    assert_eq!(order.version(), Some(4));
    assert_eq!(context.flush().await.unwrap(), FlushSummary::default());
    assert_eq!(common::cached(&unit, "Order", 42).unwrap().version, Some(4));

    let selects = db.select_count();
    let reader = unit.open_context();
    let fresh = reader.find("Order", 42).await.unwrap().unwrap();
    assert_eq!(fresh.value("total").unwrap(), DatabaseValue::Int64(999));
    assert_eq!(db.select_count(), selects);
}

#[tokio::test]
async fn test_refresh_of_deleted_row_detaches() {
    let (unit, _db) = common::shop();
    let context = unit.open_context();
    let order = context.find("Order", 44).await.unwrap().unwrap();

    let other = unit.open_context();
    let same = other.find("Order", 44).await.unwrap().unwrap();
    other.remove(&same).unwrap();
    other.flush().await.unwrap();

    let err = context.refresh(&order).await.unwrap_err();
    assert!(matches!(err, OrmError::ObjectNotFound { .. }));
    assert_eq!(context.status(&order), EntityStatus::Detached);
}

#[tokio::test]
async fn test_read_only_instances_are_not_flushed() {
    let (unit, db) = common::shop();
    let context = unit.open_context();
    let order = context.find_read_only("Order", 42).await.unwrap().unwrap();
    assert_eq!(context.status(&order), EntityStatus::ReadOnly);

    order.set("total", 1i64).unwrap();
    assert_eq!(context.flush().await.unwrap().updated, 0);
    assert_eq!(total(&db, 42), Some(DatabaseValue::Int64(250)));

    context.set_read_only(&order, false).unwrap();
    order.set("total", 2i64).unwrap();
    assert_eq!(context.flush().await.unwrap().updated, 1);
    assert_eq!(total(&db, 42), Some(DatabaseValue::Int64(2)));
}

#[tokio::test]
async fn test_close_rolls_back_an_open_transaction() {
    let (unit, db) = common::shop();
    let context = unit.open_context();
    let order = context.find("Order", 42).await.unwrap().unwrap();

    context.begin().await.unwrap();
    order.set("total", 5i64).unwrap();
    context.flush().await.unwrap();
    context.close().await.unwrap();

    assert!(!db.in_transaction());
    assert_eq!(total(&db, 42), Some(DatabaseValue::Int64(250)));
    assert!(context.flush().await.unwrap_err().is_context_closed());
}
