mod common;

use keel_orm::{DatabaseValue, EntitySlot, EntityStatus, OrmError, PersistenceConfig, AccessType};

#[tokio::test]
async fn test_first_load_reads_store_then_identity_map() {
    let (unit, db) = common::shop();
    let context = unit.open_context();

    let order = context.find("Order", 42).await.unwrap().expect("order 42 exists");
    assert_eq!(db.select_count(), 1);
    assert_eq!(order.version(), Some(3));
    assert_eq!(order.value("total").unwrap(), DatabaseValue::Int64(250));
    assert_eq!(context.status(&order), EntityStatus::Managed);

    let cached = common::cached(&unit, "Order", 42).expect("order 42 was put into the cache");
    assert_eq!(cached.version, Some(3));

    let again = context.find("Order", 42).await.unwrap().unwrap();
    assert!(again.ptr_eq(&order));
    assert_eq!(db.statement_count(), 1);

    let stats = unit.statistics().snapshot();
    assert_eq!(stats.cache_misses, 1);
    assert_eq!(stats.cache_puts, 1);
    assert_eq!(stats.entity_fetches, 1);
}

#[tokio::test]
async fn test_missing_row_is_none() {
    let (unit, _db) = common::shop();
    let context = unit.open_context();

    assert!(context.find("Order", 999).await.unwrap().is_none());
    assert!(!context.is_managed("Order", 999).unwrap());
    assert_eq!(context.entity_count().unwrap(), 0);
}

#[tokio::test]
async fn test_find_many_keeps_request_order_and_batches() {
    let (unit, db) = common::shop();
    let context = unit.open_context();

    let first = context.find("Order", 43).await.unwrap().unwrap();
    let found = context.find_many("Order", [44, 42, 43, 99]).await.unwrap();

    assert_eq!(db.select_count(), 2);
    let ids: Vec<Option<String>> = found
        .iter()
        .map(|entity| entity.as_ref().map(|e| e.id().to_string()))
        .collect();
    assert_eq!(
        ids,
        vec![Some("44".to_string()), Some("42".to_string()), Some("43".to_string()), None]
    );
    assert!(found[2].as_ref().unwrap().ptr_eq(&first));
}

#[tokio::test]
async fn test_proxy_resolves_to_the_managed_instance() {
    let (unit, db) = common::shop();
    let context = unit.open_context();

    let order = context.find("Order", 42).await.unwrap().unwrap();
    let via_order = order.reference("customer").unwrap().expect("order 42 has a customer");
    let via_context = context.get_reference("Customer", 1).unwrap();
    assert!(via_order.ptr_eq(&via_context));
    assert!(!via_order.is_initialized());
    assert_eq!(db.select_count(), 1);

    let customer = via_order.initialize().await.unwrap();
    assert!(via_context.is_initialized());
    assert_eq!(customer.value("name").unwrap(), DatabaseValue::from("Ada"));

    let found = context.find("Customer", 1).await.unwrap().unwrap();
    assert!(found.ptr_eq(&customer));
    assert_eq!(db.select_count(), 2);
}

#[tokio::test]
async fn test_eager_cycle_resolves_once() {
    let (unit, db) = common::shop();
    let context = unit.open_context();

    let alice = context.find("Employee", 1).await.unwrap().unwrap();
    assert!(context.is_managed("Employee", 2).unwrap());
    assert_eq!(db.select_count(), 2);

    let bob_proxy = alice.reference("manager").unwrap().unwrap();
    assert!(bob_proxy.is_initialized());
    let bob = bob_proxy.initialize().await.unwrap();
    assert_eq!(bob.value("name").unwrap(), DatabaseValue::from("Bob"));

    let back = bob.reference("manager").unwrap().unwrap().initialize().await.unwrap();
    assert!(back.ptr_eq(&alice));
    assert_eq!(db.select_count(), 2);

    let carol = context.find("Employee", 3).await.unwrap().unwrap();
    assert!(carol.reference("manager").unwrap().is_none());
}

#[tokio::test]
async fn test_self_referencing_eager_association_resolves_to_itself() {
    let (unit, db) = common::shop();
    let context = unit.open_context();

    let dana = context.find("Employee", 4).await.unwrap().unwrap();
    assert_eq!(db.select_count(), 1);
    assert_eq!(context.entity_count().unwrap(), 1);

    let manager = dana.reference("manager").unwrap().unwrap();
    assert!(manager.is_initialized());
    assert!(manager.initialize().await.unwrap().ptr_eq(&dana));
    assert!(context.find("Employee", 4).await.unwrap().unwrap().ptr_eq(&dana));
    assert_eq!(db.select_count(), 1);
}

#[tokio::test]
async fn test_get_or_create_prefers_the_managed_instance() {
    let (unit, db) = common::shop();
    let context = unit.open_context();

    let order = context.find("Order", 42).await.unwrap().unwrap();
    match context.get_or_create("Order", 42).unwrap() {
        EntitySlot::Managed(entity) => assert!(entity.ptr_eq(&order)),
        EntitySlot::Proxy(_) => panic!("order 42 is already managed"),
    }

    let slot = context.get_or_create("Customer", 2).unwrap();
    let proxy = match slot {
        EntitySlot::Proxy(proxy) => proxy,
        EntitySlot::Managed(_) => panic!("customer 2 has not been loaded"),
    };
    assert!(proxy.ptr_eq(&context.get_reference("Customer", 2).unwrap()));
    assert_eq!(db.select_count(), 1);
}

#[tokio::test]
async fn test_duplicate_rows_fail_the_load() {
    let (unit, db) = common::shop();
    db.insert(
        "tickets",
        [
            ("id", DatabaseValue::Int64(7)),
            ("subject", DatabaseValue::from("Duplicate")),
            ("customer_id", DatabaseValue::Int64(1)),
        ],
    );
    let context = unit.open_context();

    let err = context.find("Ticket", 7).await.unwrap_err();
    assert!(matches!(err, OrmError::DuplicateIdentity { count: 2, .. }));
    assert!(!context.is_managed("Ticket", 7).unwrap());
}

#[tokio::test]
async fn test_batch_fetch_of_pending_proxies() {
    let config = PersistenceConfig {
        default_batch_fetch_size: 4,
        ..PersistenceConfig::default()
    };
    let (unit, db) = common::shop_with(AccessType::ReadWrite, config);
    let context = unit.open_context();

    let orders = context.find_many("Order", [42, 43, 44]).await.unwrap();
    assert_eq!(db.select_count(), 1);

    let ada = orders[0].as_ref().unwrap().reference("customer").unwrap().unwrap();
    let grace = orders[2].as_ref().unwrap().reference("customer").unwrap().unwrap();
    assert!(!grace.is_initialized());

    ada.initialize().await.unwrap();
    assert!(grace.is_initialized());
    assert_eq!(db.select_count(), 2);
    assert_eq!(grace.value("name").await.unwrap(), DatabaseValue::from("Grace"));
}

#[tokio::test]
async fn test_query_returns_managed_instances() {
    let (unit, _db) = common::shop();
    let context = unit.open_context();

    let order = context.find("Order", 44).await.unwrap().unwrap();
    let results = context
        .query(&keel_orm::Criteria::new("Order").eq("customer", 2i64))
        .await
        .unwrap();
    assert_eq!(results.len(), 1);
    assert!(results[0].ptr_eq(&order));
}
