mod common;

use assert_matches::assert_matches;
use std::sync::Arc;
use storefront_api::{
    errors::ServiceError,
    models::{StockKey, StockLine},
    repositories::{InMemoryStockStore, SeaOrmStockStore, StockStore},
};
use uuid::Uuid;

async fn store_for(backend: common::Backend) -> Arc<dyn StockStore> {
    match backend {
        common::Backend::InMemory => Arc::new(InMemoryStockStore::new()),
        common::Backend::Sqlite => Arc::new(SeaOrmStockStore::new(common::sqlite_pool().await)),
    }
}

async fn available(store: &dyn StockStore, key: &StockKey) -> u32 {
    store.level(key).await.unwrap().map_or(0, |l| l.available)
}

/// Many buyers race for a handful of units; exactly that many succeed.
async fn never_oversells(backend: common::Backend) {
    let store = store_for(backend).await;
    let key = StockKey::sized(Uuid::new_v4(), "M");
    store.seed(&key, 5).await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..40 {
        let store = store.clone();
        let key = key.clone();
        handles.push(tokio::spawn(async move {
            store.reserve(&[StockLine::new(key, 1)]).await
        }));
    }

    let mut reserved = 0;
    let mut short = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(()) => reserved += 1,
            Err(ServiceError::InsufficientStock(_)) => short += 1,
            Err(other) => panic!("unexpected error: {other}"),
        }
    }

    assert_eq!(reserved, 5);
    assert_eq!(short, 35);
    assert_eq!(available(store.as_ref(), &key).await, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn in_memory_store_never_oversells() {
    never_oversells(common::Backend::InMemory).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn sqlite_store_never_oversells() {
    never_oversells(common::Backend::Sqlite).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn carts_touching_keys_in_opposite_order_do_not_deadlock() {
    let store: Arc<dyn StockStore> = Arc::new(InMemoryStockStore::new());
    let a = StockKey::sized(Uuid::from_u128(1), "S");
    let b = StockKey::sized(Uuid::from_u128(2), "S");
    store.seed(&a, 100).await.unwrap();
    store.seed(&b, 100).await.unwrap();

    let mut handles = Vec::new();
    for i in 0..50 {
        let store = store.clone();
        let (first, second) = if i % 2 == 0 {
            (a.clone(), b.clone())
        } else {
            (b.clone(), a.clone())
        };
        handles.push(tokio::spawn(async move {
            store
                .reserve(&[StockLine::new(first, 1), StockLine::new(second, 1)])
                .await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    assert_eq!(available(store.as_ref(), &a).await, 50);
    assert_eq!(available(store.as_ref(), &b).await, 50);
}

#[tokio::test]
async fn sqlite_reservation_is_all_or_nothing() {
    let store = store_for(common::Backend::Sqlite).await;
    let plenty = StockKey::product(Uuid::new_v4());
    let scarce = StockKey::sized(Uuid::new_v4(), "XL");
    store.seed(&plenty, 10).await.unwrap();
    store.seed(&scarce, 1).await.unwrap();

    let err = store
        .reserve(&[StockLine::new(plenty.clone(), 4), StockLine::new(scarce.clone(), 2)])
        .await
        .unwrap_err();

    assert_matches!(err, ServiceError::InsufficientStock(shortage) => {
        assert_eq!(shortage.line, 1);
        assert_eq!(shortage.size.as_deref(), Some("XL"));
        assert_eq!(shortage.available, 1);
    });
    assert_eq!(available(store.as_ref(), &plenty).await, 10);
    assert_eq!(available(store.as_ref(), &scarce).await, 1);
}

#[tokio::test]
async fn sqlite_commit_and_release_move_counters() {
    let store = store_for(common::Backend::Sqlite).await;
    let key = StockKey::product(Uuid::new_v4());
    store.seed(&key, 6).await.unwrap();
    let line = [StockLine::new(key.clone(), 2)];

    store.reserve(&line).await.unwrap();
    store.commit(&line).await.unwrap();
    store.reserve(&line).await.unwrap();
    store.release(&line).await.unwrap();

    let level = store.level(&key).await.unwrap().unwrap();
    assert_eq!(level.available, 4);
    assert_eq!(level.sold, 2);
}

#[tokio::test]
async fn sqlite_seed_keeps_existing_levels_and_set_available_overrides() {
    let store = store_for(common::Backend::Sqlite).await;
    let key = StockKey::sized(Uuid::new_v4(), "M");

    assert!(store.seed(&key, 3).await.unwrap());
    assert!(!store.seed(&key, 99).await.unwrap());
    assert_eq!(available(store.as_ref(), &key).await, 3);

    let level = store.set_available(&key, 12).await.unwrap();
    assert_eq!(level.available, 12);

    let other = StockKey::product(Uuid::new_v4());
    store.seed(&other, 1).await.unwrap();
    let low = store.low_stock(5).await.unwrap();
    assert_eq!(low.len(), 1);
    assert_eq!(low[0].key, other);
}
