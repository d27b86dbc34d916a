use std::io::Write;
use std::path::Path;
use storefront_api::{
    errors::ServiceError,
    repositories::{InMemoryStockStore, StockStore},
    services::catalog::{load_seed, seed_catalog, CatalogReader, InMemoryCatalog},
};

#[tokio::test]
async fn shipped_catalog_seed_loads() {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("config/catalog.json");
    let seed = load_seed(&path).expect("bundled catalog parses");
    assert!(!seed.is_empty());

    let catalog = InMemoryCatalog::new();
    let stock = InMemoryStockStore::new();
    let created = seed_catalog(&catalog, &stock, seed.clone()).await.unwrap();
    assert!(created > 0);
    assert_eq!(catalog.len(), seed.len());

    for product in &seed {
        let loaded = catalog.get_product(product.id).await.unwrap().unwrap();
        assert_eq!(loaded.price, product.price);
    }
}

#[tokio::test]
async fn reseeding_never_restocks() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        r#"[{{"id": "00000000-0000-0000-0000-0000000000c1", "name": "Belt",
            "category": "Accessories", "price": "19.00", "stock": 3}}]"#
    )
    .unwrap();

    let catalog = InMemoryCatalog::new();
    let stock = InMemoryStockStore::new();
    let first = seed_catalog(&catalog, &stock, load_seed(file.path()).unwrap())
        .await
        .unwrap();
    assert_eq!(first, 1);

    let key = storefront_api::models::StockKey::product(
        "00000000-0000-0000-0000-0000000000c1".parse().unwrap(),
    );
    stock.set_available(&key, 1).await.unwrap();

    let second = seed_catalog(&catalog, &stock, load_seed(file.path()).unwrap())
        .await
        .unwrap();
    assert_eq!(second, 0);
    assert_eq!(stock.level(&key).await.unwrap().unwrap().available, 1);
}

#[test]
fn malformed_seed_is_a_validation_error() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(file, "{{ not json").unwrap();
    assert!(matches!(
        load_seed(file.path()),
        Err(ServiceError::ValidationError(_))
    ));
}
