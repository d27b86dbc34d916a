//! Catalog Reader: product lookup for checkout, plus the allow-listed
//! product update and the JSON seed loader.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::path::Path;
use tracing::{info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

use crate::errors::ServiceError;
use crate::models::{Category, Product, ProductPatch, StockKey, Variant};
use crate::repositories::StockStore;

#[async_trait]
pub trait CatalogReader: Send + Sync {
    async fn get_product(&self, id: Uuid) -> Result<Option<Product>, ServiceError>;
}

/// Products held in process.
#[derive(Debug, Default)]
pub struct InMemoryCatalog {
    products: DashMap<Uuid, Product>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, product: Product) {
        self.products.insert(product.id, product);
    }

    pub fn len(&self) -> usize {
        self.products.len()
    }

    pub fn is_empty(&self) -> bool {
        self.products.is_empty()
    }

    /// Validates `patch` and applies it in one step. Existing orders keep
    /// their line snapshots.
    #[instrument(skip(self, patch))]
    pub fn update_product(&self, id: Uuid, patch: &ProductPatch) -> Result<Product, ServiceError> {
        patch.validate()?;
        if patch.is_empty() {
            return Err(ServiceError::ValidationError(
                "no updatable fields supplied".to_string(),
            ));
        }

        let mut entry = self
            .products
            .get_mut(&id)
            .ok_or_else(|| ServiceError::NotFound(format!("Product {} not found", id)))?;
        patch.apply_to(entry.value_mut(), Utc::now());
        info!(product_id = %id, "product updated");
        Ok(entry.value().clone())
    }
}

#[async_trait]
impl CatalogReader for InMemoryCatalog {
    async fn get_product(&self, id: Uuid) -> Result<Option<Product>, ServiceError> {
        Ok(self.products.get(&id).map(|entry| entry.value().clone()))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SeedVariant {
    pub size: String,
    #[serde(default)]
    pub sku: Option<String>,
    #[serde(default)]
    pub stock: u32,
}

/// One product in the catalog seed file.
#[derive(Debug, Clone, Deserialize)]
pub struct SeedProduct {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub category: Category,
    pub price: Decimal,
    #[serde(default = "default_active")]
    pub active: bool,
    #[serde(default)]
    pub brand: Option<String>,
    #[serde(default)]
    pub material: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Non-sized stock.
    #[serde(default)]
    pub stock: u32,
    #[serde(default)]
    pub variants: Vec<SeedVariant>,
}

fn default_active() -> bool {
    true
}

impl SeedProduct {
    fn into_product(self) -> (Product, Vec<(StockKey, u32)>) {
        let now = Utc::now();
        let mut stock = Vec::with_capacity(self.variants.len() + 1);
        if self.variants.is_empty() {
            stock.push((StockKey::product(self.id), self.stock));
        }
        let variants = self
            .variants
            .into_iter()
            .map(|v| {
                stock.push((StockKey::sized(self.id, v.size.clone()), v.stock));
                Variant {
                    size: v.size,
                    sku: v.sku,
                }
            })
            .collect();

        let product = Product {
            id: self.id,
            name: self.name,
            description: self.description,
            category: self.category,
            price: self.price,
            active: self.active,
            variants,
            brand: self.brand,
            material: self.material,
            tags: self.tags,
            created_at: now,
            updated_at: now,
        };
        (product, stock)
    }
}

pub fn load_seed(path: &Path) -> Result<Vec<SeedProduct>, ServiceError> {
    let raw = std::fs::read_to_string(path).map_err(|e| {
        ServiceError::InternalError(format!("cannot read catalog seed {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&raw).map_err(|e| {
        ServiceError::ValidationError(format!("invalid catalog seed {}: {}", path.display(), e))
    })
}

/// Loads products into `catalog` and creates stock records that do not exist
/// yet. Existing counts are left alone so a restart never restocks.
pub async fn seed_catalog(
    catalog: &InMemoryCatalog,
    stock: &dyn StockStore,
    seed: Vec<SeedProduct>,
) -> Result<usize, ServiceError> {
    let mut created = 0;
    for entry in seed {
        if entry.price.is_sign_negative() {
            warn!(product_id = %entry.id, "skipping seed product with negative price");
            continue;
        }
        let (product, levels) = entry.into_product();
        for (key, available) in levels {
            if stock.seed(&key, available).await? {
                created += 1;
            }
        }
        catalog.insert(product);
    }
    info!(
        products = catalog.len(),
        stock_records_created = created,
        "catalog seeded"
    );
    Ok(created)
}
