use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::{Validate, ValidationError};

use super::stock::StockKey;

/// Sizes a variant may be offered in.
pub const SIZES: &[&str] = &[
    "XS", "S", "M", "L", "XL", "XXL", "28", "30", "32", "34", "36", "38", "40", "42", "ONE_SIZE",
];

#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
pub enum Category {
    #[serde(rename = "T-Shirts")]
    #[strum(serialize = "T-Shirts")]
    TShirts,
    Hoodies,
    Jeans,
    Shoes,
    Accessories,
}

impl Category {
    /// Categories whose every purchase must name a size.
    pub fn requires_size(&self) -> bool {
        matches!(self, Category::TShirts)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Variant {
    pub size: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sku: Option<String>,
}

/// Catalog view of a product as supplied by the Catalog Reader.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub id: Uuid,
    pub name: String,
    pub description: String,
    pub category: Category,
    pub price: Decimal,
    pub active: bool,
    #[serde(default)]
    pub variants: Vec<Variant>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub brand: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub material: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Product {
    pub fn variant(&self, size: &str) -> Option<&Variant> {
        self.variants.iter().find(|v| v.size == size)
    }

    /// Resolves which stock pool a purchase of this product draws from.
    ///
    /// Sized categories require a size; a supplied size must name one of the
    /// product's variants. Without a size, the non-sized pool is used.
    pub fn stock_key_for(&self, size: Option<&str>) -> Result<StockKey, String> {
        let size = size.map(str::trim).filter(|s| !s.is_empty());
        match size {
            None if self.category.requires_size() => {
                Err(format!("Size is required for {}", self.name))
            }
            None => Ok(StockKey::product(self.id)),
            Some(size) if self.variant(size).is_some() => Ok(StockKey::sized(self.id, size)),
            Some(_) if self.variants.is_empty() => {
                Err(format!("{} is not sold in sizes", self.name))
            }
            Some(size) => Err(format!("Size {} is not offered for {}", size, self.name)),
        }
    }
}

/// The externally mutable attributes of a product. Anything not listed here
/// cannot be changed through the update path.
#[derive(Debug, Default, Clone, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct ProductPatch {
    #[validate(length(min = 1, max = 100), custom = "not_blank")]
    pub name: Option<String>,
    #[validate(length(min = 1, max = 2000), custom = "not_blank")]
    pub description: Option<String>,
    pub category: Option<Category>,
    #[validate(custom = "non_negative_price")]
    pub price: Option<Decimal>,
    pub active: Option<bool>,
    #[validate(length(max = 100))]
    pub brand: Option<String>,
    #[validate(length(max = 100))]
    pub material: Option<String>,
    pub tags: Option<Vec<String>>,
}

impl ProductPatch {
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.description.is_none()
            && self.category.is_none()
            && self.price.is_none()
            && self.active.is_none()
            && self.brand.is_none()
            && self.material.is_none()
            && self.tags.is_none()
    }

    /// Writes every supplied field onto `product`. Callers validate first.
    pub fn apply_to(&self, product: &mut Product, now: DateTime<Utc>) {
        if let Some(name) = &self.name {
            product.name = name.trim().to_string();
        }
        if let Some(description) = &self.description {
            product.description = description.trim().to_string();
        }
        if let Some(category) = self.category {
            product.category = category;
        }
        if let Some(price) = self.price {
            product.price = price;
        }
        if let Some(active) = self.active {
            product.active = active;
        }
        if let Some(brand) = &self.brand {
            product.brand = Some(brand.clone()).filter(|b| !b.is_empty());
        }
        if let Some(material) = &self.material {
            product.material = Some(material.clone()).filter(|m| !m.is_empty());
        }
        if let Some(tags) = &self.tags {
            product.tags = tags.clone();
        }
        product.updated_at = now;
    }
}

fn not_blank(value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::new("blank"));
    }
    Ok(())
}

fn non_negative_price(price: &Decimal) -> Result<(), ValidationError> {
    if price.is_sign_negative() {
        let mut err = ValidationError::new("price");
        err.message = Some("price must not be negative".into());
        return Err(err);
    }
    Ok(())
}
