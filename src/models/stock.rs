use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// One countable inventory pool: a product, optionally narrowed to a size.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StockKey {
    pub product_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,
}

impl StockKey {
    pub fn product(product_id: Uuid) -> Self {
        Self {
            product_id,
            size: None,
        }
    }

    pub fn sized(product_id: Uuid, size: impl Into<String>) -> Self {
        Self {
            product_id,
            size: Some(size.into()),
        }
    }

    /// Size column value used by the relational store, where non-sized stock
    /// is keyed by the empty string.
    pub fn size_column(&self) -> &str {
        self.size.as_deref().unwrap_or("")
    }

    pub fn from_columns(product_id: Uuid, size: String) -> Self {
        if size.is_empty() {
            Self::product(product_id)
        } else {
            Self::sized(product_id, size)
        }
    }
}

impl fmt::Display for StockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.size {
            Some(size) => write!(f, "{}/{}", self.product_id, size),
            None => write!(f, "{}", self.product_id),
        }
    }
}

/// A quantity requested against a single stock key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockLine {
    pub key: StockKey,
    pub quantity: u32,
}

impl StockLine {
    pub fn new(key: StockKey, quantity: u32) -> Self {
        Self { key, quantity }
    }
}

/// Current counters for a stock key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockLevel {
    pub key: StockKey,
    pub available: u32,
    pub sold: u64,
}

/// Why a reservation was refused, naming the first line that could not be met.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockShortage {
    pub line: usize,
    pub product_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,
    pub requested: u32,
    pub available: u32,
}

impl fmt::Display for StockShortage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "line {} (product {}{}) requested {}, only {} available",
            self.line,
            self.product_id,
            self.size
                .as_deref()
                .map(|s| format!(", size {s}"))
                .unwrap_or_default(),
            self.requested,
            self.available
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_column_round_trips_through_empty_string() {
        let id = Uuid::new_v4();
        let plain = StockKey::product(id);
        assert_eq!(plain.size_column(), "");
        assert_eq!(StockKey::from_columns(id, String::new()), plain);

        let sized = StockKey::sized(id, "M");
        assert_eq!(StockKey::from_columns(id, "M".into()), sized);
    }

    #[test]
    fn shortage_message_names_line_and_size() {
        let shortage = StockShortage {
            line: 0,
            product_id: Uuid::nil(),
            size: Some("M".into()),
            requested: 1,
            available: 0,
        };
        let msg = shortage.to_string();
        assert!(msg.starts_with("line 0"));
        assert!(msg.contains("size M"));
    }
}
