use async_trait::async_trait;
use axum::{extract::FromRequestParts, http::request::Parts};
use serde::Deserialize;

use crate::errors::ServiceError;

/// Header carrying the authenticated customer, set by the upstream auth layer.
pub const CUSTOMER_ID_HEADER: &str = "x-customer-id";

/// The calling customer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CustomerId(pub String);

impl CustomerId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for CustomerId
where
    S: Send + Sync,
{
    type Rejection = ServiceError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(CUSTOMER_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(|v| CustomerId(v.to_string()))
            .ok_or_else(|| ServiceError::Unauthorized("customer identity required".to_string()))
    }
}

/// Pagination parameters for list operations
#[derive(Debug, Deserialize)]
pub struct PageQuery {
    #[serde(default = "default_page")]
    pub page: u64,
    #[serde(default = "default_limit")]
    pub limit: u64,
}

fn default_page() -> u64 {
    1
}

fn default_limit() -> u64 {
    20
}

impl Default for PageQuery {
    fn default() -> Self {
        Self {
            page: default_page(),
            limit: default_limit(),
        }
    }
}
