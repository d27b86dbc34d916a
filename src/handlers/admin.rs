use axum::{
    extract::{Path, Query, State},
    routing::{get, post, put},
    Json, Router,
};
use chrono::Utc;
use serde::Deserialize;
use uuid::Uuid;

use super::common::PageQuery;
use crate::{
    errors::ServiceError,
    models::{Order, OrderStatus, Product, ProductPatch, StockLevel},
    repositories::Page,
    services::{catalog::CatalogReader, orders::ExpirySummary},
    ApiResponse, ApiResult, AppState,
};

const DEFAULT_LOW_STOCK_THRESHOLD: u32 = 5;

#[derive(Debug, Deserialize)]
pub struct AdminOrderQuery {
    pub status: Option<OrderStatus>,
    #[serde(default = "default_page")]
    pub page: u64,
    #[serde(default = "default_limit")]
    pub limit: u64,
}

fn default_page() -> u64 {
    PageQuery::default().page
}

fn default_limit() -> u64 {
    PageQuery::default().limit
}

#[derive(Debug, Deserialize)]
pub struct UpdateOrderStatusRequest {
    pub status: OrderStatus,
    #[serde(default)]
    pub tracking_number: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SetStockRequest {
    #[serde(default)]
    pub size: Option<String>,
    pub available: u32,
}

#[derive(Debug, Deserialize)]
pub struct LowStockQuery {
    pub threshold: Option<u32>,
}

/// GET /api/v1/admin/orders
pub async fn list_orders(
    State(state): State<AppState>,
    Query(query): Query<AdminOrderQuery>,
) -> ApiResult<Page<Order>> {
    let page = state
        .orders
        .list_all(query.status, query.page, query.limit)
        .await?;
    Ok(Json(ApiResponse::success(page)))
}

/// PUT /api/v1/admin/orders/:id/status
pub async fn update_order_status(
    State(state): State<AppState>,
    Path(order_id): Path<Uuid>,
    Json(request): Json<UpdateOrderStatusRequest>,
) -> ApiResult<Order> {
    let order = state
        .orders
        .update_status(order_id, request.status, request.tracking_number)
        .await?;
    Ok(Json(ApiResponse::success(order)))
}

/// POST /api/v1/admin/orders/expire
pub async fn expire_pending_orders(State(state): State<AppState>) -> ApiResult<ExpirySummary> {
    let summary = state.orders.cancel_expired_pending(Utc::now()).await?;
    Ok(Json(ApiResponse::success(summary)))
}

/// PUT /api/v1/admin/products/:id
pub async fn update_product(
    State(state): State<AppState>,
    Path(product_id): Path<Uuid>,
    Json(patch): Json<ProductPatch>,
) -> ApiResult<Product> {
    let product = state.catalog.update_product(product_id, &patch)?;
    Ok(Json(ApiResponse::success(product)))
}

/// PUT /api/v1/admin/products/:id/stock
pub async fn set_product_stock(
    State(state): State<AppState>,
    Path(product_id): Path<Uuid>,
    Json(request): Json<SetStockRequest>,
) -> ApiResult<StockLevel> {
    let product = state
        .catalog
        .get_product(product_id)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("Product {} not found", product_id)))?;
    let key = product
        .stock_key_for(request.size.as_deref())
        .map_err(ServiceError::ValidationError)?;
    let level = state.ledger.set_available(&key, request.available).await?;
    Ok(Json(ApiResponse::success(level)))
}

/// GET /api/v1/admin/low-stock
pub async fn low_stock(
    State(state): State<AppState>,
    Query(query): Query<LowStockQuery>,
) -> ApiResult<Vec<StockLevel>> {
    let threshold = query.threshold.unwrap_or(DEFAULT_LOW_STOCK_THRESHOLD);
    Ok(Json(ApiResponse::success(
        state.ledger.low_stock(threshold).await?,
    )))
}

/// Staff routes. Callers wrap these in the admin-token guard.
pub fn admin_routes() -> Router<AppState> {
    Router::new()
        .route("/orders", get(list_orders))
        .route("/orders/expire", post(expire_pending_orders))
        .route("/orders/:id/status", put(update_order_status))
        .route("/products/:id", put(update_product))
        .route("/products/:id/stock", put(set_product_stock))
        .route("/low-stock", get(low_stock))
}
