use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use uuid::Uuid;

use super::common::{CustomerId, PageQuery};
use crate::{
    errors::ServiceError,
    models::{CreateOrderRequest, Order},
    repositories::Page,
    ApiResponse, ApiResult, AppState,
};

/// POST /api/v1/orders
pub async fn create_order(
    State(state): State<AppState>,
    customer: CustomerId,
    Json(request): Json<CreateOrderRequest>,
) -> Result<(StatusCode, Json<ApiResponse<Order>>), ServiceError> {
    let order = state.orders.create(customer.as_str(), request).await?;
    Ok((StatusCode::CREATED, Json(ApiResponse::success(order))))
}

/// GET /api/v1/orders/my-orders
pub async fn list_my_orders(
    State(state): State<AppState>,
    customer: CustomerId,
    Query(query): Query<PageQuery>,
) -> ApiResult<Page<Order>> {
    let page = state
        .orders
        .list_for_customer(customer.as_str(), query.page, query.limit)
        .await?;
    Ok(Json(ApiResponse::success(page)))
}

/// GET /api/v1/orders/:id
pub async fn get_order(
    State(state): State<AppState>,
    customer: CustomerId,
    Path(order_id): Path<Uuid>,
) -> ApiResult<Order> {
    let order = state
        .orders
        .get_for_customer(customer.as_str(), order_id)
        .await?;
    Ok(Json(ApiResponse::success(order)))
}

pub fn order_routes() -> Router<AppState> {
    Router::new()
        .route("/", post(create_order))
        .route("/my-orders", get(list_my_orders))
        .route("/:id", get(get_order))
}
