use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use uuid::Uuid;

use super::common::CustomerId;
use crate::{
    errors::ServiceError,
    models::Order,
    services::payments::{ConfirmOutcome, PaymentInitiation, PaymentMethodInfo},
    ApiResponse, ApiResult, AppState,
};

#[derive(Debug, Deserialize)]
pub struct CreatePaymentIntentRequest {
    pub order_id: Uuid,
}

#[derive(Debug, Deserialize)]
pub struct ConfirmPaymentRequest {
    pub order_id: Uuid,
    pub payment_intent_id: String,
}

/// POST /api/v1/payments/create-payment-intent
pub async fn create_payment_intent(
    State(state): State<AppState>,
    customer: CustomerId,
    Json(request): Json<CreatePaymentIntentRequest>,
) -> ApiResult<PaymentInitiation> {
    let initiation = state
        .payments
        .initiate(Some(customer.as_str()), request.order_id)
        .await?;
    Ok(Json(ApiResponse::success(initiation)))
}

/// POST /api/v1/payments/confirm-payment
pub async fn confirm_payment(
    State(state): State<AppState>,
    customer: CustomerId,
    Json(request): Json<ConfirmPaymentRequest>,
) -> ApiResult<Order> {
    if request.payment_intent_id.trim().is_empty() {
        return Err(ServiceError::ValidationError(
            "payment_intent_id is required".to_string(),
        ));
    }
    match state
        .payments
        .confirm_from_client(
            Some(customer.as_str()),
            request.order_id,
            request.payment_intent_id.trim(),
        )
        .await?
    {
        ConfirmOutcome::Paid(order) => Ok(Json(ApiResponse::success(order))),
        ConfirmOutcome::NotCompleted { status, .. } => Err(ServiceError::PaymentNotCompleted(
            format!("payment status is {}", status),
        )),
    }
}

/// GET /api/v1/payments/methods
pub async fn payment_methods(State(state): State<AppState>) -> ApiResult<Vec<PaymentMethodInfo>> {
    Ok(Json(ApiResponse::success(state.payments.available_methods())))
}

/// Customer payment routes. The webhook is mounted separately, unauthenticated.
pub fn payment_routes() -> Router<AppState> {
    Router::new()
        .route("/create-payment-intent", post(create_payment_intent))
        .route("/confirm-payment", post(confirm_payment))
        .route("/methods", get(payment_methods))
}
