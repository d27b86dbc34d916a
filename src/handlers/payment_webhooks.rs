use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use bytes::Bytes;
use serde_json::json;

use crate::{errors::ServiceError, services::payment_gateway::SIGNATURE_HEADER, AppState};

/// POST /api/v1/payments/webhook
///
/// The body is read raw; the signature covers the exact bytes sent.
pub async fn payment_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, ServiceError> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok());
    let outcome = state
        .payments
        .confirm_from_webhook(&body, signature)
        .await?;

    Ok((
        StatusCode::OK,
        Json(json!({ "received": true, "result": outcome })),
    ))
}
