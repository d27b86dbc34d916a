use axum::{
    extract::{Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
};
use tracing::warn;

use crate::{errors::ServiceError, AppState};

pub const ADMIN_TOKEN_HEADER: &str = "x-admin-token";

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Admits requests carrying the configured admin token. With no token
/// configured the admin surface is closed.
pub async fn require_admin_token(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let Some(expected) = state.config.admin_api_token.as_deref() else {
        return ServiceError::Forbidden("admin API is disabled".to_string()).into_response();
    };

    let supplied = request
        .headers()
        .get(ADMIN_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok());
    match supplied {
        Some(token) if constant_time_eq(token.as_bytes(), expected.as_bytes()) => {
            next.run(request).await
        }
        Some(_) => {
            warn!(uri = %request.uri(), "admin request with wrong token");
            ServiceError::Forbidden("invalid admin token".to_string()).into_response()
        }
        None => ServiceError::Unauthorized("admin token required".to_string()).into_response(),
    }
}
