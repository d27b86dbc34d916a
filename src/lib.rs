//! Storefront API Library
//!
//! Order fulfillment for an online storefront: stock reservation, pricing,
//! the order lifecycle and payment reconciliation.
#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![allow(elided_lifetimes_in_paths)]
#![warn(clippy::all, clippy::perf, clippy::dbg_macro)]

pub mod circuit_breaker;
pub mod config;
pub mod db;
pub mod entities;
pub mod errors;
pub mod events;
pub mod handlers;
pub mod metrics;
pub mod middleware_helpers;
pub mod migrator;
pub mod models;
pub mod repositories;
pub mod services;
pub mod tracing;

use axum::{
    extract::State,
    http::HeaderValue,
    middleware::{from_fn, from_fn_with_state},
    response::Json,
    routing::{get, post},
    Router,
};
use chrono::Utc;
use sea_orm::DatabaseConnection;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tower_http::{
    compression::CompressionLayer,
    cors::{AllowOrigin, Any, CorsLayer},
    trace::TraceLayer,
};

use crate::{
    circuit_breaker::CircuitBreaker,
    config::AppConfig,
    events::EventSender,
    repositories::{OrderRepository, StockStore},
    services::{
        catalog::InMemoryCatalog,
        inventory::StockLedger,
        orders::{OrderService, OrderSettings},
        payment_gateway::PaymentGateway,
        payments::PaymentService,
    },
};

// App state definition
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub orders: OrderService,
    pub payments: PaymentService,
    pub ledger: StockLedger,
    pub catalog: Arc<InMemoryCatalog>,
    pub db: Option<Arc<DatabaseConnection>>,
}

impl AppState {
    /// Wires the pipeline services over the given storage and gateway.
    pub fn new(
        config: AppConfig,
        stock: Arc<dyn StockStore>,
        orders: Arc<dyn OrderRepository>,
        catalog: Arc<InMemoryCatalog>,
        gateway: Arc<dyn PaymentGateway>,
        event_sender: EventSender,
    ) -> Self {
        let ledger = StockLedger::new(stock, event_sender.clone());
        let order_service = OrderService::new(
            orders,
            catalog.clone(),
            ledger.clone(),
            event_sender,
            OrderSettings::from(&config),
        );
        let breaker = Arc::new(CircuitBreaker::new(
            config.circuit_breaker_failure_threshold,
            Duration::from_secs(config.circuit_breaker_timeout_secs),
        ));
        let payments = PaymentService::new(
            order_service.clone(),
            gateway,
            breaker,
            config.currency.clone(),
        );

        Self {
            config: Arc::new(config),
            orders: order_service,
            payments,
            ledger,
            catalog,
            db: None,
        }
    }

    pub fn with_database(mut self, db: Arc<DatabaseConnection>) -> Self {
        self.db = Some(db);
        self
    }
}

// Common response wrappers
#[derive(Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<ResponseMeta>,
}

#[derive(Serialize)]
pub struct ResponseMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub timestamp: String,
}

impl ResponseMeta {
    fn capture() -> Self {
        Self {
            request_id: crate::tracing::current_request_id().map(|rid| rid.as_str().to_string()),
            timestamp: Utc::now().to_rfc3339(),
        }
    }
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            message: None,
            meta: Some(ResponseMeta::capture()),
        }
    }
}

/// Standard API result type for JSON responses
pub type ApiResult<T> = Result<Json<ApiResponse<T>>, errors::ServiceError>;

pub fn api_v1_routes(state: &AppState) -> Router<AppState> {
    let admin = handlers::admin::admin_routes().route_layer(from_fn_with_state(
        state.clone(),
        middleware_helpers::require_admin_token,
    ));

    Router::new()
        .route("/status", get(api_status))
        .nest("/orders", handlers::orders::order_routes())
        .nest("/payments", handlers::payments::payment_routes())
        // signature-verified, no customer identity
        .route(
            "/payments/webhook",
            post(handlers::payment_webhooks::payment_webhook),
        )
        .nest("/admin", admin)
}

fn cors_layer(config: &AppConfig) -> CorsLayer {
    let origins: Vec<HeaderValue> = config
        .cors_origins()
        .iter()
        .filter_map(|origin| HeaderValue::from_str(origin).ok())
        .collect();
    if origins.is_empty() {
        CorsLayer::permissive()
    } else {
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(origins))
            .allow_methods(Any)
            .allow_headers(Any)
    }
}

/// The complete HTTP application.
pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics::metrics_handler))
        .nest("/api/v1", api_v1_routes(&state))
        .layer(CompressionLayer::new())
        .layer(cors_layer(&state.config))
        .layer(TraceLayer::new_for_http().make_span_with(crate::tracing::RequestSpanMaker))
        .layer(from_fn(middleware_helpers::request_id_middleware))
        .with_state(state)
}

async fn api_status(State(state): State<AppState>) -> Json<ApiResponse<Value>> {
    Json(ApiResponse::success(json!({
        "status": "ok",
        "service": "storefront-api",
        "version": env!("CARGO_PKG_VERSION"),
        "environment": state.config.environment,
        "storage_backend": state.config.storage_backend,
        "timestamp": Utc::now().to_rfc3339(),
    })))
}

async fn health_check(State(state): State<AppState>) -> Json<ApiResponse<Value>> {
    let database = match &state.db {
        Some(db) => match db::check_connection(db).await {
            Ok(()) => "healthy",
            Err(_) => "unhealthy",
        },
        None => "not_configured",
    };
    let status = if database == "unhealthy" {
        "degraded"
    } else {
        "healthy"
    };

    Json(ApiResponse::success(json!({
        "status": status,
        "checks": { "database": database },
        "timestamp": Utc::now().to_rfc3339(),
    })))
}

#[cfg(test)]
mod response_tests {
    use super::*;
    use chrono::DateTime;

    #[tokio::test]
    async fn success_response_includes_request_metadata() {
        let response =
            crate::tracing::scope_request_id(crate::tracing::RequestId::new("meta-123"), async {
                ApiResponse::success("ok")
            })
            .await;

        let meta = response.meta.expect("metadata expected");
        assert_eq!(meta.request_id.as_deref(), Some("meta-123"));
        DateTime::parse_from_rfc3339(&meta.timestamp).expect("timestamp should parse");
    }
}
