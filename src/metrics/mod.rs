use axum::{http::header, http::StatusCode, response::IntoResponse};
use lazy_static::lazy_static;
use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new_custom(Some("storefront".into()), None)
        .expect("registry can be created");
    pub static ref ORDERS_CREATED: IntCounter =
        IntCounter::new("orders_created_total", "Orders created in pending state")
            .expect("metric can be created");
    pub static ref STOCK_RESERVATION_FAILURES: IntCounter = IntCounter::new(
        "stock_reservation_failures_total",
        "Checkouts refused for insufficient stock"
    )
    .expect("metric can be created");
    pub static ref PAYMENT_FINALIZATIONS: IntCounterVec = IntCounterVec::new(
        Opts::new(
            "payment_finalizations_total",
            "Orders finalized, by payment outcome"
        ),
        &["outcome"]
    )
    .expect("metric can be created");
    pub static ref DUPLICATE_FINALIZATIONS: IntCounterVec = IntCounterVec::new(
        Opts::new(
            "duplicate_finalizations_total",
            "Finalization attempts absorbed by the idempotent guard, by operation"
        ),
        &["operation"]
    )
    .expect("metric can be created");
    pub static ref WEBHOOK_EVENTS: IntCounterVec = IntCounterVec::new(
        Opts::new("payment_webhook_events_total", "Verified webhook events by type"),
        &["event_type"]
    )
    .expect("metric can be created");
    pub static ref WEBHOOK_SIGNATURE_REJECTIONS: IntCounter = IntCounter::new(
        "payment_webhook_signature_rejections_total",
        "Webhook deliveries dropped for a bad signature"
    )
    .expect("metric can be created");
    pub static ref EXPIRED_ORDERS_CANCELLED: IntCounter = IntCounter::new(
        "expired_orders_cancelled_total",
        "Pending orders cancelled after the abandonment window"
    )
    .expect("metric can be created");
}

/// Registers every collector with [`REGISTRY`]. Safe to call more than once.
pub fn register_metrics() {
    let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
        Box::new(ORDERS_CREATED.clone()),
        Box::new(STOCK_RESERVATION_FAILURES.clone()),
        Box::new(PAYMENT_FINALIZATIONS.clone()),
        Box::new(DUPLICATE_FINALIZATIONS.clone()),
        Box::new(WEBHOOK_EVENTS.clone()),
        Box::new(WEBHOOK_SIGNATURE_REJECTIONS.clone()),
        Box::new(EXPIRED_ORDERS_CANCELLED.clone()),
    ];
    for collector in collectors {
        if let Err(err) = REGISTRY.register(collector) {
            if !matches!(err, prometheus::Error::AlreadyReg) {
                tracing::warn!(error = %err, "failed to register metric");
            }
        }
    }
}

pub fn render() -> Result<String, prometheus::Error> {
    let mut buffer = Vec::new();
    TextEncoder::new().encode(&REGISTRY.gather(), &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
}

/// `GET /metrics`
pub async fn metrics_handler() -> impl IntoResponse {
    match render() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(err) => {
            tracing::error!(error = %err, "failed to encode metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
