mod common;

use axum::http::{Method, StatusCode};
use common::{Backend, TestApp, ADMIN_TOKEN, CAP, CUSTOMER, TEE};
use serde_json::{json, Value};
use storefront_api::services::payment_gateway::IntentStatus;

const CUSTOMER_HEADER: (&str, &str) = ("x-customer-id", CUSTOMER);
const ADMIN_HEADER: (&str, &str) = ("x-admin-token", ADMIN_TOKEN);

fn order_body(product: uuid::Uuid, size: Option<&str>, quantity: u32) -> String {
    json!({
        "items": [{ "product_id": product, "size": size, "quantity": quantity }],
        "shipping_address": {
            "first_name": "Ada",
            "last_name": "Lovelace",
            "street": "12 Engine Row",
            "city": "London",
            "zip_code": "N1 9GU"
        },
        "payment_method": "stripe"
    })
    .to_string()
}

async fn place_order(app: &TestApp, body: String) -> Value {
    let (status, json) = app
        .request(Method::POST, "/api/v1/orders", Some(body), &[CUSTOMER_HEADER])
        .await;
    assert_eq!(status, StatusCode::CREATED, "{json}");
    json["data"].clone()
}

#[tokio::test]
async fn health_reports_storage_state() {
    let memory = TestApp::new(Backend::InMemory).await;
    let (status, body) = memory.request(Method::GET, "/health", None, &[]).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["status"], "healthy");
    assert_eq!(body["data"]["checks"]["database"], "not_configured");

    let sqlite = TestApp::new(Backend::Sqlite).await;
    let (_, body) = sqlite.request(Method::GET, "/health", None, &[]).await;
    assert_eq!(body["data"]["checks"]["database"], "healthy");
}

#[tokio::test]
async fn metrics_endpoint_serves_prometheus_text() {
    storefront_api::metrics::register_metrics();
    let app = TestApp::new(Backend::InMemory).await;
    place_order(&app, order_body(CAP, None, 1)).await;

    let request = axum::http::Request::builder()
        .uri("/metrics")
        .body(axum::body::Body::empty())
        .unwrap();
    let response = tower::ServiceExt::oneshot(storefront_api::app(app.state.clone()), request)
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = http_body_util::BodyExt::collect(response.into_body())
        .await
        .unwrap()
        .to_bytes();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(text.contains("storefront_orders_created_total"));
}

#[tokio::test]
async fn request_id_is_echoed() {
    let app = TestApp::new(Backend::InMemory).await;
    let request = axum::http::Request::builder()
        .uri("/api/v1/status")
        .header("x-request-id", "trace-abc")
        .body(axum::body::Body::empty())
        .unwrap();
    let response = tower::ServiceExt::oneshot(storefront_api::app(app.state.clone()), request)
        .await
        .unwrap();
    assert_eq!(
        response.headers().get("x-request-id").unwrap(),
        "trace-abc"
    );
}

#[tokio::test]
async fn create_order_returns_priced_pending_order() {
    let app = TestApp::new(Backend::InMemory).await;
    let order = place_order(&app, order_body(TEE, Some("M"), 1)).await;

    assert_eq!(order["status"], "pending");
    assert_eq!(order["payment_status"], "pending");
    assert_eq!(order["totals"]["total"], "42.38");
    assert_eq!(order["customer_id"], CUSTOMER);

    let id = order["id"].as_str().unwrap();
    let (status, fetched) = app
        .request(Method::GET, &format!("/api/v1/orders/{id}"), None, &[CUSTOMER_HEADER])
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(fetched["data"]["id"], id);

    let (status, _) = app
        .request(
            Method::GET,
            &format!("/api/v1/orders/{id}"),
            None,
            &[("x-customer-id", "intruder")],
        )
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn order_routes_require_customer_identity() {
    let app = TestApp::new(Backend::InMemory).await;
    let (status, body) = app
        .request(
            Method::POST,
            "/api/v1/orders",
            Some(order_body(CAP, None, 1)),
            &[],
        )
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "Unauthorized");
    assert_eq!(app.available(&common::cap_key()).await, 10);
}

#[tokio::test]
async fn out_of_stock_is_unprocessable_with_details() {
    let app = TestApp::new(Backend::InMemory).await;
    place_order(&app, order_body(TEE, Some("M"), 1)).await;

    let (status, body) = app
        .request(
            Method::POST,
            "/api/v1/orders",
            Some(order_body(TEE, Some("M"), 1)),
            &[CUSTOMER_HEADER],
        )
        .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["details"]["line"], 0);
    assert_eq!(body["details"]["available"], 0);
}

#[tokio::test]
async fn my_orders_are_paginated() {
    let app = TestApp::new(Backend::InMemory).await;
    for _ in 0..3 {
        place_order(&app, order_body(CAP, None, 1)).await;
    }
    let (status, body) = app
        .request(
            Method::GET,
            "/api/v1/orders/my-orders?page=2&limit=2",
            None,
            &[CUSTOMER_HEADER],
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["total"], 3);
    assert_eq!(body["data"]["items"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn payment_flow_over_http() {
    let app = TestApp::new(Backend::InMemory).await;
    let order = place_order(&app, order_body(CAP, None, 2)).await;
    let order_id = order["id"].as_str().unwrap().to_string();

    let (status, body) = app
        .request(
            Method::POST,
            "/api/v1/payments/create-payment-intent",
            Some(json!({ "order_id": order_id }).to_string()),
            &[CUSTOMER_HEADER],
        )
        .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    let intent_id = body["data"]["payment_intent_id"].as_str().unwrap().to_string();
    assert!(body["data"]["client_secret"].is_string());

    let confirm = json!({ "order_id": order_id, "payment_intent_id": intent_id }).to_string();
    let (status, body) = app
        .request(
            Method::POST,
            "/api/v1/payments/confirm-payment",
            Some(confirm.clone()),
            &[CUSTOMER_HEADER],
        )
        .await;
    assert_eq!(status, StatusCode::PAYMENT_REQUIRED, "{body}");

    app.gateway.set_status(&intent_id, IntentStatus::Succeeded);
    let (status, body) = app
        .request(
            Method::POST,
            "/api/v1/payments/confirm-payment",
            Some(confirm),
            &[CUSTOMER_HEADER],
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["status"], "processing");
    assert_eq!(body["data"]["payment_status"], "completed");

    let (status, _) = app
        .request(
            Method::POST,
            "/api/v1/payments/create-payment-intent",
            Some(json!({ "order_id": order_id }).to_string()),
            &[CUSTOMER_HEADER],
        )
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(app.sold(&common::cap_key()).await, 2);
}

#[tokio::test]
async fn payment_methods_reflect_configuration() {
    let app = TestApp::new(Backend::InMemory).await;
    let (status, body) = app
        .request(Method::GET, "/api/v1/payments/methods", None, &[])
        .await;
    assert_eq!(status, StatusCode::OK);
    let methods = body["data"].as_array().unwrap();
    let stripe = methods.iter().find(|m| m["id"] == "stripe").unwrap();
    assert_eq!(stripe["enabled"], true);
    let cod = methods.iter().find(|m| m["id"] == "cod").unwrap();
    assert_eq!(cod["enabled"], false);
}

#[tokio::test]
async fn webhook_requires_a_valid_signature() {
    let app = TestApp::new(Backend::InMemory).await;
    let order = place_order(&app, order_body(CAP, None, 1)).await;
    let order_id: uuid::Uuid = order["id"].as_str().unwrap().parse().unwrap();
    let body = common::webhook_body("payment_intent.succeeded", order_id, "pi_x");

    let (status, _) = app
        .request(Method::POST, "/api/v1/payments/webhook", Some(body.clone()), &[])
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let forged = format!("t={},v1={}", chrono::Utc::now().timestamp(), "00".repeat(32));
    let (status, _) = app
        .request(
            Method::POST,
            "/api/v1/payments/webhook",
            Some(body.clone()),
            &[("stripe-signature", forged.as_str())],
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let stored = app.state.orders.get(order_id).await.unwrap();
    assert_eq!(stored.payment_status.to_string(), "pending");

    let signature = common::sign(&body);
    let (status, reply) = app
        .request(
            Method::POST,
            "/api/v1/payments/webhook",
            Some(body),
            &[("stripe-signature", signature.as_str())],
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(reply["received"], true);
    assert_eq!(reply["result"]["outcome"], "processed");
    assert_eq!(reply["result"]["status"], "processing");
}

#[tokio::test]
async fn webhook_acknowledges_what_it_cannot_apply() {
    let app = TestApp::new(Backend::InMemory).await;

    let unknown_type = json!({
        "id": "evt_1",
        "type": "charge.refunded",
        "data": { "object": { "id": "ch_1" } }
    })
    .to_string();
    let signature = common::sign(&unknown_type);
    let (status, reply) = app
        .request(
            Method::POST,
            "/api/v1/payments/webhook",
            Some(unknown_type),
            &[("stripe-signature", signature.as_str())],
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(reply["result"]["outcome"], "ignored");

    let unknown_order =
        common::webhook_body("payment_intent.succeeded", uuid::Uuid::new_v4(), "pi_9");
    let signature = common::sign(&unknown_order);
    let (status, reply) = app
        .request(
            Method::POST,
            "/api/v1/payments/webhook",
            Some(unknown_order),
            &[("stripe-signature", signature.as_str())],
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(reply["result"]["outcome"], "ignored");
}

#[tokio::test]
async fn failed_payment_webhook_restocks_and_repeats_are_harmless() {
    let app = TestApp::new(Backend::InMemory).await;
    let order = place_order(&app, order_body(CAP, None, 3)).await;
    let order_id: uuid::Uuid = order["id"].as_str().unwrap().parse().unwrap();
    assert_eq!(app.available(&common::cap_key()).await, 7);

    for _ in 0..2 {
        let body = common::webhook_body("payment_intent.payment_failed", order_id, "pi_f");
        let signature = common::sign(&body);
        let (status, reply) = app
            .request(
                Method::POST,
                "/api/v1/payments/webhook",
                Some(body),
                &[("stripe-signature", signature.as_str())],
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(reply["result"]["payment_status"], "failed");
    }
    assert_eq!(app.available(&common::cap_key()).await, 10);

    // a success arriving after the failure is acknowledged but not applied
    let body = common::webhook_body("payment_intent.succeeded", order_id, "pi_f");
    let signature = common::sign(&body);
    let (status, reply) = app
        .request(
            Method::POST,
            "/api/v1/payments/webhook",
            Some(body),
            &[("stripe-signature", signature.as_str())],
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(reply["result"]["outcome"], "already_finalized");
    assert_eq!(app.sold(&common::cap_key()).await, 0);
}

#[tokio::test]
async fn admin_routes_are_token_guarded() {
    let app = TestApp::new(Backend::InMemory).await;

    let (status, _) = app
        .request(Method::GET, "/api/v1/admin/orders", None, &[])
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = app
        .request(
            Method::GET,
            "/api/v1/admin/orders",
            None,
            &[("x-admin-token", "guess")],
        )
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, body) = app
        .request(Method::GET, "/api/v1/admin/orders", None, &[ADMIN_HEADER])
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["total"], 0);
}

#[tokio::test]
async fn admin_surface_is_closed_without_a_token() {
    let config = storefront_api::config::AppConfig {
        admin_api_token: None,
        ..common::test_config()
    };
    let app = TestApp::with_config(Backend::InMemory, config).await;
    let (status, _) = app
        .request(Method::GET, "/api/v1/admin/orders", None, &[ADMIN_HEADER])
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn admin_can_fulfil_restock_and_edit_products() {
    let app = TestApp::new(Backend::InMemory).await;
    let order = place_order(&app, order_body(TEE, Some("M"), 1)).await;
    let order_id: uuid::Uuid = order["id"].as_str().unwrap().parse().unwrap();
    app.state.orders.mark_paid(order_id, None).await.unwrap();

    let (status, body) = app
        .request(
            Method::PUT,
            &format!("/api/v1/admin/orders/{order_id}/status"),
            Some(json!({ "status": "shipped", "tracking_number": "TRK-1" }).to_string()),
            &[ADMIN_HEADER],
        )
        .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["data"]["tracking_number"], "TRK-1");

    let (status, body) = app
        .request(
            Method::GET,
            "/api/v1/admin/low-stock?threshold=0",
            None,
            &[ADMIN_HEADER],
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"].as_array().unwrap().len(), 1);

    let (status, body) = app
        .request(
            Method::PUT,
            &format!("/api/v1/admin/products/{TEE}/stock"),
            Some(json!({ "size": "M", "available": 7 }).to_string()),
            &[ADMIN_HEADER],
        )
        .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(app.available(&common::tee_m()).await, 7);

    let (status, body) = app
        .request(
            Method::PUT,
            &format!("/api/v1/admin/products/{TEE}"),
            Some(json!({ "price": "24.50" }).to_string()),
            &[ADMIN_HEADER],
        )
        .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["data"]["price"], "24.50");

    // the paid order keeps the price it was sold at
    let stored = app.state.orders.get(order_id).await.unwrap();
    assert_eq!(stored.items[0].unit_price.to_string(), "29.99");
}

#[tokio::test]
async fn admin_expiry_endpoint_runs_a_sweep() {
    let app = TestApp::new(Backend::InMemory).await;
    place_order(&app, order_body(CAP, None, 1)).await;

    let (status, body) = app
        .request(
            Method::POST,
            "/api/v1/admin/orders/expire",
            None,
            &[ADMIN_HEADER],
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    // the order is younger than the abandonment window
    assert_eq!(body["data"]["cancelled"], 0);
    assert_eq!(app.available(&common::cap_key()).await, 9);
}
