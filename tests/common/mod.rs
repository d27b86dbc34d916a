#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{Method, Request, StatusCode},
    Router,
};
use chrono::Utc;
use http_body_util::BodyExt;
use rust_decimal_macros::dec;
use serde_json::Value;
use storefront_api::{
    config::AppConfig,
    db::{self, DbConfig},
    errors::ServiceError,
    events::{process_events, EventSender},
    models::{
        Address, Category, CreateOrderRequest, OrderItemRequest, Product, StockKey, Variant,
    },
    repositories::{
        InMemoryOrderRepository, InMemoryStockStore, OrderRepository, SeaOrmOrderRepository,
        SeaOrmStockStore, StockStore,
    },
    services::{
        catalog::InMemoryCatalog,
        payment_gateway::{
            CreateIntentRequest, IntentStatus, PaymentGateway, PaymentIntent, WebhookEvent,
            WebhookVerifier,
        },
    },
    AppState,
};
use tokio::sync::mpsc;
use tower::ServiceExt;
use uuid::Uuid;

pub const WEBHOOK_SECRET: &str = "whsec_test_secret";
pub const ADMIN_TOKEN: &str = "admin-test-token";
pub const CUSTOMER: &str = "customer-1";

pub const TEE: Uuid = Uuid::from_u128(0x7ee);
pub const CAP: Uuid = Uuid::from_u128(0xca9);

/// In-process stand-in for the payment provider.
pub struct FakeGateway {
    intents: Mutex<HashMap<String, PaymentIntent>>,
    by_idempotency_key: Mutex<HashMap<String, String>>,
    pub create_calls: AtomicUsize,
    pub retrieve_calls: AtomicUsize,
    unavailable: AtomicBool,
    verifier: WebhookVerifier,
}

impl FakeGateway {
    pub fn new() -> Self {
        Self {
            intents: Mutex::new(HashMap::new()),
            by_idempotency_key: Mutex::new(HashMap::new()),
            create_calls: AtomicUsize::new(0),
            retrieve_calls: AtomicUsize::new(0),
            unavailable: AtomicBool::new(false),
            verifier: verifier(),
        }
    }

    /// Simulates the customer completing (or failing) payment out of band.
    pub fn set_status(&self, intent_id: &str, status: IntentStatus) {
        if let Some(intent) = self.intents.lock().unwrap().get_mut(intent_id) {
            intent.status = status;
        }
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn intent_count(&self) -> usize {
        self.intents.lock().unwrap().len()
    }

    fn check_available(&self) -> Result<(), ServiceError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(ServiceError::GatewayUnavailable("fake outage".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl PaymentGateway for FakeGateway {
    async fn create_intent(
        &self,
        request: CreateIntentRequest,
    ) -> Result<PaymentIntent, ServiceError> {
        self.check_available()?;
        self.create_calls.fetch_add(1, Ordering::SeqCst);

        let mut keys = self.by_idempotency_key.lock().unwrap();
        let mut intents = self.intents.lock().unwrap();
        if let Some(existing) = keys.get(&request.idempotency_key) {
            return Ok(intents[existing].clone());
        }
        let id = format!("pi_{}", intents.len() + 1);
        let intent = PaymentIntent {
            id: id.clone(),
            client_secret: Some(format!("{}_secret", id)),
            status: IntentStatus::RequiresPaymentMethod,
            amount: request.amount_minor,
            currency: request.currency,
            metadata: request.metadata.into_iter().collect(),
        };
        keys.insert(request.idempotency_key, id.clone());
        intents.insert(id, intent.clone());
        Ok(intent)
    }

    async fn retrieve_intent(&self, intent_id: &str) -> Result<PaymentIntent, ServiceError> {
        self.check_available()?;
        self.retrieve_calls.fetch_add(1, Ordering::SeqCst);
        self.intents
            .lock()
            .unwrap()
            .get(intent_id)
            .cloned()
            .ok_or_else(|| ServiceError::NotFound(format!("payment intent {}", intent_id)))
    }

    fn verify_webhook(
        &self,
        payload: &[u8],
        signature: Option<&str>,
    ) -> Result<WebhookEvent, ServiceError> {
        self.verifier
            .parse(payload, signature, Utc::now().timestamp())
    }
}

pub fn verifier() -> WebhookVerifier {
    WebhookVerifier::new(Some(WEBHOOK_SECRET.into()), Duration::from_secs(300))
}

pub fn webhook_body(event_type: &str, order_id: Uuid, intent_id: &str) -> String {
    serde_json::json!({
        "id": format!("evt_{}", Uuid::new_v4().simple()),
        "type": event_type,
        "data": { "object": {
            "id": intent_id,
            "object": "payment_intent",
            "metadata": { "order_id": order_id.to_string() }
        }}
    })
    .to_string()
}

pub fn sign(body: &str) -> String {
    verifier()
        .sign(Utc::now().timestamp(), body.as_bytes())
        .unwrap()
}

#[derive(Clone, Copy, Debug)]
pub enum Backend {
    InMemory,
    Sqlite,
}

pub struct TestApp {
    pub state: AppState,
    pub stock: Arc<dyn StockStore>,
    pub gateway: Arc<FakeGateway>,
    router: Router,
    _event_task: tokio::task::JoinHandle<()>,
}

pub fn test_config() -> AppConfig {
    AppConfig {
        environment: "test-development".into(),
        admin_api_token: Some(ADMIN_TOKEN.into()),
        payment_webhook_secret: Some(WEBHOOK_SECRET.into()),
        cors_allowed_origins: Some("http://localhost:3000".into()),
        ..AppConfig::default()
    }
}

pub async fn sqlite_pool() -> Arc<sea_orm::DatabaseConnection> {
    let cfg = DbConfig {
        url: "sqlite::memory:".into(),
        max_connections: 1,
        min_connections: 1,
        idle_timeout: Duration::from_secs(3600),
        ..DbConfig::default()
    };
    let pool = db::establish_connection_with_config(&cfg)
        .await
        .expect("sqlite connects");
    db::run_migrations(&pool).await.expect("migrations run");
    Arc::new(pool)
}

impl TestApp {
    pub async fn new(backend: Backend) -> Self {
        Self::with_config(backend, test_config()).await
    }

    pub async fn with_config(backend: Backend, config: AppConfig) -> Self {
        let mut pool = None;
        let (stock, orders): (Arc<dyn StockStore>, Arc<dyn OrderRepository>) = match backend {
            Backend::InMemory => (
                Arc::new(InMemoryStockStore::new()),
                Arc::new(InMemoryOrderRepository::new()),
            ),
            Backend::Sqlite => {
                let db = sqlite_pool().await;
                pool = Some(db.clone());
                (
                    Arc::new(SeaOrmStockStore::new(db.clone())),
                    Arc::new(SeaOrmOrderRepository::new(db)),
                )
            }
        };

        let catalog = Arc::new(InMemoryCatalog::new());
        seed_products(&catalog, stock.as_ref()).await;

        let (tx, rx) = mpsc::channel(1024);
        let event_task = tokio::spawn(process_events(rx));
        let gateway = Arc::new(FakeGateway::new());

        let mut state = AppState::new(
            config,
            stock.clone(),
            orders,
            catalog,
            gateway.clone(),
            EventSender::new(tx),
        );
        if let Some(db) = pool {
            state = state.with_database(db);
        }

        Self {
            router: storefront_api::app(state.clone()),
            state,
            stock,
            gateway,
            _event_task: event_task,
        }
    }

    pub async fn available(&self, key: &StockKey) -> u32 {
        self.stock
            .level(key)
            .await
            .unwrap()
            .map_or(0, |level| level.available)
    }

    pub async fn sold(&self, key: &StockKey) -> u64 {
        self.stock
            .level(key)
            .await
            .unwrap()
            .map_or(0, |level| level.sold)
    }

    /// Sends one request through the full router and returns the status and
    /// JSON body (`Value::Null` when the body is empty or not JSON).
    pub async fn request(
        &self,
        method: Method,
        uri: &str,
        body: Option<String>,
        headers: &[(&str, &str)],
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if body.is_some() {
            builder = builder.header("content-type", "application/json");
        }
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        let request = builder
            .body(body.map(Body::from).unwrap_or_else(Body::empty))
            .unwrap();

        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, json)
    }
}

pub fn tee_m() -> StockKey {
    StockKey::sized(TEE, "M")
}

pub fn cap_key() -> StockKey {
    StockKey::product(CAP)
}

async fn seed_products(catalog: &InMemoryCatalog, stock: &dyn StockStore) {
    let now = Utc::now();
    catalog.insert(Product {
        id: TEE,
        name: "Classic Logo Tee".into(),
        description: "Cotton tee".into(),
        category: Category::TShirts,
        price: dec!(29.99),
        active: true,
        variants: vec![
            Variant {
                size: "M".into(),
                sku: Some("TEE-M".into()),
            },
            Variant {
                size: "L".into(),
                sku: Some("TEE-L".into()),
            },
        ],
        brand: None,
        material: None,
        tags: vec![],
        created_at: now,
        updated_at: now,
    });
    catalog.insert(Product {
        id: CAP,
        name: "Canvas Cap".into(),
        description: "Six panel cap".into(),
        category: Category::Accessories,
        price: dec!(15.00),
        active: true,
        variants: vec![],
        brand: None,
        material: None,
        tags: vec![],
        created_at: now,
        updated_at: now,
    });

    stock.seed(&tee_m(), 1).await.unwrap();
    stock.seed(&StockKey::sized(TEE, "L"), 5).await.unwrap();
    stock.seed(&cap_key(), 10).await.unwrap();
}

pub fn address() -> Address {
    Address {
        first_name: "Ada".into(),
        last_name: "Lovelace".into(),
        street: "12 Engine Row".into(),
        city: "London".into(),
        state: None,
        zip_code: "N1 9GU".into(),
        country: Some("UK".into()),
        phone: None,
    }
}

pub fn item(product_id: Uuid, size: Option<&str>, quantity: u32) -> OrderItemRequest {
    OrderItemRequest {
        product_id,
        size: size.map(str::to_string),
        quantity,
    }
}

pub fn checkout(items: Vec<OrderItemRequest>) -> CreateOrderRequest {
    CreateOrderRequest {
        items,
        shipping_address: address(),
        billing_address: None,
        payment_method: "stripe".into(),
    }
}
