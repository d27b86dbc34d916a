//! Gateway Adapter: the payment provider's create-intent, retrieve-intent and
//! webhook-verification contract, plus the Stripe-compatible HTTP client.

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::errors::ServiceError;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "Stripe-Signature";
pub const EVENT_PAYMENT_SUCCEEDED: &str = "payment_intent.succeeded";
pub const EVENT_PAYMENT_FAILED: &str = "payment_intent.payment_failed";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum IntentStatus {
    RequiresPaymentMethod,
    RequiresConfirmation,
    RequiresAction,
    Processing,
    RequiresCapture,
    Canceled,
    Succeeded,
    #[serde(other)]
    Unknown,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentIntent {
    pub id: String,
    #[serde(default)]
    pub client_secret: Option<String>,
    pub status: IntentStatus,
    pub amount: i64,
    pub currency: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CreateIntentRequest {
    pub amount_minor: i64,
    pub currency: String,
    pub metadata: BTreeMap<String, String>,
    /// Replays of the same key return the intent created the first time.
    pub idempotency_key: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct WebhookEventData {
    pub object: serde_json::Value,
}

/// A verified gateway notification.
#[derive(Clone, Debug, Deserialize)]
pub struct WebhookEvent {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: WebhookEventData,
}

/// Gateway intent ids look like `pi_` followed by ASCII alphanumerics or
/// underscores. Anything else never reaches the gateway.
pub fn is_valid_intent_id(intent_id: &str) -> bool {
    intent_id
        .strip_prefix("pi_")
        .map(|rest| {
            !rest.is_empty() && rest.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_')
        })
        .unwrap_or(false)
}

impl WebhookEvent {
    /// Order correlated through `metadata.order_id` on the event object.
    pub fn order_id(&self) -> Option<Uuid> {
        self.data
            .object
            .get("metadata")
            .and_then(|m| m.get("order_id"))
            .and_then(|v| v.as_str())
            .and_then(|s| Uuid::parse_str(s).ok())
    }

    pub fn intent_id(&self) -> Option<String> {
        self.data
            .object
            .get("id")
            .and_then(|v| v.as_str())
            .map(str::to_string)
    }
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_intent(&self, request: CreateIntentRequest)
        -> Result<PaymentIntent, ServiceError>;

    async fn retrieve_intent(&self, intent_id: &str) -> Result<PaymentIntent, ServiceError>;

    /// Authenticates and parses a raw webhook body. Fails with
    /// `ServiceError::SignatureInvalid` for anything not signed by the gateway.
    fn verify_webhook(
        &self,
        payload: &[u8],
        signature: Option<&str>,
    ) -> Result<WebhookEvent, ServiceError>;
}

/// Checks `t=<unix>,v1=<hex hmac>` signature headers.
#[derive(Clone, Debug)]
pub struct WebhookVerifier {
    secret: Option<String>,
    tolerance: Duration,
}

impl WebhookVerifier {
    pub fn new(secret: Option<String>, tolerance: Duration) -> Self {
        Self {
            secret: secret.filter(|s| !s.trim().is_empty()),
            tolerance,
        }
    }

    fn mac(secret: &str, timestamp: &str, payload: &[u8]) -> Result<HmacSha256, ServiceError> {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
            .map_err(|e| ServiceError::InternalError(format!("invalid webhook secret: {}", e)))?;
        mac.update(timestamp.as_bytes());
        mac.update(b".");
        mac.update(payload);
        Ok(mac)
    }

    /// Produces a header value the way the gateway does.
    pub fn sign(&self, timestamp: i64, payload: &[u8]) -> Result<String, ServiceError> {
        let secret = self
            .secret
            .as_deref()
            .ok_or_else(|| ServiceError::InternalError("webhook secret not configured".into()))?;
        let mac = Self::mac(secret, &timestamp.to_string(), payload)?;
        Ok(format!(
            "t={},v1={}",
            timestamp,
            hex::encode(mac.finalize().into_bytes())
        ))
    }

    pub fn verify(&self, payload: &[u8], header: Option<&str>, now: i64) -> Result<(), ServiceError> {
        let secret = self.secret.as_deref().ok_or_else(|| {
            ServiceError::SignatureInvalid("webhook secret is not configured".into())
        })?;
        let header =
            header.ok_or_else(|| ServiceError::SignatureInvalid("missing signature".into()))?;

        let mut timestamp = None;
        let mut candidates = Vec::new();
        for part in header.split(',') {
            match part.trim().split_once('=') {
                Some(("t", value)) => timestamp = Some(value),
                Some(("v1", value)) => candidates.push(value),
                _ => {}
            }
        }

        let timestamp =
            timestamp.ok_or_else(|| ServiceError::SignatureInvalid("missing timestamp".into()))?;
        let sent_at: i64 = timestamp
            .parse()
            .map_err(|_| ServiceError::SignatureInvalid("malformed timestamp".into()))?;
        if now.abs_diff(sent_at) > self.tolerance.as_secs() {
            return Err(ServiceError::SignatureInvalid(
                "timestamp outside tolerance".into(),
            ));
        }

        for candidate in candidates {
            let Ok(expected) = hex::decode(candidate) else {
                continue;
            };
            if Self::mac(secret, timestamp, payload)?
                .verify_slice(&expected)
                .is_ok()
            {
                return Ok(());
            }
        }
        Err(ServiceError::SignatureInvalid("no matching signature".into()))
    }

    /// Verifies, then parses the event body.
    pub fn parse(
        &self,
        payload: &[u8],
        header: Option<&str>,
        now: i64,
    ) -> Result<WebhookEvent, ServiceError> {
        self.verify(payload, header, now)?;
        serde_json::from_slice(payload)
            .map_err(|e| ServiceError::ValidationError(format!("malformed webhook event: {}", e)))
    }
}

#[derive(Debug, Deserialize)]
struct GatewayErrorBody {
    error: GatewayErrorDetail,
}

#[derive(Debug, Deserialize)]
struct GatewayErrorDetail {
    #[serde(default)]
    message: Option<String>,
}

/// Stripe-compatible REST client.
#[derive(Clone)]
pub struct StripeGateway {
    client: reqwest::Client,
    base_url: String,
    secret_key: Option<String>,
    verifier: WebhookVerifier,
}

impl StripeGateway {
    pub fn new(
        base_url: impl Into<String>,
        secret_key: Option<String>,
        verifier: WebhookVerifier,
    ) -> Result<Self, ServiceError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| ServiceError::InternalError(format!("http client: {}", e)))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            secret_key,
            verifier,
        })
    }

    fn secret_key(&self) -> Result<&str, ServiceError> {
        self.secret_key
            .as_deref()
            .ok_or_else(|| ServiceError::GatewayUnavailable("gateway credentials not configured".into()))
    }

    async fn read_intent(response: reqwest::Response) -> Result<PaymentIntent, ServiceError> {
        let status = response.status();
        if status.is_success() {
            // Malformed replies are not outages and must not trip the breaker.
            return response.json::<PaymentIntent>().await.map_err(|e| {
                ServiceError::InvalidOperation(format!("unreadable gateway response: {}", e))
            });
        }

        let message = response
            .json::<GatewayErrorBody>()
            .await
            .ok()
            .and_then(|body| body.error.message)
            .unwrap_or_else(|| status.to_string());

        if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            warn!(%status, "payment gateway unavailable: {}", message);
            Err(ServiceError::GatewayUnavailable(message))
        } else if status == reqwest::StatusCode::NOT_FOUND {
            Err(ServiceError::NotFound(format!("payment intent: {}", message)))
        } else {
            Err(ServiceError::InvalidOperation(format!(
                "payment gateway rejected request: {}",
                message
            )))
        }
    }
}

fn transport_error(err: reqwest::Error) -> ServiceError {
    ServiceError::GatewayUnavailable(err.to_string())
}

#[async_trait]
impl PaymentGateway for StripeGateway {
    #[instrument(skip(self, request), fields(amount = request.amount_minor))]
    async fn create_intent(
        &self,
        request: CreateIntentRequest,
    ) -> Result<PaymentIntent, ServiceError> {
        let mut form = vec![
            ("amount".to_string(), request.amount_minor.to_string()),
            ("currency".to_string(), request.currency.to_lowercase()),
            (
                "automatic_payment_methods[enabled]".to_string(),
                "true".to_string(),
            ),
        ];
        for (key, value) in &request.metadata {
            form.push((format!("metadata[{}]", key), value.clone()));
        }

        let response = self
            .client
            .post(format!("{}/v1/payment_intents", self.base_url))
            .bearer_auth(self.secret_key()?)
            .header("Idempotency-Key", &request.idempotency_key)
            .form(&form)
            .send()
            .await
            .map_err(transport_error)?;

        let intent = Self::read_intent(response).await?;
        debug!(intent_id = %intent.id, "payment intent created");
        Ok(intent)
    }

    #[instrument(skip(self))]
    async fn retrieve_intent(&self, intent_id: &str) -> Result<PaymentIntent, ServiceError> {
        if !is_valid_intent_id(intent_id) {
            return Err(ServiceError::ValidationError(
                "malformed payment intent id".to_string(),
            ));
        }
        let mut url = reqwest::Url::parse(&self.base_url)
            .map_err(|e| ServiceError::InternalError(format!("gateway base url: {}", e)))?;
        url.path_segments_mut()
            .map_err(|_| ServiceError::InternalError("gateway base url cannot be a base".into()))?
            .pop_if_empty()
            .extend(["v1", "payment_intents", intent_id]);

        let response = self
            .client
            .get(url)
            .bearer_auth(self.secret_key()?)
            .send()
            .await
            .map_err(transport_error)?;
        Self::read_intent(response).await
    }

    fn verify_webhook(
        &self,
        payload: &[u8],
        signature: Option<&str>,
    ) -> Result<WebhookEvent, ServiceError> {
        self.verifier
            .parse(payload, signature, chrono::Utc::now().timestamp())
    }
}
