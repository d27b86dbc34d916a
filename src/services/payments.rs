//! Payment Reconciler.
//!
//! Two untrusted channels report payment outcomes: the customer's confirm
//! call and the gateway webhook. Neither is deduplicated here; both end in
//! the order service's idempotent `mark_paid` / `mark_failed`, and the loser
//! of a race simply observes the finalized order.

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::{
    circuit_breaker::CircuitBreaker,
    errors::ServiceError,
    metrics::{WEBHOOK_EVENTS, WEBHOOK_SIGNATURE_REJECTIONS},
    models::{Order, OrderStatus, PaymentMethod, PaymentStatus},
    services::{
        orders::OrderService,
        payment_gateway::{
            is_valid_intent_id, CreateIntentRequest, IntentStatus, PaymentGateway, PaymentIntent,
            EVENT_PAYMENT_FAILED, EVENT_PAYMENT_SUCCEEDED,
        },
        pricing::to_minor_units,
    },
};

/// What the client needs to complete payment.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PaymentInitiation {
    pub order_id: Uuid,
    pub payment_intent_id: String,
    pub client_secret: Option<String>,
    pub amount: i64,
    pub currency: String,
}

#[derive(Clone, Debug, PartialEq)]
pub enum ConfirmOutcome {
    Paid(Order),
    /// The gateway has not captured the payment; the order is unchanged.
    NotCompleted { order: Order, status: IntentStatus },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum WebhookOutcome {
    Processed {
        order_id: Uuid,
        status: OrderStatus,
        payment_status: PaymentStatus,
    },
    AlreadyFinalized {
        order_id: Uuid,
    },
    Ignored {
        reason: String,
    },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PaymentMethodInfo {
    pub id: PaymentMethod,
    pub name: &'static str,
    pub enabled: bool,
}

#[derive(Clone)]
pub struct PaymentService {
    orders: OrderService,
    gateway: Arc<dyn PaymentGateway>,
    breaker: Arc<CircuitBreaker>,
    currency: String,
}

impl PaymentService {
    pub fn new(
        orders: OrderService,
        gateway: Arc<dyn PaymentGateway>,
        breaker: Arc<CircuitBreaker>,
        currency: impl Into<String>,
    ) -> Self {
        Self {
            orders,
            gateway,
            breaker,
            currency: currency.into().to_lowercase(),
        }
    }

    async fn load(&self, customer_id: Option<&str>, order_id: Uuid) -> Result<Order, ServiceError> {
        match customer_id {
            Some(customer_id) => self.orders.get_for_customer(customer_id, order_id).await,
            None => self.orders.get(order_id).await,
        }
    }

    async fn retrieve(&self, intent_id: &str) -> Result<PaymentIntent, ServiceError> {
        let gateway = self.gateway.clone();
        let intent_id = intent_id.to_string();
        self.breaker
            .call(move || async move { gateway.retrieve_intent(&intent_id).await })
            .await
    }

    fn ensure_payable(order: &Order) -> Result<(), ServiceError> {
        if order.payment_status == PaymentStatus::Completed {
            return Err(ServiceError::AlreadyPaid(order.id));
        }
        if order.payment_method != PaymentMethod::Stripe {
            return Err(ServiceError::InvalidOperation(format!(
                "Order {} is paid by {}",
                order.id,
                order.payment_method.display_name()
            )));
        }
        if !order.is_finalizable() {
            return Err(ServiceError::InvalidOperation(format!(
                "Order {} is {} and can no longer be paid",
                order.id, order.status
            )));
        }
        Ok(())
    }

    fn initiation(&self, order: &Order, intent: PaymentIntent) -> PaymentInitiation {
        PaymentInitiation {
            order_id: order.id,
            payment_intent_id: intent.id,
            client_secret: intent.client_secret,
            amount: intent.amount,
            currency: intent.currency,
        }
    }

    /// Creates (or returns the already created) gateway intent for an order.
    ///
    /// The intent is requested with an idempotency key derived from the order,
    /// so concurrent initiations resolve to one intent at the gateway too.
    #[instrument(skip(self), fields(order_id = %order_id))]
    pub async fn initiate(
        &self,
        customer_id: Option<&str>,
        order_id: Uuid,
    ) -> Result<PaymentInitiation, ServiceError> {
        let order = self.load(customer_id, order_id).await?;
        Self::ensure_payable(&order)?;

        if let Some(existing) = &order.payment_intent_id {
            info!(payment_intent_id = %existing, "reusing existing payment intent");
            let intent = self.retrieve(existing).await?;
            return Ok(self.initiation(&order, intent));
        }

        let mut metadata = BTreeMap::new();
        metadata.insert("order_id".to_string(), order.id.to_string());
        metadata.insert("order_number".to_string(), order.order_number.clone());
        let request = CreateIntentRequest {
            amount_minor: to_minor_units(order.totals.total)?,
            currency: self.currency.clone(),
            metadata,
            idempotency_key: format!("order-{}", order.id),
        };

        let gateway = self.gateway.clone();
        let intent = self
            .breaker
            .call(move || async move { gateway.create_intent(request).await })
            .await?;

        let stored = self.orders.record_payment_intent(order.id, &intent.id).await?;
        match stored.payment_intent_id.as_deref() {
            Some(winner) if winner != intent.id => {
                warn!(
                    created = %intent.id,
                    recorded = %winner,
                    "another initiation recorded an intent first"
                );
                let intent = self.retrieve(winner).await?;
                Ok(self.initiation(&stored, intent))
            }
            _ => {
                info!(payment_intent_id = %intent.id, "payment intent created");
                Ok(self.initiation(&stored, intent))
            }
        }
    }

    /// Client-reported completion. The gateway, not the client, decides
    /// whether the payment succeeded.
    #[instrument(skip(self), fields(order_id = %order_id))]
    pub async fn confirm_from_client(
        &self,
        customer_id: Option<&str>,
        order_id: Uuid,
        payment_intent_id: &str,
    ) -> Result<ConfirmOutcome, ServiceError> {
        let order = self.load(customer_id, order_id).await?;
        if !is_valid_intent_id(payment_intent_id) {
            return Err(ServiceError::ValidationError(
                "malformed payment intent id".to_string(),
            ));
        }
        if let Some(stored) = &order.payment_intent_id {
            if stored != payment_intent_id {
                return Err(ServiceError::ValidationError(
                    "payment intent does not belong to this order".to_string(),
                ));
            }
        }

        let intent = self.retrieve(payment_intent_id).await?;
        if let Some(tagged) = intent.metadata.get("order_id") {
            if tagged != &order.id.to_string() {
                return Err(ServiceError::ValidationError(
                    "payment intent does not belong to this order".to_string(),
                ));
            }
        }

        if intent.status != IntentStatus::Succeeded {
            info!(intent_status = %intent.status, "payment not completed yet");
            return Ok(ConfirmOutcome::NotCompleted {
                order,
                status: intent.status,
            });
        }

        let order = self.orders.mark_paid(order.id, Some(&intent.id)).await?;
        Ok(ConfirmOutcome::Paid(order))
    }

    /// Gateway notification. Signature failures are rejected; anything that
    /// cannot or need not be applied is acknowledged so the gateway stops
    /// retrying. Storage errors propagate so that it does retry.
    #[instrument(skip(self, payload, signature), fields(bytes = payload.len()))]
    pub async fn confirm_from_webhook(
        &self,
        payload: &[u8],
        signature: Option<&str>,
    ) -> Result<WebhookOutcome, ServiceError> {
        let event = match self.gateway.verify_webhook(payload, signature) {
            Ok(event) => event,
            Err(err) => {
                if matches!(err, ServiceError::SignatureInvalid(_)) {
                    WEBHOOK_SIGNATURE_REJECTIONS.inc();
                }
                warn!(error = %err, "webhook rejected");
                return Err(err);
            }
        };

        WEBHOOK_EVENTS
            .with_label_values(&[event.event_type.as_str()])
            .inc();
        info!(event_id = %event.id, event_type = %event.event_type, "webhook received");

        let succeeded = match event.event_type.as_str() {
            EVENT_PAYMENT_SUCCEEDED => true,
            EVENT_PAYMENT_FAILED => false,
            other => {
                return Ok(WebhookOutcome::Ignored {
                    reason: format!("unhandled event type {}", other),
                })
            }
        };

        let Some(order_id) = event.order_id() else {
            warn!(event_id = %event.id, "webhook event carries no order reference");
            return Ok(WebhookOutcome::Ignored {
                reason: "no order reference".to_string(),
            });
        };

        let result = if succeeded {
            self.orders
                .mark_paid(order_id, event.intent_id().as_deref())
                .await
        } else {
            self.orders.mark_failed(order_id).await
        };

        match result {
            Ok(order) => Ok(WebhookOutcome::Processed {
                order_id: order.id,
                status: order.status,
                payment_status: order.payment_status,
            }),
            Err(ServiceError::AlreadyFinalized {
                order_id,
                status,
                payment_status,
            }) => {
                info!(
                    order_id = %order_id,
                    status = %status,
                    payment_status = %payment_status,
                    "webhook for finalized order acknowledged"
                );
                Ok(WebhookOutcome::AlreadyFinalized { order_id })
            }
            Err(ServiceError::NotFound(_)) => {
                warn!(order_id = %order_id, "webhook references unknown order");
                Ok(WebhookOutcome::Ignored {
                    reason: "unknown order".to_string(),
                })
            }
            Err(err) => Err(err),
        }
    }

    pub fn available_methods(&self) -> Vec<PaymentMethodInfo> {
        let accepted = &self.orders.settings().accepted_methods;
        [PaymentMethod::Stripe, PaymentMethod::Paypal, PaymentMethod::Cod]
            .into_iter()
            .map(|method| PaymentMethodInfo {
                id: method,
                name: method.display_name(),
                enabled: accepted.contains(&method),
            })
            .collect()
    }
}
