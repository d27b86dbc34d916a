//! Order State Machine.
//!
//! Orders are created `pending` together with their stock reservation. The
//! finalization slot (`status == pending && payment_status == pending`) is
//! claimed with a single conditional update, so whichever of `mark_paid`,
//! `mark_failed` or the expiry sweep wins is the only one whose stock side
//! effect runs.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

use crate::{
    config::AppConfig,
    errors::ServiceError,
    events::{Event, EventSender},
    metrics::{
        DUPLICATE_FINALIZATIONS, EXPIRED_ORDERS_CANCELLED, ORDERS_CREATED, PAYMENT_FINALIZATIONS,
    },
    models::{
        order::generate_order_number, CreateOrderRequest, Order, OrderLine, OrderStatus,
        PaymentMethod, PaymentStatus,
    },
    repositories::{
        order_not_found, OrderFilter, OrderRepository, OrderUpdate, Page, Transition,
        TransitionGuard,
    },
    services::{catalog::CatalogReader, inventory::StockLedger, pricing::PricingPolicy},
};

const EXPIRY_BATCH: u64 = 500;
pub const MAX_PAGE_SIZE: u64 = 100;

#[derive(Clone, Debug)]
pub struct OrderSettings {
    pub pricing: PricingPolicy,
    pub accepted_methods: Vec<PaymentMethod>,
    /// Pending orders older than this are cancelled by the expiry sweep.
    pub abandonment_window: Duration,
}

impl Default for OrderSettings {
    fn default() -> Self {
        Self {
            pricing: PricingPolicy::default(),
            accepted_methods: vec![PaymentMethod::Stripe],
            abandonment_window: Duration::minutes(30),
        }
    }
}

impl From<&AppConfig> for OrderSettings {
    fn from(config: &AppConfig) -> Self {
        Self {
            pricing: config.pricing_policy(),
            accepted_methods: config.accepted_methods(),
            abandonment_window: config.abandonment_window(),
        }
    }
}

/// Result of one `cancel_expired_pending` pass.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ExpirySummary {
    pub examined: usize,
    pub cancelled: usize,
    /// Finalized by a payment channel between selection and cancellation.
    pub skipped: usize,
    pub failed: usize,
}

#[derive(Clone)]
pub struct OrderService {
    orders: Arc<dyn OrderRepository>,
    catalog: Arc<dyn CatalogReader>,
    ledger: StockLedger,
    event_sender: EventSender,
    settings: OrderSettings,
}

fn clamp_page(page: u64, limit: u64) -> (u64, u64) {
    (page.max(1), limit.clamp(1, MAX_PAGE_SIZE))
}

impl OrderService {
    pub fn new(
        orders: Arc<dyn OrderRepository>,
        catalog: Arc<dyn CatalogReader>,
        ledger: StockLedger,
        event_sender: EventSender,
        settings: OrderSettings,
    ) -> Self {
        Self {
            orders,
            catalog,
            ledger,
            event_sender,
            settings,
        }
    }

    pub fn settings(&self) -> &OrderSettings {
        &self.settings
    }

    fn parse_payment_method(&self, raw: &str) -> Result<PaymentMethod, ServiceError> {
        raw.trim()
            .parse::<PaymentMethod>()
            .ok()
            .filter(|method| self.settings.accepted_methods.contains(method))
            .ok_or_else(|| {
                ServiceError::ValidationError(format!("Unsupported payment method: {}", raw))
            })
    }

    fn validate_request(&self, request: &CreateOrderRequest) -> Result<PaymentMethod, ServiceError> {
        request.validate()?;
        for (index, item) in request.items.iter().enumerate() {
            item.validate().map_err(|e| {
                ServiceError::ValidationError(format!("items[{}]: {}", index, e))
            })?;
        }
        request.shipping_address.validate().map_err(|e| {
            ServiceError::ValidationError(format!("shipping_address: {}", e))
        })?;
        if let Some(billing) = &request.billing_address {
            billing.validate().map_err(|e| {
                ServiceError::ValidationError(format!("billing_address: {}", e))
            })?;
        }
        self.parse_payment_method(&request.payment_method)
    }

    /// Looks up every requested item and freezes its price, name and sku.
    async fn resolve_lines(
        &self,
        request: &CreateOrderRequest,
    ) -> Result<Vec<OrderLine>, ServiceError> {
        let mut lines = Vec::with_capacity(request.items.len());
        for (index, item) in request.items.iter().enumerate() {
            let product = self
                .catalog
                .get_product(item.product_id)
                .await?
                .ok_or_else(|| {
                    ServiceError::NotFound(format!(
                        "Product {} (line {}) not found",
                        item.product_id, index
                    ))
                })?;
            if !product.active {
                return Err(ServiceError::ValidationError(format!(
                    "line {}: {} is no longer available",
                    index, product.name
                )));
            }

            let key = product
                .stock_key_for(item.size.as_deref())
                .map_err(|msg| ServiceError::ValidationError(format!("line {}: {}", index, msg)))?;
            let sku = key
                .size
                .as_deref()
                .and_then(|size| product.variant(size))
                .and_then(|variant| variant.sku.clone());

            lines.push(OrderLine {
                product_id: product.id,
                name: product.name.clone(),
                size: key.size,
                sku,
                quantity: item.quantity,
                unit_price: product.price,
            });
        }
        Ok(lines)
    }

    /// Validates, reserves stock for the whole cart, prices it and stores
    /// the order as `pending`.
    #[instrument(skip(self, request), fields(customer_id = %customer_id, items = request.items.len()))]
    pub async fn create(
        &self,
        customer_id: &str,
        request: CreateOrderRequest,
    ) -> Result<Order, ServiceError> {
        if customer_id.trim().is_empty() {
            return Err(ServiceError::ValidationError(
                "customer reference is required".to_string(),
            ));
        }
        let payment_method = self.validate_request(&request)?;
        let items = self.resolve_lines(&request).await?;
        let totals = self.settings.pricing.price(&items);

        let id = Uuid::new_v4();
        let now = Utc::now();
        let order = Order {
            id,
            order_number: generate_order_number(id, now),
            customer_id: customer_id.to_string(),
            items,
            totals,
            status: OrderStatus::Pending,
            payment_status: PaymentStatus::Pending,
            payment_method,
            payment_intent_id: None,
            billing_address: request
                .billing_address
                .clone()
                .unwrap_or_else(|| request.shipping_address.clone()),
            shipping_address: request.shipping_address,
            tracking_number: None,
            created_at: now,
            updated_at: now,
        };

        let stock = order.stock_lines();
        self.ledger.reserve(&stock).await?;

        if let Err(err) = self.orders.insert(&order).await {
            error!(order_id = %order.id, error = %err, "order insert failed; releasing reservation");
            if let Err(release_err) = self.ledger.release(&stock).await {
                error!(order_id = %order.id, error = %release_err, "compensating release failed");
            }
            return Err(err);
        }

        ORDERS_CREATED.inc();
        info!(
            order_id = %order.id,
            order_number = %order.order_number,
            total = %order.totals.total,
            "order created"
        );
        self.event_sender
            .send_or_log(Event::OrderCreated {
                order_id: order.id,
                order_number: order.order_number.clone(),
            })
            .await;
        Ok(order)
    }

    pub async fn get(&self, order_id: Uuid) -> Result<Order, ServiceError> {
        self.orders
            .find(order_id)
            .await?
            .ok_or_else(|| order_not_found(order_id))
    }

    /// An order as seen by its owner. Other customers' orders read as missing.
    #[instrument(skip(self))]
    pub async fn get_for_customer(
        &self,
        customer_id: &str,
        order_id: Uuid,
    ) -> Result<Order, ServiceError> {
        let order = self.get(order_id).await?;
        if order.customer_id != customer_id {
            return Err(order_not_found(order_id));
        }
        Ok(order)
    }

    #[instrument(skip(self))]
    pub async fn list_for_customer(
        &self,
        customer_id: &str,
        page: u64,
        limit: u64,
    ) -> Result<Page<Order>, ServiceError> {
        let (page, limit) = clamp_page(page, limit);
        let filter = OrderFilter {
            customer_id: Some(customer_id.to_string()),
            status: None,
        };
        self.orders.list(&filter, page, limit).await
    }

    #[instrument(skip(self))]
    pub async fn list_all(
        &self,
        status: Option<OrderStatus>,
        page: u64,
        limit: u64,
    ) -> Result<Page<Order>, ServiceError> {
        let (page, limit) = clamp_page(page, limit);
        let filter = OrderFilter {
            customer_id: None,
            status,
        };
        self.orders.list(&filter, page, limit).await
    }

    async fn publish_finalized(&self, order: &Order) {
        self.event_sender
            .send_or_log(Event::OrderFinalized {
                order_id: order.id,
                status: order.status,
                payment_status: order.payment_status,
            })
            .await;
    }

    /// Stores the gateway intent on a still-payable order. The first intent
    /// recorded wins; the returned order carries whichever one that was.
    #[instrument(skip(self), fields(order_id = %order_id))]
    pub async fn record_payment_intent(
        &self,
        order_id: Uuid,
        payment_intent_id: &str,
    ) -> Result<Order, ServiceError> {
        let update = OrderUpdate {
            payment_intent_id: Some(payment_intent_id.to_string()),
            ..OrderUpdate::default()
        };
        match self
            .orders
            .transition(order_id, &TransitionGuard::finalizable(), &update)
            .await?
        {
            Transition::Applied(order) => Ok(order),
            Transition::Rejected(order) if order.payment_status == PaymentStatus::Completed => {
                Err(ServiceError::AlreadyPaid(order.id))
            }
            Transition::Rejected(order) => Err(ServiceError::AlreadyFinalized {
                order_id: order.id,
                status: order.status,
                payment_status: order.payment_status,
            }),
        }
    }

    /// Records a successful payment. Repeating it returns the stored order
    /// without committing stock again.
    #[instrument(skip(self), fields(order_id = %order_id))]
    pub async fn mark_paid(
        &self,
        order_id: Uuid,
        payment_intent_id: Option<&str>,
    ) -> Result<Order, ServiceError> {
        let update = OrderUpdate {
            status: Some(OrderStatus::Processing),
            payment_status: Some(PaymentStatus::Completed),
            payment_intent_id: payment_intent_id.map(str::to_string),
            tracking_number: None,
        };

        match self
            .orders
            .transition(order_id, &TransitionGuard::finalizable(), &update)
            .await?
        {
            Transition::Applied(order) => {
                if let Err(err) = self.ledger.commit(&order.stock_lines()).await {
                    error!(order_id = %order.id, error = %err, "stock commit failed after payment");
                }
                PAYMENT_FINALIZATIONS.with_label_values(&["completed"]).inc();
                info!(order_id = %order.id, "order paid");
                self.publish_finalized(&order).await;
                Ok(order)
            }
            Transition::Rejected(order) if order.payment_status == PaymentStatus::Completed => {
                DUPLICATE_FINALIZATIONS
                    .with_label_values(&["mark_paid"])
                    .inc();
                info!(order_id = %order.id, "payment already recorded");
                Ok(order)
            }
            Transition::Rejected(order) => {
                let intent = payment_intent_id
                    .map(str::to_string)
                    .or_else(|| order.payment_intent_id.clone());
                if let Some(intent) = intent {
                    warn!(
                        order_id = %order.id,
                        status = %order.status,
                        payment_status = %order.payment_status,
                        "payment succeeded for an order that can no longer accept it"
                    );
                    self.event_sender
                        .send_or_log(Event::PaymentRequiresRefund {
                            order_id: order.id,
                            payment_intent_id: intent,
                        })
                        .await;
                }
                Err(ServiceError::AlreadyFinalized {
                    order_id: order.id,
                    status: order.status,
                    payment_status: order.payment_status,
                })
            }
        }
    }

    /// Records a failed payment: the order is cancelled and its stock
    /// released, once.
    #[instrument(skip(self), fields(order_id = %order_id))]
    pub async fn mark_failed(&self, order_id: Uuid) -> Result<Order, ServiceError> {
        let update = OrderUpdate {
            status: Some(OrderStatus::Cancelled),
            payment_status: Some(PaymentStatus::Failed),
            ..OrderUpdate::default()
        };

        match self
            .orders
            .transition(order_id, &TransitionGuard::finalizable(), &update)
            .await?
        {
            Transition::Applied(order) => {
                if let Err(err) = self.ledger.release(&order.stock_lines()).await {
                    error!(order_id = %order.id, error = %err, "stock release failed after payment failure");
                }
                PAYMENT_FINALIZATIONS.with_label_values(&["failed"]).inc();
                info!(order_id = %order.id, "order payment failed");
                self.publish_finalized(&order).await;
                Ok(order)
            }
            Transition::Rejected(order) if order.payment_status == PaymentStatus::Failed => {
                DUPLICATE_FINALIZATIONS
                    .with_label_values(&["mark_failed"])
                    .inc();
                Ok(order)
            }
            Transition::Rejected(order) => Err(ServiceError::AlreadyFinalized {
                order_id: order.id,
                status: order.status,
                payment_status: order.payment_status,
            }),
        }
    }

    /// Cancels pending orders created before `now - abandonment_window` and
    /// releases their stock. Orders finalized concurrently are skipped.
    #[instrument(skip(self))]
    pub async fn cancel_expired_pending(
        &self,
        now: DateTime<Utc>,
    ) -> Result<ExpirySummary, ServiceError> {
        let cutoff = now - self.settings.abandonment_window;
        let candidates = self
            .orders
            .pending_created_before(cutoff, EXPIRY_BATCH)
            .await?;

        let mut summary = ExpirySummary {
            examined: candidates.len(),
            ..ExpirySummary::default()
        };
        let update = OrderUpdate {
            status: Some(OrderStatus::Cancelled),
            ..OrderUpdate::default()
        };

        for candidate in candidates {
            match self
                .orders
                .transition(candidate.id, &TransitionGuard::finalizable(), &update)
                .await
            {
                Ok(Transition::Applied(order)) => {
                    if let Err(err) = self.ledger.release(&order.stock_lines()).await {
                        error!(order_id = %order.id, error = %err, "stock release failed for expired order");
                    }
                    EXPIRED_ORDERS_CANCELLED.inc();
                    summary.cancelled += 1;
                    self.event_sender
                        .send_or_log(Event::OrderCancelled {
                            order_id: order.id,
                            reason: "payment not completed in time".to_string(),
                        })
                        .await;
                }
                Ok(Transition::Rejected(_)) => summary.skipped += 1,
                Err(err) => {
                    error!(order_id = %candidate.id, error = %err, "failed to expire order");
                    summary.failed += 1;
                }
            }
        }

        if summary.examined > 0 {
            info!(
                examined = summary.examined,
                cancelled = summary.cancelled,
                skipped = summary.skipped,
                failed = summary.failed,
                "expired pending orders swept"
            );
        }
        Ok(summary)
    }

    /// Staff-driven fulfillment progression.
    ///
    /// `processing` is reachable only through payment confirmation, and
    /// cancelling a pending order competes for the same finalization slot
    /// as the payment channels.
    #[instrument(skip(self, tracking_number), fields(order_id = %order_id, new_status = %new_status))]
    pub async fn update_status(
        &self,
        order_id: Uuid,
        new_status: OrderStatus,
        tracking_number: Option<String>,
    ) -> Result<Order, ServiceError> {
        let current = self.get(order_id).await?;
        let old_status = current.status;

        if !old_status.can_transition_to(new_status) {
            return Err(ServiceError::InvalidOperation(format!(
                "Cannot transition order from {} to {}",
                old_status, new_status
            )));
        }
        if new_status == OrderStatus::Processing {
            return Err(ServiceError::InvalidOperation(
                "orders enter processing only when payment is confirmed".to_string(),
            ));
        }

        let releases_stock =
            old_status == OrderStatus::Pending && new_status == OrderStatus::Cancelled;
        let guard = if releases_stock {
            TransitionGuard::finalizable()
        } else {
            TransitionGuard::in_status(old_status)
        };
        let update = OrderUpdate {
            status: Some(new_status),
            tracking_number: tracking_number.filter(|t| !t.trim().is_empty()),
            ..OrderUpdate::default()
        };

        let order = match self.orders.transition(order_id, &guard, &update).await? {
            Transition::Applied(order) => order,
            Transition::Rejected(order) => {
                return Err(ServiceError::Conflict(format!(
                    "Order {} changed concurrently; it is now {} with payment {}",
                    order.id, order.status, order.payment_status
                )))
            }
        };

        if releases_stock {
            if let Err(err) = self.ledger.release(&order.stock_lines()).await {
                error!(order_id = %order.id, error = %err, "stock release failed for cancelled order");
            }
            self.event_sender
                .send_or_log(Event::OrderCancelled {
                    order_id: order.id,
                    reason: "cancelled by staff".to_string(),
                })
                .await;
        }

        info!(from = %old_status, to = %new_status, "order status updated");
        self.event_sender
            .send_or_log(Event::OrderStatusChanged {
                order_id: order.id,
                old_status,
                new_status,
            })
            .await;
        Ok(order)
    }
}
