use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::errors::ServiceError;
use crate::models::{Order, OrderStatus, PaymentStatus, StockKey, StockLevel, StockLine};

pub mod memory;
pub mod order_repository;
pub mod stock_repository;

pub use memory::{InMemoryOrderRepository, InMemoryStockStore};
pub use order_repository::SeaOrmOrderRepository;
pub use stock_repository::SeaOrmStockStore;

/// Durable per-key stock counters.
///
/// `reserve` is all-or-nothing across every line it is given: on
/// `ServiceError::InsufficientStock` no counter has changed, and no
/// concurrent reader ever sees a reservation half applied.
#[async_trait]
pub trait StockStore: Send + Sync {
    async fn reserve(&self, lines: &[StockLine]) -> Result<(), ServiceError>;

    /// Returns quantities to `available`.
    async fn release(&self, lines: &[StockLine]) -> Result<(), ServiceError>;

    /// Records reserved quantities as sold. `available` is untouched.
    async fn commit(&self, lines: &[StockLine]) -> Result<(), ServiceError>;

    async fn level(&self, key: &StockKey) -> Result<Option<StockLevel>, ServiceError>;

    /// Administrative overwrite of a key's available count.
    async fn set_available(&self, key: &StockKey, available: u32)
        -> Result<StockLevel, ServiceError>;

    /// Creates the key with `available` unless it already exists. Returns
    /// whether a record was created.
    async fn seed(&self, key: &StockKey, available: u32) -> Result<bool, ServiceError>;

    /// Keys whose available count is at or below `threshold`, lowest first.
    async fn low_stock(&self, threshold: u32) -> Result<Vec<StockLevel>, ServiceError>;
}

#[derive(Clone, Debug, Default)]
pub struct OrderFilter {
    pub customer_id: Option<String>,
    pub status: Option<OrderStatus>,
}

#[derive(Clone, Debug, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub page: u64,
    pub limit: u64,
}

/// Preconditions for a conditional order update. All set fields must match
/// the stored order for the update to apply.
#[derive(Clone, Debug, Default)]
pub struct TransitionGuard {
    pub status: Option<OrderStatus>,
    pub payment_status: Option<PaymentStatus>,
    /// Require that no payment intent has been recorded yet.
    pub intent_absent: bool,
}

impl TransitionGuard {
    /// The finalization slot: still awaiting payment and not cancelled.
    pub fn finalizable() -> Self {
        Self {
            status: Some(OrderStatus::Pending),
            payment_status: Some(PaymentStatus::Pending),
            intent_absent: false,
        }
    }

    pub fn in_status(status: OrderStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn matches(&self, order: &Order) -> bool {
        self.status.map_or(true, |s| s == order.status)
            && self
                .payment_status
                .map_or(true, |p| p == order.payment_status)
            && (!self.intent_absent || order.payment_intent_id.is_none())
    }
}

#[derive(Clone, Debug, Default)]
pub struct OrderUpdate {
    pub status: Option<OrderStatus>,
    pub payment_status: Option<PaymentStatus>,
    /// Written only if the order has no intent recorded yet.
    pub payment_intent_id: Option<String>,
    pub tracking_number: Option<String>,
}

impl OrderUpdate {
    pub fn apply(&self, order: &mut Order, now: DateTime<Utc>) {
        if let Some(status) = self.status {
            order.status = status;
        }
        if let Some(payment_status) = self.payment_status {
            order.payment_status = payment_status;
        }
        if order.payment_intent_id.is_none() {
            if let Some(intent) = &self.payment_intent_id {
                order.payment_intent_id = Some(intent.clone());
            }
        }
        if let Some(tracking) = &self.tracking_number {
            order.tracking_number = Some(tracking.clone());
        }
        order.updated_at = now;
    }
}

/// Outcome of a conditional update.
#[derive(Clone, Debug, PartialEq)]
pub enum Transition {
    /// The guard held and the update was written; carries the new state.
    Applied(Order),
    /// The guard did not hold; carries the state that was observed instead.
    Rejected(Order),
}

#[async_trait]
pub trait OrderRepository: Send + Sync {
    async fn insert(&self, order: &Order) -> Result<(), ServiceError>;

    async fn find(&self, id: Uuid) -> Result<Option<Order>, ServiceError>;

    /// Newest first. `page` is 1-based.
    async fn list(
        &self,
        filter: &OrderFilter,
        page: u64,
        limit: u64,
    ) -> Result<Page<Order>, ServiceError>;

    /// Pending orders created strictly before `cutoff`, oldest first.
    async fn pending_created_before(
        &self,
        cutoff: DateTime<Utc>,
        limit: u64,
    ) -> Result<Vec<Order>, ServiceError>;

    /// Atomically applies `update` if `guard` holds. Unknown ids yield
    /// `ServiceError::NotFound`.
    async fn transition(
        &self,
        id: Uuid,
        guard: &TransitionGuard,
        update: &OrderUpdate,
    ) -> Result<Transition, ServiceError>;
}

pub(crate) fn order_not_found(id: Uuid) -> ServiceError {
    ServiceError::NotFound(format!("Order {} not found", id))
}
