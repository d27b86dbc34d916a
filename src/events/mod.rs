use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::models::{OrderStatus, PaymentStatus, StockKey};

/// Domain events published for downstream fulfillment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    OrderCreated {
        order_id: Uuid,
        order_number: String,
    },
    /// Emitted once per order, when the payment outcome is applied.
    OrderFinalized {
        order_id: Uuid,
        status: OrderStatus,
        payment_status: PaymentStatus,
    },
    OrderCancelled {
        order_id: Uuid,
        reason: String,
    },
    OrderStatusChanged {
        order_id: Uuid,
        old_status: OrderStatus,
        new_status: OrderStatus,
    },
    /// A payment succeeded at the gateway for an order that can no longer take it.
    PaymentRequiresRefund {
        order_id: Uuid,
        payment_intent_id: String,
    },
    StockAdjusted {
        key: StockKey,
        available: u32,
    },
}

#[derive(Clone, Debug)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    /// Sends an event asynchronously
    pub async fn send(&self, event: Event) -> Result<(), String> {
        self.sender
            .send(event)
            .await
            .map_err(|e| format!("Failed to send event: {}", e))
    }

    /// Event delivery never fails the operation that produced the event.
    pub async fn send_or_log(&self, event: Event) {
        if let Err(err) = self.send(event).await {
            warn!(error = %err, "dropping domain event");
        }
    }
}

pub async fn process_events(mut rx: mpsc::Receiver<Event>) {
    info!("Starting event processing loop");

    while let Some(event) = rx.recv().await {
        match &event {
            Event::OrderFinalized {
                order_id,
                status,
                payment_status,
            } => {
                info!(
                    order_id = %order_id,
                    status = %status,
                    payment_status = %payment_status,
                    "order finalized"
                );
            }
            Event::PaymentRequiresRefund {
                order_id,
                payment_intent_id,
            } => {
                warn!(
                    order_id = %order_id,
                    payment_intent_id = %payment_intent_id,
                    "payment captured for an order that is no longer payable; refund required"
                );
            }
            other => info!(event = ?other, "domain event"),
        }
    }

    info!("Event processing loop stopped");
}
