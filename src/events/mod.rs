use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::entities::OrderStatus;

/// Handle used by services to publish domain events.
///
/// Delivery is best effort: a full or closed channel never fails the
/// operation that produced the event.
#[derive(Debug, Clone)]
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

    /// Sends an event, logging instead of failing when the consumer is gone.
    pub async fn send_or_log(&self, event: Event) {
        if let Err(e) = self.send(event).await {
            warn!(error = %e, "Dropping domain event");
        }
    }
}

/// Creates a bounded channel and the sender wrapping it.
pub fn channel(capacity: usize) -> (EventSender, mpsc::Receiver<Event>) {
    let (tx, rx) = mpsc::channel(capacity);
    (EventSender::new(tx), rx)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    OrderCreated {
        order_id: Uuid,
        shop_id: Uuid,
        user_id: Uuid,
        total_amount: Decimal,
    },
    OrderStatusChanged {
        order_id: Uuid,
        old_status: OrderStatus,
        new_status: OrderStatus,
    },
    OrdersExpired {
        order_ids: Vec<Uuid>,
    },
    PaymentSucceeded {
        payment_id: Uuid,
        order_id: Uuid,
        amount: Decimal,
    },
    PaymentFailed {
        payment_id: Uuid,
        order_id: Uuid,
        reason: String,
    },
    RefundRequested {
        refund_id: Uuid,
        order_id: Uuid,
        amount: Decimal,
    },
    RefundApproved {
        refund_id: Uuid,
        order_id: Uuid,
        amount: Decimal,
    },
    RefundRejected {
        refund_id: Uuid,
        order_id: Uuid,
    },
    CartCleared {
        cart_id: Uuid,
    },
    UserAnonymized {
        user_id: Uuid,
        orders_anonymized: u64,
    },
}

/// Drains the channel until every sender is dropped.
pub async fn process_events(mut rx: mpsc::Receiver<Event>) {
    info!("Starting event processing loop");

    while let Some(event) = rx.recv().await {
        match &event {
            Event::OrderCreated {
                order_id,
                shop_id,
                total_amount,
                ..
            } => {
                info!(%order_id, %shop_id, %total_amount, "Order created");
            }
            Event::OrderStatusChanged {
                order_id,
                old_status,
                new_status,
            } => {
                info!(%order_id, %old_status, %new_status, "Order status changed");
            }
            Event::OrdersExpired { order_ids } => {
                info!(count = order_ids.len(), "Expired unpaid orders cancelled");
            }
            Event::PaymentSucceeded {
                payment_id,
                order_id,
                amount,
            } => {
                info!(%payment_id, %order_id, %amount, "Payment succeeded");
            }
            Event::PaymentFailed {
                payment_id,
                order_id,
                reason,
            } => {
                warn!(%payment_id, %order_id, reason = %reason, "Payment failed");
            }
            Event::RefundApproved {
                refund_id, amount, ..
            } => {
                info!(%refund_id, %amount, "Refund approved");
            }
            other => {
                info!(event = ?other, "Domain event");
            }
        }
    }

    warn!("Event processing loop has ended");
}
