use chrono::{DateTime, Utc};
use sea_orm::{DatabaseConnection, TransactionTrait};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::{
    entities::{
        commerce::{cart, cart_item},
        order, order_item, payment, refund,
    },
    errors::ServiceError,
    events::{Event, EventSender},
    repositories::{CartRepository, OrderRepository, PaymentRepository, RefundRepository},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnonymizationResult {
    pub orders_anonymized: u64,
    pub carts_deleted: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportedOrder {
    pub order: order::Model,
    pub items: Vec<order_item::Model>,
    pub payments: Vec<payment::Model>,
    pub refunds: Vec<refund::Model>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportedCart {
    pub cart: cart::Model,
    pub items: Vec<cart_item::Model>,
}

/// Everything the store keeps about one user.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserDataExport {
    pub user_id: Uuid,
    pub generated_at: DateTime<Utc>,
    pub orders: Vec<ExportedOrder>,
    pub carts: Vec<ExportedCart>,
}

/// User deletion and data export.
#[derive(Clone)]
pub struct ComplianceService {
    db: Arc<DatabaseConnection>,
    event_sender: Arc<EventSender>,
}

impl ComplianceService {
    pub fn new(db: Arc<DatabaseConnection>, event_sender: Arc<EventSender>) -> Self {
        Self { db, event_sender }
    }

    /// Detaches the user's orders and deletes their carts. Orders, payments
    /// and refunds are kept for bookkeeping.
    #[instrument(skip(self))]
    pub async fn anonymize_user(&self, user_id: Uuid) -> Result<AnonymizationResult, ServiceError> {
        let txn = self.db.begin().await?;
        let orders_anonymized = OrderRepository::anonymize_user(&txn, user_id).await?;
        let carts_deleted = CartRepository::delete_carts_for_user(&txn, user_id).await?;
        txn.commit().await?;

        info!(%user_id, orders_anonymized, carts_deleted, "User data anonymized");
        self.event_sender
            .send_or_log(Event::UserAnonymized {
                user_id,
                orders_anonymized,
            })
            .await;

        Ok(AnonymizationResult {
            orders_anonymized,
            carts_deleted,
        })
    }

    #[instrument(skip(self))]
    pub async fn export_user_data(&self, user_id: Uuid) -> Result<UserDataExport, ServiceError> {
        let db = &*self.db;

        let mut orders = Vec::new();
        for order in OrderRepository::list_all_for_user(db, user_id).await? {
            let items = OrderRepository::list_items(db, order.id).await?;
            let payments = PaymentRepository::list_for_order(db, order.id).await?;
            let refunds = RefundRepository::list_for_order(db, order.id).await?;
            orders.push(ExportedOrder {
                order,
                items,
                payments,
                refunds,
            });
        }

        let mut carts = Vec::new();
        for cart in CartRepository::list_carts_for_user(db, user_id).await? {
            let items = CartRepository::list_cart_items(db, cart.id).await?;
            carts.push(ExportedCart { cart, items });
        }

        Ok(UserDataExport {
            user_id,
            generated_at: Utc::now(),
            orders,
            carts,
        })
    }
}
