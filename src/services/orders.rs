//! Order Assembler and order lifecycle.
//!
//! Converts a cart into an order inside one transaction, serves order
//! queries and cancels orders left unpaid past their deadline.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Duration, Utc};
use metrics::counter;
use rust_decimal::Decimal;
use sea_orm::{ConnectionTrait, DatabaseConnection, TransactionTrait};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::{
    entities::{
        commerce::{cart_item, product_variant},
        order, order_item, OrderStatus,
    },
    errors::{rejection_response, ServiceError},
    events::{Event, EventSender},
    repositories::{
        order_repository::NewOrder, CartRepository, CatalogRepository, OrderRepository,
    },
    services::promotions,
};

pub const INSUFFICIENT_STOCK: &str = "Stock insuffisant";
pub const PRODUCT_DELETED: &str = "Produit supprimé";

/// Upper bound on orders handled by one sweep run.
const SWEEP_BATCH_SIZE: u64 = 500;

/// One cart line that cannot be fulfilled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilityIssue {
    /// Variant id of the offending line.
    pub prod: Uuid,
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub available: Option<i32>,
}

impl AvailabilityIssue {
    fn insufficient_stock(variant_id: Uuid, available: i32) -> Self {
        Self {
            prod: variant_id,
            error: INSUFFICIENT_STOCK.to_string(),
            available: Some(available),
        }
    }

    fn product_deleted(variant_id: Uuid) -> Self {
        Self {
            prod: variant_id,
            error: PRODUCT_DELETED.to_string(),
            available: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum CheckoutError {
    #[error("Panier vide")]
    EmptyCart,

    #[error("Erreur de disponibilité")]
    Unavailable(Vec<AvailabilityIssue>),

    #[error(transparent)]
    Service(#[from] ServiceError),
}

impl From<sea_orm::DbErr> for CheckoutError {
    fn from(err: sea_orm::DbErr) -> Self {
        CheckoutError::Service(err.into())
    }
}

impl CheckoutError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::EmptyCart | Self::Unavailable(_) => StatusCode::BAD_REQUEST,
            Self::Service(err) => err.status_code(),
        }
    }

    pub fn details(&self) -> Option<Value> {
        match self {
            Self::Unavailable(issues) => serde_json::to_value(issues).ok(),
            _ => None,
        }
    }
}

impl IntoResponse for CheckoutError {
    fn into_response(self) -> Response {
        match self {
            Self::Service(err) => err.into_response(),
            rejection => {
                rejection_response(rejection.status_code(), rejection.to_string(), rejection.details())
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedOrder {
    pub order_id: Uuid,
}

/// An order with its line snapshots.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderDetails {
    #[serde(flatten)]
    pub order: order::Model,
    pub items: Vec<order_item::Model>,
}

/// Outcome of one expiry sweep.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExpirySweepResult {
    /// Orders moved from PENDING to CANCELLED by this run.
    pub cancelled_order_ids: Vec<Uuid>,
    /// Candidates that changed state before this run reached them.
    pub skipped_count: u64,
    /// Candidates whose cancellation failed and will be retried next run.
    pub failed_count: u64,
    /// Units returned to stock.
    pub restocked_units: i64,
    pub swept_at: Option<DateTime<Utc>>,
}

impl ExpirySweepResult {
    pub fn cancelled_count(&self) -> usize {
        self.cancelled_order_ids.len()
    }
}

/// Service for assembling orders and managing their lifecycle.
#[derive(Clone)]
pub struct OrderService {
    db: Arc<DatabaseConnection>,
    event_sender: Arc<EventSender>,
    order_expiry: Duration,
}

impl OrderService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        event_sender: Arc<EventSender>,
        order_expiry: Duration,
    ) -> Self {
        Self {
            db,
            event_sender,
            order_expiry,
        }
    }

    /// Converts the user's cart for `shop_id` into a PENDING order.
    ///
    /// Availability is checked for every line before anything is written.
    /// Order creation, line snapshots, stock decrements, cart deletion and
    /// the final total run in one transaction: a stock race lost on any line
    /// leaves no order behind.
    #[instrument(skip(self), fields(user_id = %user_id, shop_id = %shop_id))]
    pub async fn create_order_from_cart(
        &self,
        user_id: Uuid,
        shop_id: Uuid,
    ) -> Result<CreatedOrder, CheckoutError> {
        let db = &*self.db;

        let Some(cart) = CartRepository::find_cart_by_user_and_shop(db, user_id, shop_id).await?
        else {
            counter!("storefront.checkout.rejected", 1, "reason" => "empty_cart");
            return Err(CheckoutError::EmptyCart);
        };

        let items = CartRepository::list_cart_items(db, cart.id).await?;
        if items.is_empty() {
            counter!("storefront.checkout.rejected", 1, "reason" => "empty_cart");
            return Err(CheckoutError::EmptyCart);
        }

        let mut issues = Vec::new();
        let mut lines: Vec<(cart_item::Model, product_variant::Model)> =
            Vec::with_capacity(items.len());
        for item in items {
            match Self::check_availability(db, &item).await? {
                Ok(variant) => lines.push((item, variant)),
                Err(issue) => issues.push(issue),
            }
        }

        if !issues.is_empty() {
            info!(issues = issues.len(), "Checkout rejected for unavailable lines");
            counter!("storefront.checkout.rejected", 1, "reason" => "unavailable");
            return Err(CheckoutError::Unavailable(issues));
        }

        let currency = lines
            .first()
            .map(|(_, variant)| variant.currency.clone())
            .unwrap_or_default();
        if lines.iter().any(|(_, variant)| variant.currency != currency) {
            return Err(ServiceError::InvalidInput(
                "Cart contains items priced in different currencies".to_string(),
            )
            .into());
        }

        let cart_total: Decimal = lines
            .iter()
            .map(|(item, variant)| variant.price * Decimal::from(item.quantity))
            .sum();

        let now = Utc::now();
        let txn = db.begin().await?;

        // Claiming the cart first serializes checkouts of the same cart.
        if !CartRepository::delete_cart(&txn, cart.id).await? {
            txn.rollback().await?;
            info!(cart_id = %cart.id, "Cart already converted by a concurrent checkout");
            counter!("storefront.checkout.rejected", 1, "reason" => "empty_cart");
            return Err(CheckoutError::EmptyCart);
        }

        let order = OrderRepository::create(
            &txn,
            NewOrder {
                shop_id,
                user_id,
                total_amount: cart_total,
                currency,
                expires_at: now + self.order_expiry,
            },
        )
        .await?;

        let mut total = Decimal::ZERO;
        for (item, variant) in &lines {
            let unit_price = promotions::applied_unit_price(&txn, variant, now).await?;
            OrderRepository::add_item(&txn, order.id, variant.id, item.quantity, unit_price)
                .await?;

            if !CatalogRepository::decrement_stock(&txn, variant.id, item.quantity).await? {
                txn.rollback().await?;
                let available = CatalogRepository::find_variant_by_id(db, variant.id)
                    .await?
                    .map(|v| v.stock)
                    .unwrap_or(0);
                warn!(variant_id = %variant.id, available, "Stock race lost during checkout");
                counter!("storefront.checkout.rejected", 1, "reason" => "stock_race");
                return Err(CheckoutError::Unavailable(vec![
                    AvailabilityIssue::insufficient_stock(variant.id, available),
                ]));
            }

            total += unit_price * Decimal::from(item.quantity);
        }

        OrderRepository::update_total(&txn, order.id, total).await?;
        txn.commit().await?;

        info!(order_id = %order.id, total = %total, lines = lines.len(), "Order created from cart");
        counter!("storefront.orders.created", 1);

        self.event_sender
            .send_or_log(Event::OrderCreated {
                order_id: order.id,
                shop_id,
                user_id,
                total_amount: total,
            })
            .await;
        self.event_sender
            .send_or_log(Event::CartCleared { cart_id: cart.id })
            .await;

        Ok(CreatedOrder { order_id: order.id })
    }

    /// Outer `Err` is a system failure, inner `Err` a line that cannot be served.
    async fn check_availability<C>(
        conn: &C,
        item: &cart_item::Model,
    ) -> Result<Result<product_variant::Model, AvailabilityIssue>, ServiceError>
    where
        C: ConnectionTrait,
    {
        let Some(variant) = CatalogRepository::find_variant_by_id(conn, item.variant_id).await?
        else {
            return Ok(Err(AvailabilityIssue::product_deleted(item.variant_id)));
        };

        if CatalogRepository::find_product_by_id(conn, variant.product_id)
            .await?
            .is_none()
        {
            return Ok(Err(AvailabilityIssue::product_deleted(item.variant_id)));
        }

        if variant.stock < item.quantity {
            return Ok(Err(AvailabilityIssue::insufficient_stock(
                variant.id,
                variant.stock,
            )));
        }

        Ok(Ok(variant))
    }

    /// Returns the order with its items if it belongs to `user_id`.
    #[instrument(skip(self))]
    pub async fn get_order(&self, user_id: Uuid, order_id: Uuid) -> Result<OrderDetails, ServiceError> {
        let db = &*self.db;
        let order = OrderRepository::find_by_id(db, order_id)
            .await?
            .filter(|o| o.is_owned_by(user_id))
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))?;
        let items = OrderRepository::list_items(db, order.id).await?;
        Ok(OrderDetails { order, items })
    }

    /// Lists the user's orders, newest first.
    #[instrument(skip(self))]
    pub async fn list_orders_for_user(
        &self,
        user_id: Uuid,
        page: u64,
        per_page: u64,
    ) -> Result<(Vec<order::Model>, u64), ServiceError> {
        OrderRepository::list_for_user(&*self.db, user_id, page.max(1), per_page.clamp(1, 100))
            .await
    }

    /// Cancels PENDING orders past `expires_at` that were never paid and
    /// returns their units to stock.
    ///
    /// Safe to run repeatedly: each cancellation is a conditional update, so an
    /// order paid or cancelled concurrently is skipped.
    #[instrument(skip(self))]
    pub async fn cancel_expired_unpaid_orders(&self) -> Result<ExpirySweepResult, ServiceError> {
        let db = &*self.db;
        let now = Utc::now();
        let candidates = OrderRepository::find_expired_unpaid(db, now, SWEEP_BATCH_SIZE).await?;

        let mut result = ExpirySweepResult {
            swept_at: Some(now),
            ..Default::default()
        };

        for order in candidates {
            match Self::cancel_and_restock(db, order.id).await {
                Ok(Some(units)) => {
                    result.cancelled_order_ids.push(order.id);
                    result.restocked_units += units;
                    info!(order_id = %order.id, units, "Cancelled expired unpaid order");
                    self.event_sender
                        .send_or_log(Event::OrderStatusChanged {
                            order_id: order.id,
                            old_status: OrderStatus::Pending,
                            new_status: OrderStatus::Cancelled,
                        })
                        .await;
                }
                Ok(None) => result.skipped_count += 1,
                Err(e) => {
                    result.failed_count += 1;
                    warn!(order_id = %order.id, error = %e, "Failed to cancel expired order");
                }
            }
        }

        if !result.cancelled_order_ids.is_empty() {
            counter!(
                "storefront.orders.expired",
                result.cancelled_order_ids.len() as u64
            );
            self.event_sender
                .send_or_log(Event::OrdersExpired {
                    order_ids: result.cancelled_order_ids.clone(),
                })
                .await;
        }

        info!(
            cancelled = result.cancelled_count(),
            skipped = result.skipped_count,
            failed = result.failed_count,
            "Completed expired order sweep"
        );
        Ok(result)
    }

    /// `Ok(None)` when the order left PENDING before we got to it.
    async fn cancel_and_restock(
        db: &DatabaseConnection,
        order_id: Uuid,
    ) -> Result<Option<i64>, ServiceError> {
        let txn = db.begin().await?;

        if !OrderRepository::transition_status(
            &txn,
            order_id,
            OrderStatus::Pending,
            OrderStatus::Cancelled,
        )
        .await?
        {
            txn.rollback().await?;
            return Ok(None);
        }

        let mut units = 0i64;
        for item in OrderRepository::list_items(&txn, order_id).await? {
            if CatalogRepository::restock(&txn, item.variant_id, item.quantity).await? {
                units += i64::from(item.quantity);
            } else {
                warn!(variant_id = %item.variant_id, "Variant gone, units not restocked");
            }
        }

        txn.commit().await?;
        Ok(Some(units))
    }
}
