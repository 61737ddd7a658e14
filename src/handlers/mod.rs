pub mod carts;
pub mod common;
pub mod health;
pub mod me;
pub mod orders;
pub mod payments;
pub mod refunds;

use crate::events::EventSender;
use crate::gateways::GatewayRegistry;
use crate::services::{
    carts::CartService, compliance::ComplianceService, orders::OrderService,
    payments::PaymentService, refunds::RefundService,
};
use sea_orm::DatabaseConnection;
use std::sync::Arc;

// Re-export AppState so handler modules can import it as crate::handlers::AppState
pub use crate::AppState;

/// Services layer that encapsulates business logic used by HTTP handlers
#[derive(Clone)]
pub struct AppServices {
    pub carts: Arc<CartService>,
    pub orders: Arc<OrderService>,
    pub payments: Arc<PaymentService>,
    pub refunds: Arc<RefundService>,
    pub compliance: Arc<ComplianceService>,
}

impl AppServices {
    pub fn new(
        db: Arc<DatabaseConnection>,
        event_sender: Arc<EventSender>,
        gateways: Arc<GatewayRegistry>,
        order_expiry: chrono::Duration,
    ) -> Self {
        Self {
            carts: Arc::new(CartService::new(db.clone(), event_sender.clone())),
            orders: Arc::new(OrderService::new(
                db.clone(),
                event_sender.clone(),
                order_expiry,
            )),
            payments: Arc::new(PaymentService::new(
                db.clone(),
                event_sender.clone(),
                gateways.clone(),
            )),
            refunds: Arc::new(RefundService::new(
                db.clone(),
                event_sender.clone(),
                gateways,
            )),
            compliance: Arc::new(ComplianceService::new(db, event_sender)),
        }
    }
}
