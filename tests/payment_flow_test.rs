mod common;

use std::sync::Arc;

use assert_matches::assert_matches;
use async_trait::async_trait;
use common::*;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use sea_orm::DatabaseConnection;
use serde_json::json;
use storefront_api::{
    entities::{order::OrderStatus, payment::PaymentStatus},
    gateways::{
        GatewayError, GatewayPaymentRequest, GatewayRefundRequest, GatewayResponse,
        PaymentGateway,
    },
    repositories::{OrderRepository, PaymentRepository},
    services::payments::{
        PaymentError, PaymentService, ProcessPaymentRequest, REASON_ORDER_ALREADY_PROCESSED,
    },
};
use uuid::Uuid;

fn pay(order_id: Uuid, method: &str, amount: Decimal) -> ProcessPaymentRequest {
    ProcessPaymentRequest {
        order_id,
        method: method.to_string(),
        amount,
        currency: "EUR".to_string(),
        card_data: Some(json!({ "paymentMethod": "pm_card_visa" })),
        paypal_data: None,
        description: None,
    }
}

async fn order_status(db: &DatabaseConnection, order_id: Uuid) -> OrderStatus {
    OrderRepository::find_by_id(db, order_id)
        .await
        .unwrap()
        .unwrap()
        .status
}

#[tokio::test]
async fn successful_payment_moves_order_to_processing() {
    let h = Harness::new().await;
    let user_id = Uuid::new_v4();
    let order_id = h.pending_order(user_id, dec!(50), 2).await;

    let outcome = h
        .payments
        .process_payment(user_id, pay(order_id, "stripe", dec!(100)))
        .await
        .expect("payment succeeds");

    assert_eq!(outcome.payment.status, PaymentStatus::Success);
    assert!(!outcome.is_pending());
    assert!(outcome.provider_id.is_some());
    assert_eq!(outcome.payment.method, "stripe");
    assert_eq!(order_status(&h.db, order_id).await, OrderStatus::Processing);

    let calls = h.gateway.payment_calls.lock().unwrap().clone();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].metadata.order_id, order_id);
    assert_eq!(calls[0].metadata.user_id, user_id);
    assert_eq!(calls[0].currency, "EUR");
}

#[tokio::test]
async fn method_key_is_case_insensitive() {
    let h = Harness::new().await;
    let user_id = Uuid::new_v4();
    let order_id = h.pending_order(user_id, dec!(20), 1).await;

    let outcome = h
        .payments
        .process_payment(user_id, pay(order_id, "PayPal", dec!(20)))
        .await
        .unwrap();
    assert_eq!(outcome.payment.method, "paypal");
}

#[tokio::test]
async fn declined_payment_records_failed_row() {
    let h = Harness::new().await;
    let user_id = Uuid::new_v4();
    let order_id = h.pending_order(user_id, dec!(50), 1).await;
    h.gateway.push_payment(Ok(GatewayResponse::declined(
        Some("insufficient_funds".into()),
        Some("Your card has insufficient funds.".into()),
        Some("pi_declined".into()),
        json!({ "decline_code": "insufficient_funds" }),
    )));

    let err = h
        .payments
        .process_payment(user_id, pay(order_id, "stripe", dec!(50)))
        .await
        .unwrap_err();

    assert_eq!(err.status_code().as_u16(), 402);
    let details = assert_matches!(err, PaymentError::Declined(details) => details);
    assert_eq!(details["errorCode"], "insufficient_funds");

    let payments = PaymentRepository::list_for_order(&*h.db, order_id)
        .await
        .unwrap();
    assert_eq!(payments.len(), 1);
    assert_eq!(payments[0].status, PaymentStatus::Failed);
    assert_eq!(payments[0].provider_id.as_deref(), Some("pi_declined"));
    assert_eq!(order_status(&h.db, order_id).await, OrderStatus::Pending);
}

#[tokio::test]
async fn gateway_error_records_failed_row_and_hides_detail() {
    let h = Harness::new().await;
    let user_id = Uuid::new_v4();
    let order_id = h.pending_order(user_id, dec!(50), 1).await;
    h.gateway.push_payment(Err(GatewayError::Transport(
        "connection reset by peer".into(),
    )));

    let err = h
        .payments
        .process_payment(user_id, pay(order_id, "stripe", dec!(50)))
        .await
        .unwrap_err();

    assert_matches!(err, PaymentError::Gateway);
    assert_eq!(err.status_code().as_u16(), 502);
    assert_eq!(err.to_string(), "Erreur de paiement externe");

    let payments = PaymentRepository::list_for_order(&*h.db, order_id)
        .await
        .unwrap();
    assert_eq!(payments.len(), 1);
    assert_eq!(payments[0].status, PaymentStatus::Failed);
    assert_eq!(payments[0].metadata["errorKind"], "gateway_error");
    assert_eq!(order_status(&h.db, order_id).await, OrderStatus::Pending);
}

#[tokio::test]
async fn failed_attempt_can_be_retried() {
    let h = Harness::new().await;
    let user_id = Uuid::new_v4();
    let order_id = h.pending_order(user_id, dec!(30), 1).await;
    h.gateway.push_payment(Err(GatewayError::Transport("timeout".into())));

    assert!(h
        .payments
        .process_payment(user_id, pay(order_id, "stripe", dec!(30)))
        .await
        .is_err());
    h.payments
        .process_payment(user_id, pay(order_id, "stripe", dec!(30)))
        .await
        .expect("retry succeeds");

    let payments = PaymentRepository::list_for_order(&*h.db, order_id)
        .await
        .unwrap();
    assert_eq!(payments.len(), 2);
    assert_eq!(
        payments
            .iter()
            .filter(|p| p.status == PaymentStatus::Success)
            .count(),
        1
    );
}

#[tokio::test]
async fn unsupported_method_is_a_gateway_failure() {
    let h = Harness::new().await;
    let user_id = Uuid::new_v4();
    let order_id = h.pending_order(user_id, dec!(50), 1).await;

    let err = h
        .payments
        .process_payment(user_id, pay(order_id, "bitcoin", dec!(50)))
        .await
        .unwrap_err();

    assert_matches!(err, PaymentError::Gateway);
    assert_eq!(h.gateway.payment_call_count(), 0);
    let payments = PaymentRepository::list_for_order(&*h.db, order_id)
        .await
        .unwrap();
    assert_eq!(payments.len(), 1);
    assert_eq!(payments[0].status, PaymentStatus::Failed);
}

#[tokio::test]
async fn paid_order_cannot_be_paid_again() {
    let h = Harness::new().await;
    let user_id = Uuid::new_v4();
    let order_id = h.pending_order(user_id, dec!(50), 1).await;
    h.payments
        .process_payment(user_id, pay(order_id, "stripe", dec!(50)))
        .await
        .unwrap();

    let err = h
        .payments
        .process_payment(user_id, pay(order_id, "stripe", dec!(50)))
        .await
        .unwrap_err();

    assert_matches!(err, PaymentError::AlreadyProcessed);
    assert_eq!(err.status_code().as_u16(), 400);
    assert_eq!(h.gateway.payment_call_count(), 1);
}

#[tokio::test]
async fn rejections_before_dispatch_leave_no_payment_row() {
    let h = Harness::new().await;
    let owner = Uuid::new_v4();
    let order_id = h.pending_order(owner, dec!(50), 1).await;

    assert_matches!(
        h.payments
            .process_payment(owner, pay(Uuid::new_v4(), "stripe", dec!(50)))
            .await,
        Err(PaymentError::OrderNotFound)
    );

    let not_owner = h
        .payments
        .process_payment(Uuid::new_v4(), pay(order_id, "stripe", dec!(50)))
        .await
        .unwrap_err();
    assert_matches!(not_owner, PaymentError::NotOrderOwner);
    assert_eq!(not_owner.status_code().as_u16(), 400);

    assert_matches!(
        h.payments
            .process_payment(owner, pay(order_id, "stripe", dec!(49.99)))
            .await,
        Err(PaymentError::AmountMismatch { .. })
    );

    assert_eq!(h.gateway.payment_call_count(), 0);
    assert!(PaymentRepository::list_for_order(&*h.db, order_id)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn pending_capture_leaves_order_pending() {
    let h = Harness::new().await;
    let user_id = Uuid::new_v4();
    let order_id = h.pending_order(user_id, dec!(50), 1).await;
    h.gateway.push_payment(Ok(GatewayResponse::pending(
        "pi_processing",
        None,
        json!({ "status": "processing" }),
    )));

    let outcome = h
        .payments
        .process_payment(user_id, pay(order_id, "stripe", dec!(50)))
        .await
        .unwrap();

    assert!(outcome.is_pending());
    assert_eq!(outcome.payment.status, PaymentStatus::Pending);
    assert_eq!(order_status(&h.db, order_id).await, OrderStatus::Pending);
}

#[tokio::test]
async fn pending_capture_blocks_a_second_dispatch() {
    let h = Harness::new().await;
    let user_id = Uuid::new_v4();
    let order_id = h.pending_order(user_id, dec!(50), 1).await;
    h.gateway.push_payment(Ok(GatewayResponse::pending(
        "pi_processing",
        None,
        json!({ "status": "processing" }),
    )));
    h.payments
        .process_payment(user_id, pay(order_id, "stripe", dec!(50)))
        .await
        .unwrap();

    let err = h
        .payments
        .process_payment(user_id, pay(order_id, "stripe", dec!(50)))
        .await
        .unwrap_err();

    assert_matches!(err, PaymentError::AlreadyProcessed);
    assert_eq!(h.gateway.payment_call_count(), 1);
    let rows = PaymentRepository::list_for_order(&*h.db, order_id)
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].status, PaymentStatus::Pending);
}

#[tokio::test]
async fn expiry_sweep_skips_orders_with_a_capture_in_flight() {
    let h = Harness::with_order_expiry(chrono::Duration::minutes(-1)).await;
    let user_id = Uuid::new_v4();
    let order_id = h.pending_order(user_id, dec!(50), 1).await;
    h.gateway.push_payment(Ok(GatewayResponse::pending(
        "pi_processing",
        None,
        json!({ "status": "processing" }),
    )));
    h.payments
        .process_payment(user_id, pay(order_id, "stripe", dec!(50)))
        .await
        .unwrap();

    let swept = h.orders.cancel_expired_unpaid_orders().await.unwrap();

    assert!(swept.cancelled_order_ids.is_empty());
    assert_eq!(order_status(&h.db, order_id).await, OrderStatus::Pending);
}

/// Settles the order behind the dispatcher's back while "talking to the
/// provider", then reports a successful capture.
struct RacingGateway {
    db: Arc<DatabaseConnection>,
    order_id: Uuid,
    inner: Arc<ScriptedGateway>,
}

#[async_trait]
impl PaymentGateway for RacingGateway {
    fn name(&self) -> &'static str {
        "racing"
    }

    async fn process_payment(
        &self,
        request: &GatewayPaymentRequest,
    ) -> Result<GatewayResponse, GatewayError> {
        OrderRepository::transition_status(
            &*self.db,
            self.order_id,
            OrderStatus::Pending,
            OrderStatus::Processing,
        )
        .await
        .expect("concurrent settlement");
        self.inner.process_payment(request).await
    }

    async fn refund_payment(
        &self,
        request: &GatewayRefundRequest,
    ) -> Result<GatewayResponse, GatewayError> {
        self.inner.refund_payment(request).await
    }
}

#[tokio::test]
async fn losing_the_settlement_race_refunds_the_duplicate_capture() {
    let h = Harness::new().await;
    let user_id = Uuid::new_v4();
    let order_id = h.pending_order(user_id, dec!(50), 1).await;

    let scripted = ScriptedGateway::new();
    let racing = Arc::new(RacingGateway {
        db: h.db.clone(),
        order_id,
        inner: scripted.clone(),
    });
    let (events, _rx) = event_channel();
    let payments = PaymentService::new(h.db.clone(), events, registry_with(racing));

    let err = payments
        .process_payment(user_id, pay(order_id, "stripe", dec!(50)))
        .await
        .unwrap_err();
    assert_matches!(err, PaymentError::AlreadyProcessed);

    // The capture was reversed and no SUCCESS row survived.
    assert_eq!(scripted.refund_call_count(), 1);
    let records = PaymentRepository::list_for_order(&*h.db, order_id)
        .await
        .unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, PaymentStatus::Failed);
    assert_eq!(records[0].metadata["reason"], REASON_ORDER_ALREADY_PROCESSED);
    assert_eq!(order_status(&h.db, order_id).await, OrderStatus::Processing);
}

#[tokio::test]
async fn payments_are_listed_for_the_owner_only() {
    let h = Harness::new().await;
    let user_id = Uuid::new_v4();
    let order_id = h.pending_order(user_id, dec!(50), 1).await;
    h.payments
        .process_payment(user_id, pay(order_id, "stripe", dec!(50)))
        .await
        .unwrap();

    assert_eq!(
        h.payments
            .list_payments_for_order(user_id, order_id)
            .await
            .unwrap()
            .len(),
        1
    );
    assert!(h
        .payments
        .list_payments_for_order(Uuid::new_v4(), order_id)
        .await
        .is_err());
}
