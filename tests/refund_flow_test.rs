mod common;

use assert_matches::assert_matches;
use common::*;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde_json::json;
use storefront_api::{
    entities::{order::OrderStatus, refund::RefundStatus},
    gateways::{GatewayError, GatewayResponse},
    repositories::{OrderRepository, RefundRepository},
    services::{
        payments::ProcessPaymentRequest,
        refunds::{CreateRefundRequest, RefundError},
    },
};
use uuid::Uuid;

/// Pending order paid in full; returns the order id.
async fn paid_order(h: &Harness, user_id: Uuid, price: Decimal, quantity: i32) -> Uuid {
    let order_id = h.pending_order(user_id, price, quantity).await;
    h.payments
        .process_payment(
            user_id,
            ProcessPaymentRequest {
                order_id,
                method: "stripe".into(),
                amount: price * Decimal::from(quantity),
                currency: "EUR".into(),
                card_data: None,
                paypal_data: None,
                description: None,
            },
        )
        .await
        .expect("payment succeeds");
    order_id
}

fn refund_request(order_id: Uuid, amount: Option<Decimal>) -> CreateRefundRequest {
    CreateRefundRequest {
        order_id,
        amount,
        reason: Some("Damaged on arrival".into()),
    }
}

#[tokio::test]
async fn refund_request_is_recorded_pending_without_gateway_call() {
    let h = Harness::new().await;
    let user_id = Uuid::new_v4();
    let order_id = paid_order(&h, user_id, dec!(50), 2).await;

    let refund = h
        .refunds
        .create_refund(user_id, refund_request(order_id, Some(dec!(30))))
        .await
        .unwrap();

    assert_eq!(refund.status, RefundStatus::Pending);
    assert_eq!(refund.amount.round_dp(2), dec!(30));
    assert_eq!(refund.order_id, order_id);
    assert_eq!(refund.requested_by, Some(user_id));
    assert_eq!(h.gateway.refund_call_count(), 0);
}

#[tokio::test]
async fn missing_amount_defaults_to_the_full_payment() {
    let h = Harness::new().await;
    let user_id = Uuid::new_v4();
    let order_id = paid_order(&h, user_id, dec!(25), 4).await;

    let refund = h
        .refunds
        .create_refund(user_id, refund_request(order_id, None))
        .await
        .unwrap();
    assert_eq!(refund.amount.round_dp(2), dec!(100));
}

#[tokio::test]
async fn refund_requests_are_validated() {
    let h = Harness::new().await;
    let owner = Uuid::new_v4();
    let order_id = paid_order(&h, owner, dec!(50), 2).await;

    let unpaid = h.pending_order(owner, dec!(10), 1).await;
    let err = h
        .refunds
        .create_refund(owner, refund_request(unpaid, None))
        .await
        .unwrap_err();
    assert_matches!(err, RefundError::PaymentNotFound);
    assert_eq!(err.status_code().as_u16(), 404);

    let err = h
        .refunds
        .create_refund(Uuid::new_v4(), refund_request(order_id, None))
        .await
        .unwrap_err();
    assert_matches!(err, RefundError::Forbidden);
    assert_eq!(err.status_code().as_u16(), 403);

    let err = h
        .refunds
        .create_refund(owner, refund_request(order_id, Some(dec!(150))))
        .await
        .unwrap_err();
    assert_matches!(err, RefundError::AmountExceedsPayment { .. });
    assert_eq!(err.status_code().as_u16(), 400);

    assert_matches!(
        h.refunds
            .create_refund(owner, refund_request(order_id, Some(Decimal::ZERO)))
            .await,
        Err(RefundError::InvalidAmount)
    );

    assert!(RefundRepository::list_for_order(&*h.db, order_id)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn only_settled_payments_can_be_refunded() {
    let h = Harness::new().await;
    let user_id = Uuid::new_v4();
    let order_id = h.pending_order(user_id, dec!(40), 1).await;
    h.gateway
        .push_payment(Err(GatewayError::Transport("timeout".into())));
    let _ = h
        .payments
        .process_payment(
            user_id,
            ProcessPaymentRequest {
                order_id,
                method: "stripe".into(),
                amount: dec!(40),
                currency: "EUR".into(),
                card_data: None,
                paypal_data: None,
                description: None,
            },
        )
        .await;

    let err = h
        .refunds
        .create_refund(user_id, refund_request(order_id, None))
        .await
        .unwrap_err();
    assert_matches!(err, RefundError::PaymentNotSettled);
    assert_eq!(err.status_code().as_u16(), 400);
}

#[tokio::test]
async fn full_approval_reverses_money_and_refunds_the_order() {
    let h = Harness::new().await;
    let user_id = Uuid::new_v4();
    let merchant_id = Uuid::new_v4();
    let order_id = paid_order(&h, user_id, dec!(50), 2).await;
    let refund = h
        .refunds
        .create_refund(user_id, refund_request(order_id, None))
        .await
        .unwrap();

    let approved = h
        .refunds
        .approve_refund(refund.id, merchant_id)
        .await
        .expect("approval succeeds");

    assert_eq!(approved.status, RefundStatus::Approved);
    assert_eq!(approved.processed_by, Some(merchant_id));
    assert!(approved
        .provider_refund_id
        .as_deref()
        .is_some_and(|id| id.starts_with("re_")));

    let calls = h.gateway.refund_calls.lock().unwrap().clone();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].amount.map(|a| a.round_dp(2)), Some(dec!(100)));
    assert!(calls[0].provider_id.starts_with("pi_"));

    let order = OrderRepository::find_by_id(&*h.db, order_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(order.status, OrderStatus::Refunded);
}

#[tokio::test]
async fn partial_approval_leaves_order_status_alone() {
    let h = Harness::new().await;
    let user_id = Uuid::new_v4();
    let order_id = paid_order(&h, user_id, dec!(50), 2).await;
    let refund = h
        .refunds
        .create_refund(user_id, refund_request(order_id, Some(dec!(20))))
        .await
        .unwrap();

    h.refunds
        .approve_refund(refund.id, Uuid::new_v4())
        .await
        .unwrap();

    let order = OrderRepository::find_by_id(&*h.db, order_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(order.status, OrderStatus::Processing);
}

#[tokio::test]
async fn approved_refund_cannot_be_approved_or_rejected_again() {
    let h = Harness::new().await;
    let user_id = Uuid::new_v4();
    let order_id = paid_order(&h, user_id, dec!(10), 1).await;
    let refund = h
        .refunds
        .create_refund(user_id, refund_request(order_id, None))
        .await
        .unwrap();
    h.refunds
        .approve_refund(refund.id, Uuid::new_v4())
        .await
        .unwrap();

    let err = h
        .refunds
        .approve_refund(refund.id, Uuid::new_v4())
        .await
        .unwrap_err();
    assert_matches!(err, RefundError::AlreadyApproved);
    assert_eq!(err.to_string(), "Ce remboursement a déjà été approuvé.");

    assert_matches!(
        h.refunds.reject_refund(refund.id, Uuid::new_v4()).await,
        Err(RefundError::AlreadyApproved)
    );
    assert_eq!(h.gateway.refund_call_count(), 1);
}

#[tokio::test]
async fn rejection_touches_neither_gateway_nor_order() {
    let h = Harness::new().await;
    let user_id = Uuid::new_v4();
    let merchant_id = Uuid::new_v4();
    let order_id = paid_order(&h, user_id, dec!(10), 1).await;
    let refund = h
        .refunds
        .create_refund(user_id, refund_request(order_id, None))
        .await
        .unwrap();

    let rejected = h.refunds.reject_refund(refund.id, merchant_id).await.unwrap();
    assert_eq!(rejected.status, RefundStatus::Rejected);
    assert_eq!(rejected.processed_by, Some(merchant_id));
    assert_eq!(h.gateway.refund_call_count(), 0);

    let order = OrderRepository::find_by_id(&*h.db, order_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(order.status, OrderStatus::Processing);

    // A rejected refund may still be approved later.
    let approved = h
        .refunds
        .approve_refund(refund.id, merchant_id)
        .await
        .unwrap();
    assert_eq!(approved.status, RefundStatus::Approved);
}

#[tokio::test]
async fn unknown_refund_is_not_found() {
    let h = Harness::new().await;
    assert_matches!(
        h.refunds.approve_refund(Uuid::new_v4(), Uuid::new_v4()).await,
        Err(RefundError::NotFound)
    );
    assert_matches!(
        h.refunds.reject_refund(Uuid::new_v4(), Uuid::new_v4()).await,
        Err(RefundError::NotFound)
    );
}

#[tokio::test]
async fn gateway_failure_releases_the_claim() {
    let h = Harness::new().await;
    let user_id = Uuid::new_v4();
    let order_id = paid_order(&h, user_id, dec!(10), 1).await;
    let refund = h
        .refunds
        .create_refund(user_id, refund_request(order_id, None))
        .await
        .unwrap();
    h.gateway.push_refund(Err(GatewayError::Provider {
        status: 500,
        body: "internal error".into(),
    }));

    let err = h
        .refunds
        .approve_refund(refund.id, Uuid::new_v4())
        .await
        .unwrap_err();
    assert_matches!(err, RefundError::Gateway);
    assert_eq!(err.status_code().as_u16(), 502);

    let stored = RefundRepository::find_by_id(&*h.db, refund.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.status, RefundStatus::Pending);
    assert!(stored.provider_refund_id.is_none());

    // The next attempt goes through.
    h.refunds
        .approve_refund(refund.id, Uuid::new_v4())
        .await
        .expect("retry succeeds");
    assert_eq!(h.gateway.refund_call_count(), 2);
}

#[tokio::test]
async fn declined_reversal_is_payment_required() {
    let h = Harness::new().await;
    let user_id = Uuid::new_v4();
    let order_id = paid_order(&h, user_id, dec!(10), 1).await;
    let refund = h
        .refunds
        .create_refund(user_id, refund_request(order_id, None))
        .await
        .unwrap();
    h.gateway.push_refund(Ok(GatewayResponse::declined(
        Some("charge_already_refunded".into()),
        None,
        None,
        json!({}),
    )));

    let err = h
        .refunds
        .approve_refund(refund.id, Uuid::new_v4())
        .await
        .unwrap_err();
    assert_eq!(err.status_code().as_u16(), 402);
    let details = assert_matches!(err, RefundError::Declined(details) => details);
    assert_eq!(details["errorCode"], "charge_already_refunded");

    let stored = RefundRepository::find_by_id(&*h.db, refund.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.status, RefundStatus::Pending);
}

#[tokio::test]
async fn refunds_are_listed_per_order() {
    let h = Harness::new().await;
    let user_id = Uuid::new_v4();
    let order_id = paid_order(&h, user_id, dec!(50), 2).await;
    for amount in [dec!(10), dec!(20)] {
        h.refunds
            .create_refund(user_id, refund_request(order_id, Some(amount)))
            .await
            .unwrap();
    }

    let refunds = h.refunds.list_refunds_for_order(order_id).await.unwrap();
    assert_eq!(refunds.len(), 2);
    assert!(h
        .refunds
        .list_refunds_for_order(Uuid::new_v4())
        .await
        .unwrap()
        .is_empty());
}
