//! Payment Dispatcher.
//!
//! Checks that an order is payable, dispatches the charge to the gateway
//! registered for the requested method and records every attempt.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use chrono::Utc;
use metrics::counter;
use rust_decimal::Decimal;
use sea_orm::{DatabaseConnection, TransactionTrait};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;
use validator::{Validate, ValidationError};

use crate::{
    entities::{order, payment, OrderStatus, PaymentStatus},
    errors::{rejection_response, ServiceError},
    events::{Event, EventSender},
    gateways::{
        GatewayError, GatewayPaymentRequest, GatewayRefundRequest, GatewayRegistry,
        GatewayResponse, GatewayStatus, PaymentContext, PaymentGateway,
    },
    repositories::{payment_repository::NewPayment, OrderRepository, PaymentRepository},
};

/// Recorded on a FAILED row when another payment settled the order first.
pub const REASON_ORDER_ALREADY_PROCESSED: &str = "order_already_processed";

fn validate_positive_amount(amount: &Decimal) -> Result<(), ValidationError> {
    if *amount > Decimal::ZERO {
        Ok(())
    } else {
        Err(ValidationError::new("amount_must_be_positive"))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ProcessPaymentRequest {
    pub order_id: Uuid,
    #[validate(length(min = 1, max = 32))]
    pub method: String,
    #[validate(custom = "validate_positive_amount")]
    pub amount: Decimal,
    #[validate(length(equal = 3))]
    pub currency: String,
    #[serde(default)]
    pub card_data: Option<Value>,
    #[serde(default)]
    pub paypal_data: Option<Value>,
    #[serde(default)]
    #[validate(length(max = 255))]
    pub description: Option<String>,
}

#[derive(Debug, Error)]
pub enum PaymentError {
    #[error("Commande introuvable")]
    OrderNotFound,

    /// Reported as a client error rather than 403.
    #[error("Commande invalide")]
    NotOrderOwner,

    #[error("Commande déjà traitée")]
    AlreadyProcessed,

    #[error("Montant de paiement invalide")]
    AmountMismatch { expected: Decimal, currency: String },

    #[error("Erreur de paiement externe")]
    Gateway,

    #[error("Paiement refusé")]
    Declined(Value),

    #[error(transparent)]
    Service(#[from] ServiceError),
}

impl From<sea_orm::DbErr> for PaymentError {
    fn from(err: sea_orm::DbErr) -> Self {
        PaymentError::Service(err.into())
    }
}

impl PaymentError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::OrderNotFound
            | Self::NotOrderOwner
            | Self::AlreadyProcessed
            | Self::AmountMismatch { .. } => StatusCode::BAD_REQUEST,
            Self::Gateway => StatusCode::BAD_GATEWAY,
            Self::Declined(_) => StatusCode::PAYMENT_REQUIRED,
            Self::Service(err) => err.status_code(),
        }
    }

    pub fn details(&self) -> Option<Value> {
        match self {
            Self::Declined(details) => Some(details.clone()),
            Self::AmountMismatch { expected, currency } => {
                Some(json!({ "expectedAmount": expected, "currency": currency }))
            }
            _ => None,
        }
    }
}

impl IntoResponse for PaymentError {
    fn into_response(self) -> Response {
        match self {
            Self::Service(err) => err.into_response(),
            rejection => {
                rejection_response(rejection.status_code(), rejection.to_string(), rejection.details())
            }
        }
    }
}

/// A dispatched payment that was not refused.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentOutcome {
    pub payment: payment::Model,
    pub provider_id: Option<String>,
}

impl PaymentOutcome {
    /// The provider has not settled yet; the order stays PENDING.
    pub fn is_pending(&self) -> bool {
        self.payment.status == PaymentStatus::Pending
    }
}

#[derive(Clone)]
pub struct PaymentService {
    db: Arc<DatabaseConnection>,
    event_sender: Arc<EventSender>,
    gateways: Arc<GatewayRegistry>,
}

impl PaymentService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        event_sender: Arc<EventSender>,
        gateways: Arc<GatewayRegistry>,
    ) -> Self {
        Self {
            db,
            event_sender,
            gateways,
        }
    }

    /// Settles `request.order_id` on behalf of `user_id`.
    ///
    /// Every call that selects a gateway leaves exactly one Payment row.
    /// No transaction is held while the provider is being called.
    #[instrument(skip(self, request), fields(order_id = %request.order_id, method = %request.method))]
    pub async fn process_payment(
        &self,
        user_id: Uuid,
        request: ProcessPaymentRequest,
    ) -> Result<PaymentOutcome, PaymentError> {
        let db = &*self.db;

        let order = OrderRepository::find_by_id(db, request.order_id)
            .await?
            .ok_or(PaymentError::OrderNotFound)?;
        if !order.is_owned_by(user_id) {
            warn!(%user_id, "Payment attempted on another user's order");
            return Err(PaymentError::NotOrderOwner);
        }
        if order.status != OrderStatus::Pending {
            return Err(PaymentError::AlreadyProcessed);
        }
        if let Some(pending) = PaymentRepository::find_pending_for_order(db, order.id).await? {
            info!(payment_id = %pending.id, "Capture already in flight for order");
            return Err(PaymentError::AlreadyProcessed);
        }
        if request.amount.round_dp(4) != order.total_amount.round_dp(4)
            || !request.currency.eq_ignore_ascii_case(&order.currency)
        {
            return Err(PaymentError::AmountMismatch {
                expected: order.total_amount,
                currency: order.currency.clone(),
            });
        }

        let gateway_request = GatewayPaymentRequest {
            amount: request.amount,
            currency: order.currency.clone(),
            method: request.method.clone(),
            card_data: request.card_data.clone(),
            paypal_data: request.paypal_data.clone(),
            metadata: PaymentContext {
                order_id: order.id,
                user_id,
                description: request
                    .description
                    .clone()
                    .unwrap_or_else(|| format!("Order {}", order.id)),
            },
        };

        let gateway = match self.gateways.resolve(&request.method) {
            Ok(gateway) => gateway,
            Err(e) => return Err(self.gateway_failure(&order, &gateway_request, e).await),
        };
        let response = match gateway.process_payment(&gateway_request).await {
            Ok(response) => response,
            Err(e) => return Err(self.gateway_failure(&order, &gateway_request, e).await),
        };

        match response.status {
            GatewayStatus::Declined => {
                info!(error_code = ?response.error_code, "Payment declined by gateway");
                let details = json!({
                    "errorCode": response.error_code,
                    "errorMessage": response.error_message,
                    "details": response.details,
                });
                let metadata = json!({
                    "provider": gateway.name(),
                    "declined": details,
                    "request": gateway_request,
                    "failedAt": Utc::now(),
                });
                self.record_failure(
                    &order,
                    &gateway_request,
                    response.provider_id.clone(),
                    metadata,
                    "declined",
                )
                .await?;
                Err(PaymentError::Declined(details))
            }
            GatewayStatus::Pending => {
                let payment = PaymentRepository::create(
                    db,
                    NewPayment {
                        order_id: order.id,
                        status: PaymentStatus::Pending,
                        method: request.method.to_ascii_lowercase(),
                        amount: gateway_request.amount,
                        currency: gateway_request.currency.clone(),
                        provider_id: response.provider_id.clone(),
                        metadata: Self::settlement_metadata(gateway.name(), &response, &gateway_request),
                    },
                )
                .await?;
                info!(payment_id = %payment.id, "Payment pending at provider");
                counter!("storefront.payments.dispatched", 1, "outcome" => "pending");
                Ok(PaymentOutcome {
                    provider_id: response.provider_id,
                    payment,
                })
            }
            GatewayStatus::Succeeded => {
                self.settle(&order, gateway, response, &gateway_request)
                    .await
            }
        }
    }

    /// Writes the SUCCESS row and moves the order to PROCESSING atomically.
    /// Losing the transition to a concurrent payment refunds this capture.
    async fn settle(
        &self,
        order: &order::Model,
        gateway: Arc<dyn PaymentGateway>,
        response: GatewayResponse,
        gateway_request: &GatewayPaymentRequest,
    ) -> Result<PaymentOutcome, PaymentError> {
        let db = &*self.db;
        let txn = db.begin().await?;

        let payment = PaymentRepository::create(
            &txn,
            NewPayment {
                order_id: order.id,
                status: PaymentStatus::Success,
                method: gateway_request.method.to_ascii_lowercase(),
                amount: gateway_request.amount,
                currency: gateway_request.currency.clone(),
                provider_id: response.provider_id.clone(),
                metadata: Self::settlement_metadata(gateway.name(), &response, gateway_request),
            },
        )
        .await?;

        let won = OrderRepository::transition_status(
            &txn,
            order.id,
            OrderStatus::Pending,
            OrderStatus::Processing,
        )
        .await?;

        if won {
            txn.commit().await?;
            info!(payment_id = %payment.id, "Payment settled, order processing");
            counter!("storefront.payments.dispatched", 1, "outcome" => "success");
            self.event_sender
                .send_or_log(Event::PaymentSucceeded {
                    payment_id: payment.id,
                    order_id: order.id,
                    amount: payment.amount,
                })
                .await;
            self.event_sender
                .send_or_log(Event::OrderStatusChanged {
                    order_id: order.id,
                    old_status: OrderStatus::Pending,
                    new_status: OrderStatus::Processing,
                })
                .await;
            return Ok(PaymentOutcome {
                provider_id: response.provider_id,
                payment,
            });
        }

        txn.rollback().await?;
        warn!("Order left PENDING during dispatch, compensating duplicate capture");

        let compensation = match response.provider_id.clone() {
            Some(provider_id) => {
                match gateway
                    .refund_payment(&GatewayRefundRequest {
                        provider_id,
                        amount: Some(gateway_request.amount),
                        currency: gateway_request.currency.clone(),
                    })
                    .await
                {
                    Ok(refund) => json!({
                        "status": refund.status,
                        "refundId": refund.provider_id,
                    }),
                    Err(e) => {
                        error!(error = %e, "Compensating refund failed, manual action required");
                        json!({ "status": "failed", "error": e.to_string() })
                    }
                }
            }
            None => json!({ "status": "skipped", "error": "missing provider id" }),
        };

        let metadata = json!({
            "provider": gateway.name(),
            "reason": REASON_ORDER_ALREADY_PROCESSED,
            "transactionId": response.transaction_id,
            "compensation": compensation,
            "request": gateway_request,
            "failedAt": Utc::now(),
        });
        self.record_failure(
            order,
            gateway_request,
            response.provider_id,
            metadata,
            REASON_ORDER_ALREADY_PROCESSED,
        )
        .await?;
        Err(PaymentError::AlreadyProcessed)
    }

    /// Records the attempt and hides the provider error from the caller.
    async fn gateway_failure(
        &self,
        order: &order::Model,
        gateway_request: &GatewayPaymentRequest,
        err: GatewayError,
    ) -> PaymentError {
        error!(error = %err, "Payment gateway failure");
        let metadata = json!({
            "error": err.to_string(),
            "errorKind": "gateway_error",
            "request": gateway_request,
            "failedAt": Utc::now(),
        });
        match self
            .record_failure(order, gateway_request, None, metadata, "gateway_error")
            .await
        {
            Ok(_) => PaymentError::Gateway,
            Err(e) => PaymentError::Service(e),
        }
    }

    async fn record_failure(
        &self,
        order: &order::Model,
        gateway_request: &GatewayPaymentRequest,
        provider_id: Option<String>,
        metadata: Value,
        outcome: &'static str,
    ) -> Result<payment::Model, ServiceError> {
        let payment = PaymentRepository::create(
            &*self.db,
            NewPayment {
                order_id: order.id,
                status: PaymentStatus::Failed,
                method: gateway_request.method.to_ascii_lowercase(),
                amount: gateway_request.amount,
                currency: gateway_request.currency.clone(),
                provider_id,
                metadata,
            },
        )
        .await?;

        counter!("storefront.payments.dispatched", 1, "outcome" => outcome);
        self.event_sender
            .send_or_log(Event::PaymentFailed {
                payment_id: payment.id,
                order_id: order.id,
                reason: outcome.to_string(),
            })
            .await;
        Ok(payment)
    }

    fn settlement_metadata(
        provider: &str,
        response: &GatewayResponse,
        gateway_request: &GatewayPaymentRequest,
    ) -> Value {
        json!({
            "provider": provider,
            "providerId": response.provider_id,
            "transactionId": response.transaction_id,
            "gatewayDetails": response.details,
            "request": gateway_request,
            "processedAt": Utc::now(),
        })
    }

    /// Attempts recorded for an order owned by `user_id`, oldest first.
    #[instrument(skip(self))]
    pub async fn list_payments_for_order(
        &self,
        user_id: Uuid,
        order_id: Uuid,
    ) -> Result<Vec<payment::Model>, ServiceError> {
        let db = &*self.db;
        OrderRepository::find_by_id(db, order_id)
            .await?
            .filter(|o| o.is_owned_by(user_id))
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))?;
        PaymentRepository::list_for_order(db, order_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn request() -> ProcessPaymentRequest {
        ProcessPaymentRequest {
            order_id: Uuid::new_v4(),
            method: "stripe".into(),
            amount: dec!(10),
            currency: "EUR".into(),
            card_data: None,
            paypal_data: None,
            description: None,
        }
    }

    #[test]
    fn request_validation() {
        assert!(request().validate().is_ok());

        let mut zero = request();
        zero.amount = Decimal::ZERO;
        assert!(zero.validate().is_err());

        let mut bad_currency = request();
        bad_currency.currency = "EURO".into();
        assert!(bad_currency.validate().is_err());

        let mut no_method = request();
        no_method.method = String::new();
        assert!(no_method.validate().is_err());
    }

    #[test]
    fn rejection_codes() {
        assert_eq!(PaymentError::OrderNotFound.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(PaymentError::NotOrderOwner.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(PaymentError::AlreadyProcessed.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(PaymentError::Gateway.status_code(), StatusCode::BAD_GATEWAY);
        assert_eq!(
            PaymentError::Declined(json!({})).status_code(),
            StatusCode::PAYMENT_REQUIRED
        );
        assert_eq!(PaymentError::Gateway.to_string(), "Erreur de paiement externe");
        assert_eq!(PaymentError::Gateway.details(), None);
    }
}
