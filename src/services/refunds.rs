//! Refund Coordinator.
//!
//! Refunds are requested by the buyer and reversed at the gateway only when a
//! merchant approves them.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use metrics::counter;
use rust_decimal::Decimal;
use sea_orm::DatabaseConnection;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

use crate::{
    entities::{payment, refund, OrderStatus, PaymentStatus, RefundStatus},
    errors::{rejection_response, ServiceError},
    events::{Event, EventSender},
    gateways::{GatewayError, GatewayRefundRequest, GatewayRegistry, GatewayResponse},
    repositories::{OrderRepository, PaymentRepository, RefundRepository},
};

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CreateRefundRequest {
    pub order_id: Uuid,
    /// Defaults to the full payment amount.
    #[serde(default)]
    pub amount: Option<Decimal>,
    #[serde(default)]
    #[validate(length(max = 1000))]
    pub reason: Option<String>,
}

#[derive(Debug, Error)]
pub enum RefundError {
    #[error("Paiement introuvable")]
    PaymentNotFound,

    #[error("Accès non autorisé à ce paiement")]
    Forbidden,

    #[error("Le paiement doit être en statut SUCCESS pour être remboursé")]
    PaymentNotSettled,

    #[error("Le montant de remboursement doit être positif")]
    InvalidAmount,

    #[error("Le montant de remboursement ne peut pas dépasser le montant du paiement")]
    AmountExceedsPayment { requested: Decimal, available: Decimal },

    #[error("Remboursement introuvable")]
    NotFound,

    #[error("Ce remboursement a déjà été approuvé.")]
    AlreadyApproved,

    #[error("Erreur lors du remboursement via la gateway")]
    Gateway,

    #[error("Remboursement refusé par la gateway")]
    Declined(Value),

    #[error(transparent)]
    Service(#[from] ServiceError),
}

impl From<sea_orm::DbErr> for RefundError {
    fn from(err: sea_orm::DbErr) -> Self {
        RefundError::Service(err.into())
    }
}

impl RefundError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::PaymentNotFound | Self::NotFound => StatusCode::NOT_FOUND,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::PaymentNotSettled
            | Self::InvalidAmount
            | Self::AmountExceedsPayment { .. }
            | Self::AlreadyApproved => StatusCode::BAD_REQUEST,
            Self::Gateway => StatusCode::BAD_GATEWAY,
            Self::Declined(_) => StatusCode::PAYMENT_REQUIRED,
            Self::Service(err) => err.status_code(),
        }
    }

    pub fn details(&self) -> Option<Value> {
        match self {
            Self::Declined(details) => Some(details.clone()),
            Self::AmountExceedsPayment {
                requested,
                available,
            } => Some(json!({ "requested": requested, "paymentAmount": available })),
            _ => None,
        }
    }
}

impl IntoResponse for RefundError {
    fn into_response(self) -> Response {
        match self {
            Self::Service(err) => err.into_response(),
            rejection => {
                rejection_response(rejection.status_code(), rejection.to_string(), rejection.details())
            }
        }
    }
}

#[derive(Clone)]
pub struct RefundService {
    db: Arc<DatabaseConnection>,
    event_sender: Arc<EventSender>,
    gateways: Arc<GatewayRegistry>,
}

impl RefundService {
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

    /// Records a PENDING refund against the order's settled payment.
    /// Nothing is sent to the gateway yet.
    #[instrument(skip(self, request), fields(order_id = %request.order_id))]
    pub async fn create_refund(
        &self,
        user_id: Uuid,
        request: CreateRefundRequest,
    ) -> Result<refund::Model, RefundError> {
        let db = &*self.db;

        let payment = match PaymentRepository::find_success_for_order(db, request.order_id).await? {
            Some(payment) => payment,
            None => PaymentRepository::find_latest_for_order(db, request.order_id)
                .await?
                .ok_or(RefundError::PaymentNotFound)?,
        };

        let order = OrderRepository::find_by_id(db, payment.order_id)
            .await?
            .ok_or(RefundError::PaymentNotFound)?;
        if !order.is_owned_by(user_id) {
            warn!(%user_id, "Refund requested on another user's payment");
            return Err(RefundError::Forbidden);
        }

        if payment.status != PaymentStatus::Success {
            return Err(RefundError::PaymentNotSettled);
        }

        let amount = request.amount.unwrap_or(payment.amount);
        if amount <= Decimal::ZERO {
            return Err(RefundError::InvalidAmount);
        }
        if amount > payment.amount {
            return Err(RefundError::AmountExceedsPayment {
                requested: amount,
                available: payment.amount,
            });
        }

        let refund = RefundRepository::create_pending(
            db,
            order.id,
            payment.id,
            amount,
            request.reason,
            user_id,
        )
        .await?;

        info!(refund_id = %refund.id, amount = %amount, "Refund requested");
        self.event_sender
            .send_or_log(Event::RefundRequested {
                refund_id: refund.id,
                order_id: order.id,
                amount,
            })
            .await;

        Ok(refund)
    }

    /// Reverses the refund at the gateway and marks it APPROVED.
    ///
    /// The refund is claimed with a conditional update before the gateway is
    /// called and restored if the gateway fails, so concurrent approvals
    /// reverse the money at most once. A full refund moves the order to
    /// REFUNDED; a partial one leaves it alone.
    #[instrument(skip(self), fields(refund_id = %refund_id, acting_user_id = %acting_user_id))]
    pub async fn approve_refund(
        &self,
        refund_id: Uuid,
        acting_user_id: Uuid,
    ) -> Result<refund::Model, RefundError> {
        let db = &*self.db;

        let refund = RefundRepository::find_by_id(db, refund_id)
            .await?
            .ok_or(RefundError::NotFound)?;
        if refund.status == RefundStatus::Approved {
            return Err(RefundError::AlreadyApproved);
        }

        let claimed = RefundRepository::transition_status(
            db,
            refund.id,
            refund.status,
            RefundStatus::Approved,
            Some(acting_user_id),
        )
        .await?;
        if !claimed {
            return Err(self.lost_race(refund.id).await);
        }

        let payment = match PaymentRepository::find_by_id(db, refund.payment_id).await? {
            Some(payment) => payment,
            None => {
                self.release_claim(&refund).await?;
                return Err(RefundError::PaymentNotFound);
            }
        };

        let response = match self.reverse_at_gateway(&payment, refund.amount).await {
            Ok(response) => response,
            Err(e) => {
                error!(error = %e, "Gateway refund failed");
                self.release_claim(&refund).await?;
                return Err(RefundError::Gateway);
            }
        };

        if !response.is_accepted() {
            info!(error_code = ?response.error_code, "Gateway declined refund");
            self.release_claim(&refund).await?;
            return Err(RefundError::Declined(json!({
                "errorCode": response.error_code,
                "errorMessage": response.error_message,
                "details": response.details,
            })));
        }

        RefundRepository::set_provider_refund_id(db, refund.id, response.provider_id.clone())
            .await?;

        if refund.amount >= payment.amount {
            self.mark_order_refunded(payment.order_id).await?;
        }

        counter!("storefront.refunds.approved", 1);
        info!(amount = %refund.amount, "Refund approved");
        self.event_sender
            .send_or_log(Event::RefundApproved {
                refund_id: refund.id,
                order_id: refund.order_id,
                amount: refund.amount,
            })
            .await;

        RefundRepository::find_by_id(db, refund.id)
            .await?
            .ok_or(RefundError::NotFound)
    }

    /// Marks the refund REJECTED. No gateway call, no order change.
    #[instrument(skip(self), fields(refund_id = %refund_id, acting_user_id = %acting_user_id))]
    pub async fn reject_refund(
        &self,
        refund_id: Uuid,
        acting_user_id: Uuid,
    ) -> Result<refund::Model, RefundError> {
        let db = &*self.db;

        let refund = RefundRepository::find_by_id(db, refund_id)
            .await?
            .ok_or(RefundError::NotFound)?;
        if refund.status == RefundStatus::Approved {
            return Err(RefundError::AlreadyApproved);
        }

        let rejected = RefundRepository::transition_status(
            db,
            refund.id,
            refund.status,
            RefundStatus::Rejected,
            Some(acting_user_id),
        )
        .await?;
        if !rejected {
            return Err(self.lost_race(refund.id).await);
        }

        info!("Refund rejected");
        self.event_sender
            .send_or_log(Event::RefundRejected {
                refund_id: refund.id,
                order_id: refund.order_id,
            })
            .await;

        RefundRepository::find_by_id(db, refund.id)
            .await?
            .ok_or(RefundError::NotFound)
    }

    /// Shop owning the order a refund was requested on.
    pub async fn shop_of_refund(&self, refund_id: Uuid) -> Result<Uuid, RefundError> {
        let db = &*self.db;
        let refund = RefundRepository::find_by_id(db, refund_id)
            .await?
            .ok_or(RefundError::NotFound)?;
        let order = OrderRepository::find_by_id(db, refund.order_id)
            .await?
            .ok_or(RefundError::NotFound)?;
        Ok(order.shop_id)
    }

    pub async fn shop_of_order(&self, order_id: Uuid) -> Result<Uuid, ServiceError> {
        OrderRepository::find_by_id(&*self.db, order_id)
            .await?
            .map(|order| order.shop_id)
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))
    }

    #[instrument(skip(self))]
    pub async fn list_refunds_for_order(
        &self,
        order_id: Uuid,
    ) -> Result<Vec<refund::Model>, ServiceError> {
        RefundRepository::list_for_order(&*self.db, order_id).await
    }

    async fn reverse_at_gateway(
        &self,
        payment: &payment::Model,
        amount: Decimal,
    ) -> Result<GatewayResponse, GatewayError> {
        let gateway = self.gateways.resolve(&payment.method)?;
        let provider_id = payment.provider_id.clone().unwrap_or_default();
        gateway
            .refund_payment(&GatewayRefundRequest {
                provider_id,
                amount: Some(amount),
                currency: payment.currency.clone(),
            })
            .await
    }

    /// Puts the refund back to the status it had before this approval claimed it.
    async fn release_claim(&self, refund: &refund::Model) -> Result<(), ServiceError> {
        let restored = RefundRepository::transition_status(
            &*self.db,
            refund.id,
            RefundStatus::Approved,
            refund.status,
            refund.processed_by,
        )
        .await?;
        if !restored {
            warn!(refund_id = %refund.id, "Refund changed while its approval was failing");
        }
        Ok(())
    }

    async fn lost_race(&self, refund_id: Uuid) -> RefundError {
        match RefundRepository::find_by_id(&*self.db, refund_id).await {
            Ok(Some(current)) if current.status == RefundStatus::Approved => {
                RefundError::AlreadyApproved
            }
            Ok(Some(_)) => RefundError::Service(ServiceError::ConcurrentModification(refund_id)),
            Ok(None) => RefundError::NotFound,
            Err(e) => RefundError::Service(e),
        }
    }

    async fn mark_order_refunded(&self, order_id: Uuid) -> Result<(), ServiceError> {
        let db = &*self.db;
        let Some(order) = OrderRepository::find_by_id(db, order_id).await? else {
            warn!(%order_id, "Refunded order no longer exists");
            return Ok(());
        };
        if order.status == OrderStatus::Refunded {
            return Ok(());
        }

        if OrderRepository::transition_status(db, order.id, order.status, OrderStatus::Refunded)
            .await?
        {
            self.event_sender
                .send_or_log(Event::OrderStatusChanged {
                    order_id: order.id,
                    old_status: order.status,
                    new_status: OrderStatus::Refunded,
                })
                .await;
        } else {
            warn!(%order_id, "Order status moved while recording full refund");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejection_codes_and_messages() {
        assert_eq!(RefundError::PaymentNotFound.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(RefundError::Forbidden.status_code(), StatusCode::FORBIDDEN);
        assert_eq!(RefundError::AlreadyApproved.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(RefundError::Gateway.status_code(), StatusCode::BAD_GATEWAY);
        assert_eq!(
            RefundError::Declined(Value::Null).status_code(),
            StatusCode::PAYMENT_REQUIRED
        );
        assert_eq!(
            RefundError::AlreadyApproved.to_string(),
            "Ce remboursement a déjà été approuvé."
        );
    }
}
