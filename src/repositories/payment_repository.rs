use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::{
    ActiveEnum, ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter,
    QueryOrder, Set,
};
use serde_json::Value;
use uuid::Uuid;

use crate::entities::payment::{self, Entity as Payment, PaymentStatus};
use crate::errors::ServiceError;

/// One settlement attempt to record.
#[derive(Debug, Clone)]
pub struct NewPayment {
    pub order_id: Uuid,
    pub status: PaymentStatus,
    pub method: String,
    pub amount: Decimal,
    pub currency: String,
    pub provider_id: Option<String>,
    pub metadata: Value,
}

/// Payment Store.
pub struct PaymentRepository;

impl PaymentRepository {
    pub async fn create<C>(conn: &C, new_payment: NewPayment) -> Result<payment::Model, ServiceError>
    where
        C: ConnectionTrait,
    {
        let now = Utc::now();
        let model = payment::ActiveModel {
            id: Set(Uuid::new_v4()),
            order_id: Set(new_payment.order_id),
            status: Set(new_payment.status),
            method: Set(new_payment.method),
            amount: Set(new_payment.amount),
            currency: Set(new_payment.currency),
            provider_id: Set(new_payment.provider_id),
            metadata: Set(new_payment.metadata),
            created_at: Set(now),
            updated_at: Set(now),
        };
        Ok(model.insert(conn).await?)
    }

    pub async fn find_by_id<C>(
        conn: &C,
        payment_id: Uuid,
    ) -> Result<Option<payment::Model>, ServiceError>
    where
        C: ConnectionTrait,
    {
        Ok(Payment::find_by_id(payment_id).one(conn).await?)
    }

    /// The settled payment of an order, if any.
    pub async fn find_success_for_order<C>(
        conn: &C,
        order_id: Uuid,
    ) -> Result<Option<payment::Model>, ServiceError>
    where
        C: ConnectionTrait,
    {
        Ok(Payment::find()
            .filter(payment::Column::OrderId.eq(order_id))
            .filter(payment::Column::Status.eq(PaymentStatus::Success.to_value()))
            .order_by_desc(payment::Column::CreatedAt)
            .one(conn)
            .await?)
    }

    /// A capture still awaiting confirmation at the provider, if any.
    pub async fn find_pending_for_order<C>(
        conn: &C,
        order_id: Uuid,
    ) -> Result<Option<payment::Model>, ServiceError>
    where
        C: ConnectionTrait,
    {
        Ok(Payment::find()
            .filter(payment::Column::OrderId.eq(order_id))
            .filter(payment::Column::Status.eq(PaymentStatus::Pending.to_value()))
            .order_by_desc(payment::Column::CreatedAt)
            .one(conn)
            .await?)
    }

    pub async fn find_latest_for_order<C>(
        conn: &C,
        order_id: Uuid,
    ) -> Result<Option<payment::Model>, ServiceError>
    where
        C: ConnectionTrait,
    {
        Ok(Payment::find()
            .filter(payment::Column::OrderId.eq(order_id))
            .order_by_desc(payment::Column::CreatedAt)
            .one(conn)
            .await?)
    }

    /// Oldest attempt first.
    pub async fn list_for_order<C>(
        conn: &C,
        order_id: Uuid,
    ) -> Result<Vec<payment::Model>, ServiceError>
    where
        C: ConnectionTrait,
    {
        Ok(Payment::find()
            .filter(payment::Column::OrderId.eq(order_id))
            .order_by_asc(payment::Column::CreatedAt)
            .all(conn)
            .await?)
    }
}
