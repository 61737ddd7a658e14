use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::{
    sea_query::Expr, ActiveEnum, ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait,
    QueryFilter, QueryOrder, Set,
};
use uuid::Uuid;

use crate::entities::refund::{self, Entity as Refund, RefundStatus};
use crate::errors::ServiceError;

/// Refund Store.
pub struct RefundRepository;

impl RefundRepository {
    pub async fn create_pending<C>(
        conn: &C,
        order_id: Uuid,
        payment_id: Uuid,
        amount: Decimal,
        reason: Option<String>,
        requested_by: Uuid,
    ) -> Result<refund::Model, ServiceError>
    where
        C: ConnectionTrait,
    {
        let now = Utc::now();
        let model = refund::ActiveModel {
            id: Set(Uuid::new_v4()),
            order_id: Set(order_id),
            payment_id: Set(payment_id),
            amount: Set(amount),
            reason: Set(reason),
            status: Set(RefundStatus::Pending),
            requested_by: Set(Some(requested_by)),
            processed_by: Set(None),
            provider_refund_id: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        };
        Ok(model.insert(conn).await?)
    }

    pub async fn find_by_id<C>(
        conn: &C,
        refund_id: Uuid,
    ) -> Result<Option<refund::Model>, ServiceError>
    where
        C: ConnectionTrait,
    {
        Ok(Refund::find_by_id(refund_id).one(conn).await?)
    }

    pub async fn list_for_order<C>(
        conn: &C,
        order_id: Uuid,
    ) -> Result<Vec<refund::Model>, ServiceError>
    where
        C: ConnectionTrait,
    {
        Ok(Refund::find()
            .filter(refund::Column::OrderId.eq(order_id))
            .order_by_asc(refund::Column::CreatedAt)
            .all(conn)
            .await?)
    }

    /// Conditional status change; `true` when this call won.
    pub async fn transition_status<C>(
        conn: &C,
        refund_id: Uuid,
        from: RefundStatus,
        to: RefundStatus,
        processed_by: Option<Uuid>,
    ) -> Result<bool, ServiceError>
    where
        C: ConnectionTrait,
    {
        let result = Refund::update_many()
            .col_expr(refund::Column::Status, Expr::value(to.to_value()))
            .col_expr(refund::Column::ProcessedBy, Expr::value(processed_by))
            .col_expr(refund::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(refund::Column::Id.eq(refund_id))
            .filter(refund::Column::Status.eq(from.to_value()))
            .exec(conn)
            .await?;

        Ok(result.rows_affected == 1)
    }

    pub async fn set_provider_refund_id<C>(
        conn: &C,
        refund_id: Uuid,
        provider_refund_id: Option<String>,
    ) -> Result<(), ServiceError>
    where
        C: ConnectionTrait,
    {
        Refund::update_many()
            .col_expr(
                refund::Column::ProviderRefundId,
                Expr::value(provider_refund_id),
            )
            .col_expr(refund::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(refund::Column::Id.eq(refund_id))
            .exec(conn)
            .await?;
        Ok(())
    }
}
