use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::{
    sea_query::Expr, ActiveEnum, ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait,
    PaginatorTrait, QueryFilter, QueryOrder, QuerySelect, Set,
};
use uuid::Uuid;

use crate::entities::order::{self, Entity as Order, OrderStatus};
use crate::entities::order_item::{self, Entity as OrderItem};
use crate::entities::payment::{self, Entity as Payment, PaymentStatus};
use crate::errors::ServiceError;

/// Fields of a freshly assembled order.
#[derive(Debug, Clone)]
pub struct NewOrder {
    pub shop_id: Uuid,
    pub user_id: Uuid,
    pub total_amount: Decimal,
    pub currency: String,
    pub expires_at: DateTime<Utc>,
}

/// Order Store.
pub struct OrderRepository;

impl OrderRepository {
    pub async fn create<C>(conn: &C, new_order: NewOrder) -> Result<order::Model, ServiceError>
    where
        C: ConnectionTrait,
    {
        let now = Utc::now();
        let model = order::ActiveModel {
            id: Set(Uuid::new_v4()),
            shop_id: Set(new_order.shop_id),
            user_id: Set(Some(new_order.user_id)),
            status: Set(OrderStatus::Pending),
            total_amount: Set(new_order.total_amount),
            currency: Set(new_order.currency),
            expires_at: Set(new_order.expires_at),
            created_at: Set(now),
            updated_at: Set(now),
        };
        Ok(model.insert(conn).await?)
    }

    pub async fn add_item<C>(
        conn: &C,
        order_id: Uuid,
        variant_id: Uuid,
        quantity: i32,
        price: Decimal,
    ) -> Result<order_item::Model, ServiceError>
    where
        C: ConnectionTrait,
    {
        let model = order_item::ActiveModel {
            id: Set(Uuid::new_v4()),
            order_id: Set(order_id),
            variant_id: Set(variant_id),
            quantity: Set(quantity),
            price: Set(price),
            created_at: Set(Utc::now()),
        };
        Ok(model.insert(conn).await?)
    }

    pub async fn find_by_id<C>(conn: &C, order_id: Uuid) -> Result<Option<order::Model>, ServiceError>
    where
        C: ConnectionTrait,
    {
        Ok(Order::find_by_id(order_id).one(conn).await?)
    }

    pub async fn list_items<C>(
        conn: &C,
        order_id: Uuid,
    ) -> Result<Vec<order_item::Model>, ServiceError>
    where
        C: ConnectionTrait,
    {
        Ok(OrderItem::find()
            .filter(order_item::Column::OrderId.eq(order_id))
            .order_by_asc(order_item::Column::CreatedAt)
            .order_by_asc(order_item::Column::Id)
            .all(conn)
            .await?)
    }

    /// Newest first. `page` is 1-based.
    pub async fn list_for_user<C>(
        conn: &C,
        user_id: Uuid,
        page: u64,
        per_page: u64,
    ) -> Result<(Vec<order::Model>, u64), ServiceError>
    where
        C: ConnectionTrait,
    {
        let paginator = Order::find()
            .filter(order::Column::UserId.eq(user_id))
            .order_by_desc(order::Column::CreatedAt)
            .paginate(conn, per_page.max(1));

        let total = paginator.num_items().await?;
        let orders = paginator.fetch_page(page.saturating_sub(1)).await?;
        Ok((orders, total))
    }

    pub async fn list_all_for_user<C>(
        conn: &C,
        user_id: Uuid,
    ) -> Result<Vec<order::Model>, ServiceError>
    where
        C: ConnectionTrait,
    {
        Ok(Order::find()
            .filter(order::Column::UserId.eq(user_id))
            .order_by_asc(order::Column::CreatedAt)
            .all(conn)
            .await?)
    }

    pub async fn update_total<C>(
        conn: &C,
        order_id: Uuid,
        total_amount: Decimal,
    ) -> Result<(), ServiceError>
    where
        C: ConnectionTrait,
    {
        Order::update_many()
            .col_expr(order::Column::TotalAmount, Expr::value(total_amount))
            .col_expr(order::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(order::Column::Id.eq(order_id))
            .exec(conn)
            .await?;
        Ok(())
    }

    /// Moves the order to `to` only if it is still in `from`.
    ///
    /// Returns `true` when this call performed the transition. Concurrent
    /// callers racing on the same order see exactly one `true`.
    pub async fn transition_status<C>(
        conn: &C,
        order_id: Uuid,
        from: OrderStatus,
        to: OrderStatus,
    ) -> Result<bool, ServiceError>
    where
        C: ConnectionTrait,
    {
        let result = Order::update_many()
            .col_expr(order::Column::Status, Expr::value(to.to_value()))
            .col_expr(order::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(order::Column::Id.eq(order_id))
            .filter(order::Column::Status.eq(from.to_value()))
            .exec(conn)
            .await?;

        Ok(result.rows_affected == 1)
    }

    /// PENDING orders past their deadline with no settled or in-flight payment.
    pub async fn find_expired_unpaid<C>(
        conn: &C,
        now: DateTime<Utc>,
        limit: u64,
    ) -> Result<Vec<order::Model>, ServiceError>
    where
        C: ConnectionTrait,
    {
        let candidates = Order::find()
            .filter(order::Column::Status.eq(OrderStatus::Pending.to_value()))
            .filter(order::Column::ExpiresAt.lt(now))
            .order_by_asc(order::Column::ExpiresAt)
            .limit(limit)
            .all(conn)
            .await?;

        if candidates.is_empty() {
            return Ok(candidates);
        }

        let ids: Vec<Uuid> = candidates.iter().map(|o| o.id).collect();
        let paid: Vec<Uuid> = Payment::find()
            .select_only()
            .column(payment::Column::OrderId)
            .filter(payment::Column::OrderId.is_in(ids))
            .filter(payment::Column::Status.is_in([
                PaymentStatus::Success.to_value(),
                PaymentStatus::Pending.to_value(),
            ]))
            .into_tuple()
            .all(conn)
            .await?;

        Ok(candidates
            .into_iter()
            .filter(|o| !paid.contains(&o.id))
            .collect())
    }

    /// Detaches the user's orders from their account. Rows are kept.
    pub async fn anonymize_user<C>(conn: &C, user_id: Uuid) -> Result<u64, ServiceError>
    where
        C: ConnectionTrait,
    {
        let result = Order::update_many()
            .col_expr(order::Column::UserId, Expr::value(Option::<Uuid>::None))
            .col_expr(order::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(order::Column::UserId.eq(user_id))
            .exec(conn)
            .await?;
        Ok(result.rows_affected)
    }
}
