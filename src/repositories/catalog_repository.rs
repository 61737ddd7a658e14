use chrono::{DateTime, Utc};
use sea_orm::{
    sea_query::Expr, ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter, QueryOrder,
};
use uuid::Uuid;

use crate::entities::commerce::{product_variant, promotion, ProductVariant, Promotion};
use crate::entities::product::{self, Entity as Product};
use crate::errors::ServiceError;

/// Catalog Store: variants, products and their promotions.
pub struct CatalogRepository;

impl CatalogRepository {
    pub async fn find_variant_by_id<C>(
        conn: &C,
        variant_id: Uuid,
    ) -> Result<Option<product_variant::Model>, ServiceError>
    where
        C: ConnectionTrait,
    {
        Ok(ProductVariant::find_by_id(variant_id).one(conn).await?)
    }

    pub async fn find_product_by_id<C>(
        conn: &C,
        product_id: Uuid,
    ) -> Result<Option<product::Model>, ServiceError>
    where
        C: ConnectionTrait,
    {
        Ok(Product::find_by_id(product_id).one(conn).await?)
    }

    /// Atomically removes `quantity` units if at least that many are left.
    ///
    /// Returns `false` when the row is missing or the stock is too low; the
    /// stored value is untouched in that case.
    pub async fn decrement_stock<C>(
        conn: &C,
        variant_id: Uuid,
        quantity: i32,
    ) -> Result<bool, ServiceError>
    where
        C: ConnectionTrait,
    {
        if quantity < 1 {
            return Err(ServiceError::InvalidInput(format!(
                "Quantity must be positive: {}",
                quantity
            )));
        }

        let result = ProductVariant::update_many()
            .col_expr(
                product_variant::Column::Stock,
                Expr::col(product_variant::Column::Stock).sub(quantity),
            )
            .col_expr(product_variant::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(product_variant::Column::Id.eq(variant_id))
            .filter(product_variant::Column::Stock.gte(quantity))
            .exec(conn)
            .await?;

        Ok(result.rows_affected == 1)
    }

    /// Returns units to stock. Missing variants are skipped and reported as `false`.
    pub async fn restock<C>(conn: &C, variant_id: Uuid, quantity: i32) -> Result<bool, ServiceError>
    where
        C: ConnectionTrait,
    {
        let result = ProductVariant::update_many()
            .col_expr(
                product_variant::Column::Stock,
                Expr::col(product_variant::Column::Stock).add(quantity),
            )
            .col_expr(product_variant::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(product_variant::Column::Id.eq(variant_id))
            .exec(conn)
            .await?;

        Ok(result.rows_affected == 1)
    }

    /// Promotions whose window contains `at`, bounds included, oldest first.
    pub async fn list_active_promotions_for_variant<C>(
        conn: &C,
        variant_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<Vec<promotion::Model>, ServiceError>
    where
        C: ConnectionTrait,
    {
        Ok(Promotion::find()
            .filter(promotion::Column::VariantId.eq(variant_id))
            .filter(promotion::Column::StartDate.lte(at))
            .filter(promotion::Column::EndDate.gte(at))
            .order_by_asc(promotion::Column::CreatedAt)
            .order_by_asc(promotion::Column::Id)
            .all(conn)
            .await?)
    }
}
