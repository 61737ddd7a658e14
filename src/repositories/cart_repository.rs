use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter, QueryOrder, Set,
};
use uuid::Uuid;

use crate::entities::commerce::{cart, cart_item, Cart, CartItem};
use crate::errors::ServiceError;

/// Cart Store: one cart per (user, shop).
pub struct CartRepository;

impl CartRepository {
    pub async fn find_cart_by_user_and_shop<C>(
        conn: &C,
        user_id: Uuid,
        shop_id: Uuid,
    ) -> Result<Option<cart::Model>, ServiceError>
    where
        C: ConnectionTrait,
    {
        Ok(Cart::find()
            .filter(cart::Column::UserId.eq(user_id))
            .filter(cart::Column::ShopId.eq(shop_id))
            .one(conn)
            .await?)
    }

    pub async fn create_cart<C>(
        conn: &C,
        user_id: Uuid,
        shop_id: Uuid,
    ) -> Result<cart::Model, ServiceError>
    where
        C: ConnectionTrait,
    {
        let now = Utc::now();
        let model = cart::ActiveModel {
            id: Set(Uuid::new_v4()),
            user_id: Set(user_id),
            shop_id: Set(shop_id),
            created_at: Set(now),
            updated_at: Set(now),
        };
        Ok(model.insert(conn).await?)
    }

    /// Items in insertion order, which is the order checkout walks them in.
    pub async fn list_cart_items<C>(
        conn: &C,
        cart_id: Uuid,
    ) -> Result<Vec<cart_item::Model>, ServiceError>
    where
        C: ConnectionTrait,
    {
        Ok(CartItem::find()
            .filter(cart_item::Column::CartId.eq(cart_id))
            .order_by_asc(cart_item::Column::CreatedAt)
            .order_by_asc(cart_item::Column::Id)
            .all(conn)
            .await?)
    }

    pub async fn find_item<C>(
        conn: &C,
        cart_id: Uuid,
        variant_id: Uuid,
    ) -> Result<Option<cart_item::Model>, ServiceError>
    where
        C: ConnectionTrait,
    {
        Ok(CartItem::find()
            .filter(cart_item::Column::CartId.eq(cart_id))
            .filter(cart_item::Column::VariantId.eq(variant_id))
            .one(conn)
            .await?)
    }

    pub async fn add_cart_item<C>(
        conn: &C,
        cart_id: Uuid,
        variant_id: Uuid,
        quantity: i32,
    ) -> Result<cart_item::Model, ServiceError>
    where
        C: ConnectionTrait,
    {
        let model = cart_item::ActiveModel {
            id: Set(Uuid::new_v4()),
            cart_id: Set(cart_id),
            variant_id: Set(variant_id),
            quantity: Set(quantity),
            created_at: Set(Utc::now()),
        };
        Ok(model.insert(conn).await?)
    }

    /// Deletes one line of the given cart. Returns whether a row was removed.
    pub async fn delete_cart_item<C>(
        conn: &C,
        cart_id: Uuid,
        item_id: Uuid,
    ) -> Result<bool, ServiceError>
    where
        C: ConnectionTrait,
    {
        let result = CartItem::delete_many()
            .filter(cart_item::Column::Id.eq(item_id))
            .filter(cart_item::Column::CartId.eq(cart_id))
            .exec(conn)
            .await?;
        Ok(result.rows_affected > 0)
    }

    /// Deletes the items first, then the cart row.
    /// Returns `false` when the cart row was already gone.
    pub async fn delete_cart<C>(conn: &C, cart_id: Uuid) -> Result<bool, ServiceError>
    where
        C: ConnectionTrait,
    {
        CartItem::delete_many()
            .filter(cart_item::Column::CartId.eq(cart_id))
            .exec(conn)
            .await?;
        let result = Cart::delete_by_id(cart_id).exec(conn).await?;
        Ok(result.rows_affected == 1)
    }

    pub async fn list_carts_for_user<C>(
        conn: &C,
        user_id: Uuid,
    ) -> Result<Vec<cart::Model>, ServiceError>
    where
        C: ConnectionTrait,
    {
        Ok(Cart::find()
            .filter(cart::Column::UserId.eq(user_id))
            .order_by_asc(cart::Column::CreatedAt)
            .all(conn)
            .await?)
    }

    pub async fn delete_carts_for_user<C>(conn: &C, user_id: Uuid) -> Result<u64, ServiceError>
    where
        C: ConnectionTrait,
    {
        let carts = Self::list_carts_for_user(conn, user_id).await?;

        for cart in &carts {
            Self::delete_cart(conn, cart.id).await?;
        }
        Ok(carts.len() as u64)
    }
}
