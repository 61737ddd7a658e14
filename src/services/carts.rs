use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::{DatabaseConnection, DbErr, SqlErr};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, instrument};
use uuid::Uuid;
use validator::Validate;

use crate::{
    entities::commerce::{cart, cart_item},
    errors::{rejection_response, ServiceError},
    events::{Event, EventSender},
    repositories::{CartRepository, CatalogRepository},
};

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct AddCartItemRequest {
    pub variant_id: Uuid,
    #[validate(range(min = 1, max = 10000))]
    pub quantity: i32,
}

#[derive(Debug, Error)]
pub enum CartError {
    #[error("Produit déjà dans le panier")]
    AlreadyInCart,

    #[error("Produit introuvable")]
    VariantNotFound,

    #[error("Quantité invalide")]
    InvalidQuantity,

    #[error("Article introuvable")]
    ItemNotFound,

    #[error(transparent)]
    Service(#[from] ServiceError),
}

impl From<DbErr> for CartError {
    fn from(err: DbErr) -> Self {
        CartError::Service(err.into())
    }
}

impl CartError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::AlreadyInCart => StatusCode::CONFLICT,
            Self::VariantNotFound | Self::ItemNotFound => StatusCode::NOT_FOUND,
            Self::InvalidQuantity => StatusCode::BAD_REQUEST,
            Self::Service(err) => err.status_code(),
        }
    }
}

impl IntoResponse for CartError {
    fn into_response(self) -> Response {
        match self {
            Self::Service(err) => err.into_response(),
            rejection => rejection_response(rejection.status_code(), rejection.to_string(), None),
        }
    }
}

/// A cart line priced at the variant's current price.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CartLine {
    pub id: Uuid,
    pub variant_id: Uuid,
    pub quantity: i32,
    /// `None` when the variant was removed from the catalog.
    pub unit_price: Option<Decimal>,
    pub line_total: Option<Decimal>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CartView {
    pub cart_id: Option<Uuid>,
    pub shop_id: Uuid,
    pub items: Vec<CartLine>,
    pub total: Decimal,
}

/// Cart Store facade for the HTTP surface.
#[derive(Clone)]
pub struct CartService {
    db: Arc<DatabaseConnection>,
    event_sender: Arc<EventSender>,
}

fn is_unique_violation(err: &ServiceError) -> bool {
    matches!(
        err,
        ServiceError::DatabaseError(db_err)
            if matches!(db_err.sql_err(), Some(SqlErr::UniqueConstraintViolation(_)))
    )
}

impl CartService {
    pub fn new(db: Arc<DatabaseConnection>, event_sender: Arc<EventSender>) -> Self {
        Self { db, event_sender }
    }

    /// Adds a variant to the user's cart for `shop_id`, creating the cart on
    /// first use. A variant already in the cart is a conflict, not a merge.
    #[instrument(skip(self))]
    pub async fn add_item(
        &self,
        user_id: Uuid,
        shop_id: Uuid,
        variant_id: Uuid,
        quantity: i32,
    ) -> Result<cart_item::Model, CartError> {
        let db = &*self.db;
        if quantity < 1 {
            return Err(CartError::InvalidQuantity);
        }

        let variant = CatalogRepository::find_variant_by_id(db, variant_id)
            .await?
            .ok_or(CartError::VariantNotFound)?;
        let product = CatalogRepository::find_product_by_id(db, variant.product_id)
            .await?
            .ok_or(CartError::VariantNotFound)?;
        if product.shop_id != shop_id {
            return Err(ServiceError::InvalidInput(format!(
                "Variant {} is not sold by shop {}",
                variant_id, shop_id
            ))
            .into());
        }

        let cart = self.find_or_create_cart(user_id, shop_id).await?;
        if CartRepository::find_item(db, cart.id, variant_id).await?.is_some() {
            return Err(CartError::AlreadyInCart);
        }

        match CartRepository::add_cart_item(db, cart.id, variant_id, quantity).await {
            Ok(item) => {
                debug!(cart_id = %cart.id, item_id = %item.id, "Cart item added");
                Ok(item)
            }
            Err(e) if is_unique_violation(&e) => Err(CartError::AlreadyInCart),
            Err(e) => Err(e.into()),
        }
    }

    async fn find_or_create_cart(
        &self,
        user_id: Uuid,
        shop_id: Uuid,
    ) -> Result<cart::Model, ServiceError> {
        let db = &*self.db;
        if let Some(cart) = CartRepository::find_cart_by_user_and_shop(db, user_id, shop_id).await? {
            return Ok(cart);
        }

        match CartRepository::create_cart(db, user_id, shop_id).await {
            Ok(cart) => Ok(cart),
            // Another request created it first.
            Err(e) if is_unique_violation(&e) => {
                CartRepository::find_cart_by_user_and_shop(db, user_id, shop_id)
                    .await?
                    .ok_or(e)
            }
            Err(e) => Err(e),
        }
    }

    #[instrument(skip(self))]
    pub async fn remove_item(
        &self,
        user_id: Uuid,
        shop_id: Uuid,
        item_id: Uuid,
    ) -> Result<(), CartError> {
        let db = &*self.db;
        let cart = CartRepository::find_cart_by_user_and_shop(db, user_id, shop_id)
            .await?
            .ok_or(CartError::ItemNotFound)?;
        if !CartRepository::delete_cart_item(db, cart.id, item_id).await? {
            return Err(CartError::ItemNotFound);
        }
        Ok(())
    }

    /// Current lines with a total derived from live variant prices.
    #[instrument(skip(self))]
    pub async fn list_items(&self, user_id: Uuid, shop_id: Uuid) -> Result<CartView, ServiceError> {
        let db = &*self.db;
        let Some(cart) = CartRepository::find_cart_by_user_and_shop(db, user_id, shop_id).await?
        else {
            return Ok(CartView {
                cart_id: None,
                shop_id,
                items: Vec::new(),
                total: Decimal::ZERO,
            });
        };

        let mut items = Vec::new();
        let mut total = Decimal::ZERO;
        for item in CartRepository::list_cart_items(db, cart.id).await? {
            let unit_price = CatalogRepository::find_variant_by_id(db, item.variant_id)
                .await?
                .map(|v| v.price);
            let line_total = unit_price.map(|price| price * Decimal::from(item.quantity));
            total += line_total.unwrap_or(Decimal::ZERO);
            items.push(CartLine {
                id: item.id,
                variant_id: item.variant_id,
                quantity: item.quantity,
                unit_price,
                line_total,
            });
        }

        Ok(CartView {
            cart_id: Some(cart.id),
            shop_id,
            items,
            total,
        })
    }

    /// Deletes the cart and its items. Returns whether a cart existed.
    #[instrument(skip(self))]
    pub async fn clear_cart(&self, user_id: Uuid, shop_id: Uuid) -> Result<bool, ServiceError> {
        let db = &*self.db;
        let Some(cart) = CartRepository::find_cart_by_user_and_shop(db, user_id, shop_id).await?
        else {
            return Ok(false);
        };

        if !CartRepository::delete_cart(db, cart.id).await? {
            return Ok(false);
        }
        info!(cart_id = %cart.id, cleared_at = %Utc::now(), "Cart cleared");
        self.event_sender
            .send_or_log(Event::CartCleared { cart_id: cart.id })
            .await;
        Ok(true)
    }
}
