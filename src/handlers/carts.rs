use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use uuid::Uuid;

use crate::{
    auth::AuthUser,
    errors::ServiceError,
    handlers::common::{created_response, validate_body},
    services::carts::{AddCartItemRequest, CartError, CartView},
    ApiResponse, AppState,
};

/// GET /shops/:shop_id/cart
pub async fn get_cart(
    State(state): State<AppState>,
    auth_user: AuthUser,
    Path(shop_id): Path<Uuid>,
) -> Result<Json<ApiResponse<CartView>>, ServiceError> {
    let view = state
        .services
        .carts
        .list_items(auth_user.user_id, shop_id)
        .await?;
    Ok(Json(ApiResponse::success(view)))
}

/// POST /shops/:shop_id/cart/items
pub async fn add_cart_item(
    State(state): State<AppState>,
    auth_user: AuthUser,
    Path(shop_id): Path<Uuid>,
    Json(request): Json<AddCartItemRequest>,
) -> Result<Response, CartError> {
    if let Err(response) = validate_body(&request) {
        return Ok(response);
    }

    let item = state
        .services
        .carts
        .add_item(auth_user.user_id, shop_id, request.variant_id, request.quantity)
        .await?;
    Ok(created_response(item))
}

/// DELETE /shops/:shop_id/cart/items/:item_id
pub async fn remove_cart_item(
    State(state): State<AppState>,
    auth_user: AuthUser,
    Path((shop_id, item_id)): Path<(Uuid, Uuid)>,
) -> Result<StatusCode, CartError> {
    state
        .services
        .carts
        .remove_item(auth_user.user_id, shop_id, item_id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// DELETE /shops/:shop_id/cart
pub async fn clear_cart(
    State(state): State<AppState>,
    auth_user: AuthUser,
    Path(shop_id): Path<Uuid>,
) -> Result<impl IntoResponse, ServiceError> {
    let cleared = state
        .services
        .carts
        .clear_cart(auth_user.user_id, shop_id)
        .await?;
    Ok(Json(ApiResponse::success(json!({ "cleared": cleared }))))
}
