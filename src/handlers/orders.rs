use axum::{
    extract::{Path, Query, State},
    response::Response,
    Json,
};
use tracing::info;
use uuid::Uuid;

use crate::{
    auth::AuthUser,
    entities::{order, payment},
    errors::ServiceError,
    handlers::common::{created_response, PaginationParams},
    services::orders::{CheckoutError, OrderDetails},
    ApiResponse, AppState, PaginatedResponse,
};

/// POST /shops/:shop_id/orders
///
/// Converts the caller's cart for the shop into an order.
pub async fn create_order(
    State(state): State<AppState>,
    auth_user: AuthUser,
    Path(shop_id): Path<Uuid>,
) -> Result<Response, CheckoutError> {
    let created = state
        .services
        .orders
        .create_order_from_cart(auth_user.user_id, shop_id)
        .await?;
    info!(order_id = %created.order_id, "Order created from cart");
    Ok(created_response(created))
}

/// GET /orders
pub async fn list_orders(
    State(state): State<AppState>,
    auth_user: AuthUser,
    Query(params): Query<PaginationParams>,
) -> Result<Json<ApiResponse<PaginatedResponse<order::Model>>>, ServiceError> {
    let (page, per_page) = params.normalized();
    let (items, total) = state
        .services
        .orders
        .list_orders_for_user(auth_user.user_id, page, per_page)
        .await?;
    Ok(Json(ApiResponse::success(PaginatedResponse::new(
        items, total, page, per_page,
    ))))
}

/// GET /orders/:order_id
pub async fn get_order(
    State(state): State<AppState>,
    auth_user: AuthUser,
    Path(order_id): Path<Uuid>,
) -> Result<Json<ApiResponse<OrderDetails>>, ServiceError> {
    let details = state
        .services
        .orders
        .get_order(auth_user.user_id, order_id)
        .await?;
    Ok(Json(ApiResponse::success(details)))
}

/// GET /orders/:order_id/payments
pub async fn list_order_payments(
    State(state): State<AppState>,
    auth_user: AuthUser,
    Path(order_id): Path<Uuid>,
) -> Result<Json<ApiResponse<Vec<payment::Model>>>, ServiceError> {
    let payments = state
        .services
        .payments
        .list_payments_for_order(auth_user.user_id, order_id)
        .await?;
    Ok(Json(ApiResponse::success(payments)))
}
