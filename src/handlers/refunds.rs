use axum::{
    extract::{Path, State},
    response::Response,
    Json,
};
use tracing::warn;
use uuid::Uuid;

use crate::{
    auth::AuthUser,
    entities::refund,
    errors::ServiceError,
    handlers::common::{created_response, validate_body},
    services::refunds::{CreateRefundRequest, RefundError},
    ApiResponse, AppState,
};

/// POST /refunds
pub async fn create_refund(
    State(state): State<AppState>,
    auth_user: AuthUser,
    Json(request): Json<CreateRefundRequest>,
) -> Result<Response, RefundError> {
    if let Err(response) = validate_body(&request) {
        return Ok(response);
    }

    let refund = state
        .services
        .refunds
        .create_refund(auth_user.user_id, request)
        .await?;
    Ok(created_response(refund))
}

/// Merchants review refunds only on orders of the shops they operate.
async fn ensure_reviewer(
    state: &AppState,
    auth_user: &AuthUser,
    refund_id: Uuid,
) -> Result<(), RefundError> {
    let shop_id = state.services.refunds.shop_of_refund(refund_id).await?;
    if !auth_user.can_manage_shop(shop_id) {
        warn!(user_id = %auth_user.user_id, %shop_id, "Refund review outside merchant's shops");
        return Err(RefundError::Forbidden);
    }
    Ok(())
}

/// POST /refunds/:refund_id/approve (merchant)
pub async fn approve_refund(
    State(state): State<AppState>,
    auth_user: AuthUser,
    Path(refund_id): Path<Uuid>,
) -> Result<Json<ApiResponse<refund::Model>>, RefundError> {
    ensure_reviewer(&state, &auth_user, refund_id).await?;
    let refund = state
        .services
        .refunds
        .approve_refund(refund_id, auth_user.user_id)
        .await?;
    Ok(Json(ApiResponse::success(refund)))
}

/// POST /refunds/:refund_id/reject (merchant)
pub async fn reject_refund(
    State(state): State<AppState>,
    auth_user: AuthUser,
    Path(refund_id): Path<Uuid>,
) -> Result<Json<ApiResponse<refund::Model>>, RefundError> {
    ensure_reviewer(&state, &auth_user, refund_id).await?;
    let refund = state
        .services
        .refunds
        .reject_refund(refund_id, auth_user.user_id)
        .await?;
    Ok(Json(ApiResponse::success(refund)))
}

/// GET /orders/:order_id/refunds (merchant)
pub async fn list_order_refunds(
    State(state): State<AppState>,
    auth_user: AuthUser,
    Path(order_id): Path<Uuid>,
) -> Result<Json<ApiResponse<Vec<refund::Model>>>, ServiceError> {
    let shop_id = state.services.refunds.shop_of_order(order_id).await?;
    if !auth_user.can_manage_shop(shop_id) {
        return Err(ServiceError::Forbidden(
            "Order belongs to another shop".to_string(),
        ));
    }
    let refunds = state
        .services
        .refunds
        .list_refunds_for_order(order_id)
        .await?;
    Ok(Json(ApiResponse::success(refunds)))
}
