use axum::{extract::State, Json};

use crate::{
    auth::AuthUser,
    errors::ServiceError,
    services::compliance::{AnonymizationResult, UserDataExport},
    ApiResponse, AppState,
};

/// DELETE /me
///
/// Detaches the caller's orders and removes their carts.
pub async fn delete_my_data(
    State(state): State<AppState>,
    auth_user: AuthUser,
) -> Result<Json<ApiResponse<AnonymizationResult>>, ServiceError> {
    let result = state
        .services
        .compliance
        .anonymize_user(auth_user.user_id)
        .await?;
    Ok(Json(ApiResponse::success(result)))
}

/// GET /me/export
pub async fn export_my_data(
    State(state): State<AppState>,
    auth_user: AuthUser,
) -> Result<Json<ApiResponse<UserDataExport>>, ServiceError> {
    let export = state
        .services
        .compliance
        .export_user_data(auth_user.user_id)
        .await?;
    Ok(Json(ApiResponse::success(export)))
}
