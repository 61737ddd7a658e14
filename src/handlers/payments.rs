use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};

use crate::{
    auth::AuthUser,
    handlers::common::validate_body,
    services::payments::{PaymentError, ProcessPaymentRequest},
    ApiResponse, AppState,
};

/// POST /payments
///
/// 201 when the provider settled the payment, 202 when it is still pending
/// on the provider's side.
pub async fn process_payment(
    State(state): State<AppState>,
    auth_user: AuthUser,
    Json(request): Json<ProcessPaymentRequest>,
) -> Result<Response, PaymentError> {
    if let Err(response) = validate_body(&request) {
        return Ok(response);
    }

    let outcome = state
        .services
        .payments
        .process_payment(auth_user.user_id, request)
        .await?;

    let status = if outcome.is_pending() {
        StatusCode::ACCEPTED
    } else {
        StatusCode::CREATED
    };
    Ok((status, Json(ApiResponse::success(outcome))).into_response())
}
