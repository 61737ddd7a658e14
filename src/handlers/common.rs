use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationErrors};

use crate::ApiResponse;

/// Validates a request body, producing the 400 response on failure.
pub fn validate_body<T: Validate>(input: &T) -> Result<(), Response> {
    input.validate().map_err(|e| validation_failure(&e))
}

pub fn validation_failure(errors: &ValidationErrors) -> Response {
    let mut messages: Vec<String> = errors
        .field_errors()
        .iter()
        .flat_map(|(field, errors)| {
            errors.iter().map(move |error| {
                format!(
                    "{}: {}",
                    field,
                    error
                        .message
                        .as_ref()
                        .map(|m| m.to_string())
                        .unwrap_or_else(|| error.code.to_string())
                )
            })
        })
        .collect();
    messages.sort();

    (
        StatusCode::BAD_REQUEST,
        Json(ApiResponse::<()>::validation_errors(messages)),
    )
        .into_response()
}

/// Standard created response
pub fn created_response<T: Serialize>(data: T) -> Response {
    (StatusCode::CREATED, Json(ApiResponse::success(data))).into_response()
}

/// Pagination parameters for list operations
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct PaginationParams {
    #[serde(default = "default_page")]
    pub page: u64,
    #[serde(default = "default_per_page")]
    pub per_page: u64,
}

fn default_page() -> u64 {
    1
}

fn default_per_page() -> u64 {
    20
}

impl Default for PaginationParams {
    fn default() -> Self {
        Self {
            page: default_page(),
            per_page: default_per_page(),
        }
    }
}

impl PaginationParams {
    /// Page and page size clamped to what the services accept.
    pub fn normalized(self) -> (u64, u64) {
        (self.page.max(1), self.per_page.clamp(1, 100))
    }
}
