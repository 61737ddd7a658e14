use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{db, handlers::AppState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    Up,
    Down,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: ComponentStatus,
    pub database: ComponentStatus,
    pub version: String,
    pub timestamp: String,
}

/// Liveness plus a database ping. Answers 503 while the database is down.
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let database = match db::check_connection(&state.db).await {
        Ok(()) => ComponentStatus::Up,
        Err(e) => {
            warn!(error = %e, "Health check database ping failed");
            ComponentStatus::Down
        }
    };

    let status_code = if database == ComponentStatus::Up {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status_code,
        Json(HealthResponse {
            status: database,
            database,
            version: env!("CARGO_PKG_VERSION").to_string(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }),
    )
}
