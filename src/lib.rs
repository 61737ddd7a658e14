//! Storefront API Library
//!
//! Cart checkout, payment settlement and refunds for a multi-tenant
//! storefront.
#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![allow(elided_lifetimes_in_paths)]
#![warn(clippy::all, clippy::perf, clippy::dbg_macro)]

// Core modules
pub mod auth;
pub mod config;
pub mod db;
pub mod entities;
pub mod errors;
pub mod events;
pub mod gateways;
pub mod handlers;
pub mod middleware_helpers;
pub mod migrator;
pub mod repositories;
pub mod services;
pub mod tracing;
pub mod workers;

use axum::{
    routing::{delete, get, post},
    Router,
};
use chrono::Utc;
use sea_orm::DatabaseConnection;
use serde::Serialize;
use std::sync::Arc;

use crate::auth::{AuthRouterExt, AuthService, ROLE_MERCHANT};

// App state definition
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<DatabaseConnection>,
    pub config: config::AppConfig,
    pub event_sender: Arc<events::EventSender>,
    pub services: handlers::AppServices,
    pub auth: Arc<AuthService>,
}

// Common response wrappers
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub message: Option<String>,
    pub errors: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<ResponseMeta>,
}

#[derive(Debug, Serialize)]
pub struct ResponseMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub timestamp: String,
}

impl ResponseMeta {
    fn capture() -> Self {
        Self {
            request_id: crate::tracing::current_request_id().map(|rid| rid.as_str().to_string()),
            timestamp: Utc::now().to_rfc3339(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct PaginatedResponse<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub page: u64,
    pub limit: u64,
    pub total_pages: u64,
}

impl<T> PaginatedResponse<T> {
    pub fn new(items: Vec<T>, total: u64, page: u64, limit: u64) -> Self {
        let total_pages = if limit == 0 {
            0
        } else {
            (total + limit - 1) / limit
        };
        Self {
            items,
            total,
            page,
            limit,
            total_pages,
        }
    }
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            message: None,
            errors: None,
            meta: Some(ResponseMeta::capture()),
        }
    }

    pub fn error(message: String) -> Self {
        Self {
            success: false,
            data: None,
            message: Some(message),
            errors: None,
            meta: Some(ResponseMeta::capture()),
        }
    }

    pub fn validation_errors(errors: Vec<String>) -> Self {
        Self {
            success: false,
            data: None,
            message: Some("Validation failed".to_string()),
            errors: Some(errors),
            meta: Some(ResponseMeta::capture()),
        }
    }
}


/// Routes mounted under `/api/v1`. Every route requires a bearer token;
/// refund review additionally requires the merchant role.
pub fn api_v1_routes() -> Router<AppState> {
    let customer = Router::new()
        .route(
            "/shops/:shop_id/cart",
            get(handlers::carts::get_cart).delete(handlers::carts::clear_cart),
        )
        .route(
            "/shops/:shop_id/cart/items",
            post(handlers::carts::add_cart_item),
        )
        .route(
            "/shops/:shop_id/cart/items/:item_id",
            delete(handlers::carts::remove_cart_item),
        )
        .route(
            "/shops/:shop_id/orders",
            post(handlers::orders::create_order),
        )
        .route("/orders", get(handlers::orders::list_orders))
        .route("/orders/:order_id", get(handlers::orders::get_order))
        .route(
            "/orders/:order_id/payments",
            get(handlers::orders::list_order_payments),
        )
        .route("/payments", post(handlers::payments::process_payment))
        .route("/refunds", post(handlers::refunds::create_refund))
        .route("/me", delete(handlers::me::delete_my_data))
        .route("/me/export", get(handlers::me::export_my_data))
        .with_auth();

    let merchant = Router::new()
        .route(
            "/orders/:order_id/refunds",
            get(handlers::refunds::list_order_refunds),
        )
        .route(
            "/refunds/:refund_id/approve",
            post(handlers::refunds::approve_refund),
        )
        .route(
            "/refunds/:refund_id/reject",
            post(handlers::refunds::reject_refund),
        )
        .with_role(ROLE_MERCHANT);

    customer.merge(merchant)
}

/// Full application router with the request-id, tracing and auth layers.
/// CORS and timeouts are added by the binary.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health::health_check))
        .nest("/api/v1", api_v1_routes())
        .layer(crate::tracing::configure_http_tracing())
        .layer(axum::middleware::from_fn_with_state(
            state.auth.clone(),
            auth::inject_auth_service,
        ))
        // Ensure every request carries a request id for traceability
        .layer(axum::middleware::from_fn(
            middleware_helpers::request_id::request_id_middleware,
        ))
        .with_state(state)
}
