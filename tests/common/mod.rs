#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::{
    body::{to_bytes, Body},
    http::{Method, Request},
    Router,
};
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use sea_orm::{ActiveModelTrait, DatabaseConnection, EntityTrait, Set};
use serde_json::{json, Value};
use storefront_api::{
    auth::{AuthConfig, AuthService, ROLE_MERCHANT},
    config::AppConfig,
    db::{self, DbConfig},
    entities::{
        commerce::{product_variant, promotion, DiscountType, ProductVariant},
        product,
    },
    events::{self, Event, EventSender},
    gateways::{
        GatewayError, GatewayPaymentRequest, GatewayRefundRequest, GatewayRegistry,
        GatewayResponse, PaymentGateway,
    },
    handlers::AppServices,
    repositories::CartRepository,
    services::{
        orders::OrderService, payments::PaymentService, refunds::RefundService,
    },
    AppState,
};
use tokio::sync::mpsc;
use tower::ServiceExt;
use uuid::Uuid;

pub const TEST_JWT_SECRET: &str = "test_secret_key_for_testing_purposes_only_32chars";

/// Fresh in-memory SQLite database with the schema applied.
///
/// A single pooled connection keeps every query on the same in-memory
/// database.
pub async fn setup_db() -> Arc<DatabaseConnection> {
    let config = DbConfig {
        url: "sqlite::memory:".to_string(),
        max_connections: 1,
        min_connections: 1,
        ..Default::default()
    };
    let pool = db::establish_connection_with_config(&config)
        .await
        .expect("failed to create test database");
    db::run_migrations(&pool)
        .await
        .expect("failed to run migrations in tests");
    Arc::new(pool)
}

/// Event channel large enough that no test ever blocks on it.
pub fn event_channel() -> (Arc<EventSender>, mpsc::Receiver<Event>) {
    let (sender, rx) = events::channel(1024);
    (Arc::new(sender), rx)
}

/// Drains whatever has been published so far.
pub fn drain_events(rx: &mut mpsc::Receiver<Event>) -> Vec<Event> {
    let mut out = Vec::new();
    while let Ok(event) = rx.try_recv() {
        out.push(event);
    }
    out
}

pub async fn seed_product(db: &DatabaseConnection, shop_id: Uuid) -> product::Model {
    let now = Utc::now();
    product::ActiveModel {
        id: Set(Uuid::new_v4()),
        shop_id: Set(shop_id),
        name: Set("Test product".to_string()),
        created_at: Set(now),
        updated_at: Set(now),
    }
    .insert(db)
    .await
    .expect("seed product")
}

pub async fn seed_variant(
    db: &DatabaseConnection,
    product_id: Uuid,
    price: Decimal,
    stock: i32,
) -> product_variant::Model {
    seed_variant_in(db, product_id, price, stock, "EUR").await
}

pub async fn seed_variant_in(
    db: &DatabaseConnection,
    product_id: Uuid,
    price: Decimal,
    stock: i32,
    currency: &str,
) -> product_variant::Model {
    let now = Utc::now();
    let id = Uuid::new_v4();
    product_variant::ActiveModel {
        id: Set(id),
        product_id: Set(product_id),
        sku: Set(format!("SKU-{}", id.simple())),
        name: Set("Test variant".to_string()),
        price: Set(price),
        currency: Set(currency.to_string()),
        stock: Set(stock),
        created_at: Set(now),
        updated_at: Set(now),
    }
    .insert(db)
    .await
    .expect("seed variant")
}

pub async fn seed_promotion(
    db: &DatabaseConnection,
    variant_id: Uuid,
    discount_type: DiscountType,
    discount_value: Decimal,
    start_date: DateTime<Utc>,
    end_date: DateTime<Utc>,
) -> promotion::Model {
    promotion::ActiveModel {
        id: Set(Uuid::new_v4()),
        variant_id: Set(variant_id),
        name: Set("Test promotion".to_string()),
        discount_type: Set(discount_type),
        discount_value: Set(discount_value),
        start_date: Set(start_date),
        end_date: Set(end_date),
        created_at: Set(Utc::now()),
    }
    .insert(db)
    .await
    .expect("seed promotion")
}

/// Puts `quantity` units of `variant_id` in the user's cart for `shop_id`.
pub async fn add_to_cart(
    db: &DatabaseConnection,
    user_id: Uuid,
    shop_id: Uuid,
    variant_id: Uuid,
    quantity: i32,
) {
    let cart = match CartRepository::find_cart_by_user_and_shop(db, user_id, shop_id)
        .await
        .expect("find cart")
    {
        Some(cart) => cart,
        None => CartRepository::create_cart(db, user_id, shop_id)
            .await
            .expect("create cart"),
    };
    CartRepository::add_cart_item(db, cart.id, variant_id, quantity)
        .await
        .expect("add cart item");
}

pub async fn variant_stock(db: &DatabaseConnection, variant_id: Uuid) -> i32 {
    ProductVariant::find_by_id(variant_id)
        .one(db)
        .await
        .expect("load variant")
        .expect("variant exists")
        .stock
}

/// Gateway whose answers are queued by the test.
///
/// An empty queue answers with a success.
#[derive(Default)]
pub struct ScriptedGateway {
    payments: Mutex<VecDeque<Result<GatewayResponse, GatewayError>>>,
    refunds: Mutex<VecDeque<Result<GatewayResponse, GatewayError>>>,
    pub payment_calls: Mutex<Vec<GatewayPaymentRequest>>,
    pub refund_calls: Mutex<Vec<GatewayRefundRequest>>,
}

impl ScriptedGateway {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push_payment(&self, outcome: Result<GatewayResponse, GatewayError>) {
        self.payments.lock().unwrap().push_back(outcome);
    }

    pub fn push_refund(&self, outcome: Result<GatewayResponse, GatewayError>) {
        self.refunds.lock().unwrap().push_back(outcome);
    }

    pub fn payment_call_count(&self) -> usize {
        self.payment_calls.lock().unwrap().len()
    }

    pub fn refund_call_count(&self) -> usize {
        self.refund_calls.lock().unwrap().len()
    }
}

#[async_trait]
impl PaymentGateway for ScriptedGateway {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn process_payment(
        &self,
        request: &GatewayPaymentRequest,
    ) -> Result<GatewayResponse, GatewayError> {
        self.payment_calls.lock().unwrap().push(request.clone());
        self.payments.lock().unwrap().pop_front().unwrap_or_else(|| {
            Ok(GatewayResponse::succeeded(
                format!("pi_{}", Uuid::new_v4().simple()),
                Some(format!("tx_{}", Uuid::new_v4().simple())),
                json!({ "scripted": true }),
            ))
        })
    }

    async fn refund_payment(
        &self,
        request: &GatewayRefundRequest,
    ) -> Result<GatewayResponse, GatewayError> {
        self.refund_calls.lock().unwrap().push(request.clone());
        self.refunds.lock().unwrap().pop_front().unwrap_or_else(|| {
            Ok(GatewayResponse::succeeded(
                format!("re_{}", Uuid::new_v4().simple()),
                None,
                json!({ "scripted": true }),
            ))
        })
    }
}

/// Registry answering both method keys with the same gateway.
pub fn registry_with(gateway: Arc<dyn PaymentGateway>) -> Arc<GatewayRegistry> {
    Arc::new(
        GatewayRegistry::new()
            .with_gateway("stripe", gateway.clone())
            .with_gateway("paypal", gateway),
    )
}

/// Database, events and services wired together for workflow tests.
pub struct Harness {
    pub db: Arc<DatabaseConnection>,
    pub events: mpsc::Receiver<Event>,
    pub gateway: Arc<ScriptedGateway>,
    pub orders: OrderService,
    pub payments: PaymentService,
    pub refunds: RefundService,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_order_expiry(Duration::minutes(15)).await
    }

    pub async fn with_order_expiry(order_expiry: Duration) -> Self {
        let db = setup_db().await;
        let (event_sender, events) = event_channel();
        let gateway = ScriptedGateway::new();
        let registry = registry_with(gateway.clone());

        Self {
            orders: OrderService::new(db.clone(), event_sender.clone(), order_expiry),
            payments: PaymentService::new(db.clone(), event_sender.clone(), registry.clone()),
            refunds: RefundService::new(db.clone(), event_sender, registry),
            db,
            events,
            gateway,
        }
    }

    /// Seeds a product in `shop_id` with one variant and returns the variant.
    pub async fn variant(&self, shop_id: Uuid, price: Decimal, stock: i32) -> product_variant::Model {
        let product = seed_product(&self.db, shop_id).await;
        seed_variant(&self.db, product.id, price, stock).await
    }

    /// Seeds a variant, fills a cart and converts it. Returns the order id.
    pub async fn pending_order(&self, user_id: Uuid, price: Decimal, quantity: i32) -> Uuid {
        let shop_id = Uuid::new_v4();
        let variant = self.variant(shop_id, price, quantity + 10).await;
        add_to_cart(&self.db, user_id, shop_id, variant.id, quantity).await;
        self.orders
            .create_order_from_cart(user_id, shop_id)
            .await
            .expect("checkout")
            .order_id
    }
}

/// Full router over an in-memory database for HTTP tests.
pub struct TestApp {
    router: Router,
    pub state: AppState,
    pub gateway: Arc<ScriptedGateway>,
}

impl TestApp {
    pub async fn new() -> Self {
        let db = setup_db().await;
        let (event_sender, _events) = event_channel();
        let gateway = ScriptedGateway::new();

        let cfg = AppConfig::new(
            "sqlite::memory:".to_string(),
            TEST_JWT_SECRET.to_string(),
            "test".to_string(),
        );
        let services = AppServices::new(
            db.clone(),
            event_sender.clone(),
            registry_with(gateway.clone()),
            cfg.order_expiry(),
        );
        let auth = Arc::new(AuthService::new(AuthConfig::from_app_config(&cfg)));

        let state = AppState {
            db,
            config: cfg,
            event_sender,
            services,
            auth,
        };

        Self {
            router: storefront_api::build_router(state.clone()),
            state,
            gateway,
        }
    }

    pub fn token_for(&self, user_id: Uuid, roles: &[&str]) -> String {
        self.state
            .auth
            .issue_token(user_id, roles)
            .expect("issue test token")
    }

    pub fn merchant_token(&self, user_id: Uuid, shop_ids: &[Uuid]) -> String {
        self.state
            .auth
            .issue_token_for_shops(user_id, &[ROLE_MERCHANT], shop_ids)
            .expect("issue test token")
    }

    /// Send a request against the router with an optional bearer token.
    pub async fn request(
        &self,
        method: Method,
        uri: &str,
        body: Option<Value>,
        token: Option<&str>,
    ) -> axum::response::Response {
        let mut builder = Request::builder().method(method).uri(uri);

        if let Some(tok) = token {
            builder = builder.header("authorization", format!("Bearer {}", tok));
        }

        let body = if let Some(json) = body {
            builder = builder.header("content-type", "application/json");
            Body::from(serde_json::to_vec(&json).expect("failed to serialize json request body"))
        } else {
            Body::empty()
        };

        let request = builder.body(body).expect("failed to build request");
        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("router error during test request")
    }
}

pub async fn json_body(response: axum::response::Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("read body");
    if bytes.is_empty() {
        return Value::Null;
    }
    serde_json::from_slice(&bytes).expect("json body")
}
