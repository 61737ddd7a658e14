use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context;
use http::HeaderValue;
use tokio::signal;
use tower_http::{
    cors::{Any, CorsLayer},
    timeout::TimeoutLayer,
};
use tracing::{error, info, warn};

use storefront_api as api;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = api::config::load_config().context("failed to load configuration")?;
    api::config::init_tracing(cfg.log_level(), cfg.log_json);

    // Init DB
    let db_pool = api::db::establish_connection_from_app_config(&cfg)
        .await
        .context("failed to connect to the database")?;
    if cfg.auto_migrate {
        api::db::run_migrations(&db_pool).await.map_err(|e| {
            error!("Failed running migrations: {}", e);
            e
        })?;
    }
    let db_arc = Arc::new(db_pool);

    // Init events
    let (event_sender, event_rx) = api::events::channel(cfg.event_channel_capacity);
    let event_sender = Arc::new(event_sender);
    tokio::spawn(api::events::process_events(event_rx));

    // Payment gateways are chosen here and nowhere else
    let gateways = Arc::new(
        api::gateways::build_registry(&cfg.payments, cfg.is_production())
            .context("failed to configure payment gateways")?,
    );
    if gateways.is_empty() {
        warn!("No payment gateway registered; every payment will be refused");
    } else {
        info!(methods = ?gateways.methods(), "Payment gateways registered");
    }

    let services = api::handlers::AppServices::new(
        db_arc.clone(),
        event_sender.clone(),
        gateways,
        cfg.order_expiry(),
    );

    let expiry_worker = if cfg.expiry_sweep_enabled {
        Some(api::workers::spawn_order_expiry_worker(
            services.orders.clone(),
            cfg.expiry_sweep_interval(),
        ))
    } else {
        info!("Order expiry sweep disabled");
        None
    };

    let auth_service = Arc::new(api::auth::AuthService::new(
        api::auth::AuthConfig::from_app_config(&cfg),
    ));

    // Compose shared app state
    let app_state = api::AppState {
        db: db_arc.clone(),
        config: cfg.clone(),
        event_sender,
        services,
        auth: auth_service,
    };

    // Build CORS layer from config
    let origins: Vec<HeaderValue> = cfg
        .cors_origins()
        .iter()
        .filter_map(|origin| HeaderValue::from_str(origin).ok())
        .collect();
    let cors_layer = if !origins.is_empty() {
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(Any)
            .allow_headers(Any)
    } else if cfg.is_development() {
        info!("Using permissive CORS in development");
        CorsLayer::permissive()
    } else {
        CorsLayer::new()
    };

    let app = api::build_router(app_state)
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
        .layer(cors_layer);

    // Bind and serve
    let ip: std::net::IpAddr = cfg
        .host
        .parse()
        .with_context(|| format!("invalid host address: {}", cfg.host))?;
    let addr = SocketAddr::from((ip, cfg.port));
    info!("storefront-api listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Some(worker) = expiry_worker {
        worker.abort();
    }
    info!("storefront-api stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
