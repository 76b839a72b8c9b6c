use std::{net::SocketAddr, sync::Arc, time::Duration};

use axum::{routing::get, Router};
use tokio::{signal, sync::mpsc};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::info;

use orders_api as api;

use api::clients::{
    HttpPaymentProcessor, HttpProductCatalog, PaymentProcessor, ProductCatalog,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cfg = api::config::load_config()?;
    api::config::init_tracing(&cfg.log_level, cfg.log_json);

    // Init DB
    let db_pool = api::db::establish_connection_from_app_config(&cfg).await?;
    if cfg.auto_migrate {
        api::db::run_migrations(&db_pool).await?;
    }
    let db = Arc::new(db_pool);

    // Init events
    let (event_tx, event_rx) = mpsc::channel(1024);
    let event_sender = api::events::EventSender::new(event_tx);
    tokio::spawn(api::events::process_events(event_rx));

    // Remote collaborators share one bounded timeout; a timed-out call is
    // treated the same as an unreachable peer.
    let timeout = Duration::from_secs(cfg.http_timeout_secs);
    let catalog: Arc<dyn ProductCatalog> = Arc::new(HttpProductCatalog::new(
        cfg.product_service_url.clone(),
        timeout,
    )?);
    let payments: Arc<dyn PaymentProcessor> = Arc::new(HttpPaymentProcessor::new(
        cfg.payment_service_url.clone(),
        timeout,
    )?);

    let orders = Arc::new(api::services::orders::OrderService::new(
        db.clone(),
        catalog,
        payments,
        Some(Arc::new(event_sender)),
    ));

    let state = api::AppState {
        db: db.clone(),
        orders,
    };

    let app = Router::new()
        .route("/health", get(api::handlers::health))
        .merge(api::handlers::orders::router())
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state);

    let addr: SocketAddr = format!("{}:{}", cfg.host, cfg.port).parse()?;
    info!("orders-api listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    api::db::close_pool((*db).clone()).await?;
    info!("shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
    info!("shutdown signal received");
}
