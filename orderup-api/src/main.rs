use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use anyhow::Context;
use orderup_api::{app, AppState};
use orderup_core::OrderStore;
use orderup_order::{BreakerSettings, EngineSettings, OrderManager};
use orderup_shared::OrderEvent;
use orderup_store::app_config::{Config, StorageBackend};
use orderup_store::{DbClient, HttpChargeGateway, HttpFulfillmentGateway, MemoryOrderStore};
use tokio::sync::broadcast;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "orderup_api=debug,orderup_order=debug,tower_http=debug,audit=info".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::load().context("Failed to load config")?;
    tracing::info!("Starting Order Up API on port {}", config.server.port);

    // Order store
    let store: Arc<dyn OrderStore> = match config.storage.backend {
        StorageBackend::Memory => {
            tracing::warn!("Using in-memory order store; orders are lost on restart");
            Arc::new(MemoryOrderStore::new())
        }
        StorageBackend::Postgres => {
            let url = config
                .storage
                .database_url
                .as_deref()
                .context("storage.database_url is required for the postgres backend")?;
            let db = DbClient::new(url, &config.storage)
                .await
                .context("Failed to connect to Postgres")?;
            db.migrate().await.context("Failed to run migrations")?;
            Arc::new(db.order_store())
        }
    };

    // Downstream gateways
    let timeout = config.gateways.timeout();
    let charge_gateway = HttpChargeGateway::new(&config.gateways.charge_url, timeout)
        .context("Failed to build charge client")?;
    let fulfillment_gateway = HttpFulfillmentGateway::new(&config.gateways.fulfillment_url, timeout)
        .context("Failed to build fulfillment client")?;

    // Lifecycle events feed the audit log
    let (events_tx, events_rx) = broadcast::channel(config.engine.event_buffer.max(1));
    tokio::spawn(audit_log(events_rx));

    let manager = OrderManager::new(
        store,
        Arc::new(charge_gateway),
        Arc::new(fulfillment_gateway),
        EngineSettings {
            gateway_timeout: timeout,
            max_concurrent_fulfillments: config.engine.max_concurrent_fulfillments,
            circuit_breaker: BreakerSettings {
                failure_threshold: config.resiliency.failure_threshold,
                reset_timeout: Duration::from_secs(config.resiliency.reset_timeout_secs),
            },
        },
    )
    .with_events(events_tx);

    let app = app(AppState::new(Arc::new(manager)));

    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    Ok(())
}

async fn audit_log(mut rx: broadcast::Receiver<OrderEvent>) {
    loop {
        match rx.recv().await {
            Ok(event) => match serde_json::to_string(&event) {
                Ok(payload) => tracing::info!(target: "audit", order_id = %event.order_id(), "{}", payload),
                Err(e) => tracing::warn!(target: "audit", "Failed to encode event: {}", e),
            },
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(target: "audit", "Audit log fell behind, skipped {} events", skipped);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received, draining connections");
}
