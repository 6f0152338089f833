mod config;
mod database;
mod entity;
mod error;
mod events;
mod facade;
mod listener;
mod registry;
mod scheduler;
mod session;
mod state;
mod store;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::http::{HeaderName, Method};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing::{Level, info};

use crate::config::AppConfig;
use crate::events::Publisher;
use crate::facade::Facade;
use crate::registry::Registry;
use crate::scheduler::Scheduler;
use crate::state::AppState;
use crate::store::{ProjectionStore, SeaOrmStore};

/// Build the admission façade's HTTP router (§10.4). The worker-facing TCP
/// listener is served separately by [`listener::serve`].
fn build_router(state: AppState) -> axum::Router {
    let facade = Facade::new(state.registry.clone(), state.store.clone(), state.scheduler.clone());

    let allow_origin = if state.config.server.cors.allow_origins.is_empty() {
        AllowOrigin::any()
    } else {
        let origins: Vec<_> = state
            .config
            .server
            .cors
            .allow_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        AllowOrigin::list(origins)
    };

    let cors = CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([HeaderName::from_static("content-type")])
        .max_age(Duration::from_secs(state.config.server.cors.max_age));

    axum::Router::new()
        .nest("/api/v1", facade::router(facade))
        .layer(cors)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .with_target(false)
        .init();

    let app_config = AppConfig::load().context("Failed to load configuration")?;

    let db = database::init_db(&app_config.database.url).await?;

    let registry = Arc::new(Registry::new());
    let store: Arc<dyn ProjectionStore> = Arc::new(SeaOrmStore::new(db.clone()));
    let publisher = Arc::new(Publisher::new(
        app_config.event.secret.clone().into_bytes(),
        app_config.bridge.update_rate_limit,
        app_config.bridge.update_rate_window(),
    ));
    let bridge_config = Arc::new(app_config.bridge.clone());
    let scheduler = Scheduler::new(registry.clone(), store.clone(), publisher.clone());

    let state = AppState {
        db,
        config: app_config.clone(),
        registry: registry.clone(),
        store: store.clone(),
        publisher: publisher.clone(),
        scheduler: scheduler.clone(),
    };

    let app = build_router(state);

    let scheduler_task = tokio::spawn(scheduler.run());

    let addr_str = format!("{}:{}", app_config.server.host, app_config.server.port);
    let addr: SocketAddr = addr_str
        .parse()
        .with_context(|| format!("Invalid server address: {}", addr_str))?;

    let judge_listener = {
        let registry = registry.clone();
        let store = store.clone();
        let publisher = publisher.clone();
        let bind_address = app_config.server.judge_bind_address.clone();
        tokio::spawn(async move {
            if let Err(err) = listener::serve(&bind_address, registry, store, publisher, bridge_config).await {
                tracing::error!(%err, "judge listener exited");
            }
        })
    };

    info!("Admission façade running at http://{}", addr);
    let http_listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    tokio::select! {
        result = axum::serve(http_listener, app) => {
            result.context("Admission façade runtime error")?;
        }
        _ = judge_listener => {}
        _ = scheduler_task => {
            tracing::error!("scheduler task exited unexpectedly");
        }
    }

    Ok(())
}
