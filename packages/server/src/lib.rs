pub mod config;
pub mod database;
pub mod entity;
pub mod error;
pub mod events;
pub mod facade;
pub mod listener;
pub mod registry;
pub mod scheduler;
pub mod session;
pub mod state;
pub mod store;

use axum::http::{HeaderName, Method};
use tower_http::cors::{AllowOrigin, CorsLayer};

use crate::facade::Facade;
use crate::state::AppState;

/// Build the admission façade's HTTP router (§10.4). The worker-facing TCP
/// listener is served separately by [`listener::serve`].
pub fn build_router(state: AppState) -> axum::Router {
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
        .max_age(std::time::Duration::from_secs(state.config.server.cors.max_age));

    axum::Router::new()
        .nest("/api/v1", facade::router(facade))
        .layer(cors)
}
