//! The admission façade (§6): the API a producer (the web collaborator)
//! calls to enqueue submissions, abort in-flight ones, or manage workers.
//! Exposed both in-process (used directly by [`crate::store`] consumers in
//! the same binary) and as a small axum JSON API (§10.4).

use std::sync::Arc;

use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::registry::{AbortError, Registry};
use crate::scheduler::Scheduler;
use crate::store::ProjectionStore;

#[derive(Clone)]
pub struct Facade {
    registry: Arc<Registry>,
    store: Arc<dyn ProjectionStore>,
    scheduler: Arc<Scheduler>,
}

impl Facade {
    pub fn new(registry: Arc<Registry>, store: Arc<dyn ProjectionStore>, scheduler: Arc<Scheduler>) -> Self {
        Self {
            registry,
            store,
            scheduler,
        }
    }

    /// `submit(id) -> ok` (§6): hands the submission to the scheduler, which
    /// dispatches it immediately if a worker is eligible or holds it for
    /// reconsideration otherwise (§4.4, §5).
    pub async fn submit(&self, submission_id: i64) -> Result<(), AppError> {
        self.store
            .submission_metadata(submission_id)
            .await
            .map_err(|_| AppError::NotFound(format!("submission {submission_id} not found")))?;
        self.scheduler.submit(submission_id).await;
        Ok(())
    }

    /// `abort(id) -> ok|not_running` (§6).
    pub async fn abort(&self, submission_id: i64) -> Result<(), AbortError> {
        self.registry.abort(submission_id).await
    }

    /// `disconnect(worker_name, force) -> ok` (§6).
    pub async fn disconnect(&self, worker_name: &str, force: bool) -> bool {
        self.registry.disconnect(worker_name, force).await
    }

    /// `disable(worker_name, bool) -> ok` (§6).
    pub fn disable(&self, worker_name: &str, disabled: bool) -> bool {
        self.registry.set_disabled(worker_name, disabled)
    }
}

#[derive(Deserialize)]
struct SubmitRequest {
    submission_id: i64,
}

#[derive(Deserialize)]
struct AbortRequest {
    submission_id: i64,
}

#[derive(Deserialize)]
struct DisconnectRequest {
    worker_name: String,
    #[serde(default)]
    force: bool,
}

#[derive(Deserialize)]
struct DisableRequest {
    worker_name: String,
    disabled: bool,
}

#[derive(Serialize)]
struct OkResponse {
    ok: bool,
}

async fn submit_handler(
    State(facade): State<Facade>,
    Json(req): Json<SubmitRequest>,
) -> Result<Json<OkResponse>, AppError> {
    facade.submit(req.submission_id).await?;
    Ok(Json(OkResponse { ok: true }))
}

async fn abort_handler(
    State(facade): State<Facade>,
    Json(req): Json<AbortRequest>,
) -> Result<Json<OkResponse>, AppError> {
    facade.abort(req.submission_id).await.map_err(|_| AppError::NotRunning)?;
    Ok(Json(OkResponse { ok: true }))
}

async fn disconnect_handler(
    State(facade): State<Facade>,
    Json(req): Json<DisconnectRequest>,
) -> Result<Json<OkResponse>, AppError> {
    let ok = facade.disconnect(&req.worker_name, req.force).await;
    if !ok {
        return Err(AppError::NotFound(format!("worker {} is not connected", req.worker_name)));
    }
    Ok(Json(OkResponse { ok: true }))
}

async fn disable_handler(
    State(facade): State<Facade>,
    Json(req): Json<DisableRequest>,
) -> Result<Json<OkResponse>, AppError> {
    let ok = facade.disable(&req.worker_name, req.disabled);
    if !ok {
        return Err(AppError::NotFound(format!("worker {} is not connected", req.worker_name)));
    }
    Ok(Json(OkResponse { ok: true }))
}

pub fn router(facade: Facade) -> Router {
    Router::new()
        .route("/submissions/submit", post(submit_handler))
        .route("/submissions/abort", post(abort_handler))
        .route("/workers/disconnect", post(disconnect_handler))
        .route("/workers/disable", post(disable_handler))
        .with_state(facade)
}

