//! Axum JSON surface: status, stats, pending listings, manual ingestion and moderation.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use prsf_core::{Destination, ListingId, ListingState};
use prsf_storage::{ListingStore, StoreError};
use prsf_sync::{status_report, IngestionRunner, SweepError, Sweeper, SyncService, Trigger};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{info, warn};

#[derive(Clone)]
pub struct AppState {
    pub store: ListingStore,
    pub runner: Arc<IngestionRunner>,
    pub sweeper: Arc<Sweeper>,
    pub scheduler_enabled: bool,
}

impl AppState {
    pub fn new(store: ListingStore, runner: Arc<IngestionRunner>, sweeper: Arc<Sweeper>) -> Self {
        Self {
            store,
            runner,
            sweeper,
            scheduler_enabled: false,
        }
    }

    pub fn from_service(service: &SyncService) -> Self {
        Self {
            scheduler_enabled: service.config.scheduler_enabled,
            ..Self::new(service.store.clone(), service.runner.clone(), service.sweeper.clone())
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct PendingQuery {
    limit: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct ApproveQuery {
    destination: Option<String>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/status", get(status_handler))
        .route("/stats", get(stats_handler))
        .route("/listings/pending", get(pending_handler))
        .route("/listings/{id}", get(listing_handler))
        .route("/listings/{id}/approve", post(approve_handler))
        .route("/listings/{id}/reject", post(reject_handler))
        .route("/ingest", post(ingest_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(service: &SyncService) -> anyhow::Result<()> {
    let port = service.config.web_port;
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "web surface listening");
    axum::serve(listener, app(AppState::from_service(service))).await?;
    Ok(())
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let service = SyncService::from_env().await?;
    serve(&service).await
}

async fn status_handler(State(state): State<Arc<AppState>>) -> Response {
    let report = status_report(&state.store, &state.runner, Some(&state.sweeper), state.scheduler_enabled).await;
    Json(report).into_response()
}

async fn stats_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.store.stats().await {
        Ok(stats) => Json(stats).into_response(),
        Err(err) => server_error(err.into()),
    }
}

async fn pending_handler(State(state): State<Arc<AppState>>, Query(query): Query<PendingQuery>) -> Response {
    match state.store.pending_listings().await {
        Ok(pending) => {
            let total = pending.len();
            let limit = query.limit.unwrap_or(50).max(1);
            let listings = pending.into_iter().take(limit).collect::<Vec<_>>();
            Json(json!({ "total": total, "listings": listings })).into_response()
        }
        Err(err) => server_error(err.into()),
    }
}

async fn listing_handler(State(state): State<Arc<AppState>>, Path(id): Path<ListingId>) -> Response {
    let found = async {
        let Some(listing) = state.store.listing(id).await? else {
            return Ok::<_, StoreError>(None);
        };
        let listing_state = state.store.listing_state(id).await?;
        let card = state.store.moderation_card(id).await?;
        Ok(Some((listing, listing_state, card)))
    };
    match found.await {
        Ok(Some((listing, listing_state, card))) => {
            Json(json!({ "listing": listing, "state": listing_state, "moderation_card": card })).into_response()
        }
        Ok(None) => not_found(id),
        Err(err) => server_error(err.into()),
    }
}

async fn approve_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<ListingId>,
    Query(query): Query<ApproveQuery>,
) -> Response {
    let destination = query
        .destination
        .filter(|d| !d.trim().is_empty())
        .map(Destination::new);
    match state.sweeper.approve(id, destination).await {
        Ok(posted) => moderation_result(&state, id, posted).await,
        Err(SweepError::Store(StoreError::NotFound(_))) => not_found(id),
        Err(err @ SweepError::NoDestination(_)) => {
            (StatusCode::UNPROCESSABLE_ENTITY, Json(json!({ "error": err.to_string() }))).into_response()
        }
        Err(err @ SweepError::Publish(_)) => {
            warn!(listing_id = id, error = %err, "manual approve publish failed");
            (StatusCode::BAD_GATEWAY, Json(json!({ "error": err.to_string() }))).into_response()
        }
        Err(err) => server_error(err.into()),
    }
}

async fn reject_handler(State(state): State<Arc<AppState>>, Path(id): Path<ListingId>) -> Response {
    match state.sweeper.reject(id).await {
        Ok(rejected) => moderation_result(&state, id, rejected).await,
        Err(StoreError::NotFound(_)) => not_found(id),
        Err(err) => server_error(err.into()),
    }
}

async fn ingest_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.runner.trigger(Trigger::Manual).await {
        Ok(Some(summary)) => Json(summary).into_response(),
        Ok(None) => (StatusCode::CONFLICT, Json(json!({ "skipped": true }))).into_response(),
        Err(err) => server_error(err.into()),
    }
}

/// `changed == false` means the listing was no longer pending.
async fn moderation_result(state: &AppState, id: ListingId, changed: bool) -> Response {
    let listing_state = state.store.listing_state(id).await.unwrap_or_else(|err| {
        warn!(listing_id = id, error = %err, "reading listing state failed");
        ListingState::Pending
    });
    let status = if changed { StatusCode::OK } else { StatusCode::CONFLICT };
    (status, Json(json!({ "changed": changed, "state": listing_state }))).into_response()
}

fn not_found(id: ListingId) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "error": format!("listing {id} not found") })),
    )
        .into_response()
}

fn server_error(err: anyhow::Error) -> Response {
    warn!(error = %err, "request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": err.to_string() })),
    )
        .into_response()
}
