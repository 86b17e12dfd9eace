//! HTTP surface of the blob server.
//!
//! Three endpoints: `GET /fetch` (single entry, or directory listing
//! when the path carries a trailing slash), `POST /batch-upload`, and
//! `POST /sync`. Bodies are decoded by hand so malformed JSON is
//! always a 400.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use tokio::sync::watch;
use tower_http::trace::{DefaultOnFailure, DefaultOnResponse, TraceLayer};
use tower_http::LatencyUnit;

use lazyfs_common::{Entry, SyncEntry, SyncResponse};

use crate::store::{Store, StoreError};

pub fn router(store: Arc<Store>) -> Router {
    Router::new()
        .route("/fetch", get(fetch))
        .route("/batch-upload", post(batch_upload))
        .route("/sync", post(sync))
        .with_state(store)
}

/// Serve the router until the shutdown channel fires.
pub async fn run(
    listen_addr: SocketAddr,
    store: Arc<Store>,
    mut shutdown_rx: watch::Receiver<()>,
) -> Result<(), HttpServerError> {
    let trace_layer = TraceLayer::new_for_http()
        .on_response(
            DefaultOnResponse::new()
                .include_headers(false)
                .latency_unit(LatencyUnit::Micros),
        )
        .on_failure(DefaultOnFailure::new().latency_unit(LatencyUnit::Micros));

    let app = router(store).layer(trace_layer);

    tracing::info!(addr = ?listen_addr, "blob server listening");
    let listener = tokio::net::TcpListener::bind(listen_addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.changed().await;
        })
        .await?;

    Ok(())
}

#[derive(Debug, Deserialize)]
struct FetchParams {
    filepath: Option<String>,
}

async fn fetch(
    State(store): State<Arc<Store>>,
    Query(params): Query<FetchParams>,
) -> Result<Response, ApiError> {
    let filepath = match params.filepath.as_deref() {
        Some(p) if !p.is_empty() => p,
        _ => return Err(ApiError::MissingFilepath),
    };

    if filepath.ends_with('/') {
        let listing = store
            .fetch_dir(filepath)
            .await?
            .ok_or(ApiError::NotFound)?;
        return Ok(Json(listing).into_response());
    }

    let entry = store
        .fetch_entry(filepath)
        .await?
        .ok_or(ApiError::NotFound)?;
    Ok(Json(entry).into_response())
}

async fn batch_upload(
    State(store): State<Arc<Store>>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let entries: Vec<Entry> = serde_json::from_slice(&body).map_err(ApiError::InvalidJson)?;
    let stored = store.upload(entries).await?;
    Ok(format!("stored={stored}").into_response())
}

async fn sync(State(store): State<Arc<Store>>, body: Bytes) -> Result<Response, ApiError> {
    let offered: Vec<SyncEntry> = serde_json::from_slice(&body).map_err(ApiError::InvalidJson)?;
    let need_upload = store.need_upload(&offered).await;
    Ok(Json(SyncResponse { need_upload }).into_response())
}

#[derive(Debug, thiserror::Error)]
enum ApiError {
    #[error("filepath is required")]
    MissingFilepath,

    #[error("Not found")]
    NotFound,

    #[error("Invalid JSON: {0}")]
    InvalidJson(serde_json::Error),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::MissingFilepath | ApiError::InvalidJson(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self, "request failed");
        }
        (status, self.to_string()).into_response()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum HttpServerError {
    #[error("an error occurred running the HTTP server: {0}")]
    ServingFailed(#[from] std::io::Error),
}
