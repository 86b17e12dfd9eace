//! Control-plane HTTP server, co-resident with the FUSE mount.
//!
//! `POST /run` turns an uploaded script name into a container run
//! against the mounted tree; it is also the point where the negative
//! lookup cache is cleared, so files uploaded between runs become
//! visible. `GET /stats` serves the run history.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tower_http::trace::{DefaultOnFailure, DefaultOnResponse, TraceLayer};
use tower_http::LatencyUnit;
use uuid::Uuid;

use crate::database::{Database, NewRun, RunRecord};
use crate::fuse::FsCore;
use crate::runc::{self, RunError};

#[derive(Clone)]
pub struct AppState {
    core: Arc<FsCore>,
    db: Database,
    /// Absolute path of the mounted `app` directory, used as the
    /// container rootfs.
    rootfs: PathBuf,
}

impl AppState {
    pub fn new(core: Arc<FsCore>, db: Database, rootfs: PathBuf) -> Self {
        Self { core, db, rootfs }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/run", post(run))
        .route("/stats", get(stats))
        .with_state(state)
}

/// Serve the control plane until the shutdown channel fires.
pub async fn run_server(
    listen_addr: SocketAddr,
    state: AppState,
    mut shutdown_rx: watch::Receiver<()>,
) -> Result<(), HttpServerError> {
    let trace_layer = TraceLayer::new_for_http()
        .on_response(
            DefaultOnResponse::new()
                .include_headers(false)
                .latency_unit(LatencyUnit::Micros),
        )
        .on_failure(DefaultOnFailure::new().latency_unit(LatencyUnit::Micros));

    let app = router(state).layer(trace_layer);

    tracing::info!(addr = ?listen_addr, "control plane listening");
    let listener = tokio::net::TcpListener::bind(listen_addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.changed().await;
        })
        .await?;

    Ok(())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RunRequest {
    pub file_name: String,
    #[serde(default)]
    pub username: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RunResponse {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub run_id: i64,
}

async fn run(State(state): State<AppState>, body: Bytes) -> Result<Response, ApiError> {
    let request: RunRequest = serde_json::from_slice(&body).map_err(ApiError::InvalidJson)?;
    if !valid_filename(&request.file_name) {
        return Err(ApiError::InvalidFilename);
    }

    // Files uploaded since the previous run must be reachable again.
    state.core.clear_not_found();

    // Per-run bundle directory, so concurrent runs never share a
    // config.json.
    let bundle = tempfile::tempdir().map_err(ApiError::Bundle)?;
    let config = runc::oci_config(&request.file_name, &state.rootfs);
    let encoded = serde_json::to_vec_pretty(&config).expect("static config serializes");
    tokio::fs::write(bundle.path().join("config.json"), encoded)
        .await
        .map_err(ApiError::Bundle)?;

    let container_id = format!("lazyfs-{}", Uuid::new_v4());
    let started_at = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0);
    let started = Instant::now();

    tracing::info!(file = %request.file_name, %container_id, "starting container run");
    let outcome = runc::run_container(bundle.path(), &container_id).await?;

    let stats = state.core.stats.swap_and_reset();
    let run_id = match state
        .db
        .log_run(NewRun {
            filename: &request.file_name,
            started_at,
            duration_ms: started.elapsed().as_millis() as i64,
            stdout: &runc::strip_ansi(&outcome.stdout),
            stderr: &outcome.stderr,
            exit_code: outcome.exit_code,
            stats,
            username: &request.username,
        })
        .await
    {
        Ok(id) => id,
        Err(err) => {
            tracing::warn!(%err, "failed to log run");
            0
        }
    };

    Ok(Json(RunResponse {
        stdout: outcome.stdout,
        stderr: outcome.stderr,
        exit_code: outcome.exit_code,
        run_id,
    })
    .into_response())
}

async fn stats(State(state): State<AppState>) -> Result<Json<Vec<RunRecord>>, ApiError> {
    Ok(Json(state.db.all_runs().await?))
}

/// Script names come from users; only plain basenames are allowed.
fn valid_filename(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
}

#[derive(Debug, thiserror::Error)]
enum ApiError {
    #[error("Invalid JSON: {0}")]
    InvalidJson(serde_json::Error),

    #[error("invalid filename")]
    InvalidFilename,

    #[error("failed to prepare bundle: {0}")]
    Bundle(std::io::Error),

    #[error(transparent)]
    Run(#[from] RunError),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::InvalidJson(_) | ApiError::InvalidFilename => StatusCode::BAD_REQUEST,
            ApiError::Bundle(_) | ApiError::Run(_) | ApiError::Database(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self, "run request failed");
        }
        (status, self.to_string()).into_response()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum HttpServerError {
    #[error("an error occurred running the HTTP server: {0}")]
    ServingFailed(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::BlobClient;

    #[test]
    fn filename_validation() {
        assert!(valid_filename("alice_app.py"));
        assert!(valid_filename("job-2.py"));

        assert!(!valid_filename(""));
        assert!(!valid_filename("../etc/passwd"));
        assert!(!valid_filename("a b.py"));
        assert!(!valid_filename("x;rm -rf /"));
    }

    async fn test_state() -> AppState {
        let client = BlobClient::new(url::Url::parse("http://localhost:1").unwrap()).unwrap();
        let core = Arc::new(FsCore::new(
            client,
            std::env::temp_dir(),
            tokio::runtime::Handle::current(),
        ));
        let db = Database::connect("sqlite::memory:").await.unwrap();
        AppState::new(core, db, PathBuf::from("/tmp/lazyfs/app"))
    }

    async fn spawn(state: AppState) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = router(state);
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    #[tokio::test]
    async fn run_rejects_bad_requests_before_touching_runc() {
        let addr = spawn(test_state().await).await;
        let client = reqwest::Client::new();

        let resp = client
            .post(format!("http://{addr}/run"))
            .body("{broken")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);

        let resp = client
            .post(format!("http://{addr}/run"))
            .json(&serde_json::json!({"FileName": "../escape.py"}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);
        assert!(resp.text().await.unwrap().contains("invalid filename"));

        let resp = client
            .post(format!("http://{addr}/run"))
            .json(&serde_json::json!({"Username": "alice"}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);
    }

    #[tokio::test]
    async fn stats_starts_empty() {
        let addr = spawn(test_state().await).await;

        let runs: Vec<RunRecord> = reqwest::Client::new()
            .get(format!("http://{addr}/stats"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert!(runs.is_empty());
    }
}
