//! HTTP progress surface
//!
//! Routes:
//! - `GET /progress` - current [`Status`](crate::Status) as JSON
//! - `GET /log` - raw contents of the run's log file
//! - `GET /deliverable` - JSON list of downloadable artifacts
//! - `GET /deliverable/{name}` - raw bytes of one artifact

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::extract::{Path as UrlPath, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{error, info};

use cake_common::{Error, Result};

use crate::status::{Status, StatusBoard};

/// Listing entry for one artifact
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliverableInfo {
    /// Path to fetch the artifact from, relative to the server root
    pub url: String,
    /// Extension including the dot, e.g. ".yaml"; empty if none
    pub file_extension: String,
}

/// Shared state behind the progress routes
#[derive(Debug, Clone)]
pub struct ProgressState {
    board: StatusBoard,
    log_file: Option<PathBuf>,
    deliverables: Arc<RwLock<BTreeMap<String, PathBuf>>>,
}

impl ProgressState {
    /// State serving `board`, and `log_file` under `/log`
    pub fn new(board: StatusBoard, log_file: Option<PathBuf>) -> Self {
        Self {
            board,
            log_file,
            deliverables: Arc::default(),
        }
    }

    /// The status being served
    pub fn board(&self) -> &StatusBoard {
        &self.board
    }

    /// Offer `path` for download; returns the name it is served under
    /// (the file name without its extension).
    pub fn register_deliverable(&self, path: impl Into<PathBuf>) -> String {
        let path = path.into();
        let name = deliverable_name(&path);
        self.deliverables.write().insert(name.clone(), path);
        name
    }

    fn listing(&self) -> Vec<DeliverableInfo> {
        self.deliverables
            .read()
            .iter()
            .map(|(name, path)| DeliverableInfo {
                url: format!("/deliverable/{}", name),
                file_extension: path
                    .extension()
                    .map(|e| format!(".{}", e.to_string_lossy()))
                    .unwrap_or_default(),
            })
            .collect()
    }

    fn deliverable_path(&self, name: &str) -> Option<PathBuf> {
        self.deliverables.read().get(name).cloned()
    }
}

fn deliverable_name(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// Build the progress router
pub fn progress_routes(state: ProgressState) -> Router {
    Router::new()
        .route("/progress", get(progress_handler))
        .route("/log", get(log_handler))
        .route("/deliverable", get(deliverables_handler))
        .route("/deliverable/{name}", get(deliverable_handler))
        .with_state(state)
}

async fn progress_handler(State(state): State<ProgressState>) -> Json<Status> {
    Json(state.board.snapshot())
}

async fn log_handler(State(state): State<ProgressState>) -> Response {
    let Some(path) = state.log_file.as_ref() else {
        return (StatusCode::NOT_FOUND, "no log file configured").into_response();
    };
    match tokio::fs::read(path).await {
        Ok(bytes) => ([(header::CONTENT_TYPE, "text/plain; charset=utf-8")], bytes).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to read {}: {}", path.display(), e),
        )
            .into_response(),
    }
}

async fn deliverables_handler(State(state): State<ProgressState>) -> Json<Vec<DeliverableInfo>> {
    Json(state.listing())
}

async fn deliverable_handler(
    State(state): State<ProgressState>,
    UrlPath(name): UrlPath<String>,
) -> Response {
    let Some(path) = state.deliverable_path(&name) else {
        return (StatusCode::NOT_FOUND, format!("no deliverable named '{}'", name)).into_response();
    };
    match tokio::fs::read(&path).await {
        Ok(bytes) => (
            [(header::CONTENT_TYPE, "application/octet-stream")],
            bytes,
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to read {}: {}", path.display(), e),
        )
            .into_response(),
    }
}

/// Bind `addr` and serve the progress routes on a background task.
///
/// Binding happens before returning so a port conflict surfaces to the caller.
pub async fn spawn_progress_server(
    addr: SocketAddr,
    state: ProgressState,
) -> Result<JoinHandle<()>> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| Error::connectivity(addr.to_string(), format!("failed to bind: {e}")))?;
    info!(addr = %addr, "Progress server started");
    Ok(serve_listener(listener, state))
}

/// Serve the progress routes on an already-bound listener
pub fn serve_listener(listener: TcpListener, state: ProgressState) -> JoinHandle<()> {
    let app = progress_routes(state);
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "Progress server error");
        }
    })
}
