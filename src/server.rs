//! HTTP+JSON transport over the [`Engine`].
//!
//! [`create_router`] builds the axum router; [`serve`] binds it, optionally
//! starts the background drain loop, and shuts both down on ctrl-c.

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::engine::Engine;
use crate::error::LayerError;
use crate::ingest::{BacklogStats, BatchRecord, DrainReport};
use crate::layers::crystal::Crystal;
use crate::layers::raw::RawWindow;
use crate::layers::{LayerKind, Metadata, SearchResult};
use crate::recall::{Bundle, RecallRequest};

pub struct AppState {
    pub engine: Arc<Engine>,
    started: Instant,
}

impl AppState {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            started: Instant::now(),
        }
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.started.elapsed().as_secs()
    }
}

/// API error body: `{error, code}` with a status derived from the error kind.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: &'static str,
    #[serde(skip)]
    status: StatusCode,
}

impl ErrorResponse {
    fn not_found(what: impl Into<String>) -> Self {
        Self {
            error: what.into(),
            code: "NOT_FOUND",
            status: StatusCode::NOT_FOUND,
        }
    }
}

impl From<LayerError> for ErrorResponse {
    fn from(err: LayerError) -> Self {
        let status = match &err {
            LayerError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            LayerError::NotFound(_) => StatusCode::NOT_FOUND,
            LayerError::Conflict(_) => StatusCode::CONFLICT,
            LayerError::Unavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!(error = %err, code = err.code(), "request failed");
        } else {
            debug!(error = %err, code = err.code(), "request rejected");
        }
        Self {
            error: err.to_string(),
            code: err.code(),
            status,
        }
    }
}

impl IntoResponse for ErrorResponse {
    fn into_response(self) -> Response {
        (self.status, Json(self)).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ErrorResponse>;

fn parse_layer(name: &str) -> Result<LayerKind, ErrorResponse> {
    name.parse::<LayerKind>().map_err(ErrorResponse::from)
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub uptime_seconds: u64,
}

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        uptime_seconds: state.uptime_seconds(),
    })
}

async fn recall(
    State(state): State<Arc<AppState>>,
    Json(request): Json<RecallRequest>,
) -> ApiResult<Bundle> {
    let bundle = state.engine.recall.recall(&request).await?;
    Ok(Json(bundle))
}

#[derive(Debug, Deserialize)]
pub struct StoreRequest {
    pub content: String,
    #[serde(default)]
    pub metadata: Metadata,
}

#[derive(Debug, Serialize)]
pub struct StoreResponse {
    pub id: String,
    pub layer: LayerKind,
}

async fn store(
    State(state): State<Arc<AppState>>,
    Path(layer): Path<String>,
    Json(request): Json<StoreRequest>,
) -> ApiResult<StoreResponse> {
    let kind = parse_layer(&layer)?;
    let id = state
        .engine
        .layer(kind)
        .store(&request.content, &request.metadata)
        .await?;
    info!(layer = %kind, id = %id, "content stored");
    Ok(Json(StoreResponse { id, layer: kind }))
}

/// `after`, `center`, `total` and `ratio` select a time window of raw events
/// instead of running `query`.
#[derive(Debug, Deserialize)]
pub struct SearchRequest {
    #[serde(default)]
    pub query: String,
    pub limit: Option<usize>,
    #[serde(flatten)]
    pub window: RawWindow,
}

#[derive(Debug, Serialize)]
pub struct SearchResponse {
    pub layer: LayerKind,
    pub results: Vec<SearchResult>,
}

async fn search(
    State(state): State<Arc<AppState>>,
    Path(layer): Path<String>,
    Json(request): Json<SearchRequest>,
) -> ApiResult<SearchResponse> {
    let kind = parse_layer(&layer)?;
    let recall = &state.engine.config.recall;
    let limit = request.limit.unwrap_or(recall.default_limit_per_layer);
    if limit == 0 || limit > recall.max_limit_per_layer {
        return Err(LayerError::InvalidInput(format!(
            "limit must be between 1 and {}",
            recall.max_limit_per_layer
        ))
        .into());
    }
    let results = if request.window.is_empty() {
        state.engine.layer(kind).search(&request.query, limit).await?
    } else if kind == LayerKind::Raw {
        state.engine.raw.window(request.window, limit).await?
    } else {
        return Err(LayerError::InvalidInput(format!(
            "after, center, total and ratio only apply to the raw layer, not {kind}"
        ))
        .into());
    };
    Ok(Json(SearchResponse { layer: kind, results }))
}

#[derive(Debug, Default, Deserialize)]
pub struct DrainRequest {
    pub batch_size: Option<usize>,
}

async fn drain_backlog(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> ApiResult<DrainReport> {
    // An empty body means "use the configured batch size".
    let request: DrainRequest = if body.is_empty() {
        DrainRequest::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| LayerError::InvalidInput(format!("invalid drain request: {e}")))?
    };
    let batch_size = request
        .batch_size
        .unwrap_or(state.engine.config.ingest.batch_size);
    if batch_size == 0 {
        return Err(LayerError::InvalidInput("batch_size must be positive".into()).into());
    }
    let report = state.engine.drainer.drain(batch_size).await?;
    Ok(Json(report))
}

#[derive(Debug, Serialize)]
pub struct IngestStatsResponse {
    #[serde(flatten)]
    pub stats: BacklogStats,
    pub recent_batches: Vec<BatchRecord>,
}

async fn ingest_stats(State(state): State<Arc<AppState>>) -> ApiResult<IngestStatsResponse> {
    let backlog = &state.engine.backlog;
    let stats = backlog.stats().await?;
    let recent_batches = backlog.batches(10).await?;
    Ok(Json(IngestStatsResponse {
        stats,
        recent_batches,
    }))
}

#[derive(Debug, Deserialize)]
pub struct CrystalQuery {
    #[serde(default)]
    pub archive: bool,
    pub limit: Option<usize>,
    #[serde(default)]
    pub offset: usize,
}

#[derive(Debug, Serialize)]
pub struct CrystalsResponse {
    pub archive: bool,
    pub window: usize,
    pub crystals: Vec<Crystal>,
}

async fn crystals(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CrystalQuery>,
) -> ApiResult<CrystalsResponse> {
    let layer = &state.engine.crystal;
    let crystals = if query.archive {
        layer.archive(query.limit.unwrap_or(50), query.offset).await?
    } else {
        layer.current().await?
    };
    Ok(Json(CrystalsResponse {
        archive: query.archive,
        window: layer.window(),
        crystals,
    }))
}

#[derive(Debug, Serialize)]
pub struct DeleteResponse {
    pub id: String,
    pub deleted: bool,
}

async fn delete_edge(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<DeleteResponse> {
    if !state.engine.graph.delete_edge(&id).await? {
        return Err(ErrorResponse::not_found(format!("edge {id}")));
    }
    info!(edge = %id, "graph edge deleted");
    Ok(Json(DeleteResponse { id, deleted: true }))
}

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/recall", post(recall))
        .route("/store/{layer}", post(store))
        .route("/search/{layer}", post(search))
        .route("/ingest/backlog", post(drain_backlog))
        .route("/ingest/stats", get(ingest_stats))
        .route("/crystals", get(crystals))
        .route("/graph/edge/{id}", delete(delete_edge))
        .with_state(state)
}

/// Bind `engine.config.bind_addr()` and serve until ctrl-c.
pub async fn serve(engine: Arc<Engine>) -> anyhow::Result<()> {
    let bind_addr = engine.config.bind_addr();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let drain_loop = engine
        .config
        .ingest
        .auto_drain
        .then(|| Arc::clone(&engine.drainer).spawn_loop(shutdown_rx));

    let router = create_router(Arc::new(AppState::new(engine)));
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!(addr = %bind_addr, "strata listening at http://{bind_addr}");

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "failed to listen for ctrl-c");
                std::future::pending::<()>().await;
            }
            info!("shutting down");
        })
        .await?;

    let _ = shutdown_tx.send(true);
    if let Some(handle) = drain_loop {
        if let Err(e) = handle.await {
            warn!(error = %e, "drain loop did not stop cleanly");
        }
    }
    Ok(())
}
