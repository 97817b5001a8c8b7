//! HTTP route handlers. Engine calls run on the blocking pool.

use crate::engine::{Engine, EngineStats};
use crate::error::VexError;
use crate::metrics::MetricsSnapshot;
use crate::record::{SearchHit, VectorRecord};
use crate::server::AppState;
use crate::CompactionReport;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

// --- Request/Response types ---

#[derive(Debug, Deserialize)]
pub struct InsertRequest {
    pub id: u64,
    pub vector: Vec<f32>,
    /// Stored as UTF-8 bytes.
    pub payload: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SearchRequest {
    pub vector: Vec<f32>,
    pub k: Option<u32>,
    pub ef: Option<u32>,
    #[serde(default)]
    pub include_records: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SearchResultResponse {
    pub id: u64,
    pub score: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record: Option<VectorResponse>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct VectorResponse {
    pub id: u64,
    pub vector: Vec<f32>,
    pub payload: String,
}

impl From<VectorRecord> for VectorResponse {
    fn from(record: VectorRecord) -> Self {
        Self {
            id: record.id,
            vector: record.vector,
            payload: String::from_utf8_lossy(&record.payload).into_owned(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version_id: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FlushResponse {
    pub version_id: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, error: String) -> ApiError {
    (status, Json(ErrorResponse { error }))
}

fn status_for(e: &VexError) -> StatusCode {
    match e {
        e if e.is_validation() => StatusCode::BAD_REQUEST,
        VexError::NotFound { .. } => StatusCode::NOT_FOUND,
        VexError::EngineNotReady | VexError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        VexError::Cancelled => StatusCode::REQUEST_TIMEOUT,
        VexError::CompactionAborted(_) => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Run an engine call on the blocking pool and map its error to a status.
async fn blocking<T, F>(state: &AppState, f: F) -> Result<T, ApiError>
where
    F: FnOnce(&Engine) -> crate::error::Result<T> + Send + 'static,
    T: Send + 'static,
{
    let engine = Arc::clone(&state.engine);
    tokio::task::spawn_blocking(move || f(&engine))
        .await
        .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?
        .map_err(|e| api_error(status_for(&e), e.to_string()))
}

// --- Router ---

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/vectors", post(insert_vector))
        .route("/vectors/:id", get(get_vector).delete(delete_vector))
        .route("/search", post(search_vectors))
        .route("/flush", post(flush))
        .route("/compact", post(compact))
        .route("/health", get(health))
        .route("/stats", get(stats))
        .route("/metrics", get(get_metrics))
        .with_state(state)
}

// --- Handlers ---

async fn insert_vector(
    State(state): State<Arc<AppState>>,
    Json(req): Json<InsertRequest>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    let id = req.id;
    let payload = req.payload.map(String::into_bytes).unwrap_or_default();
    blocking(&state, move |engine| {
        engine.insert_with_payload(id, req.vector, payload)
    })
    .await?;

    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({"id": id, "status": "inserted"})),
    ))
}

async fn get_vector(
    State(state): State<Arc<AppState>>,
    Path(id): Path<u64>,
) -> Result<Json<VectorResponse>, ApiError> {
    match blocking(&state, move |engine| engine.get(id)).await? {
        Some(record) => Ok(Json(record.into())),
        None => Err(api_error(
            StatusCode::NOT_FOUND,
            VexError::NotFound { id }.to_string(),
        )),
    }
}

async fn delete_vector(
    State(state): State<Arc<AppState>>,
    Path(id): Path<u64>,
) -> Result<Json<serde_json::Value>, ApiError> {
    blocking(&state, move |engine| engine.delete(id)).await?;
    Ok(Json(serde_json::json!({"id": id, "status": "deleted"})))
}

async fn search_vectors(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SearchRequest>,
) -> Result<Json<Vec<SearchResultResponse>>, ApiError> {
    let k = req.k.unwrap_or(10);
    let (vector, ef) = (req.vector, req.ef);

    let response = if req.include_records {
        blocking(&state, move |engine| engine.search_with_records(&vector, k, ef))
            .await?
            .into_iter()
            .map(|(hit, record)| SearchResultResponse {
                id: hit.id,
                score: hit.score,
                record: Some(record.into()),
            })
            .collect()
    } else {
        blocking(&state, move |engine| engine.search(&vector, k, ef))
            .await?
            .into_iter()
            .map(|SearchHit { id, score }| SearchResultResponse {
                id,
                score,
                record: None,
            })
            .collect()
    };
    Ok(Json(response))
}

async fn flush(State(state): State<Arc<AppState>>) -> Result<Json<FlushResponse>, ApiError> {
    let version_id = blocking(&state, |engine| {
        engine.flush()?;
        Ok(engine.current_version().version_id)
    })
    .await?;
    Ok(Json(FlushResponse { version_id }))
}

async fn compact(State(state): State<Arc<AppState>>) -> Result<Json<CompactionReport>, ApiError> {
    Ok(Json(blocking(&state, |engine| engine.compact()).await?))
}

async fn health(State(state): State<Arc<AppState>>) -> (StatusCode, Json<HealthResponse>) {
    let healthy = blocking(&state, |engine| Ok(engine.health_check()))
        .await
        .unwrap_or(false);
    let (status, label) = if healthy {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "unavailable")
    };
    (
        status,
        Json(HealthResponse {
            status: label.to_string(),
            version_id: state.engine.current_version().version_id,
        }),
    )
}

async fn stats(State(state): State<Arc<AppState>>) -> Json<EngineStats> {
    Json(state.engine.stats())
}

async fn get_metrics(State(state): State<Arc<AppState>>) -> Json<MetricsSnapshot> {
    Json(state.engine.metrics())
}
