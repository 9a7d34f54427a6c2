//! HTTP API over stored profiling runs (read and maintenance only).

use crate::errors::StoreError;
use crate::profiling::{normalize_tags, ProfilingRun, RunOverview, RunSummary};
use crate::store::{export_run, ExportFormat, ProfileStore, RunFilter, SortKey, SortOrder};
use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

#[derive(Clone)]
pub struct ServerState {
    pub store: Arc<dyn ProfileStore>,
}

/// Query string of `GET /runs`. `tags` is comma-separated.
#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    pub model: Option<String>,
    pub tags: Option<String>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub experiment: Option<String>,
    pub sort_by: Option<SortKey>,
    pub order: Option<SortOrder>,
    pub offset: Option<u32>,
    pub limit: Option<u32>,
}

impl ListQuery {
    pub fn into_filter(self) -> RunFilter {
        RunFilter {
            model: self.model,
            tags: self
                .tags
                .map(|t| normalize_tags(t.split(',')))
                .unwrap_or_default(),
            from: self.from,
            to: self.to,
            experiment: self.experiment,
            sort_by: self.sort_by.unwrap_or_default(),
            sort_order: self.order.unwrap_or_default(),
            offset: self.offset.unwrap_or(0),
            limit: self.limit,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ExportQuery {
    pub format: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CleanupQuery {
    pub older_than_days: u32,
}

#[derive(Debug, Serialize)]
pub struct RunsResponse {
    pub runs: Vec<RunOverview>,
    pub count: usize,
}

#[derive(Debug, Serialize)]
pub struct SummaryResponse {
    pub run: RunOverview,
    pub summary: RunSummary,
}

#[derive(Debug, Serialize)]
pub struct DeletedResponse {
    pub deleted: u64,
}

pub fn router(store: Arc<dyn ProfileStore>) -> Router {
    let state = Arc::new(ServerState { store });
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(health_check))
        .route("/health", get(health_check))
        .route("/runs", get(list_runs))
        .route("/runs/cleanup", post(cleanup_runs))
        .route("/runs/:id", get(get_run).delete(delete_run))
        .route("/runs/:id/summary", get(run_summary))
        .route("/runs/:id/export", get(export))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}

/// Serve the API on `0.0.0.0:port` until the process is stopped.
pub async fn run_server(store: Arc<dyn ProfileStore>, port: u16) -> std::io::Result<()> {
    let app = router(store);
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Profile API running on http://{}", addr);
    axum::serve(listener, app).await
}

pub async fn health_check() -> &'static str {
    "OK"
}

pub async fn list_runs(
    State(state): State<Arc<ServerState>>,
    Query(query): Query<ListQuery>,
) -> Result<Json<RunsResponse>, ApiError> {
    let runs = state.store.list(&query.into_filter()).await?;
    Ok(Json(RunsResponse {
        count: runs.len(),
        runs,
    }))
}

pub async fn get_run(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<ProfilingRun>, ApiError> {
    state
        .store
        .get(id)
        .await?
        .map(Json)
        .ok_or(ApiError::NotFound(id))
}

pub async fn run_summary(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<SummaryResponse>, ApiError> {
    let run = state
        .store
        .summarize(id)
        .await?
        .ok_or(ApiError::NotFound(id))?;
    Ok(Json(SummaryResponse {
        summary: run.summary.clone(),
        run,
    }))
}

pub async fn export(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<Uuid>,
    Query(query): Query<ExportQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let format = match query.format.as_deref() {
        Some(f) => f.parse::<ExportFormat>().map_err(ApiError::BadRequest)?,
        None => ExportFormat::default(),
    };
    let run = state.store.get(id).await?.ok_or(ApiError::NotFound(id))?;
    let body = export_run(&run, format)?;
    let disposition = format!("attachment; filename=\"run-{id}.{}\"", format.extension());
    Ok((
        [
            (header::CONTENT_TYPE, format.content_type().to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        body,
    ))
}

pub async fn delete_run(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    if state.store.delete(id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound(id))
    }
}

pub async fn cleanup_runs(
    State(state): State<Arc<ServerState>>,
    Query(query): Query<CleanupQuery>,
) -> Result<Json<DeletedResponse>, ApiError> {
    let deleted = state
        .store
        .cleanup(chrono::Duration::days(i64::from(query.older_than_days)))
        .await?;
    Ok(Json(DeletedResponse { deleted }))
}

#[derive(Debug)]
pub enum ApiError {
    NotFound(Uuid),
    BadRequest(String),
    Store(StoreError),
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        ApiError::Store(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let (status, message) = match self {
            ApiError::NotFound(id) => (StatusCode::NOT_FOUND, format!("run {id} not found")),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Store(e @ StoreError::StorageUnavailable { .. }) => {
                tracing::error!(error = %e, "store unavailable");
                (StatusCode::SERVICE_UNAVAILABLE, e.to_string())
            }
            ApiError::Store(e) => {
                tracing::error!(error = %e, "store query failed");
                (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
            }
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn list_query_splits_and_normalizes_tags() {
        let q = ListQuery {
            tags: Some(" b,a,,b ".to_string()),
            limit: Some(5),
            ..Default::default()
        };
        let f = q.into_filter();
        assert_eq!(f.tags, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(f.limit, Some(5));
        assert_eq!(f.sort_by, SortKey::Date);
        assert_eq!(f.sort_order, SortOrder::Desc);
    }

    #[test]
    fn error_statuses() {
        let r = ApiError::NotFound(Uuid::nil()).into_response();
        assert_eq!(r.status(), StatusCode::NOT_FOUND);
        let r = ApiError::BadRequest("bad".into()).into_response();
        assert_eq!(r.status(), StatusCode::BAD_REQUEST);
    }
}
