//! Read-only HTTP surface for operators and downstream pollers, plus the
//! manual quarantine reset.

use std::sync::Arc;

use axum::{
    extract::{rejection::QueryRejection, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tower_http::cors::CorsLayer;

use crate::coordinator::Coordinator;
use crate::metrics::Metrics;
use crate::store::{Cursor, StoreError};

const DEFAULT_PAGE: usize = 100;

#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<Coordinator>,
    pub metrics: Option<Metrics>,
}

impl AppState {
    pub fn new(coordinator: Arc<Coordinator>) -> Self {
        Self {
            coordinator,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }
}

pub fn create_router(state: AppState) -> Router {
    let metrics_routes = state.metrics.as_ref().map(Metrics::router);

    let mut router = Router::new()
        .route("/health", get(health))
        .route("/records", get(records))
        .route("/late", get(late))
        .route("/admin/sources/{id}/reset", post(reset_source))
        .layer(CorsLayer::very_permissive())
        .with_state(state);

    if let Some(m) = metrics_routes {
        router = router.merge(m);
    }
    router
}

/// Error body shared by every route: `{"error": "..."}`.
struct ApiError(StatusCode, String);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, Json(serde_json::json!({ "error": self.1 }))).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::InvalidCursor(_) => ApiError(StatusCode::BAD_REQUEST, e.to_string()),
            other => {
                tracing::error!(target: "pipeline", error = %other, "store read failed");
                ApiError(StatusCode::INTERNAL_SERVER_ERROR, "storage error".into())
            }
        }
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rej: QueryRejection) -> Self {
        ApiError(rej.status(), rej.body_text())
    }
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.coordinator.health())
}

#[derive(Debug, Deserialize)]
struct RecordsQuery {
    entity: String,
    #[serde(default)]
    start: Option<DateTime<Utc>>,
    #[serde(default)]
    end: Option<DateTime<Utc>>,
    #[serde(default)]
    cursor: Option<String>,
    #[serde(default)]
    limit: Option<usize>,
}

async fn records(
    State(state): State<AppState>,
    query: Result<Query<RecordsQuery>, QueryRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Query(q) = query?;
    let entity = q.entity.trim().to_ascii_uppercase();
    if entity.is_empty() {
        return Err(ApiError(StatusCode::BAD_REQUEST, "entity must not be empty".into()));
    }
    let cursor = q
        .cursor
        .as_deref()
        .filter(|c| !c.is_empty())
        .map(str::parse::<Cursor>)
        .transpose()?;
    let page = state.coordinator.store().read_range(
        &entity,
        q.start,
        q.end,
        cursor,
        q.limit.unwrap_or(DEFAULT_PAGE),
    )?;
    Ok(Json(page))
}

#[derive(Debug, Deserialize)]
struct LateQuery {
    #[serde(default)]
    entity: Option<String>,
    #[serde(default)]
    limit: Option<usize>,
}

async fn late(
    State(state): State<AppState>,
    query: Result<Query<LateQuery>, QueryRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Query(q) = query?;
    let entity = q.entity.map(|e| e.trim().to_ascii_uppercase());
    let rows = state
        .coordinator
        .store()
        .read_late(entity.as_deref(), q.limit.unwrap_or(DEFAULT_PAGE))?;
    Ok(Json(rows))
}

async fn reset_source(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    if !state.coordinator.reset_source(&id) {
        return Err(ApiError(
            StatusCode::NOT_FOUND,
            format!("unknown source '{id}'"),
        ));
    }
    Ok(Json(serde_json::json!({ "source_id": id, "reset": true })))
}
