//! Read-only query surface.
//!
//! List and single-record endpoints over every record kind, plus /health.
//! Strictly observational: nothing here mutates a record, and listing an
//! in-flight record shows whatever checkpoint it last wrote.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::db::ListFilter;
use crate::records::{RecordKind, RecordStatus};
use crate::tasks::RunnerStats;
use crate::AppState;

#[derive(Debug, Deserialize, Default)]
pub struct ListQuery {
    pub status: Option<String>,
    pub repo: Option<String>,
    pub limit: Option<usize>,
}

impl ListQuery {
    fn into_filter(self) -> Result<ListFilter, StatusCode> {
        let status = match self.status.as_deref() {
            None => None,
            // An invalid status filter is a client error, not an empty list.
            Some(s) => Some(RecordStatus::parse(s).map_err(|_| StatusCode::BAD_REQUEST)?),
        };
        Ok(ListFilter {
            status,
            repo: self.repo,
            limit: self.limit,
        })
    }
}

#[derive(Debug, Serialize)]
pub struct ListResponse<T: Serialize> {
    pub total: u64,
    pub stats: HashMap<String, u64>,
    pub records: Vec<T>,
}

fn internal<E: std::fmt::Display>(e: E) -> StatusCode {
    error!("Query surface storage error: {}", e);
    StatusCode::INTERNAL_SERVER_ERROR
}

async fn list_copies(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> Result<Json<ListResponse<crate::records::CopyRecord>>, StatusCode> {
    let filter = query.into_filter()?;
    Ok(Json(ListResponse {
        total: state.db.count(RecordKind::Copy).map_err(internal)?,
        stats: state.db.stats(RecordKind::Copy.table()).map_err(internal)?,
        records: state.db.list_copies(&filter).map_err(internal)?,
    }))
}

async fn get_copy(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<crate::records::CopyRecord>, StatusCode> {
    state
        .db
        .get_copy(&id)
        .map_err(internal)?
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

async fn list_reviews(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> Result<Json<ListResponse<crate::records::ReviewTask>>, StatusCode> {
    let filter = query.into_filter()?;
    Ok(Json(ListResponse {
        total: state.db.count(RecordKind::Review).map_err(internal)?,
        stats: state
            .db
            .stats(RecordKind::Review.table())
            .map_err(internal)?,
        records: state.db.list_reviews(&filter).map_err(internal)?,
    }))
}

async fn get_review(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<crate::records::ReviewTask>, StatusCode> {
    state
        .db
        .get_review(&id)
        .map_err(internal)?
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

async fn list_scores(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> Result<Json<ListResponse<crate::records::ScoreRecord>>, StatusCode> {
    let filter = query.into_filter()?;
    Ok(Json(ListResponse {
        total: state.db.count(RecordKind::Score).map_err(internal)?,
        stats: state
            .db
            .stats(RecordKind::Score.table())
            .map_err(internal)?,
        records: state.db.list_scores(&filter).map_err(internal)?,
    }))
}

async fn get_score(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<crate::records::ScoreRecord>, StatusCode> {
    state
        .db
        .get_score(&id)
        .map_err(internal)?
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

async fn list_comment_syncs(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> Result<Json<ListResponse<crate::records::CommentSyncRecord>>, StatusCode> {
    let filter = query.into_filter()?;
    Ok(Json(ListResponse {
        total: state.db.count(RecordKind::CommentSync).map_err(internal)?,
        stats: state
            .db
            .stats(RecordKind::CommentSync.table())
            .map_err(internal)?,
        records: state.db.list_comment_syncs(&filter).map_err(internal)?,
    }))
}

async fn get_comment_sync(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<crate::records::CommentSyncRecord>, StatusCode> {
    state
        .db
        .get_comment_sync(&id)
        .map_err(internal)?
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

async fn list_events(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> Result<Json<ListResponse<crate::records::WebhookEventRecord>>, StatusCode> {
    // Audit rows have their own outcome vocabulary; the status filter does
    // not apply to them.
    if query.status.is_some() {
        return Err(StatusCode::BAD_REQUEST);
    }
    let filter = ListFilter {
        status: None,
        repo: query.repo,
        limit: query.limit,
    };
    Ok(Json(ListResponse {
        total: state.db.count_events().map_err(internal)?,
        stats: state.db.stats("webhook_events").map_err(internal)?,
        records: state.db.list_webhook_events(&filter).map_err(internal)?,
    }))
}

async fn get_event(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<crate::records::WebhookEventRecord>, StatusCode> {
    state
        .db
        .get_webhook_event(&id)
        .map_err(internal)?
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
    version: &'static str,
    runner: RunnerStats,
}

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        service: "octorelay",
        version: octorelay_core::service_version(),
        runner: state.runner.stats(),
    })
}

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/health", get(health))
        .route("/api/copies", get(list_copies))
        .route("/api/copies/:id", get(get_copy))
        .route("/api/tasks", get(list_reviews))
        .route("/api/tasks/:id", get(get_review))
        .route("/api/scores", get(list_scores))
        .route("/api/scores/:id", get(get_score))
        .route("/api/comment-syncs", get(list_comment_syncs))
        .route("/api/comment-syncs/:id", get(get_comment_sync))
        .route("/api/events", get(list_events))
        .route("/api/events/:id", get(get_event))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_list_query_filter_conversion() {
        let query = ListQuery {
            status: Some("completed".to_string()),
            repo: Some("acme/public".to_string()),
            limit: Some(10),
        };
        let filter = query.into_filter().unwrap();
        assert_eq!(filter.status, Some(RecordStatus::Completed));
        assert_eq!(filter.repo.as_deref(), Some("acme/public"));
        assert_eq!(filter.limit, Some(10));
    }

    #[test]
    fn test_invalid_status_filter_is_a_client_error() {
        let query = ListQuery {
            status: Some("done".to_string()),
            ..Default::default()
        };
        assert_eq!(query.into_filter().unwrap_err(), StatusCode::BAD_REQUEST);
    }
}
