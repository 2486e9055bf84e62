//! JSON API under `/api`. Every handler takes an [`AdminSession`].

use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Path as AxumPath, Query, State,
    },
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use sponsorhub_core::{AppStateDocument, Sponsor, SponsorPatch};
use sponsorhub_sync::{Reconciler, StoreError};
use thiserror::Error;
use tracing::{error, info};

use crate::session::AdminSession;
use crate::AppState;

/// Lines returned by the applied-changes endpoint.
pub const APPLIED_CHANGES_LIMIT: usize = 200;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    NotFound(String),
    #[error("persistence unavailable")]
    Unavailable,
    #[error("internal server error")]
    Internal(#[source] anyhow::Error),
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        if err.is_invalid_input() {
            Self::BadRequest(err.to_string())
        } else if err.is_not_found() {
            Self::NotFound(err.to_string())
        } else {
            Self::Internal(err.into())
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::BadRequest(rejection.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        Self::BadRequest(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Unavailable => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Internal(err) => {
                error!(error = ?err, "request failed");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, Json(json!({ "ok": false, "error": self.to_string() }))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Default, Deserialize)]
pub struct ForceQuery {
    force: Option<String>,
}

impl ForceQuery {
    /// `true` and `1` apply; anything else is a dry run.
    pub fn is_forced(&self) -> bool {
        matches!(self.force.as_deref().map(str::trim), Some("true" | "1"))
    }
}

#[derive(Debug, Deserialize)]
struct RestoreRequest {
    #[serde(default)]
    file: Option<String>,
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/state", get(get_state).post(post_state))
        .route("/state/drift", get(get_drift))
        .route("/backups", get(list_backups))
        .route("/backups/restore", post(restore_backup))
        .route("/backups/{file}", get(download_backup))
        .route("/logs/applied-changes", get(applied_changes))
        .route("/sponsors", get(list_sponsors).post(create_sponsor))
        .route(
            "/sponsors/{id}",
            get(get_sponsor).put(update_sponsor).delete(delete_sponsor),
        )
}

fn reconciler(state: &AppState) -> ApiResult<&Reconciler> {
    state.reconciler.as_deref().ok_or(ApiError::Unavailable)
}

async fn get_state(_: AdminSession, State(state): State<AppState>) -> ApiResult<Json<AppStateDocument>> {
    Ok(Json(reconciler(&state)?.get_state().await?))
}

async fn post_state(
    AdminSession(session): AdminSession,
    State(state): State<AppState>,
    query: Result<Query<ForceQuery>, QueryRejection>,
    payload: Result<Json<AppStateDocument>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    let Query(query) = query?;
    let Json(incoming) = payload?;
    let reconciler = reconciler(&state)?;

    if query.is_forced() {
        let summary = reconciler.apply(incoming).await?;
        info!(user = %session.email, upserts = summary.upserts, deletes = summary.deletes, "state saved");
        Ok(Json(json!({ "ok": true, "applied": true, "summary": summary })))
    } else {
        let diff = reconciler.preview(&incoming).await?;
        Ok(Json(json!({ "ok": true, "dryRun": true, "diff": diff })))
    }
}

async fn get_drift(_: AdminSession, State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let drift = reconciler(&state)?.drift().await?;
    Ok(Json(json!({ "ok": true, "drift": drift })))
}

async fn list_backups(_: AdminSession, State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let backups = reconciler(&state)?.list_backups().await?;
    Ok(Json(json!({ "backups": backups })))
}

async fn download_backup(
    _: AdminSession,
    State(state): State<AppState>,
    AxumPath(file): AxumPath<String>,
) -> ApiResult<Response> {
    let bytes = reconciler(&state)?.read_backup(&file).await?;
    let disposition = format!("attachment; filename=\"{file}\"");
    Ok((
        [
            (header::CONTENT_TYPE, "application/json".to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        bytes,
    )
        .into_response())
}

async fn restore_backup(
    AdminSession(session): AdminSession,
    State(state): State<AppState>,
    query: Result<Query<ForceQuery>, QueryRejection>,
    payload: Result<Json<RestoreRequest>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    let Query(query) = query?;
    let Json(request) = payload?;
    let file = request
        .file
        .filter(|f| !f.trim().is_empty())
        .ok_or_else(|| ApiError::BadRequest("file is required".to_string()))?;
    let reconciler = reconciler(&state)?;

    if query.is_forced() {
        let summary = reconciler.restore(&file).await?;
        info!(user = %session.email, file = %file, upserts = summary.upserts, deletes = summary.deletes, "backup restored");
        Ok(Json(json!({ "ok": true, "applied": true, "summary": summary })))
    } else {
        let diff = reconciler.preview_restore(&file).await?;
        Ok(Json(json!({ "ok": true, "dryRun": true, "diff": diff })))
    }
}

async fn applied_changes(_: AdminSession, State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let entries = reconciler(&state)?
        .applied_changes(APPLIED_CHANGES_LIMIT)
        .await?;
    Ok(Json(json!({ "entries": entries })))
}

async fn list_sponsors(_: AdminSession, State(state): State<AppState>) -> ApiResult<Json<Vec<Sponsor>>> {
    Ok(Json(reconciler(&state)?.store().list_sponsors().await?))
}

async fn get_sponsor(
    _: AdminSession,
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
) -> ApiResult<Json<Sponsor>> {
    reconciler(&state)?
        .store()
        .get_sponsor(&id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("sponsor {id} not found")))
}

async fn create_sponsor(
    _: AdminSession,
    State(state): State<AppState>,
    payload: Result<Json<Sponsor>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<Sponsor>)> {
    let Json(sponsor) = payload?;
    let created = reconciler(&state)?.store().create_sponsor(sponsor).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

async fn update_sponsor(
    _: AdminSession,
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
    payload: Result<Json<SponsorPatch>, JsonRejection>,
) -> ApiResult<Json<Sponsor>> {
    let Json(patch) = payload?;
    if patch.is_empty() {
        return Err(ApiError::BadRequest("no fields to update".to_string()));
    }
    Ok(Json(
        reconciler(&state)?.store().update_sponsor(&id, patch).await?,
    ))
}

async fn delete_sponsor(
    _: AdminSession,
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
) -> ApiResult<Json<Value>> {
    reconciler(&state)?.store().delete_sponsor(&id).await?;
    Ok(Json(json!({ "ok": true })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn force_accepts_true_and_one_only() {
        let forced = |raw: Option<&str>| {
            ForceQuery {
                force: raw.map(str::to_string),
            }
            .is_forced()
        };
        assert!(forced(Some("true")));
        assert!(forced(Some("1")));
        assert!(!forced(Some("yes")));
        assert!(!forced(Some("TRUE")));
        assert!(!forced(None));
    }

    #[test]
    fn store_errors_map_to_status_classes() {
        let status = |err: StoreError| ApiError::from(err).into_response().status();
        assert_eq!(status(StoreError::SponsorNotFound("x".into())), StatusCode::NOT_FOUND);
        assert_eq!(status(StoreError::MissingId), StatusCode::BAD_REQUEST);
        assert_eq!(
            status(StoreError::Remote {
                status: 502,
                body: "bad gateway".into()
            }),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
