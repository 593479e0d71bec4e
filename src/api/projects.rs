//! `/projects/{id}` routes over the versioned file store.

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::project::ProjectId;
use crate::vfs::{safe_relative_path, CommitSummary, Diff, FileMap, VfsStatus};

use super::error::ApiResult;
use super::AppState;

const DEFAULT_HISTORY_LIMIT: usize = 10;

#[derive(Debug, Serialize)]
pub struct WriteResponse {
    pub written: usize,
}

#[derive(Debug, Serialize)]
pub struct DeleteResponse {
    pub deleted: bool,
}

#[derive(Debug, Deserialize)]
pub struct CommitRequest {
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct CommitResponse {
    pub commit_id: String,
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct HistoryResponse {
    pub commits: Vec<CommitSummary>,
}

#[derive(Debug, Deserialize)]
pub struct RollbackRequest {
    pub commit_id: String,
}

#[derive(Debug, Deserialize)]
pub struct DiffQuery {
    pub from: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct BranchRequest {
    pub name: String,
    #[serde(default)]
    pub from_commit: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CheckoutRequest {
    pub branch: String,
}

/// `PUT /projects/{id}/files`: write a file map into the working tree.
pub async fn write_files(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
    Json(files): Json<FileMap>,
) -> ApiResult<Json<WriteResponse>> {
    for path in files.keys() {
        safe_relative_path(path)?;
    }

    let store = state.vfs.get_or_create(&ProjectId::from(project_id));
    store.lock().write_all(&files);
    Ok(Json(WriteResponse {
        written: files.len(),
    }))
}

pub async fn delete_file(
    State(state): State<AppState>,
    Path((project_id, path)): Path<(String, String)>,
) -> ApiResult<Json<DeleteResponse>> {
    let project_id = ProjectId::from(project_id);
    let store = state
        .vfs
        .get(&project_id)
        .ok_or_else(|| project_not_found(&project_id))?;
    let deleted = store.lock().delete(&path);
    Ok(Json(DeleteResponse { deleted }))
}

/// `POST /projects/{id}/commits`: snapshot the working tree.
pub async fn commit(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
    Json(request): Json<CommitRequest>,
) -> ApiResult<Json<CommitResponse>> {
    let store = state.vfs.get_or_create(&ProjectId::from(project_id));
    let commit_id = store.lock().commit(request.message)?;
    Ok(Json(CommitResponse { commit_id }))
}

pub async fn status(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
) -> ApiResult<Json<VfsStatus>> {
    let project_id = ProjectId::from(project_id);
    let store = state
        .vfs
        .get(&project_id)
        .ok_or_else(|| project_not_found(&project_id))?;
    let status = store.lock().status();
    Ok(Json(status))
}

pub async fn history(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> ApiResult<Json<HistoryResponse>> {
    let project_id = ProjectId::from(project_id);
    let store = state
        .vfs
        .get(&project_id)
        .ok_or_else(|| project_not_found(&project_id))?;
    let commits = store
        .lock()
        .history(query.limit.unwrap_or(DEFAULT_HISTORY_LIMIT));
    Ok(Json(HistoryResponse { commits }))
}

/// `POST /projects/{id}/rollback`: restore the working tree to a commit.
pub async fn rollback(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
    Json(request): Json<RollbackRequest>,
) -> ApiResult<Json<VfsStatus>> {
    let project_id = ProjectId::from(project_id);
    let store = state
        .vfs
        .get(&project_id)
        .ok_or_else(|| project_not_found(&project_id))?;
    let mut guard = store.lock();
    guard.rollback(&request.commit_id)?;
    Ok(Json(guard.status()))
}

/// `GET /projects/{id}/diff?from=`: working tree against a commit, or against
/// the empty tree when `from` is absent.
pub async fn diff(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
    Query(query): Query<DiffQuery>,
) -> ApiResult<Json<Diff>> {
    let project_id = ProjectId::from(project_id);
    let store = state
        .vfs
        .get(&project_id)
        .ok_or_else(|| project_not_found(&project_id))?;
    let diff = store.lock().diff(query.from.as_deref())?;
    Ok(Json(diff))
}

pub async fn create_branch(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
    Json(request): Json<BranchRequest>,
) -> ApiResult<Json<VfsStatus>> {
    let store = state.vfs.get_or_create(&ProjectId::from(project_id));
    let mut guard = store.lock();
    guard.create_branch(&request.name, request.from_commit.as_deref())?;
    Ok(Json(guard.status()))
}

pub async fn checkout(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
    Json(request): Json<CheckoutRequest>,
) -> ApiResult<Json<VfsStatus>> {
    let project_id = ProjectId::from(project_id);
    let store = state
        .vfs
        .get(&project_id)
        .ok_or_else(|| project_not_found(&project_id))?;
    let mut guard = store.lock();
    guard.switch_branch(&request.branch)?;
    Ok(Json(guard.status()))
}

fn project_not_found(project_id: &ProjectId) -> Error {
    Error::NotFound(format!("project {}", project_id))
}
