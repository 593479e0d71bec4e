//! `/preview` routes.

use axum::extract::{Path, State};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::project::ProjectId;
use crate::sandbox::{PreviewEnvironment, PreviewStatus, ProjectKind};
use crate::vfs::FileMap;

use super::error::ApiResult;
use super::AppState;

#[derive(Debug, Deserialize)]
pub struct CreatePreviewRequest {
    #[serde(alias = "projectId")]
    pub project_id: ProjectId,
    #[serde(default)]
    pub files: Option<FileMap>,
}

/// Public view of an environment; logs are served separately.
#[derive(Debug, Serialize, Deserialize)]
pub struct PreviewResponse {
    pub project_id: ProjectId,
    pub preview_id: String,
    pub status: PreviewStatus,
    pub kind: Option<ProjectKind>,
    pub url: Option<String>,
    pub port: Option<u16>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
}

impl From<PreviewEnvironment> for PreviewResponse {
    fn from(env: PreviewEnvironment) -> Self {
        Self {
            project_id: env.project_id,
            preview_id: env.preview_id,
            status: env.status,
            kind: env.kind,
            url: env.url,
            port: env.port,
            error_message: env.error_message,
            created_at: env.created_at,
            last_accessed_at: env.last_accessed_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct PreviewList {
    pub previews: Vec<PreviewResponse>,
}

#[derive(Debug, Serialize)]
pub struct LogsResponse {
    pub logs: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub message: &'static str,
}

/// `POST /preview`: build the preview and start watching the project.
pub async fn create(
    State(state): State<AppState>,
    Json(request): Json<CreatePreviewRequest>,
) -> ApiResult<Json<PreviewResponse>> {
    let env = state
        .previews
        .create_preview(&request.project_id, request.files)
        .await?;
    state.watchers.start(&request.project_id);
    Ok(Json(env.into()))
}

pub async fn list(State(state): State<AppState>) -> Json<PreviewList> {
    Json(PreviewList {
        previews: state
            .previews
            .list_previews()
            .into_iter()
            .map(PreviewResponse::from)
            .collect(),
    })
}

pub async fn get(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
) -> ApiResult<Json<PreviewResponse>> {
    let project_id = ProjectId::from(project_id);
    let env = state
        .previews
        .get_preview(&project_id)
        .ok_or_else(|| preview_not_found(&project_id))?;
    Ok(Json(env.into()))
}

/// `PUT /preview/{id}`: rebuild from the given file map.
pub async fn update(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
    Json(files): Json<FileMap>,
) -> ApiResult<Json<PreviewResponse>> {
    let project_id = ProjectId::from(project_id);
    let env = state.previews.update_preview(&project_id, files).await?;
    Ok(Json(env.into()))
}

/// `DELETE /preview/{id}`: stop the watcher and tear the sandbox down.
pub async fn stop(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
) -> ApiResult<Json<MessageResponse>> {
    let project_id = ProjectId::from(project_id);
    state.watchers.stop(&project_id);
    if !state.previews.stop_preview(&project_id).await? {
        return Err(preview_not_found(&project_id).into());
    }
    Ok(Json(MessageResponse {
        message: "Preview stopped successfully",
    }))
}

pub async fn logs(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
) -> ApiResult<Json<LogsResponse>> {
    let project_id = ProjectId::from(project_id);
    let logs = state
        .previews
        .get_logs(&project_id)
        .await
        .ok_or_else(|| preview_not_found(&project_id))?;
    Ok(Json(LogsResponse { logs }))
}

fn preview_not_found(project_id: &ProjectId) -> Error {
    Error::NotFound(format!("preview for project {}", project_id))
}
