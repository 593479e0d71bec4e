//! HTTP and WebSocket surface.

mod error;
mod live;
mod preview;
mod projects;

use std::sync::Arc;

use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use serde::Serialize;

use crate::config::Config;
use crate::reload::ReloadHub;
use crate::sandbox::{ContainerEngine, PreviewManager};
use crate::vfs::VfsRegistry;
use crate::watcher::WatcherRegistry;

pub use error::{ApiError, ErrorBody};
pub use preview::{CreatePreviewRequest, PreviewResponse};

/// Shared handles every handler works with.
#[derive(Clone)]
pub struct AppState {
    pub vfs: VfsRegistry,
    pub previews: PreviewManager,
    pub watchers: WatcherRegistry,
    pub hub: ReloadHub,
}

impl AppState {
    /// Wires the stores, manager and watcher registry from configuration.
    pub fn new(engine: Arc<dyn ContainerEngine>, config: &Config) -> Self {
        let vfs = VfsRegistry::new();
        let hub = ReloadHub::new();
        let previews = PreviewManager::new(engine, vfs.clone(), config.preview.clone());
        let watchers = WatcherRegistry::new(
            vfs.clone(),
            previews.clone(),
            hub.clone(),
            config.watcher.poll_interval(),
        );
        Self {
            vfs,
            previews,
            watchers,
            hub,
        }
    }
}

/// Builds the service router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/preview", post(preview::create).get(preview::list))
        .route(
            "/preview/{project_id}",
            get(preview::get).put(preview::update).delete(preview::stop),
        )
        .route("/preview/{project_id}/logs", get(preview::logs))
        .route("/ws/{project_id}", get(live::subscribe))
        .route("/projects/{project_id}/files", put(projects::write_files))
        .route(
            "/projects/{project_id}/files/{*path}",
            delete(projects::delete_file),
        )
        .route("/projects/{project_id}/commits", post(projects::commit))
        .route("/projects/{project_id}/status", get(projects::status))
        .route("/projects/{project_id}/history", get(projects::history))
        .route("/projects/{project_id}/rollback", post(projects::rollback))
        .route("/projects/{project_id}/diff", get(projects::diff))
        .route("/projects/{project_id}/branches", post(projects::create_branch))
        .route("/projects/{project_id}/checkout", post(projects::checkout))
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}
