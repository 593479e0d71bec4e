//! Preview Sandbox - versioned project files served from ephemeral containers
//!
//! This library keeps each project's files in an in-memory, commit-based
//! store and turns them into isolated, short-lived preview containers that
//! are rebuilt whenever a new commit lands.

pub mod api;
pub mod config;
pub mod error;
pub mod project;
pub mod reload;
pub mod sandbox;
pub mod sweeper;
pub mod vfs;
pub mod watcher;

pub use error::{Error, Result};
pub use project::ProjectId;

pub use api::{router, AppState};
pub use config::{
    Config, EngineKind, PreviewConfig, ServerConfig, SweeperConfig, Validate, ValidationResult,
    WatcherConfig,
};
pub use reload::{LiveEvent, ReloadHub};
pub use sandbox::{
    ContainerEngine, DockerCli, InMemoryEngine, PreviewEnvironment, PreviewManager, PreviewStatus,
    ProjectKind,
};
pub use sweeper::{SweepReport, Sweeper};
pub use vfs::{FileMap, VfsRegistry, VirtualFileSystem};
pub use watcher::{CommitListener, ListenerId, WatcherRegistry};
