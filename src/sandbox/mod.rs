//! Container-backed preview environments.
//!
//! [`PreviewManager`] turns a project's file set into a running, isolated
//! container reachable on a dedicated host port. Containers are driven
//! through the [`ContainerEngine`] trait; [`DockerCli`] talks to a real
//! engine and [`InMemoryEngine`] fakes one.

mod docker;
mod engine;
mod environment;
mod manager;
mod memory;
mod ports;
mod project;
mod workspace;

pub use docker::DockerCli;
pub use engine::{
    managed_filter, preview_labels, BuildSpec, ContainerEngine, ContainerState, EngineResource,
    LineSink, RunSpec, MANAGED_LABEL_KEY, MANAGED_LABEL_VALUE, NAME_PREFIX, PREVIEW_LABEL,
    PROJECT_LABEL,
};
pub use environment::{PreviewEnvironment, PreviewStatus};
pub use manager::{PreviewManager, CONTAINER_LOGS_MARKER};
pub use memory::{InMemoryEngine, StartBehaviour};
pub use ports::{PortAllocator, PortLease};
pub use project::{BuildRecipe, ProjectKind, RECIPE_FILE};
pub use workspace::{materialize, Materialized};
