//! Container engine abstraction.
//!
//! The preview manager talks to containers only through [`ContainerEngine`].
//! [`DockerCli`](super::DockerCli) drives a real engine; the
//! [`InMemoryEngine`](super::InMemoryEngine) stands in for it in tests and
//! offline development.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;

/// Label every managed container and image carries.
pub const MANAGED_LABEL_KEY: &str = "preview-sandbox";
/// Value of [`MANAGED_LABEL_KEY`].
pub const MANAGED_LABEL_VALUE: &str = "preview";
/// Label carrying the owning project id.
pub const PROJECT_LABEL: &str = "project_id";
/// Label carrying the preview id.
pub const PREVIEW_LABEL: &str = "preview_id";
/// Prefix shared by image tags and container names.
pub const NAME_PREFIX: &str = "preview-sandbox-";

/// `key=value` filter selecting everything this service manages.
pub fn managed_filter() -> String {
    format!("{}={}", MANAGED_LABEL_KEY, MANAGED_LABEL_VALUE)
}

/// Labels applied to a preview's image and container.
pub fn preview_labels(project_id: &str, preview_id: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (MANAGED_LABEL_KEY.to_string(), MANAGED_LABEL_VALUE.to_string()),
        (PROJECT_LABEL.to_string(), project_id.to_string()),
        (PREVIEW_LABEL.to_string(), preview_id.to_string()),
    ])
}

/// Lifecycle state as reported by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerState {
    Created,
    Running,
    Restarting,
    Paused,
    Exited,
    Dead,
    Removing,
    Unknown(String),
}

impl ContainerState {
    /// Parses the engine's lowercase status word.
    pub fn parse(raw: &str) -> Self {
        match raw.trim().trim_matches('\'').to_ascii_lowercase().as_str() {
            "created" => ContainerState::Created,
            "running" => ContainerState::Running,
            "restarting" => ContainerState::Restarting,
            "paused" => ContainerState::Paused,
            "exited" => ContainerState::Exited,
            "dead" => ContainerState::Dead,
            "removing" => ContainerState::Removing,
            other => ContainerState::Unknown(other.to_string()),
        }
    }

    /// The container will not reach `running` without outside intervention.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ContainerState::Exited | ContainerState::Dead | ContainerState::Removing
        )
    }
}

impl fmt::Display for ContainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContainerState::Created => f.write_str("created"),
            ContainerState::Running => f.write_str("running"),
            ContainerState::Restarting => f.write_str("restarting"),
            ContainerState::Paused => f.write_str("paused"),
            ContainerState::Exited => f.write_str("exited"),
            ContainerState::Dead => f.write_str("dead"),
            ContainerState::Removing => f.write_str("removing"),
            ContainerState::Unknown(raw) => write!(f, "unknown ({})", raw),
        }
    }
}

/// Inputs for an image build.
#[derive(Debug, Clone)]
pub struct BuildSpec<'a> {
    /// Directory holding the recipe and project files.
    pub context_dir: &'a Path,
    pub tag: &'a str,
    pub labels: &'a BTreeMap<String, String>,
}

/// Inputs for starting a detached container.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSpec {
    pub image: String,
    pub name: String,
    pub network: String,
    pub host_port: u16,
    pub container_port: u16,
    pub memory_bytes: i64,
    pub cpus: f64,
    pub labels: BTreeMap<String, String>,
}

/// A container or image found by label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineResource {
    /// Engine id (container id or image id).
    pub id: String,
    /// Container name, or image repository.
    pub name: String,
}

impl EngineResource {
    /// Preview id encoded in the resource name, if it follows the naming scheme.
    pub fn preview_id(&self) -> Option<&str> {
        self.name
            .trim_start_matches('/')
            .strip_prefix(NAME_PREFIX)
            .filter(|id| !id.is_empty())
    }
}

/// Callback receiving build output one line at a time.
pub type LineSink<'a> = &'a (dyn Fn(&str) + Send + Sync);

/// Operations the preview manager needs from a container runtime.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Short identifier for logs.
    fn name(&self) -> &'static str;

    /// Creates the bridge network if it does not exist yet.
    async fn ensure_network(&self, network: &str) -> Result<()>;

    /// Builds an image, streaming each output line to `on_line`.
    ///
    /// Fails with [`Error::BuildFailure`](crate::Error::BuildFailure)
    /// carrying the tail of the output.
    async fn build_image(&self, spec: &BuildSpec<'_>, on_line: LineSink<'_>) -> Result<()>;

    /// Starts a detached container and returns its engine reference.
    async fn run_container(&self, spec: &RunSpec) -> Result<String>;

    async fn container_state(&self, container: &str) -> Result<ContainerState>;

    /// Last `tail` lines of the container's own output.
    async fn container_logs(&self, container: &str, tail: usize) -> Result<Vec<String>>;

    async fn stop_container(&self, container: &str, timeout: Duration) -> Result<()>;

    async fn remove_container(&self, container: &str) -> Result<()>;

    async fn remove_image(&self, tag: &str) -> Result<()>;

    /// Containers (running or not) carrying the `key=value` label.
    async fn list_containers(&self, label: &str) -> Result<Vec<EngineResource>>;

    /// Images carrying the `key=value` label.
    async fn list_images(&self, label: &str) -> Result<Vec<EngineResource>>;
}
