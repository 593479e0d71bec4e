//! Error types for the preview sandbox.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Top-level error type for file store and preview operations.
#[derive(Error, Debug)]
pub enum Error {
    /// There is nothing to preview.
    #[error("no files to preview")]
    NoFiles,

    /// Building the isolated image failed.
    #[error("failed to build image {tag}: {output}")]
    BuildFailure { tag: String, output: String },

    /// The container never reached the running state.
    #[error("container failed to start: {0}")]
    StartFailure(String),

    /// The container did not become ready before the deadline.
    #[error("container failed to start within {0:?}")]
    HealthTimeout(Duration),

    /// Every port in the configured range is taken.
    #[error("no available ports in range {start}..{end}")]
    PortExhausted { start: u16, end: u16 },

    /// The referenced preview or project does not exist.
    #[error("{0} not found")]
    NotFound(String),

    /// The commit does not exist in the store.
    #[error("commit {0} not found")]
    CommitNotFound(String),

    /// The branch does not exist in the store.
    #[error("branch {0} not found")]
    BranchNotFound(String),

    /// The branch name is already taken.
    #[error("branch {0} already exists")]
    BranchExists(String),

    /// A freshly derived commit id clashed with an existing one.
    #[error("commit id collision: {0}")]
    CommitCollision(String),

    /// A file path escapes the project root.
    #[error("invalid file path: {0}")]
    InvalidPath(PathBuf),

    /// The container engine rejected a command.
    #[error("container engine error: {0}")]
    Engine(String),

    /// A spawned lifecycle task panicked or was cancelled.
    #[error("background task failed: {0}")]
    Task(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// IO error while materialising files.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialisation error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Stable machine-readable label for the error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::NoFiles => "no_files",
            Error::BuildFailure { .. } => "build_failure",
            Error::StartFailure(_) => "start_failure",
            Error::HealthTimeout(_) => "health_timeout",
            Error::PortExhausted { .. } => "port_exhausted",
            Error::NotFound(_) => "not_found",
            Error::CommitNotFound(_) => "commit_not_found",
            Error::BranchNotFound(_) => "branch_not_found",
            Error::BranchExists(_) => "branch_exists",
            Error::CommitCollision(_) => "commit_collision",
            Error::InvalidPath(_) => "invalid_path",
            Error::Engine(_) => "engine",
            Error::Task(_) => "task",
            Error::Config(_) => "config",
            Error::Io(_) => "io",
            Error::Json(_) => "json",
        }
    }

    /// HTTP status code used when the error crosses the API boundary.
    pub fn status_code(&self) -> u16 {
        match self {
            Error::NoFiles | Error::InvalidPath(_) => 400,
            Error::NotFound(_) | Error::CommitNotFound(_) | Error::BranchNotFound(_) => 404,
            Error::BranchExists(_) => 409,
            Error::PortExhausted { .. } => 503,
            Error::HealthTimeout(_) => 504,
            _ => 500,
        }
    }

    /// Returns true for the "absent" family of errors.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::NotFound(_) | Error::CommitNotFound(_) | Error::BranchNotFound(_)
        )
    }
}

/// Result type alias for file store and preview operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_are_snake_case_labels() {
        assert_eq!(Error::NoFiles.kind(), "no_files");
        assert_eq!(
            Error::PortExhausted { start: 1, end: 2 }.kind(),
            "port_exhausted"
        );
        assert_eq!(Error::HealthTimeout(Duration::from_secs(1)).kind(), "health_timeout");
    }

    #[test]
    fn not_found_family_maps_to_404() {
        for err in [
            Error::NotFound("p".into()),
            Error::CommitNotFound("c".into()),
            Error::BranchNotFound("b".into()),
        ] {
            assert!(err.is_not_found());
            assert_eq!(err.status_code(), 404);
        }
        assert!(!Error::NoFiles.is_not_found());
        assert_eq!(Error::NoFiles.status_code(), 400);
    }

    #[test]
    fn build_failure_message_carries_output() {
        let err = Error::BuildFailure {
            tag: "img".into(),
            output: "npm ERR! missing script".into(),
        };
        assert!(err.to_string().contains("npm ERR!"));
        assert_eq!(err.status_code(), 500);
    }
}
