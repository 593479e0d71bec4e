//! Preview environment record and its lifecycle state machine.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::project::ProjectId;

use super::project::ProjectKind;

/// Lifecycle state of a preview environment.
///
/// `creating → running`, `creating → error`, `running → stopped`,
/// `running → error`. Nothing leaves `stopped`; an update builds a fresh
/// environment instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PreviewStatus {
    Creating,
    Running,
    Stopped,
    Error,
}

impl PreviewStatus {
    /// Whether the state machine allows moving to `next`.
    pub fn can_transition_to(self, next: PreviewStatus) -> bool {
        use PreviewStatus::*;
        matches!(
            (self, next),
            (Creating, Running) | (Creating, Error) | (Running, Stopped) | (Running, Error)
        )
    }
}

/// An ephemeral sandbox serving one project's files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreviewEnvironment {
    pub project_id: ProjectId,
    /// Opaque, random, unique per creation.
    pub preview_id: String,
    /// Container engine handle, set once the container exists.
    pub container_ref: Option<String>,
    /// Name used for both the image tag and the container.
    pub container_name: String,
    pub kind: Option<ProjectKind>,
    pub status: PreviewStatus,
    pub port: Option<u16>,
    pub url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    pub error_message: Option<String>,
    /// Ordered, append-only.
    pub logs: Vec<String>,
}

impl PreviewEnvironment {
    /// Creates a fresh record in the `creating` state.
    pub fn new(project_id: ProjectId, preview_id: String, container_name: String) -> Self {
        let now = Utc::now();
        Self {
            project_id,
            preview_id,
            container_ref: None,
            container_name,
            kind: None,
            status: PreviewStatus::Creating,
            port: None,
            url: None,
            created_at: now,
            last_accessed_at: now,
            error_message: None,
            logs: Vec::new(),
        }
    }

    /// Moves to `next` if the state machine allows it. Returns whether it moved.
    pub fn transition(&mut self, next: PreviewStatus) -> bool {
        if self.status.can_transition_to(next) {
            self.status = next;
            true
        } else {
            tracing::debug!(
                preview = %self.preview_id,
                from = ?self.status,
                to = ?next,
                "ignored invalid status transition"
            );
            false
        }
    }

    /// Records a failure: status `error` plus a human-readable message.
    pub fn fail(&mut self, message: impl Into<String>) {
        let message = message.into();
        self.transition(PreviewStatus::Error);
        self.append_log(format!("Error: {}", message));
        self.error_message = Some(message);
    }

    /// Appends a timestamped line to the environment log.
    pub fn append_log(&mut self, message: impl AsRef<str>) {
        let message = message.as_ref();
        tracing::info!(project = %self.project_id, preview = %self.preview_id, "{}", message);
        self.logs
            .push(format!("[{}] {}", Utc::now().format("%H:%M:%S"), message));
    }

    pub fn touch(&mut self) {
        self.last_accessed_at = Utc::now();
    }

    /// Age exceeds `max_lifetime` at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>, max_lifetime: Duration) -> bool {
        exceeds(now, self.created_at, max_lifetime)
    }

    /// Unaccessed for longer than `idle_timeout` at `now`.
    pub fn is_idle(&self, now: DateTime<Utc>, idle_timeout: Duration) -> bool {
        exceeds(now, self.last_accessed_at, idle_timeout)
    }

    /// Either expired or idle at `now`.
    pub fn is_stale(
        &self,
        now: DateTime<Utc>,
        max_lifetime: Duration,
        idle_timeout: Duration,
    ) -> bool {
        self.is_expired(now, max_lifetime) || self.is_idle(now, idle_timeout)
    }
}

fn exceeds(now: DateTime<Utc>, since: DateTime<Utc>, limit: Duration) -> bool {
    match (now - since).to_std() {
        Ok(elapsed) => elapsed > limit,
        // `since` lies in the future
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    fn env() -> PreviewEnvironment {
        PreviewEnvironment::new(
            ProjectId::from("p"),
            "abc".to_string(),
            "preview-sandbox-abc".to_string(),
        )
    }

    #[test]
    fn new_environment_is_creating() {
        let env = env();
        assert_eq!(env.status, PreviewStatus::Creating);
        assert!(env.logs.is_empty());
        assert!(env.url.is_none());
    }

    #[test]
    fn state_machine_allows_only_documented_edges() {
        use PreviewStatus::*;
        assert!(Creating.can_transition_to(Running));
        assert!(Creating.can_transition_to(Error));
        assert!(Running.can_transition_to(Stopped));
        assert!(Running.can_transition_to(Error));

        assert!(!Stopped.can_transition_to(Running));
        assert!(!Error.can_transition_to(Running));
        assert!(!Creating.can_transition_to(Stopped));
        assert!(!Running.can_transition_to(Creating));
    }

    #[test]
    fn fail_records_message_and_log() {
        let mut env = env();
        env.fail("build exploded");
        assert_eq!(env.status, PreviewStatus::Error);
        assert_eq!(env.error_message.as_deref(), Some("build exploded"));
        assert!(env.logs.last().unwrap().contains("build exploded"));
    }

    #[test]
    fn append_log_keeps_order() {
        let mut env = env();
        env.append_log("one");
        env.append_log("two");
        assert!(env.logs[0].ends_with("one"));
        assert!(env.logs[1].ends_with("two"));
    }

    #[test]
    fn expiry_and_idle_checks_use_thresholds() {
        let mut env = env();
        let now = Utc::now();
        env.created_at = now - TimeDelta::minutes(61);
        env.last_accessed_at = now - TimeDelta::minutes(5);

        assert!(env.is_expired(now, Duration::from_secs(3600)));
        assert!(!env.is_idle(now, Duration::from_secs(1800)));

        env.created_at = now;
        env.last_accessed_at = now - TimeDelta::minutes(31);
        assert!(!env.is_expired(now, Duration::from_secs(3600)));
        assert!(env.is_idle(now, Duration::from_secs(1800)));
    }

    #[test]
    fn future_timestamps_never_expire() {
        let mut env = env();
        env.created_at = Utc::now() + TimeDelta::hours(1);
        assert!(!env.is_expired(Utc::now(), Duration::from_secs(1)));
    }

    #[test]
    fn serializes_status_lowercase() {
        let json = serde_json::to_value(env()).unwrap();
        assert_eq!(json["status"], "creating");
        assert_eq!(json["project_id"], "p");
    }
}
