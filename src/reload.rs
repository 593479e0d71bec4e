//! Per-project live-update channels.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::project::ProjectId;

/// Events buffered per channel before slow subscribers start lagging.
const DEFAULT_CAPACITY: usize = 64;

/// Message pushed to connected clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum LiveEvent {
    /// A new commit landed; clients should re-fetch.
    Reload {
        project_id: ProjectId,
        commit_id: String,
    },
}

impl LiveEvent {
    pub fn project_id(&self) -> &ProjectId {
        match self {
            LiveEvent::Reload { project_id, .. } => project_id,
        }
    }
}

/// Fan-out of [`LiveEvent`]s, one broadcast channel per project.
#[derive(Clone)]
pub struct ReloadHub {
    channels: Arc<Mutex<HashMap<ProjectId, broadcast::Sender<LiveEvent>>>>,
    capacity: usize,
}

impl Default for ReloadHub {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }
}

impl ReloadHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            channels: Arc::new(Mutex::new(HashMap::new())),
            capacity: capacity.max(1),
        }
    }

    /// Receives every event published for `project_id` from now on.
    pub fn subscribe(&self, project_id: &ProjectId) -> broadcast::Receiver<LiveEvent> {
        let mut channels = self.channels.lock();
        channels
            .entry(project_id.clone())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Sends `event` to its project's subscribers. Returns how many received it.
    pub fn publish(&self, event: LiveEvent) -> usize {
        let mut channels = self.channels.lock();
        let project_id = event.project_id().clone();
        let Some(sender) = channels.get(&project_id) else {
            tracing::debug!(project = %project_id, "no live subscribers");
            return 0;
        };

        match sender.send(event) {
            Ok(n) => {
                tracing::debug!(project = %project_id, subscribers = n, "published live event");
                n
            }
            Err(_) => {
                // every receiver is gone
                channels.remove(&project_id);
                0
            }
        }
    }

    pub fn subscriber_count(&self, project_id: &ProjectId) -> usize {
        self.channels
            .lock()
            .get(project_id)
            .map(broadcast::Sender::receiver_count)
            .unwrap_or(0)
    }
}
