//! Snapshot watchers: poll a project's head commit and react to new ones.
//!
//! At most one watcher runs per project. On every new head commit the
//! watcher rebuilds the project's preview (when one exists), publishes a
//! reload event and then runs the project's commit listeners.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::project::ProjectId;
use crate::reload::{LiveEvent, ReloadHub};
use crate::sandbox::PreviewManager;
use crate::vfs::VfsRegistry;

/// Callback run after a watcher observes a new commit.
#[async_trait]
pub trait CommitListener: Send + Sync {
    async fn on_commit(&self, project_id: &ProjectId, commit_id: &str) -> Result<()>;
}

#[async_trait]
impl<F> CommitListener for F
where
    F: Fn(&ProjectId, &str) -> Result<()> + Send + Sync + 'static,
{
    async fn on_commit(&self, project_id: &ProjectId, commit_id: &str) -> Result<()> {
        self(project_id, commit_id)
    }
}

/// Handle returned by [`WatcherRegistry::register_listener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct Watch {
    token: CancellationToken,
    task: JoinHandle<()>,
}

type Listeners = Vec<(ListenerId, Arc<dyn CommitListener>)>;

struct Inner {
    vfs: VfsRegistry,
    previews: PreviewManager,
    hub: ReloadHub,
    poll_interval: Duration,
    watches: Mutex<HashMap<ProjectId, Watch>>,
    listeners: Mutex<HashMap<ProjectId, Listeners>>,
    next_listener: AtomicU64,
}

/// Owns the watcher task of every watched project.
#[derive(Clone)]
pub struct WatcherRegistry {
    inner: Arc<Inner>,
}

impl WatcherRegistry {
    pub fn new(
        vfs: VfsRegistry,
        previews: PreviewManager,
        hub: ReloadHub,
        poll_interval: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                vfs,
                previews,
                hub,
                poll_interval,
                watches: Mutex::new(HashMap::new()),
                listeners: Mutex::new(HashMap::new()),
                next_listener: AtomicU64::new(1),
            }),
        }
    }

    /// Starts watching `project_id`, replacing any existing watcher.
    ///
    /// The replaced watcher is cancelled but not awaited; it may still be
    /// finishing its current step when the new one starts.
    pub fn start(&self, project_id: &ProjectId) {
        let token = CancellationToken::new();
        let head = self.inner.vfs.head(project_id);
        let task = tokio::spawn(watch(
            self.inner.clone(),
            project_id.clone(),
            head,
            token.clone(),
        ));

        let previous = self
            .inner
            .watches
            .lock()
            .insert(project_id.clone(), Watch { token, task });
        if let Some(previous) = previous {
            previous.token.cancel();
            tracing::debug!(project = %project_id, "replaced watcher");
        }
        tracing::info!(project = %project_id, "watcher started");
    }

    /// Cancels the project's watcher. Returns false if none was running.
    pub fn stop(&self, project_id: &ProjectId) -> bool {
        let removed = self.inner.watches.lock().remove(project_id);
        match removed {
            Some(watch) => {
                watch.token.cancel();
                tracing::info!(project = %project_id, "watcher stopped");
                true
            }
            None => false,
        }
    }

    /// Cancels every watcher and waits for their loops to exit.
    pub async fn stop_all(&self) {
        let watches: Vec<(ProjectId, Watch)> = self.inner.watches.lock().drain().collect();
        for (_, watch) in &watches {
            watch.token.cancel();
        }
        for (project_id, watch) in watches {
            if let Err(e) = watch.task.await {
                tracing::warn!(project = %project_id, error = %e, "watcher task ended abnormally");
            }
        }
        tracing::info!("all watchers stopped");
    }

    pub fn is_watching(&self, project_id: &ProjectId) -> bool {
        self.inner
            .watches
            .lock()
            .get(project_id)
            .is_some_and(|w| !w.task.is_finished())
    }

    pub fn watched_projects(&self) -> Vec<ProjectId> {
        let mut ids: Vec<ProjectId> = self.inner.watches.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Adds a listener for the project's commits; listeners run in
    /// registration order.
    pub fn register_listener(
        &self,
        project_id: &ProjectId,
        listener: Arc<dyn CommitListener>,
    ) -> ListenerId {
        let id = ListenerId(self.inner.next_listener.fetch_add(1, Ordering::Relaxed));
        self.inner
            .listeners
            .lock()
            .entry(project_id.clone())
            .or_default()
            .push((id, listener));
        id
    }

    /// Removes a listener. Returns false if it was not registered.
    pub fn unregister_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.inner.listeners.lock();
        for entries in listeners.values_mut() {
            if let Some(pos) = entries.iter().position(|(l, _)| *l == id) {
                entries.remove(pos);
                return true;
            }
        }
        false
    }
}

async fn watch(
    inner: Arc<Inner>,
    project_id: ProjectId,
    mut last_seen: Option<String>,
    token: CancellationToken,
) {
    tracing::debug!(project = %project_id, head = ?last_seen, "watching for commits");

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(inner.poll_interval) => {}
        }

        let head = inner.vfs.head(&project_id);
        let Some(commit_id) = head.clone().filter(|h| Some(h) != last_seen.as_ref()) else {
            continue;
        };
        tracing::info!(
            project = %project_id,
            from = last_seen.as_deref().unwrap_or("none"),
            to = %commit_id,
            "new commit detected"
        );

        tokio::select! {
            _ = token.cancelled() => break,
            _ = on_new_commit(&inner, &project_id, &commit_id) => {}
        }
        last_seen = head;
    }

    tracing::debug!(project = %project_id, "watcher loop exited");
}

async fn on_new_commit(inner: &Inner, project_id: &ProjectId, commit_id: &str) {
    if inner.previews.has_preview(project_id) {
        let files = inner.vfs.files(project_id);
        match inner.previews.update_preview(project_id, files).await {
            Ok(env) => {
                tracing::info!(project = %project_id, preview = %env.preview_id, "preview rebuilt")
            }
            Err(e) => tracing::error!(project = %project_id, error = %e, "preview rebuild failed"),
        }
    } else {
        tracing::debug!(project = %project_id, "no preview to rebuild");
    }

    inner.hub.publish(LiveEvent::Reload {
        project_id: project_id.clone(),
        commit_id: commit_id.to_string(),
    });

    let listeners: Vec<Arc<dyn CommitListener>> = inner
        .listeners
        .lock()
        .get(project_id)
        .map(|entries| entries.iter().map(|(_, l)| l.clone()).collect())
        .unwrap_or_default();

    for listener in listeners {
        let project_id = project_id.clone();
        let commit_id = commit_id.to_string();
        let task = tokio::spawn(async move { listener.on_commit(&project_id, &commit_id).await });
        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::error!(error = %e, "commit listener failed"),
            Err(e) => tracing::error!(error = %e, "commit listener panicked"),
        }
    }
}
