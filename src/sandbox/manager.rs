//! Preview environment lifecycle: create, update, stop, inspect.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::OnceCell;

use crate::config::PreviewConfig;
use crate::error::{Error, Result};
use crate::project::ProjectId;
use crate::vfs::{normalize_path, FileMap, VfsRegistry};

use super::engine::{
    managed_filter, preview_labels, BuildSpec, ContainerEngine, ContainerState, RunSpec,
    NAME_PREFIX,
};
use super::environment::{PreviewEnvironment, PreviewStatus};
use super::ports::{PortAllocator, PortLease};
use super::project::ProjectKind;
use super::workspace;

/// Separator between the environment log and native container output.
pub const CONTAINER_LOGS_MARKER: &str = "--- Container Logs ---";

/// One registered environment plus the resources it holds.
struct PreviewSlot {
    env: Mutex<PreviewEnvironment>,
    port: Mutex<Option<PortLease>>,
}

impl PreviewSlot {
    fn new(env: PreviewEnvironment) -> Self {
        Self {
            env: Mutex::new(env),
            port: Mutex::new(None),
        }
    }

    fn log(&self, message: impl AsRef<str>) {
        self.env.lock().append_log(message);
    }

    fn update<R>(&self, f: impl FnOnce(&mut PreviewEnvironment) -> R) -> R {
        f(&mut self.env.lock())
    }

    fn snapshot(&self) -> PreviewEnvironment {
        self.env.lock().clone()
    }
}

struct Inner {
    engine: Arc<dyn ContainerEngine>,
    vfs: VfsRegistry,
    config: PreviewConfig,
    ports: PortAllocator,
    slots: Mutex<HashMap<ProjectId, Arc<PreviewSlot>>>,
    lifecycle: Mutex<HashMap<ProjectId, Arc<tokio::sync::Mutex<()>>>>,
    network: OnceCell<()>,
}

impl Inner {
    /// Forgets the project's lifecycle lock once no operation holds or waits on it.
    fn release_lifecycle_lock(&self, project_id: &ProjectId) {
        let mut locks = self.lifecycle.lock();
        if locks
            .get(project_id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(project_id);
        }
    }
}

/// Owns every preview environment in the process.
///
/// Lifecycle operations for one project are serialised by a per-project lock
/// and each runs in its own task, so a slow build for one project never
/// holds up another. Cloning is cheap; clones share state.
#[derive(Clone)]
pub struct PreviewManager {
    inner: Arc<Inner>,
}

impl PreviewManager {
    pub fn new(engine: Arc<dyn ContainerEngine>, vfs: VfsRegistry, config: PreviewConfig) -> Self {
        let ports = PortAllocator::new(config.port_range_start, config.port_range_end);
        Self {
            inner: Arc::new(Inner {
                engine,
                vfs,
                config,
                ports,
                slots: Mutex::new(HashMap::new()),
                lifecycle: Mutex::new(HashMap::new()),
                network: OnceCell::new(),
            }),
        }
    }

    pub fn config(&self) -> &PreviewConfig {
        &self.inner.config
    }

    pub fn vfs(&self) -> &VfsRegistry {
        &self.inner.vfs
    }

    /// Ports currently leased to environments.
    pub fn ports_in_use(&self) -> usize {
        self.inner.ports.in_use()
    }

    /// Builds and starts a fresh environment for `project_id`, replacing any
    /// existing one.
    ///
    /// With `files` absent the project's current working tree is used. An
    /// empty file set fails with [`Error::NoFiles`] and registers nothing.
    /// Any later failure leaves the environment registered in the `error`
    /// state and is also returned.
    pub async fn create_preview(
        &self,
        project_id: &ProjectId,
        files: Option<FileMap>,
    ) -> Result<PreviewEnvironment> {
        let this = self.clone();
        let project_id = project_id.clone();
        self.run_exclusive(project_id.clone(), async move {
            this.create_locked(&project_id, files).await
        })
        .await
    }

    /// Replaces the project's environment with one built from `files`.
    ///
    /// Always a full rebuild; behaves like [`create_preview`](Self::create_preview)
    /// when nothing is running yet.
    pub async fn update_preview(
        &self,
        project_id: &ProjectId,
        files: FileMap,
    ) -> Result<PreviewEnvironment> {
        let this = self.clone();
        let project_id = project_id.clone();
        self.run_exclusive(project_id.clone(), async move {
            if let Some(slot) = this.slot(&project_id) {
                slot.update(|env| {
                    env.touch();
                    env.append_log("Updating preview with new files...");
                });
            }
            this.create_locked(&project_id, Some(files)).await
        })
        .await
    }

    /// Tears down the project's environment. Returns false if none existed.
    ///
    /// Engine failures during teardown are logged; the environment is
    /// unregistered regardless.
    pub async fn stop_preview(&self, project_id: &ProjectId) -> Result<bool> {
        let this = self.clone();
        let project_id = project_id.clone();
        self.run_exclusive(project_id.clone(), async move {
            Ok(this.stop_locked(&project_id).await)
        })
        .await
    }

    /// Stops the project's environment only if the environment registered
    /// once the lifecycle lock is held still satisfies `predicate`.
    ///
    /// Returns false when nothing is registered or the check fails, e.g.
    /// because a concurrent update replaced the environment meanwhile.
    pub async fn stop_preview_if<P>(&self, project_id: &ProjectId, predicate: P) -> Result<bool>
    where
        P: FnOnce(&PreviewEnvironment) -> bool + Send + 'static,
    {
        let this = self.clone();
        let project_id = project_id.clone();
        self.run_exclusive(project_id.clone(), async move {
            let current = this.slot(&project_id).map(|slot| slot.snapshot());
            if !current.is_some_and(|env| predicate(&env)) {
                return Ok(false);
            }
            Ok(this.stop_locked(&project_id).await)
        })
        .await
    }

    /// Current environment for the project; counts as an access.
    pub fn get_preview(&self, project_id: &ProjectId) -> Option<PreviewEnvironment> {
        let slot = self.slot(project_id)?;
        Some(slot.update(|env| {
            env.touch();
            env.clone()
        }))
    }

    /// Current environment without updating `last_accessed_at`.
    pub fn peek_preview(&self, project_id: &ProjectId) -> Option<PreviewEnvironment> {
        self.slot(project_id).map(|slot| slot.snapshot())
    }

    pub fn has_preview(&self, project_id: &ProjectId) -> bool {
        self.inner.slots.lock().contains_key(project_id)
    }

    /// Environment log followed by a tail of native container output.
    ///
    /// Failing to fetch container output is not an error; the environment
    /// log alone is returned.
    pub async fn get_logs(&self, project_id: &ProjectId) -> Option<Vec<String>> {
        let slot = self.slot(project_id)?;
        let (mut logs, container) = {
            let env = slot.env.lock();
            (env.logs.clone(), env.container_ref.clone())
        };

        if let Some(container) = container {
            match self
                .inner
                .engine
                .container_logs(&container, self.inner.config.log_tail_lines)
                .await
            {
                Ok(lines) => {
                    logs.push(CONTAINER_LOGS_MARKER.to_string());
                    logs.extend(lines);
                }
                Err(e) => {
                    tracing::debug!(project = %project_id, error = %e, "container logs unavailable");
                }
            }
        }

        Some(logs)
    }

    /// Every registered environment, ordered by project id.
    pub fn list_previews(&self) -> Vec<PreviewEnvironment> {
        let slots: Vec<Arc<PreviewSlot>> = self.inner.slots.lock().values().cloned().collect();
        let mut envs: Vec<PreviewEnvironment> = slots.iter().map(|s| s.snapshot()).collect();
        envs.sort_by(|a, b| a.project_id.cmp(&b.project_id));
        envs
    }

    /// Environments that exceeded `max_lifetime` or sat idle longer than
    /// `idle_timeout` at `now`.
    pub fn expired_previews(
        &self,
        now: DateTime<Utc>,
        max_lifetime: std::time::Duration,
        idle_timeout: std::time::Duration,
    ) -> Vec<PreviewEnvironment> {
        self.list_previews()
            .into_iter()
            .filter(|env| env.is_stale(now, max_lifetime, idle_timeout))
            .collect()
    }

    /// Re-reads the engine state of a running environment and marks it
    /// `error` if its container died. Returns the resulting status.
    pub async fn refresh_status(&self, project_id: &ProjectId) -> Option<PreviewStatus> {
        let slot = self.slot(project_id)?;
        let (status, container) = {
            let env = slot.env.lock();
            (env.status, env.container_ref.clone())
        };

        if let (PreviewStatus::Running, Some(container)) = (status, container) {
            match self.inner.engine.container_state(&container).await {
                Ok(state) if state.is_terminal() => {
                    tracing::warn!(project = %project_id, %state, "preview container died");
                    slot.update(|env| env.fail(format!("container {} unexpectedly", state)));
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::debug!(project = %project_id, error = %e, "failed to inspect container");
                }
            }
        }

        Some(slot.snapshot().status)
    }

    /// Removes labelled containers, images and scratch directories that no
    /// registered environment owns. Returns how many resources were removed.
    pub async fn reclaim_orphans(&self) -> Result<usize> {
        let live: HashSet<String> = self
            .list_previews()
            .into_iter()
            .map(|env| env.preview_id)
            .collect();
        let owned = |preview_id: Option<&str>| preview_id.is_some_and(|id| live.contains(id));
        let engine = &self.inner.engine;
        let filter = managed_filter();
        let mut removed = 0;

        for container in engine.list_containers(&filter).await? {
            if owned(container.preview_id()) {
                continue;
            }
            match engine.remove_container(&container.id).await {
                Ok(()) => {
                    tracing::info!(container = %container.name, "removed orphaned container");
                    removed += 1;
                }
                Err(e) => {
                    tracing::warn!(container = %container.name, error = %e, "failed to remove orphaned container")
                }
            }
        }

        for image in engine.list_images(&filter).await? {
            if owned(image.preview_id()) {
                continue;
            }
            match engine.remove_image(&image.name).await {
                Ok(()) => {
                    tracing::info!(image = %image.name, "removed orphaned image");
                    removed += 1;
                }
                Err(e) => {
                    tracing::warn!(image = %image.name, error = %e, "failed to remove orphaned image")
                }
            }
        }

        let previews_dir = self.inner.config.previews_dir();
        match tokio::fs::read_dir(&previews_dir).await {
            Ok(mut entries) => {
                while let Some(entry) = entries.next_entry().await? {
                    let name = entry.file_name().to_string_lossy().into_owned();
                    if live.contains(&name) {
                        continue;
                    }
                    match workspace::remove(&entry.path()).await {
                        Ok(_) => {
                            tracing::info!(dir = ?entry.path(), "removed orphaned build directory");
                            removed += 1;
                        }
                        Err(e) => tracing::warn!(
                            dir = ?entry.path(),
                            error = %e,
                            "failed to remove orphaned build directory"
                        ),
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        Ok(removed)
    }

    /// Stops every environment. Individual failures are logged.
    pub async fn shutdown(&self) {
        let projects: Vec<ProjectId> = self.inner.slots.lock().keys().cloned().collect();
        tracing::info!(count = projects.len(), "stopping all previews");
        for project_id in projects {
            if let Err(e) = self.stop_preview(&project_id).await {
                tracing::warn!(project = %project_id, error = %e, "failed to stop preview");
            }
        }
    }

    fn slot(&self, project_id: &ProjectId) -> Option<Arc<PreviewSlot>> {
        self.inner.slots.lock().get(project_id).cloned()
    }

    fn lifecycle_lock(&self, project_id: &ProjectId) -> Arc<tokio::sync::Mutex<()>> {
        self.inner
            .lifecycle
            .lock()
            .entry(project_id.clone())
            .or_default()
            .clone()
    }

    /// Runs `op` in its own task while holding the project's lifecycle lock.
    ///
    /// The lock's map entry is dropped once no other operation waits on it.
    async fn run_exclusive<T, F>(&self, project_id: ProjectId, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: Future<Output = Result<T>> + Send + 'static,
    {
        let lock = self.lifecycle_lock(&project_id);
        let inner = self.inner.clone();
        let key = project_id.clone();
        let handle = tokio::spawn(async move {
            let result = {
                let _guard = lock.lock().await;
                op.await
            };
            drop(lock);
            inner.release_lifecycle_lock(&key);
            result
        });
        handle
            .await
            .map_err(|e| Error::Task(format!("lifecycle task for {} failed: {}", project_id, e)))?
    }

    fn build_dir(&self, preview_id: &str) -> PathBuf {
        self.inner.config.previews_dir().join(preview_id)
    }

    async fn create_locked(
        &self,
        project_id: &ProjectId,
        files: Option<FileMap>,
    ) -> Result<PreviewEnvironment> {
        let files: FileMap = files
            .unwrap_or_else(|| self.inner.vfs.files(project_id))
            .into_iter()
            .map(|(path, content)| (normalize_path(&path), content))
            .collect();
        if files.is_empty() {
            return Err(Error::NoFiles);
        }

        if self.stop_locked(project_id).await {
            tracing::info!(project = %project_id, "replaced existing preview");
        }

        let preview_id = new_preview_id();
        let container_name = format!("{}{}", NAME_PREFIX, preview_id);
        let slot = Arc::new(PreviewSlot::new(PreviewEnvironment::new(
            project_id.clone(),
            preview_id,
            container_name,
        )));
        self.inner
            .slots
            .lock()
            .insert(project_id.clone(), slot.clone());
        slot.log("Creating preview environment...");

        match self.provision(&slot, &files).await {
            Ok(()) => {
                slot.update(|env| {
                    env.transition(PreviewStatus::Running);
                    let url = env.url.clone().unwrap_or_default();
                    env.append_log(format!("Preview ready at {}", url));
                });
                Ok(slot.snapshot())
            }
            Err(e) => {
                tracing::error!(project = %project_id, error = %e, "preview creation failed");
                slot.update(|env| env.fail(e.to_string()));
                Err(e)
            }
        }
    }

    /// Steps after registration: detect, materialise, build, run, wait.
    async fn provision(&self, slot: &Arc<PreviewSlot>, files: &FileMap) -> Result<()> {
        let config = &self.inner.config;
        let engine = &self.inner.engine;
        let (project_id, preview_id, name) = {
            let env = slot.env.lock();
            (
                env.project_id.clone(),
                env.preview_id.clone(),
                env.container_name.clone(),
            )
        };

        let kind = ProjectKind::detect(files);
        let recipe = kind.recipe();
        slot.update(|env| {
            env.kind = Some(kind);
            env.append_log(format!("Detected project type: {}", kind));
        });

        let dir = self.build_dir(&preview_id);
        let context = workspace::materialize(&dir, files, &recipe).await?;
        slot.log(format!(
            "Wrote {} files to {}",
            context.files_written,
            context.dir.display()
        ));
        if context.synthesized_recipe {
            slot.log(format!("Generated build recipe for {}", kind));
        }

        self.inner
            .network
            .get_or_try_init(|| engine.ensure_network(&config.network))
            .await?;

        let labels = preview_labels(project_id.as_str(), &preview_id);
        slot.log(format!("Building image {}...", name));
        let sink = {
            let slot = slot.clone();
            move |line: &str| slot.log(line)
        };
        engine
            .build_image(
                &BuildSpec {
                    context_dir: &dir,
                    tag: &name,
                    labels: &labels,
                },
                &sink,
            )
            .await?;
        slot.log("Image built successfully");

        let lease = self.inner.ports.allocate()?;
        let port = lease.port();
        *slot.port.lock() = Some(lease);
        slot.update(|env| {
            env.port = Some(port);
            env.append_log(format!("Allocated host port {}", port));
        });

        let container = engine
            .run_container(&RunSpec {
                image: name.clone(),
                name: name.clone(),
                network: config.network.clone(),
                host_port: port,
                container_port: recipe.container_port,
                memory_bytes: recipe.memory_bytes,
                cpus: recipe.cpus,
                labels,
            })
            .await?;
        slot.update(|env| {
            env.container_ref = Some(container.clone());
            env.url = Some(format!("http://{}:{}", config.host, port));
            let short: String = container.chars().take(12).collect();
            env.append_log(format!("Container started: {}", short));
        });

        self.wait_until_running(slot, &container).await
    }

    async fn wait_until_running(&self, slot: &PreviewSlot, container: &str) -> Result<()> {
        let config = &self.inner.config;
        let engine = &self.inner.engine;
        let deadline = config.health_timeout();
        slot.log("Waiting for container to start...");

        let poll = async {
            loop {
                match engine.container_state(container).await {
                    Ok(ContainerState::Running) => return Ok(()),
                    Ok(state) if state.is_terminal() => {
                        let output = engine
                            .container_logs(container, config.log_tail_lines)
                            .await
                            .unwrap_or_default();
                        return Err(Error::StartFailure(format!(
                            "container {}: {}",
                            state,
                            output.join("\n")
                        )));
                    }
                    Ok(_) => {}
                    Err(e) => {
                        return Err(Error::StartFailure(format!(
                            "failed to inspect container: {}",
                            e
                        )))
                    }
                }
                tokio::time::sleep(config.health_poll_interval()).await;
            }
        };

        match tokio::time::timeout(deadline, poll).await {
            Ok(result) => result?,
            Err(_) => return Err(Error::HealthTimeout(deadline)),
        }

        slot.log("Container is running");
        let settle = config.settle_delay();
        if !settle.is_zero() {
            tokio::time::sleep(settle).await;
        }
        Ok(())
    }

    /// Teardown; caller holds the lifecycle lock.
    async fn stop_locked(&self, project_id: &ProjectId) -> bool {
        let Some(slot) = self.slot(project_id) else {
            return false;
        };
        let engine = &self.inner.engine;
        let (preview_id, name, container) = {
            let env = slot.env.lock();
            (
                env.preview_id.clone(),
                env.container_name.clone(),
                env.container_ref.clone(),
            )
        };
        slot.log("Stopping preview...");

        if let Some(container) = container {
            if let Err(e) = engine
                .stop_container(&container, self.inner.config.stop_timeout())
                .await
            {
                tracing::warn!(project = %project_id, error = %e, "failed to stop container");
            }
            match engine.remove_container(&container).await {
                Ok(()) => slot.log("Container stopped and removed"),
                Err(e) => {
                    tracing::warn!(project = %project_id, error = %e, "failed to remove container")
                }
            }
        }

        match workspace::remove(&self.build_dir(&preview_id)).await {
            Ok(true) => slot.log("Build directory cleaned up"),
            Ok(false) => {}
            Err(e) => {
                tracing::warn!(project = %project_id, error = %e, "failed to remove build directory")
            }
        }

        match engine.remove_image(&name).await {
            Ok(()) => slot.log("Image removed"),
            Err(e) => tracing::warn!(
                project = %project_id,
                image = %name,
                error = %e,
                "failed to remove image"
            ),
        }

        slot.port.lock().take();
        slot.update(|env| env.transition(PreviewStatus::Stopped));

        let mut slots = self.inner.slots.lock();
        if slots
            .get(project_id)
            .is_some_and(|current| Arc::ptr_eq(current, &slot))
        {
            slots.remove(project_id);
        }
        tracing::info!(project = %project_id, preview = %preview_id, "preview stopped");
        true
    }
}

fn new_preview_id() -> String {
    let mut id = uuid::Uuid::new_v4().simple().to_string();
    id.truncate(12);
    id
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::memory::{InMemoryEngine, StartBehaviour};
    use crate::sandbox::project::RECIPE_FILE;
    use std::time::Duration;

    struct Harness {
        _tmp: tempfile::TempDir,
        engine: Arc<InMemoryEngine>,
        manager: PreviewManager,
    }

    fn harness(port_start: u16) -> Harness {
        let tmp = tempfile::TempDir::new().unwrap();
        let engine = Arc::new(InMemoryEngine::new());
        let config = PreviewConfig {
            work_dir: tmp.path().to_path_buf(),
            port_range_start: port_start,
            port_range_end: port_start + 20,
            health_timeout_secs: 1,
            health_poll_interval_ms: 10,
            settle_delay_ms: 0,
            ..Default::default()
        };
        let manager = PreviewManager::new(engine.clone(), VfsRegistry::new(), config);
        Harness {
            _tmp: tmp,
            engine,
            manager,
        }
    }

    fn site(body: &str) -> FileMap {
        FileMap::from([("index.html".to_string(), body.to_string())])
    }

    #[tokio::test]
    async fn create_reaches_running_with_url() {
        let h = harness(47300);
        let id = ProjectId::from("p1");

        let env = h.manager.create_preview(&id, Some(site("<h1>v1</h1>"))).await.unwrap();

        assert_eq!(env.status, PreviewStatus::Running);
        assert_eq!(env.kind, Some(ProjectKind::Static));
        assert!(env.url.as_deref().unwrap().starts_with("http://localhost:"));
        assert!(env.logs.iter().any(|l| l.contains("Step 1/")));
        assert!(h.engine.has_network("preview-sandbox-net"));
        let spec = h.engine.run_spec(&env.container_name).unwrap();
        assert_eq!(spec.container_port, 80);
        assert_eq!(Some(spec.host_port), env.port);
    }

    #[tokio::test]
    async fn files_default_to_working_tree() {
        let h = harness(47330);
        let id = ProjectId::from("p1");
        h.manager
            .vfs()
            .get_or_create(&id)
            .lock()
            .write("requirements.txt", "fastapi");

        let env = h.manager.create_preview(&id, None).await.unwrap();
        assert_eq!(env.kind, Some(ProjectKind::Python));
    }

    #[tokio::test]
    async fn empty_files_register_nothing() {
        let h = harness(47360);
        let id = ProjectId::from("p1");

        let err = h.manager.create_preview(&id, Some(FileMap::new())).await.unwrap_err();
        assert!(matches!(err, Error::NoFiles));
        assert!(h.manager.get_preview(&id).is_none());

        let err = h.manager.create_preview(&id, None).await.unwrap_err();
        assert!(matches!(err, Error::NoFiles));
        assert_eq!(h.engine.build_count(), 0);
    }

    #[tokio::test]
    async fn build_failure_is_recorded_on_environment() {
        let h = harness(47390);
        h.engine.fail_builds(true);
        let id = ProjectId::from("p1");

        let err = h.manager.create_preview(&id, Some(site("x"))).await.unwrap_err();
        assert!(matches!(err, Error::BuildFailure { .. }));

        let env = h.manager.get_preview(&id).unwrap();
        assert_eq!(env.status, PreviewStatus::Error);
        assert!(env.error_message.unwrap().contains("exit code 1"));
        assert_eq!(h.manager.ports_in_use(), 0);
    }

    #[tokio::test]
    async fn exiting_container_is_start_failure() {
        let h = harness(47420);
        h.engine.set_start_behaviour(StartBehaviour::Exit);
        let id = ProjectId::from("p1");

        let err = h.manager.create_preview(&id, Some(site("x"))).await.unwrap_err();
        assert!(matches!(err, Error::StartFailure(_)));
        assert!(err.to_string().contains("entrypoint exited"));
        assert_eq!(h.manager.get_preview(&id).unwrap().status, PreviewStatus::Error);
    }

    #[tokio::test]
    async fn hanging_container_times_out() {
        let h = harness(47450);
        h.engine.set_start_behaviour(StartBehaviour::Hang);
        let id = ProjectId::from("p1");

        let err = h.manager.create_preview(&id, Some(site("x"))).await.unwrap_err();
        assert!(matches!(err, Error::HealthTimeout(d) if d == Duration::from_secs(1)));
        assert_eq!(h.manager.get_preview(&id).unwrap().status, PreviewStatus::Error);
    }

    #[tokio::test]
    async fn failed_environment_is_reclaimed_by_stop() {
        let h = harness(47480);
        h.engine.set_start_behaviour(StartBehaviour::Exit);
        let id = ProjectId::from("p1");
        let _ = h.manager.create_preview(&id, Some(site("x"))).await;
        assert_eq!(h.engine.container_count(), 1);
        assert_eq!(h.manager.ports_in_use(), 1);

        assert!(h.manager.stop_preview(&id).await.unwrap());
        assert_eq!(h.engine.container_count(), 0);
        assert!(h.engine.image_tags().is_empty());
        assert_eq!(h.manager.ports_in_use(), 0);
    }

    #[tokio::test]
    async fn stop_twice_reports_absence() {
        let h = harness(47510);
        let id = ProjectId::from("p1");
        let env = h.manager.create_preview(&id, Some(site("x"))).await.unwrap();
        let dir = h.manager.config().previews_dir().join(&env.preview_id);
        assert!(dir.exists());

        assert!(h.manager.stop_preview(&id).await.unwrap());
        assert!(!h.manager.stop_preview(&id).await.unwrap());
        assert!(h.manager.get_preview(&id).is_none());
        assert!(!dir.exists());
    }

    #[tokio::test]
    async fn image_removal_failure_is_not_fatal() {
        let h = harness(47540);
        h.engine.fail_image_removal(true);
        let id = ProjectId::from("p1");
        h.manager.create_preview(&id, Some(site("x"))).await.unwrap();

        assert!(h.manager.stop_preview(&id).await.unwrap());
        assert!(h.manager.get_preview(&id).is_none());
        assert_eq!(h.engine.image_tags().len(), 1);
    }

    #[tokio::test]
    async fn update_replaces_environment() {
        let h = harness(47570);
        let id = ProjectId::from("p1");
        let first = h.manager.create_preview(&id, Some(site("v1"))).await.unwrap();

        let second = h.manager.update_preview(&id, site("v2")).await.unwrap();

        assert_ne!(first.preview_id, second.preview_id);
        assert_eq!(second.project_id, id);
        assert_eq!(h.manager.list_previews().len(), 1);
        assert_eq!(h.engine.live_container_names(), vec![second.container_name]);
    }

    #[tokio::test]
    async fn update_without_environment_creates() {
        let h = harness(47600);
        let id = ProjectId::from("p1");
        let env = h.manager.update_preview(&id, site("v1")).await.unwrap();
        assert_eq!(env.status, PreviewStatus::Running);
    }

    #[tokio::test]
    async fn get_preview_touches_but_peek_does_not() {
        let h = harness(47630);
        let id = ProjectId::from("p1");
        let created = h.manager.create_preview(&id, Some(site("x"))).await.unwrap();

        let peeked = h.manager.peek_preview(&id).unwrap();
        assert_eq!(peeked.last_accessed_at, created.last_accessed_at);

        tokio::time::sleep(Duration::from_millis(5)).await;
        let got = h.manager.get_preview(&id).unwrap();
        assert!(got.last_accessed_at > created.last_accessed_at);
    }

    #[tokio::test]
    async fn logs_merge_container_tail() {
        let h = harness(47660);
        let id = ProjectId::from("p1");
        h.manager.create_preview(&id, Some(site("x"))).await.unwrap();

        let logs = h.manager.get_logs(&id).await.unwrap();
        let marker = logs.iter().position(|l| l == CONTAINER_LOGS_MARKER).unwrap();
        assert!(logs[..marker].iter().any(|l| l.contains("Creating preview")));
        assert!(logs[marker + 1].contains("listening"));

        assert!(h.manager.get_logs(&ProjectId::from("nope")).await.is_none());
    }

    #[tokio::test]
    async fn crash_is_detected_on_refresh() {
        let h = harness(47690);
        let id = ProjectId::from("p1");
        let env = h.manager.create_preview(&id, Some(site("x"))).await.unwrap();

        h.engine.kill(env.container_ref.as_deref().unwrap());
        assert_eq!(h.manager.refresh_status(&id).await, Some(PreviewStatus::Error));
        assert!(h.manager.peek_preview(&id).unwrap().error_message.is_some());
    }

    #[tokio::test]
    async fn concurrent_creates_get_distinct_ports() {
        let h = harness(47720);
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let manager = h.manager.clone();
                tokio::spawn(async move {
                    manager
                        .create_preview(&ProjectId::from(format!("p{}", i)), Some(site("x")))
                        .await
                })
            })
            .collect();

        let mut ports = HashSet::new();
        for handle in handles {
            let env = handle.await.unwrap().unwrap();
            assert!(ports.insert(env.port.unwrap()));
        }
        assert_eq!(ports.len(), 8);
    }

    #[tokio::test]
    async fn concurrent_creates_for_one_project_leave_one_environment() {
        let h = harness(47750);
        let id = ProjectId::from("p1");
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let manager = h.manager.clone();
                let id = id.clone();
                tokio::spawn(async move { manager.create_preview(&id, Some(site("x"))).await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(h.manager.list_previews().len(), 1);
        assert_eq!(h.engine.live_container_names().len(), 1);
        assert_eq!(h.manager.ports_in_use(), 1);
    }

    #[tokio::test]
    async fn reclaim_removes_unowned_resources() {
        let h = harness(47780);
        let id = ProjectId::from("p1");
        let live = h.manager.create_preview(&id, Some(site("x"))).await.unwrap();

        h.engine.plant_container(RunSpec {
            image: "preview-sandbox-dead".into(),
            name: "preview-sandbox-dead".into(),
            network: "net".into(),
            host_port: 1,
            container_port: 80,
            memory_bytes: 1,
            cpus: 0.1,
            labels: preview_labels("old", "dead"),
        });
        h.engine
            .plant_image("preview-sandbox-dead", preview_labels("old", "dead"));
        let stale_dir = h.manager.config().previews_dir().join("dead");
        std::fs::create_dir_all(&stale_dir).unwrap();

        let removed = h.manager.reclaim_orphans().await.unwrap();

        assert_eq!(removed, 3);
        assert!(!stale_dir.exists());
        assert_eq!(h.engine.live_container_names(), vec![live.container_name.clone()]);
        assert_eq!(h.engine.image_tags(), vec![live.container_name]);
    }

    #[tokio::test]
    async fn shutdown_stops_everything() {
        let h = harness(47810);
        for p in ["a", "b"] {
            h.manager
                .create_preview(&ProjectId::from(p), Some(site("x")))
                .await
                .unwrap();
        }

        h.manager.shutdown().await;

        assert!(h.manager.list_previews().is_empty());
        assert_eq!(h.engine.container_count(), 0);
        assert_eq!(h.manager.ports_in_use(), 0);
    }

    #[tokio::test]
    async fn expired_previews_apply_both_thresholds() {
        let h = harness(47840);
        let id = ProjectId::from("p1");
        h.manager.create_preview(&id, Some(site("x"))).await.unwrap();
        let hour = Duration::from_secs(3600);
        let half = Duration::from_secs(1800);

        assert!(h.manager.expired_previews(Utc::now(), hour, half).is_empty());
        let later = Utc::now() + chrono::TimeDelta::minutes(31);
        let expired = h.manager.expired_previews(later, hour, half);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].project_id, id);
    }

    #[tokio::test]
    async fn lifecycle_locks_are_released_after_use() {
        let h = harness(47200);
        let id = ProjectId::from("p1");
        assert!(!h.manager.stop_preview(&ProjectId::from("ghost")).await.unwrap());
        assert!(h.manager.inner.lifecycle.lock().is_empty());

        h.manager.create_preview(&id, Some(site("x"))).await.unwrap();
        h.manager.update_preview(&id, site("y")).await.unwrap();
        assert!(h.manager.stop_preview(&id).await.unwrap());
        assert!(h.manager.inner.lifecycle.lock().is_empty());
    }

    #[tokio::test]
    async fn conditional_stop_checks_current_environment() {
        let h = harness(47230);
        let id = ProjectId::from("p1");
        let env = h.manager.create_preview(&id, Some(site("x"))).await.unwrap();

        let stopped = h
            .manager
            .stop_preview_if(&id, |current| current.preview_id == "someone-else")
            .await
            .unwrap();
        assert!(!stopped);
        assert!(h.manager.has_preview(&id));

        let judged = env.preview_id.clone();
        let stopped = h
            .manager
            .stop_preview_if(&id, move |current| current.preview_id == judged)
            .await
            .unwrap();
        assert!(stopped);
        assert!(!h.manager.has_preview(&id));
        assert!(!h.manager.stop_preview_if(&id, |_| true).await.unwrap());
    }

    #[tokio::test]
    async fn dot_prefixed_paths_are_recognised() {
        let h = harness(47260);
        let id = ProjectId::from("app");
        let recipe = "FROM node:18-slim\nWORKDIR /app\nCOPY . .\nCMD [\"npm\", \"start\"]\n";
        let files = FileMap::from([
            (
                "./package.json".to_string(),
                r#"{"dependencies":{"react":"^18.2.0"}}"#.to_string(),
            ),
            ("./Dockerfile".to_string(), recipe.to_string()),
        ]);

        let env = h.manager.create_preview(&id, Some(files)).await.unwrap();
        assert_eq!(env.kind, Some(ProjectKind::React));
        let written = std::fs::read_to_string(
            h.manager
                .config()
                .previews_dir()
                .join(&env.preview_id)
                .join(RECIPE_FILE),
        )
        .unwrap();
        assert_eq!(written, recipe);
    }
}
