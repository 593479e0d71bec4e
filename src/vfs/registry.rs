//! Process-wide map of project id → file store.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::project::ProjectId;

use super::store::VirtualFileSystem;
use super::types::FileMap;

/// A store shared between request handlers and the watcher.
pub type SharedVfs = Arc<Mutex<VirtualFileSystem>>;

/// Injectable registry owning one [`VirtualFileSystem`] per project.
///
/// Cloning is cheap; clones share the same map.
#[derive(Clone, Default)]
pub struct VfsRegistry {
    stores: Arc<Mutex<HashMap<ProjectId, SharedVfs>>>,
}

impl VfsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the project's store, creating an empty one on first use.
    pub fn get_or_create(&self, project_id: &ProjectId) -> SharedVfs {
        let mut stores = self.stores.lock();
        stores
            .entry(project_id.clone())
            .or_insert_with(|| {
                tracing::info!(project = %project_id, "created file store");
                Arc::new(Mutex::new(VirtualFileSystem::new(project_id.clone())))
            })
            .clone()
    }

    pub fn get(&self, project_id: &ProjectId) -> Option<SharedVfs> {
        self.stores.lock().get(project_id).cloned()
    }

    /// Registers a store built elsewhere (e.g. loaded from JSON), replacing any existing one.
    pub fn insert(&self, vfs: VirtualFileSystem) -> SharedVfs {
        let project_id = vfs.project_id().clone();
        let shared = Arc::new(Mutex::new(vfs));
        self.stores.lock().insert(project_id, shared.clone());
        shared
    }

    /// Drops a project's store. Returns false if none existed.
    pub fn clear(&self, project_id: &ProjectId) -> bool {
        let removed = self.stores.lock().remove(project_id).is_some();
        if removed {
            tracing::info!(project = %project_id, "cleared file store");
        }
        removed
    }

    pub fn project_ids(&self) -> Vec<ProjectId> {
        self.stores.lock().keys().cloned().collect()
    }

    /// Current working tree of a project, empty if it has no store.
    pub fn files(&self, project_id: &ProjectId) -> FileMap {
        match self.get(project_id) {
            Some(vfs) => {
                let guard = vfs.lock();
                guard.files()
            }
            None => FileMap::new(),
        }
    }

    /// Head commit of a project, if any.
    pub fn head(&self, project_id: &ProjectId) -> Option<String> {
        let vfs = self.get(project_id)?;
        let guard = vfs.lock();
        guard.head().map(str::to_string)
    }
}
