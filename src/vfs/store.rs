//! In-memory working tree with git-like commit history.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

use crate::error::{Error, Result};
use crate::project::ProjectId;

use super::path::{normalize_path, safe_relative_path};
use super::types::{
    Commit, CommitSummary, Diff, DiffEntry, FileMap, FileNode, FileStatus, VfsStatus,
};

/// Branch that always exists.
pub const DEFAULT_BRANCH: &str = "main";

/// Directories skipped when hydrating from disk.
const SKIP_DIRS: &[&str] = &[
    "node_modules",
    ".git",
    "dist",
    "build",
    ".next",
    ".cache",
    "__pycache__",
];

/// Length of the hex commit id.
const COMMIT_ID_LEN: usize = 12;

/// Versioned file store for one project.
///
/// The working tree is the only mutable state; commits are append-only and
/// never touched after creation. Branches are plain name → commit pointers,
/// there is no merge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VirtualFileSystem {
    project_id: ProjectId,
    files: BTreeMap<String, FileNode>,
    commits: Vec<Commit>,
    #[serde(skip)]
    commit_index: HashMap<String, usize>,
    head: Option<String>,
    branches: BTreeMap<String, Option<String>>,
    current_branch: String,
    sequence: u64,
}

impl VirtualFileSystem {
    /// Creates an empty store with an unborn `main` branch.
    pub fn new(project_id: ProjectId) -> Self {
        let mut branches = BTreeMap::new();
        branches.insert(DEFAULT_BRANCH.to_string(), None);
        Self {
            project_id,
            files: BTreeMap::new(),
            commits: Vec::new(),
            commit_index: HashMap::new(),
            head: None,
            branches,
            current_branch: DEFAULT_BRANCH.to_string(),
            sequence: 0,
        }
    }

    pub fn project_id(&self) -> &ProjectId {
        &self.project_id
    }

    /// Current head commit id, `None` before the first commit.
    pub fn head(&self) -> Option<&str> {
        self.head.as_deref()
    }

    pub fn current_branch(&self) -> &str {
        &self.current_branch
    }

    /// Branch names with the commit each one points at.
    pub fn branches(&self) -> &BTreeMap<String, Option<String>> {
        &self.branches
    }

    /// Looks up a commit by id.
    pub fn commit_by_id(&self, id: &str) -> Option<&Commit> {
        self.commit_index.get(id).map(|&idx| &self.commits[idx])
    }

    /// Upserts a file in the working tree.
    ///
    /// The status is computed against the head commit, so writing back the
    /// committed content resets the node to `unchanged`. Writing content that
    /// is identical to the current node leaves it untouched.
    pub fn write(&mut self, path: &str, content: impl Into<String>) {
        let path = normalize_path(path);
        let content = content.into();
        let status = self.status_against_head(&path, &content);
        let now = Utc::now();

        match self.files.get_mut(&path) {
            Some(node) => {
                if node.status != FileStatus::Deleted && node.content == content {
                    return;
                }
                node.content = content;
                node.status = status;
                node.modified_at = now;
            }
            None => {
                self.files
                    .insert(path.clone(), FileNode::new(path, content, status, now));
            }
        }
    }

    /// Writes every entry of a file map.
    pub fn write_all(&mut self, files: &FileMap) {
        for (path, content) in files {
            self.write(path, content.as_str());
        }
    }

    /// Reads a file from the working tree. Deleted nodes read as absent.
    pub fn read(&self, path: &str) -> Option<&str> {
        self.files
            .get(&normalize_path(path))
            .filter(|node| node.status != FileStatus::Deleted)
            .map(|node| node.content.as_str())
    }

    /// Marks a file deleted. It is dropped from the tree at the next commit.
    ///
    /// Returns false if the path was absent or already deleted.
    pub fn delete(&mut self, path: &str) -> bool {
        match self.files.get_mut(&normalize_path(path)) {
            Some(node) if node.status != FileStatus::Deleted => {
                node.status = FileStatus::Deleted;
                node.modified_at = Utc::now();
                true
            }
            _ => false,
        }
    }

    /// Nodes whose status is not `unchanged`.
    pub fn changed_files(&self) -> BTreeMap<&str, &FileNode> {
        self.files
            .iter()
            .filter(|(_, node)| node.status != FileStatus::Unchanged)
            .map(|(path, node)| (path.as_str(), node))
            .collect()
    }

    /// Current working tree as path → content, without deleted nodes.
    pub fn files(&self) -> FileMap {
        self.live_nodes()
            .map(|(path, node)| (path.clone(), node.content.clone()))
            .collect()
    }

    /// Working-tree nodes including their status.
    pub fn nodes(&self) -> impl Iterator<Item = &FileNode> {
        self.files.values()
    }

    /// Snapshots the working tree and advances the current branch.
    pub fn commit(&mut self, message: impl Into<String>) -> Result<String> {
        let message = message.into();
        let timestamp = Utc::now();
        self.sequence += 1;
        let id = derive_commit_id(&self.project_id, timestamp, self.sequence);
        if self.commit_index.contains_key(&id) {
            return Err(Error::CommitCollision(id));
        }

        self.files.retain(|_, node| node.status != FileStatus::Deleted);
        for node in self.files.values_mut() {
            node.status = FileStatus::Unchanged;
        }

        let commit = Commit {
            id: id.clone(),
            message,
            timestamp,
            parent_id: self.head.clone(),
            files: self.files.clone(),
        };

        tracing::info!(
            project = %self.project_id,
            commit = %id,
            message = %commit.message,
            files = commit.files.len(),
            "created commit"
        );

        self.commit_index.insert(id.clone(), self.commits.len());
        self.commits.push(commit);
        self.head = Some(id.clone());
        self.branches
            .insert(self.current_branch.clone(), Some(id.clone()));

        Ok(id)
    }

    /// Replaces the working tree with a commit's snapshot.
    ///
    /// History is kept: later commits stay reachable by id.
    pub fn rollback(&mut self, commit_id: &str) -> Result<()> {
        let Some(commit) = self.commit_by_id(commit_id) else {
            tracing::warn!(project = %self.project_id, commit = %commit_id, "commit not found");
            return Err(Error::CommitNotFound(commit_id.to_string()));
        };

        self.files = commit.files.clone();
        self.head = Some(commit_id.to_string());
        tracing::info!(project = %self.project_id, commit = %commit_id, "rolled back");
        Ok(())
    }

    /// Compares the working tree with a commit, or with the empty tree.
    pub fn diff(&self, from_commit: Option<&str>) -> Result<Diff> {
        let empty = BTreeMap::new();
        let base = match from_commit {
            Some(id) => {
                &self
                    .commit_by_id(id)
                    .ok_or_else(|| Error::CommitNotFound(id.to_string()))?
                    .files
            }
            None => &empty,
        };

        let mut diff = Diff::new();
        for (path, node) in self.live_nodes() {
            match base.get(path) {
                None => {
                    diff.insert(
                        path.clone(),
                        DiffEntry::Added {
                            content: node.content.clone(),
                        },
                    );
                }
                Some(old) if old.content != node.content => {
                    diff.insert(
                        path.clone(),
                        DiffEntry::Modified {
                            old_content: old.content.clone(),
                            new_content: node.content.clone(),
                        },
                    );
                }
                Some(_) => {}
            }
        }

        for (path, old) in base {
            let present = self
                .files
                .get(path)
                .is_some_and(|node| node.status != FileStatus::Deleted);
            if !present {
                diff.insert(
                    path.clone(),
                    DiffEntry::Deleted {
                        old_content: old.content.clone(),
                    },
                );
            }
        }

        Ok(diff)
    }

    /// Creates a branch at `from_commit`, or at head when not given.
    pub fn create_branch(&mut self, name: &str, from_commit: Option<&str>) -> Result<()> {
        if self.branches.contains_key(name) {
            return Err(Error::BranchExists(name.to_string()));
        }

        let target = match from_commit {
            Some(id) if self.commit_index.contains_key(id) => Some(id.to_string()),
            Some(id) => return Err(Error::CommitNotFound(id.to_string())),
            None => self.head.clone(),
        };

        tracing::info!(project = %self.project_id, branch = %name, from = ?target, "created branch");
        self.branches.insert(name.to_string(), target);
        Ok(())
    }

    /// Switches branch, checking out its head commit.
    ///
    /// An unborn branch keeps the current working tree.
    pub fn switch_branch(&mut self, name: &str) -> Result<()> {
        let target = self
            .branches
            .get(name)
            .ok_or_else(|| Error::BranchNotFound(name.to_string()))?
            .clone();

        if let Some(commit_id) = target {
            self.rollback(&commit_id)?;
        }

        self.current_branch = name.to_string();
        tracing::info!(project = %self.project_id, branch = %name, "switched branch");
        Ok(())
    }

    /// Materialises the working tree under `base`. Returns the number of files written.
    pub fn export_to_disk(&self, base: &Path) -> Result<usize> {
        std::fs::create_dir_all(base)?;

        let mut written = 0;
        for (path, node) in self.live_nodes() {
            let target = base.join(safe_relative_path(path)?);
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&target, &node.content)?;
            written += 1;
        }

        tracing::info!(project = %self.project_id, files = written, path = ?base, "exported to disk");
        Ok(written)
    }

    /// Writes every UTF-8 file under `base` into the working tree.
    ///
    /// Build artifact directories are skipped. Returns the number of files read.
    pub fn import_from_disk(&mut self, base: &Path) -> Result<usize> {
        let mut imported = 0;
        let walker = WalkDir::new(base).into_iter().filter_entry(|entry| {
            entry.depth() == 0
                || !entry
                    .file_name()
                    .to_str()
                    .is_some_and(|name| SKIP_DIRS.contains(&name))
        });

        for entry in walker {
            let entry = entry.map_err(|e| Error::Io(std::io::Error::other(e)))?;
            if !entry.file_type().is_file() {
                continue;
            }

            let Ok(relative) = entry.path().strip_prefix(base) else {
                continue;
            };
            let key = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");

            match std::fs::read_to_string(entry.path()) {
                Ok(content) => {
                    self.write(&key, content);
                    imported += 1;
                }
                Err(e) if e.kind() == std::io::ErrorKind::InvalidData => {
                    tracing::debug!(path = %key, "skipping non-UTF-8 file");
                }
                Err(e) => return Err(e.into()),
            }
        }

        tracing::info!(project = %self.project_id, files = imported, path = ?base, "imported from disk");
        Ok(imported)
    }

    /// Persists the whole store (tree, commits, branches) as JSON.
    pub fn save_to_json(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        tracing::info!(project = %self.project_id, path = ?path, "saved store");
        Ok(())
    }

    /// Restores a store saved with [`save_to_json`](Self::save_to_json).
    pub fn load_from_json(path: &Path) -> Result<Self> {
        let mut vfs: Self = serde_json::from_str(&std::fs::read_to_string(path)?)?;
        vfs.commit_index = vfs
            .commits
            .iter()
            .enumerate()
            .map(|(idx, commit)| (commit.id.clone(), idx))
            .collect();
        tracing::info!(project = %vfs.project_id, path = ?path, "loaded store");
        Ok(vfs)
    }

    pub fn status(&self) -> VfsStatus {
        let changes: BTreeMap<String, FileStatus> = self
            .changed_files()
            .into_iter()
            .map(|(path, node)| (path.to_string(), node.status))
            .collect();

        VfsStatus {
            project_id: self.project_id.to_string(),
            current_branch: self.current_branch.clone(),
            head: self.head.clone(),
            total_files: self.live_nodes().count(),
            changed_files: changes.len(),
            changes,
            total_commits: self.commits.len(),
            branches: self.branches.keys().cloned().collect(),
        }
    }

    /// Most recent commits first.
    pub fn history(&self, limit: usize) -> Vec<CommitSummary> {
        self.commits
            .iter()
            .rev()
            .take(limit)
            .map(CommitSummary::from)
            .collect()
    }

    fn live_nodes(&self) -> impl Iterator<Item = (&String, &FileNode)> {
        self.files
            .iter()
            .filter(|(_, node)| node.status != FileStatus::Deleted)
    }

    fn status_against_head(&self, path: &str, content: &str) -> FileStatus {
        let committed = self
            .head
            .as_deref()
            .and_then(|id| self.commit_by_id(id))
            .and_then(|commit| commit.files.get(path));

        match committed {
            None => FileStatus::Added,
            Some(node) if node.content == content => FileStatus::Unchanged,
            Some(_) => FileStatus::Modified,
        }
    }
}

fn derive_commit_id(project_id: &ProjectId, timestamp: DateTime<Utc>, sequence: u64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(project_id.as_str().as_bytes());
    hasher.update(b"-");
    hasher.update(timestamp.to_rfc3339().as_bytes());
    hasher.update(b"-");
    hasher.update(sequence.to_le_bytes());
    let mut id = hex::encode(hasher.finalize());
    id.truncate(COMMIT_ID_LEN);
    id
}
