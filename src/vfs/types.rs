//! Data model of the versioned file store.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Relative path → file content. The shape every collaborator exchanges.
pub type FileMap = BTreeMap<String, String>;

/// Divergence of a working-tree node from the last commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
    Added,
    Modified,
    Deleted,
    Unchanged,
}

/// A file in the working tree or in a commit snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileNode {
    /// Relative, slash-separated path. Unique within a tree.
    pub path: String,
    pub content: String,
    pub status: FileStatus,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

impl FileNode {
    pub(crate) fn new(path: String, content: String, status: FileStatus, now: DateTime<Utc>) -> Self {
        Self {
            path,
            content,
            status,
            created_at: now,
            modified_at: now,
        }
    }
}

/// An immutable snapshot of the working tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Commit {
    pub id: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    /// `None` only for the first commit of a store.
    pub parent_id: Option<String>,
    /// Every node is stored with status `unchanged`.
    pub files: BTreeMap<String, FileNode>,
}

impl Commit {
    /// Returns the snapshot as a plain path → content map.
    pub fn file_map(&self) -> FileMap {
        self.files
            .iter()
            .map(|(path, node)| (path.clone(), node.content.clone()))
            .collect()
    }
}

/// One line of `history()` output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitSummary {
    pub id: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub files_count: usize,
    pub parent_id: Option<String>,
}

impl From<&Commit> for CommitSummary {
    fn from(commit: &Commit) -> Self {
        Self {
            id: commit.id.clone(),
            message: commit.message.clone(),
            timestamp: commit.timestamp,
            files_count: commit.files.len(),
            parent_id: commit.parent_id.clone(),
        }
    }
}

/// How a single path differs between a base snapshot and the working tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum DiffEntry {
    Added { content: String },
    Modified { old_content: String, new_content: String },
    Deleted { old_content: String },
}

impl DiffEntry {
    /// The status label of this entry.
    pub fn status(&self) -> FileStatus {
        match self {
            DiffEntry::Added { .. } => FileStatus::Added,
            DiffEntry::Modified { .. } => FileStatus::Modified,
            DiffEntry::Deleted { .. } => FileStatus::Deleted,
        }
    }
}

/// Result of `diff()`, keyed by path.
pub type Diff = BTreeMap<String, DiffEntry>;

/// Summary returned by `status()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VfsStatus {
    pub project_id: String,
    pub current_branch: String,
    pub head: Option<String>,
    pub total_files: usize,
    pub changed_files: usize,
    pub changes: BTreeMap<String, FileStatus>,
    pub total_commits: usize,
    pub branches: Vec<String>,
}
