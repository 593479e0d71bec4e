//! Versioned in-memory file store.
//!
//! One [`VirtualFileSystem`] per project holds a mutable working tree and an
//! append-only chain of immutable commits. The [`VfsRegistry`] hands stores
//! out to the preview manager and the snapshot watcher.

mod path;
mod registry;
mod store;
mod types;

pub use path::{normalize_path, safe_relative_path};
pub use registry::{SharedVfs, VfsRegistry};
pub use store::{VirtualFileSystem, DEFAULT_BRANCH};
pub use types::{
    Commit, CommitSummary, Diff, DiffEntry, FileMap, FileNode, FileStatus, VfsStatus,
};
