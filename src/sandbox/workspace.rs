//! Per-preview build directories.

use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::vfs::{safe_relative_path, FileMap};

use super::project::{BuildRecipe, RECIPE_FILE};

/// Outcome of writing a build context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Materialized {
    pub dir: PathBuf,
    pub files_written: usize,
    /// True when the project shipped no recipe and the template was used.
    pub synthesized_recipe: bool,
}

/// Writes `files` below `dir`, adding the recipe template when the project
/// has none of its own.
///
/// Every path is validated before anything is written, so a hostile path
/// leaves no partial context behind.
pub async fn materialize(dir: &Path, files: &FileMap, recipe: &BuildRecipe) -> Result<Materialized> {
    let targets = files
        .iter()
        .map(|(path, content)| Ok((dir.join(safe_relative_path(path)?), content)))
        .collect::<Result<Vec<_>>>()?;

    tokio::fs::create_dir_all(dir).await?;
    for (target, content) in &targets {
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(target, content.as_bytes()).await?;
    }

    let synthesized_recipe = !files.contains_key(RECIPE_FILE);
    if synthesized_recipe {
        tokio::fs::write(dir.join(RECIPE_FILE), recipe.dockerfile).await?;
        for (name, content) in recipe.extra_files {
            let target = dir.join(name);
            if !files.contains_key(*name) {
                tokio::fs::write(target, content).await?;
            }
        }
    }

    tracing::debug!(dir = ?dir, files = targets.len(), synthesized_recipe, "materialized build context");
    Ok(Materialized {
        dir: dir.to_path_buf(),
        files_written: targets.len(),
        synthesized_recipe,
    })
}

/// Removes a build directory. A missing directory is not an error.
pub async fn remove(dir: &Path) -> Result<bool> {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}
