//! Path normalisation for working-tree keys and on-disk materialisation.

use std::path::{Component, Path, PathBuf};

use crate::error::{Error, Result};

/// Normalises a working-tree key: backslashes become slashes and leading
/// `./` or `/` segments are dropped.
pub fn normalize_path(path: &str) -> String {
    let mut normalized = path.trim().replace('\\', "/");
    loop {
        if let Some(rest) = normalized.strip_prefix("./") {
            normalized = rest.to_string();
        } else if let Some(rest) = normalized.strip_prefix('/') {
            normalized = rest.to_string();
        } else {
            break;
        }
    }
    normalized
}

/// Converts a working-tree key into a path that stays under its root.
pub fn safe_relative_path(path: &str) -> Result<PathBuf> {
    let normalized = normalize_path(path);
    if normalized.is_empty() {
        return Err(Error::InvalidPath(PathBuf::from(path)));
    }

    let candidate = Path::new(&normalized);
    for component in candidate.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            _ => return Err(Error::InvalidPath(PathBuf::from(path))),
        }
    }

    Ok(candidate.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_leading_markers() {
        assert_eq!(normalize_path("./src/main.py"), "src/main.py");
        assert_eq!(normalize_path("/index.html"), "index.html");
        assert_eq!(normalize_path("src\\app.js"), "src/app.js");
    }

    #[test]
    fn rejects_parent_traversal() {
        assert!(safe_relative_path("../etc/passwd").is_err());
        assert!(safe_relative_path("src/../../x").is_err());
        assert!(safe_relative_path("").is_err());
    }

    #[test]
    fn accepts_nested_paths() {
        let path = safe_relative_path("src/components/App.jsx").unwrap();
        assert_eq!(path, PathBuf::from("src/components/App.jsx"));
    }
}
