//! Repository identity.
//!
//! Every repo-scoped store is keyed by the path returned from
//! [`resolve_repo_key`], so two working directories inside the same checkout
//! share one context.

use std::path::{Component, Path, PathBuf};

const VCS_MARKER: &str = ".git";

/// Returns the nearest ancestor of `path` (inclusive) that contains a `.git`
/// entry, or the normalized absolute path when there is none.
pub fn resolve_repo_key(path: &Path) -> String {
    let absolute = absolutize(path);
    find_repo_root(&absolute)
        .map(|root| path_to_string(&root))
        .unwrap_or_else(|| path_to_string(&absolute))
}

/// Walks upward from `start` looking for a version-control root.
pub fn find_repo_root(start: &Path) -> Option<PathBuf> {
    let start = if start.is_file() {
        start.parent()?.to_path_buf()
    } else {
        start.to_path_buf()
    };

    let mut current = Some(start.as_path());
    while let Some(dir) = current {
        if dir.join(VCS_MARKER).exists() {
            return Some(dir.to_path_buf());
        }
        current = dir.parent();
    }
    None
}

/// Last path component, for display.
pub fn repo_display_name(repo_key: &str) -> String {
    Path::new(repo_key)
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| repo_key.to_string())
}

fn absolutize(path: &Path) -> PathBuf {
    if let Ok(canonical) = std::fs::canonicalize(path) {
        return canonical;
    }

    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    };
    normalize_lexically(&joined)
}

/// Resolves `.` and `..` without touching the filesystem.
fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

fn path_to_string(path: &Path) -> String {
    path.to_string_lossy().to_string()
}
