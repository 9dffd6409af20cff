//! Storage configuration and path management for VibeFlow.
//!
//! `StorageConfig` is the single place that decides where engine data lives.
//! The two surfaces keep separate roots and state-file names:
//!
//! - CLI: `<config_dir>/vibeflow-cli/{sessions.json,state.json}`
//! - App: `<data_dir>/vibeflow/{sessions.json,config.json}`
//!
//! `VF_DATA_DIR` overrides the root for either surface. Tests use
//! `StorageConfig::with_root(temp_dir)` for isolation.

use std::env;
use std::path::{Path, PathBuf};

use crate::error::{FlowError, Result};

pub const DATA_DIR_ENV: &str = "VF_DATA_DIR";

/// Which front-end owns the data directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Surface {
    Cli,
    App,
}

impl Surface {
    fn state_file_name(self) -> &'static str {
        match self {
            Surface::Cli => "state.json",
            Surface::App => "config.json",
        }
    }
}

/// Central configuration for all VibeFlow storage paths.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    root: PathBuf,
    surface: Surface,
}

impl StorageConfig {
    /// Default location for the given surface, honouring `VF_DATA_DIR`.
    pub fn for_surface(surface: Surface) -> Result<Self> {
        if let Some(dir) = env::var_os(DATA_DIR_ENV).filter(|v| !v.is_empty()) {
            return Ok(Self {
                root: PathBuf::from(dir),
                surface,
            });
        }

        let root = match surface {
            Surface::Cli => dirs::config_dir().map(|d| d.join("vibeflow-cli")),
            Surface::App => dirs::data_dir().map(|d| d.join("vibeflow")),
        }
        .ok_or(FlowError::DataDirNotFound)?;

        Ok(Self { root, surface })
    }

    /// Creates a StorageConfig with a custom root directory (CLI layout).
    pub fn with_root(root: PathBuf) -> Self {
        Self {
            root,
            surface: Surface::Cli,
        }
    }

    pub fn with_root_for(root: PathBuf, surface: Surface) -> Self {
        Self { root, surface }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn surface(&self) -> Surface {
        self.surface
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // Files
    // ─────────────────────────────────────────────────────────────────────────────

    /// Path to sessions.json (every session record, active and ended).
    pub fn sessions_file(&self) -> PathBuf {
        self.root.join("sessions.json")
    }

    /// Path to the repo-scoped state file (mailboxes, thoughts, active markers).
    pub fn state_file(&self) -> PathBuf {
        self.root.join(self.surface.state_file_name())
    }

    /// Path to the optional user settings file.
    pub fn settings_file(&self) -> PathBuf {
        self.root.join("vibeflow.toml")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    /// Ensures the root directory and standard subdirectories exist.
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        fs_err::create_dir_all(&self.root)?;
        fs_err::create_dir_all(self.logs_dir())?;
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Per-Repo Paths
// ─────────────────────────────────────────────────────────────────────────────

/// Directory inside a repository that holds VibeFlow's own artifacts.
pub const REPO_ARTIFACT_DIR: &str = ".vibeflow";

/// `<repo>/.vibeflow/trace.json`
pub fn trace_file(repo_root: &Path) -> PathBuf {
    repo_root.join(REPO_ARTIFACT_DIR).join("trace.json")
}

/// `<repo>/.git/info/exclude`
pub fn git_exclude_file(repo_root: &Path) -> PathBuf {
    repo_root.join(".git").join("info").join("exclude")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn cli_layout_uses_state_json() {
        let config = StorageConfig::with_root(PathBuf::from("/tmp/vf"));
        assert_eq!(config.sessions_file(), PathBuf::from("/tmp/vf/sessions.json"));
        assert_eq!(config.state_file(), PathBuf::from("/tmp/vf/state.json"));
        assert_eq!(config.settings_file(), PathBuf::from("/tmp/vf/vibeflow.toml"));
    }

    #[test]
    fn app_layout_uses_config_json() {
        let config = StorageConfig::with_root_for(PathBuf::from("/tmp/vf"), Surface::App);
        assert_eq!(config.state_file(), PathBuf::from("/tmp/vf/config.json"));
        assert_eq!(config.surface(), Surface::App);
    }

    #[test]
    fn repo_artifact_paths() {
        let repo = Path::new("/work/repo");
        assert_eq!(
            trace_file(repo),
            PathBuf::from("/work/repo/.vibeflow/trace.json")
        );
        assert_eq!(
            git_exclude_file(repo),
            PathBuf::from("/work/repo/.git/info/exclude")
        );
    }

    #[test]
    fn ensure_dirs_creates_structure() {
        let temp = TempDir::new().unwrap();
        let config = StorageConfig::with_root(temp.path().join("vf"));

        config.ensure_dirs().unwrap();

        assert!(config.root().exists());
        assert!(config.logs_dir().exists());
    }
}
