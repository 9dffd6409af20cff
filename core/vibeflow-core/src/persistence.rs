//! File-backed session and repo-context persistence.
//!
//! Two JSON files live under the data root:
//!
//! - `sessions.json`: array of every [`Session`] (active and ended)
//! - `state.json` / `config.json`: repo contexts plus the ledgers of active
//!   sessions, so another process can resume them
//!
//! ```json
//! {
//!   "version": 1,
//!   "repos": { "/work/repo": { "pendingEchoes": [], "deliveredEchoes": [], "parkedThoughts": [], "includeTrace": false } },
//!   "active": { "/work/repo": { "sessionId": "...", "lastActivityAt": "...", "lastSampleAt": "..." } }
//! }
//! ```
//!
//! # Recovery
//!
//! - Missing or empty files load as an empty store
//! - Unparseable files are renamed to `<file>.<unix-millis>.bak` and the
//!   store starts empty; startup never fails on bad data
//! - Legacy records are normalised (ids, handles, repo keys, summaries)
//! - Writes go through temp file + rename

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::error::{FlowError, Result};
use crate::flow::compute_flow_summary;
use crate::ledger::ActivityLedger;
use crate::storage::StorageConfig;
use crate::thoughts::normalize_thought_ids;
use crate::types::{RepoContexts, Session};

pub const STATE_FILE_VERSION: u32 = 1;

/// Ledgers of active sessions, keyed by handle.
pub type ActiveLedgers = BTreeMap<String, ActivityLedger>;

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct StateFile {
    version: u32,
    repos: RepoContexts,
    active: ActiveLedgers,
}

impl Default for StateFile {
    fn default() -> Self {
        Self {
            version: STATE_FILE_VERSION,
            repos: RepoContexts::new(),
            active: ActiveLedgers::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoadMode {
    /// Corrupt files are moved aside; the store writes back to disk.
    Recover,
    ReadOnly,
}

#[derive(Debug, Clone)]
struct StorePaths {
    sessions_file: PathBuf,
    state_file: PathBuf,
}

/// In-memory copy of everything persisted, optionally backed by files.
#[derive(Debug)]
pub struct SessionStore {
    pub sessions: Vec<Session>,
    pub repos: RepoContexts,
    paths: Option<StorePaths>,
}

/// Result of [`SessionStore::load`].
#[derive(Debug)]
pub struct LoadedStore {
    pub store: SessionStore,
    pub active: ActiveLedgers,
    /// Backups created for files that could not be parsed.
    pub backups: Vec<PathBuf>,
}

impl SessionStore {
    pub fn new_in_memory() -> Self {
        Self {
            sessions: Vec::new(),
            repos: RepoContexts::new(),
            paths: None,
        }
    }

    pub fn is_in_memory(&self) -> bool {
        self.paths.is_none()
    }

    pub fn load(storage: &StorageConfig) -> Result<LoadedStore> {
        Self::load_at(&storage.sessions_file(), &storage.state_file(), Utc::now())
    }

    /// Loads a detached copy: corrupt files are skipped rather than moved
    /// aside, and the returned store is in-memory so `save` never writes.
    pub fn load_snapshot(storage: &StorageConfig) -> Result<LoadedStore> {
        Self::load_with(
            &storage.sessions_file(),
            &storage.state_file(),
            Utc::now(),
            LoadMode::ReadOnly,
        )
    }

    fn load_at(sessions_file: &Path, state_file: &Path, now: DateTime<Utc>) -> Result<LoadedStore> {
        Self::load_with(sessions_file, state_file, now, LoadMode::Recover)
    }

    fn load_with(
        sessions_file: &Path,
        state_file: &Path,
        now: DateTime<Utc>,
        mode: LoadMode,
    ) -> Result<LoadedStore> {
        let mut backups = Vec::new();

        let mut sessions: Vec<Session> =
            read_json_or_recover(sessions_file, now, mode, &mut backups)?.unwrap_or_default();
        let state: StateFile =
            read_json_or_recover(state_file, now, mode, &mut backups)?.unwrap_or_default();

        if state.version != STATE_FILE_VERSION {
            warn!(
                version = state.version,
                expected = STATE_FILE_VERSION,
                "Unexpected state file version; loading best effort"
            );
        }

        let fixed = normalize_sessions(&mut sessions);
        if fixed > 0 {
            info!(count = fixed, "Normalized legacy session records");
        }

        let mut repos = state.repos;
        for ctx in repos.values_mut() {
            normalize_thought_ids(&mut ctx.parked_thoughts);
        }

        Ok(LoadedStore {
            store: SessionStore {
                sessions,
                repos,
                paths: match mode {
                    LoadMode::Recover => Some(StorePaths {
                        sessions_file: sessions_file.to_path_buf(),
                        state_file: state_file.to_path_buf(),
                    }),
                    LoadMode::ReadOnly => None,
                },
            },
            active: state.active,
            backups,
        })
    }

    /// Writes both files. In-memory stores do nothing.
    pub fn save(&self, active: &ActiveLedgers) -> Result<()> {
        let Some(paths) = &self.paths else {
            return Ok(());
        };

        let sessions = serde_json::to_string_pretty(&self.sessions).map_err(|e| FlowError::Json {
            context: "serializing sessions".to_string(),
            source: e,
        })?;
        atomic_write(&paths.sessions_file, &sessions)?;

        let state = StateFile {
            version: STATE_FILE_VERSION,
            repos: self.repos.clone(),
            active: active.clone(),
        };
        let state = serde_json::to_string_pretty(&state).map_err(|e| FlowError::Json {
            context: "serializing repo state".to_string(),
            source: e,
        })?;
        atomic_write(&paths.state_file, &state)?;

        debug!(
            sessions = self.sessions.len(),
            repos = self.repos.len(),
            "Store saved"
        );
        Ok(())
    }

    pub fn session(&self, id: &str) -> Option<&Session> {
        self.sessions.iter().find(|s| s.id == id)
    }

    pub fn session_mut(&mut self, id: &str) -> Option<&mut Session> {
        self.sessions.iter_mut().find(|s| s.id == id)
    }
}

/// Reads and parses `path`. Missing/empty files are `None`; unparseable files
/// also yield `None` and, in recover mode, are moved aside.
fn read_json_or_recover<T: DeserializeOwned>(
    path: &Path,
    now: DateTime<Utc>,
    mode: LoadMode,
    backups: &mut Vec<PathBuf>,
) -> Result<Option<T>> {
    let content = match fs_err::read_to_string(path) {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(FlowError::Io {
                context: format!("reading {}", path.display()),
                source: err,
            })
        }
    };

    if content.trim().is_empty() {
        return Ok(None);
    }

    match serde_json::from_str::<T>(&content) {
        Ok(value) => Ok(Some(value)),
        Err(parse_err) if mode == LoadMode::ReadOnly => {
            warn!(path = %path.display(), error = %parse_err, "Corrupt store file skipped");
            Ok(None)
        }
        Err(parse_err) => {
            let backup = backup_path(path, now);
            fs_err::rename(path, &backup).map_err(|e| FlowError::Io {
                context: format!("backing up corrupt {}", path.display()),
                source: e,
            })?;
            warn!(
                path = %path.display(),
                backup = %backup.display(),
                error = %parse_err,
                "Corrupt store file moved aside; starting empty"
            );
            backups.push(backup);
            Ok(None)
        }
    }
}

fn backup_path(path: &Path, now: DateTime<Utc>) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(format!(".{}.bak", now.timestamp_millis()));
    path.with_file_name(name)
}

/// Fills in fields that older releases did not write.
fn normalize_sessions(sessions: &mut [Session]) -> usize {
    let mut fixed = 0;
    for (index, session) in sessions.iter_mut().enumerate() {
        let mut touched = false;
        if session.id.trim().is_empty() {
            session.id = format!("legacy-{index}");
            touched = true;
        }
        if session.handle.trim().is_empty() {
            session.handle = "legacy".to_string();
            touched = true;
        }
        if session.repo_key.trim().is_empty() {
            session.repo_key = session.cwd.clone();
            touched = true;
        }
        if let (Some(ended_at), None) = (session.ended_at, &session.flow_summary) {
            session.flow_summary = Some(compute_flow_summary(session, ended_at));
            touched = true;
        }
        if normalize_thought_ids(&mut session.parked_thoughts) > 0 {
            touched = true;
        }
        if touched {
            fixed += 1;
        }
    }
    fixed
}

/// Writes content to a file atomically using temp file + rename.
pub(crate) fn atomic_write(path: &Path, contents: &str) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    fs_err::create_dir_all(dir).map_err(|e| FlowError::Io {
        context: format!("creating directory {}", dir.display()),
        source: e,
    })?;

    let mut tmp = NamedTempFile::new_in(dir).map_err(|e| FlowError::Io {
        context: format!("creating temp file in {}", dir.display()),
        source: e,
    })?;

    tmp.write_all(contents.as_bytes()).map_err(|e| FlowError::Io {
        context: format!("writing temp file for {}", path.display()),
        source: e,
    })?;

    tmp.flush().map_err(|e| FlowError::Io {
        context: format!("flushing temp file for {}", path.display()),
        source: e,
    })?;

    tmp.persist(path).map_err(|e| FlowError::Io {
        context: format!("persisting temp file to {}", path.display()),
        source: e.error,
    })?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{FlowLabel, IdleGap, RepoContext};
    use chrono::{Duration, TimeZone};
    use tempfile::TempDir;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 31, 9, 0, 0).unwrap()
    }

    fn paths(temp: &TempDir) -> (PathBuf, PathBuf) {
        (
            temp.path().join("sessions.json"),
            temp.path().join("state.json"),
        )
    }

    #[test]
    fn missing_files_load_empty() {
        let temp = TempDir::new().unwrap();
        let (sessions, state) = paths(&temp);

        let loaded = SessionStore::load_at(&sessions, &state, t0()).unwrap();

        assert!(loaded.store.sessions.is_empty());
        assert!(loaded.store.repos.is_empty());
        assert!(loaded.active.is_empty());
        assert!(loaded.backups.is_empty());
    }

    #[test]
    fn corrupt_sessions_file_is_backed_up() {
        let temp = TempDir::new().unwrap();
        let (sessions, state) = paths(&temp);
        fs_err::write(&sessions, "{ not json").unwrap();

        let loaded = SessionStore::load_at(&sessions, &state, t0()).unwrap();

        assert!(loaded.store.sessions.is_empty());
        assert_eq!(loaded.backups.len(), 1);
        let backup = &loaded.backups[0];
        assert_eq!(
            backup.file_name().unwrap().to_string_lossy(),
            format!("sessions.json.{}.bak", t0().timestamp_millis())
        );
        assert_eq!(fs_err::read_to_string(backup).unwrap(), "{ not json");
        assert!(!sessions.exists());
    }

    #[test]
    fn non_array_sessions_file_is_treated_as_corrupt() {
        let temp = TempDir::new().unwrap();
        let (sessions, state) = paths(&temp);
        fs_err::write(&sessions, "{\"sessions\": {}}").unwrap();
        fs_err::write(&state, "[1, 2, 3]").unwrap();

        let loaded = SessionStore::load_at(&sessions, &state, t0()).unwrap();
        assert_eq!(loaded.backups.len(), 2);
    }

    #[test]
    fn empty_file_loads_empty_without_backup() {
        let temp = TempDir::new().unwrap();
        let (sessions, state) = paths(&temp);
        fs_err::write(&sessions, "  \n").unwrap();

        let loaded = SessionStore::load_at(&sessions, &state, t0()).unwrap();
        assert!(loaded.backups.is_empty());
        assert!(sessions.exists());
    }

    #[test]
    fn save_then_load_preserves_state() {
        let temp = TempDir::new().unwrap();
        let (sessions_file, state_file) = paths(&temp);
        let mut store = SessionStore::load_at(&sessions_file, &state_file, t0())
            .unwrap()
            .store;

        let session = Session::new("tab-1", "/repo".into(), "/repo".into(), t0(), None);
        let ledger = ActivityLedger::new(&session.id, t0());
        store.sessions.push(session.clone());
        store.repos.insert(
            "/repo".into(),
            RepoContext {
                include_trace: true,
                ..RepoContext::default()
            },
        );
        let mut active = ActiveLedgers::new();
        active.insert("tab-1".into(), ledger.clone());

        store.save(&active).unwrap();
        let loaded = SessionStore::load_at(&sessions_file, &state_file, t0()).unwrap();

        assert_eq!(loaded.store.sessions, vec![session]);
        assert!(loaded.store.repos["/repo"].include_trace);
        assert_eq!(loaded.active["tab-1"], ledger);
    }

    #[test]
    fn legacy_records_are_normalized() {
        let temp = TempDir::new().unwrap();
        let (sessions, state) = paths(&temp);
        fs_err::write(
            &sessions,
            r#"[
              {"cwd": "/work/app", "startedAt": "2026-01-31T09:00:00Z", "endedAt": "2026-01-31T09:10:00Z",
               "idleGaps": [{"startAt": "2026-01-31T09:02:00Z", "endAt": "2026-01-31T09:08:00Z", "durationMs": 360000}],
               "parkedThoughts": [{"text": "legacy", "createdAt": "2026-01-31T09:01:00Z"}]},
              {"id": "cli-1", "repoKey": "/work/cli", "repoName": "cli", "cwd": "/work/cli/src",
               "startedAt": "2026-01-31T10:00:00Z", "parkedThoughts": []}
            ]"#,
        )
        .unwrap();

        let loaded = SessionStore::load_at(&sessions, &state, t0()).unwrap();
        let legacy = &loaded.store.sessions[0];
        assert_eq!(legacy.id, "legacy-0");
        assert_eq!(legacy.handle, "legacy");
        assert_eq!(legacy.repo_key, "/work/app");
        assert_eq!(legacy.parked_thoughts[0].id.len(), 26);
        let summary = legacy.flow_summary.as_ref().expect("summary computed");
        assert_eq!(summary.label, FlowLabel::ContextLoss);
        assert_eq!(summary.total_idle_ms, 360_000);

        let cli = &loaded.store.sessions[1];
        assert_eq!(cli.repo_key, "/work/cli");
        assert!(cli.flow_summary.is_none());
    }

    #[test]
    fn in_memory_save_is_a_noop() {
        let store = SessionStore::new_in_memory();
        assert!(store.is_in_memory());
        store.save(&ActiveLedgers::new()).unwrap();
    }

    #[test]
    fn atomic_write_creates_parent_dirs() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("nested").join("sessions.json");
        atomic_write(&path, "[]").unwrap();
        assert_eq!(fs_err::read_to_string(&path).unwrap(), "[]");
    }

    #[test]
    fn gaps_survive_round_trip() {
        let temp = TempDir::new().unwrap();
        let (sessions_file, state_file) = paths(&temp);
        let mut store = SessionStore::load_at(&sessions_file, &state_file, t0())
            .unwrap()
            .store;
        let mut session = Session::new("tab-1", "/repo".into(), "/repo".into(), t0(), None);
        session
            .idle_gaps
            .push(IdleGap::new(t0(), t0() + Duration::minutes(6)).unwrap());
        store.sessions.push(session);
        store.save(&ActiveLedgers::new()).unwrap();

        let raw = fs_err::read_to_string(&sessions_file).unwrap();
        assert!(raw.contains("\"durationMs\": 360000"));
        assert!(raw.contains("\"startAt\""));
    }
}
