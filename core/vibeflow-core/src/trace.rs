//! Per-repo trace artifact at `<repo>/.vibeflow/trace.json`.
//!
//! When a repo opts in, every ended session appends a short record to a file
//! inside the repository itself, so the history can travel with the code.
//! Opting out hides the artifact from git via `.git/info/exclude`.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{FlowError, Result};
use crate::persistence::atomic_write;
use crate::storage::{git_exclude_file, trace_file, REPO_ARTIFACT_DIR};
use crate::types::{EndReason, FlowSummary, Intent, Session};

pub const TRACE_FILE_VERSION: u32 = 1;
pub const MAX_TRACE_ENTRIES: usize = 50;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceFile {
    pub version: u32,
    pub repo_key: String,
    pub updated_at: DateTime<Utc>,
    /// Oldest first.
    #[serde(default)]
    pub sessions: Vec<TraceEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceEntry {
    pub session_id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub end_reason: EndReason,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intent: Option<Intent>,
    pub parked_thoughts: usize,
    pub flow_summary: FlowSummary,
}

impl TraceEntry {
    /// `None` for sessions that have not ended.
    pub fn from_session(session: &Session) -> Option<Self> {
        let ended_at = session.ended_at?;
        Some(Self {
            session_id: session.id.clone(),
            started_at: session.started_at,
            ended_at,
            end_reason: session.end_reason.clone().unwrap_or(EndReason::Manual),
            intent: session.intent.clone(),
            parked_thoughts: session.parked_thoughts.len(),
            flow_summary: session.summary_as_of(ended_at),
        })
    }
}

/// Reads the artifact. Missing or unreadable-as-JSON files are `None`.
pub fn read_trace(repo_root: &Path) -> Result<Option<TraceFile>> {
    let path = trace_file(repo_root);
    let content = match fs_err::read_to_string(&path) {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(FlowError::Io {
                context: format!("reading {}", path.display()),
                source: err,
            })
        }
    };

    match serde_json::from_str(&content) {
        Ok(trace) => Ok(Some(trace)),
        Err(err) => {
            warn!(path = %path.display(), error = %err, "Ignoring corrupt trace artifact");
            Ok(None)
        }
    }
}

/// Appends `session` to the repo's trace, keeping the newest entries.
/// Skips (returns false) when the repo root is not a directory.
pub fn append_trace(repo_root: &Path, repo_key: &str, session: &Session, now: DateTime<Utc>) -> Result<bool> {
    if !repo_root.is_dir() {
        return Ok(false);
    }
    let Some(entry) = TraceEntry::from_session(session) else {
        return Ok(false);
    };

    let mut trace = read_trace(repo_root)?.unwrap_or_else(|| TraceFile {
        version: TRACE_FILE_VERSION,
        repo_key: repo_key.to_string(),
        updated_at: now,
        sessions: Vec::new(),
    });

    trace.sessions.retain(|existing| existing.session_id != entry.session_id);
    trace.sessions.push(entry);
    if trace.sessions.len() > MAX_TRACE_ENTRIES {
        let overflow = trace.sessions.len() - MAX_TRACE_ENTRIES;
        trace.sessions.drain(..overflow);
    }
    trace.version = TRACE_FILE_VERSION;
    trace.repo_key = repo_key.to_string();
    trace.updated_at = now;

    let content = serde_json::to_string_pretty(&trace).map_err(|e| FlowError::Json {
        context: "serializing trace".to_string(),
        source: e,
    })?;
    atomic_write(&trace_file(repo_root), &content)?;
    debug!(repo_key = %repo_key, entries = trace.sessions.len(), "Trace updated");
    Ok(true)
}

/// Adds or removes the `.vibeflow/` line in `.git/info/exclude`.
/// Returns false when the repo has no `.git` directory.
pub fn set_excluded(repo_root: &Path, excluded: bool) -> Result<bool> {
    if !repo_root.join(".git").is_dir() {
        return Ok(false);
    }

    let path = git_exclude_file(repo_root);
    let existing = match fs_err::read_to_string(&path) {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(err) => {
            return Err(FlowError::Io {
                context: format!("reading {}", path.display()),
                source: err,
            })
        }
    };

    let pattern = format!("{REPO_ARTIFACT_DIR}/");
    let mut lines: Vec<&str> = existing
        .lines()
        .filter(|line| line.trim() != pattern && line.trim() != REPO_ARTIFACT_DIR)
        .collect();
    if excluded {
        lines.push(&pattern);
    }

    let mut updated = lines.join("\n");
    if !updated.is_empty() {
        updated.push('\n');
    }
    if updated != existing {
        atomic_write(&path, &updated)?;
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use tempfile::TempDir;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 31, 9, 0, 0).unwrap()
    }

    fn ended_session(minutes: i64) -> Session {
        let mut session = Session::new("tab-1", "/repo".into(), "/repo".into(), t0(), None);
        let ended_at = t0() + Duration::minutes(minutes);
        session.ended_at = Some(ended_at);
        session.end_reason = Some(EndReason::Manual);
        session.flow_summary = Some(session.summary_as_of(ended_at));
        session
    }

    #[test]
    fn append_creates_artifact() {
        let temp = TempDir::new().unwrap();
        let session = ended_session(25);

        assert!(append_trace(temp.path(), "/repo", &session, t0()).unwrap());

        let trace = read_trace(temp.path()).unwrap().expect("trace exists");
        assert_eq!(trace.version, TRACE_FILE_VERSION);
        assert_eq!(trace.sessions.len(), 1);
        assert_eq!(trace.sessions[0].session_id, session.id);
        assert_eq!(trace.sessions[0].flow_summary.label.as_str(), "deep-flow");
    }

    #[test]
    fn append_caps_entries() {
        let temp = TempDir::new().unwrap();
        let mut ids = Vec::new();
        for i in 0..(MAX_TRACE_ENTRIES + 5) {
            let session = ended_session(i as i64 + 1);
            ids.push(session.id.clone());
            append_trace(temp.path(), "/repo", &session, t0()).unwrap();
        }

        let trace = read_trace(temp.path()).unwrap().unwrap();
        assert_eq!(trace.sessions.len(), MAX_TRACE_ENTRIES);
        assert_eq!(trace.sessions[0].session_id, ids[5]);
        assert_eq!(trace.sessions.last().unwrap().session_id, *ids.last().unwrap());
    }

    #[test]
    fn active_session_and_missing_repo_are_skipped() {
        let temp = TempDir::new().unwrap();
        let active = Session::new("tab-1", "/repo".into(), "/repo".into(), t0(), None);
        assert!(!append_trace(temp.path(), "/repo", &active, t0()).unwrap());
        assert!(!append_trace(&temp.path().join("gone"), "/repo", &ended_session(1), t0()).unwrap());
        assert!(read_trace(temp.path()).unwrap().is_none());
    }

    #[test]
    fn corrupt_artifact_is_replaced() {
        let temp = TempDir::new().unwrap();
        let path = trace_file(temp.path());
        fs_err::create_dir_all(path.parent().unwrap()).unwrap();
        fs_err::write(&path, "garbage").unwrap();

        assert!(read_trace(temp.path()).unwrap().is_none());
        append_trace(temp.path(), "/repo", &ended_session(3), t0()).unwrap();
        assert_eq!(read_trace(temp.path()).unwrap().unwrap().sessions.len(), 1);
    }

    #[test]
    fn exclude_toggles_line_and_keeps_other_patterns() {
        let temp = TempDir::new().unwrap();
        let exclude = git_exclude_file(temp.path());
        fs_err::create_dir_all(exclude.parent().unwrap()).unwrap();
        fs_err::write(&exclude, "# local\n*.swp\n").unwrap();

        assert!(set_excluded(temp.path(), true).unwrap());
        assert_eq!(
            fs_err::read_to_string(&exclude).unwrap(),
            "# local\n*.swp\n.vibeflow/\n"
        );

        // idempotent
        set_excluded(temp.path(), true).unwrap();
        assert_eq!(
            fs_err::read_to_string(&exclude).unwrap().matches(".vibeflow/").count(),
            1
        );

        set_excluded(temp.path(), false).unwrap();
        assert_eq!(fs_err::read_to_string(&exclude).unwrap(), "# local\n*.swp\n");
    }

    #[test]
    fn exclude_without_git_dir_is_noop() {
        let temp = TempDir::new().unwrap();
        assert!(!set_excluded(temp.path(), true).unwrap());
        assert!(!git_exclude_file(temp.path()).exists());
    }
}
