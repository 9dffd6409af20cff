//! Core types for VibeFlow sessions and repo-scoped context.
//!
//! On-disk records use camelCase keys so files written by earlier releases
//! (`tabId`, `projectRoot`, `startAt`/`endAt`) keep loading.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::flow::compute_flow_summary;
use crate::repo::repo_display_name;

/// Generates a sortable 26-character id.
pub fn new_id() -> String {
    ulid::Ulid::new().to_string()
}

// ─────────────────────────────────────────────────────────────────────────────
// Ledger Records
// ─────────────────────────────────────────────────────────────────────────────

/// A recorded interval of inactivity. `end_at > start_at` always holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdleGap {
    pub start_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
    pub duration_ms: i64,
}

impl IdleGap {
    /// Returns `None` for empty or inverted intervals.
    pub fn new(start_at: DateTime<Utc>, end_at: DateTime<Utc>) -> Option<Self> {
        if end_at <= start_at {
            return None;
        }
        Some(Self {
            start_at,
            end_at,
            duration_ms: (end_at - start_at).num_milliseconds(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Intent {
    pub text: String,
    pub set_at: DateTime<Utc>,
}

/// A free-text note kept at repository scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParkedThought {
    /// Empty only for legacy records, which are assigned an id on load.
    #[serde(default)]
    pub id: String,
    pub text: String,
    pub created_at: DateTime<Utc>,
}

/// A note left for the next session on the same repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeEcho {
    pub id: String,
    pub text: String,
    pub created_at: DateTime<Utc>,
    pub deliver_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivered_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub source_session_id: String,
}

// ─────────────────────────────────────────────────────────────────────────────
// Flow Classification
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FlowLabel {
    DeepFlow,
    ContextLoss,
    Drift,
    Steady,
}

impl FlowLabel {
    pub fn as_str(self) -> &'static str {
        match self {
            FlowLabel::DeepFlow => "deep-flow",
            FlowLabel::ContextLoss => "context-loss",
            FlowLabel::Drift => "drift",
            FlowLabel::Steady => "steady",
        }
    }
}

impl fmt::Display for FlowLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Derived metrics for a session as of some instant. Never authoritative.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowSummary {
    pub session_duration_ms: i64,
    pub total_active_ms: i64,
    pub total_idle_ms: i64,
    pub deep_flow_blocks: u32,
    pub total_deep_flow_ms: i64,
    pub longest_deep_flow_ms: i64,
    pub drift_blocks: u32,
    pub context_loss_gaps: u32,
    pub label: FlowLabel,
}

// ─────────────────────────────────────────────────────────────────────────────
// End Reason
// ─────────────────────────────────────────────────────────────────────────────

/// Why a session ended. Callers may supply their own reasons.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EndReason {
    Manual,
    Inactivity,
    Shutdown,
    AppQuit,
    Other(String),
}

impl EndReason {
    pub fn as_str(&self) -> &str {
        match self {
            EndReason::Manual => "manual",
            EndReason::Inactivity => "inactivity",
            EndReason::Shutdown => "shutdown",
            EndReason::AppQuit => "app-quit",
            EndReason::Other(reason) => reason,
        }
    }
}

impl From<&str> for EndReason {
    fn from(value: &str) -> Self {
        match value {
            "manual" => EndReason::Manual,
            "inactivity" => EndReason::Inactivity,
            "shutdown" => EndReason::Shutdown,
            "app-quit" => EndReason::AppQuit,
            other => EndReason::Other(other.to_string()),
        }
    }
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for EndReason {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for EndReason {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(EndReason::from(raw.as_str()))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Session
// ─────────────────────────────────────────────────────────────────────────────

/// One tracked unit of work. Owned by the engine; callers only see clones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    #[serde(default)]
    pub id: String,
    /// Logical handle the caller used (terminal tab id, or repo key for the CLI).
    #[serde(default, alias = "tabId")]
    pub handle: String,
    #[serde(default, alias = "projectRoot", deserialize_with = "null_as_empty")]
    pub repo_key: String,
    #[serde(default)]
    pub cwd: String,
    #[serde(default)]
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_reason: Option<EndReason>,
    /// Coalesced activity samples (at most one per sample interval).
    #[serde(default)]
    pub activity: Vec<DateTime<Utc>>,
    #[serde(default)]
    pub idle_gaps: Vec<IdleGap>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intent: Option<Intent>,
    #[serde(default)]
    pub intents: Vec<Intent>,
    #[serde(default)]
    pub parked_thoughts: Vec<ParkedThought>,
    /// Echoes authored here; moved into the repo mailbox when the session ends.
    #[serde(default)]
    pub time_echoes: Vec<TimeEcho>,
    /// Frozen at end. Absent while the session is active.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flow_summary: Option<FlowSummary>,
}

fn null_as_empty<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

impl Session {
    pub fn new(
        handle: &str,
        repo_key: String,
        cwd: String,
        started_at: DateTime<Utc>,
        start_reason: Option<String>,
    ) -> Self {
        Self {
            id: new_id(),
            handle: handle.to_string(),
            repo_key,
            cwd,
            started_at,
            start_reason,
            ended_at: None,
            end_reason: None,
            activity: vec![started_at],
            idle_gaps: Vec::new(),
            intent: None,
            intents: Vec::new(),
            parked_thoughts: Vec::new(),
            time_echoes: Vec::new(),
            flow_summary: None,
        }
    }

    pub fn is_ended(&self) -> bool {
        self.ended_at.is_some()
    }

    pub fn repo_name(&self) -> String {
        repo_display_name(&self.repo_key)
    }

    /// Frozen summary for ended sessions, recomputed otherwise.
    pub fn summary_as_of(&self, as_of: DateTime<Utc>) -> FlowSummary {
        match (&self.ended_at, &self.flow_summary) {
            (Some(_), Some(summary)) => summary.clone(),
            (Some(ended_at), None) => compute_flow_summary(self, *ended_at),
            (None, _) => compute_flow_summary(self, as_of),
        }
    }

    /// Wall-clock length up to `now` (or the end, once ended).
    pub fn duration_ms(&self, now: DateTime<Utc>) -> i64 {
        let end = self.ended_at.unwrap_or(now);
        (end - self.started_at).num_milliseconds().max(0)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Read-Only DTOs
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum SessionStatus {
    Active {
        #[serde(rename = "idleForMs")]
        idle_for_ms: i64,
        paused: bool,
    },
    Ended {
        #[serde(rename = "endedAt")]
        ended_at: DateTime<Utc>,
        reason: EndReason,
    },
}

/// A session plus its flow summary, as handed to callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionView {
    pub session: Session,
    pub flow_summary: FlowSummary,
    pub status: SessionStatus,
}

/// Compact entry for "recent work" lists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecentSession {
    pub id: String,
    pub repo_key: String,
    pub repo_name: String,
    pub cwd: String,
    pub ended_at: Option<DateTime<Utc>>,
    pub intent: Option<Intent>,
}

impl From<&Session> for RecentSession {
    fn from(session: &Session) -> Self {
        Self {
            id: session.id.clone(),
            repo_key: session.repo_key.clone(),
            repo_name: session.repo_name(),
            cwd: session.cwd.clone(),
            ended_at: session.ended_at,
            intent: session.intent.clone(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Repo Context
// ─────────────────────────────────────────────────────────────────────────────

/// Cross-session state for one repository, created lazily on first write.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RepoContext {
    pub pending_echoes: Vec<TimeEcho>,
    pub delivered_echoes: Vec<TimeEcho>,
    pub parked_thoughts: Vec<ParkedThought>,
    pub include_trace: bool,
}

impl RepoContext {
    pub fn is_empty(&self) -> bool {
        self.pending_echoes.is_empty()
            && self.delivered_echoes.is_empty()
            && self.parked_thoughts.is_empty()
            && !self.include_trace
    }
}

pub type RepoContexts = BTreeMap<String, RepoContext>;

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn at(min: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 31, 9, 0, 0).unwrap() + Duration::minutes(min)
    }

    #[test]
    fn idle_gap_rejects_empty_intervals() {
        assert!(IdleGap::new(at(5), at(5)).is_none());
        assert!(IdleGap::new(at(6), at(5)).is_none());
        let gap = IdleGap::new(at(0), at(6)).unwrap();
        assert_eq!(gap.duration_ms, 6 * 60 * 1000);
    }

    #[test]
    fn end_reason_round_trips_through_strings() {
        assert_eq!(EndReason::from("app-quit"), EndReason::AppQuit);
        assert_eq!(
            EndReason::from("tab-closed"),
            EndReason::Other("tab-closed".into())
        );
        let json = serde_json::to_string(&EndReason::Inactivity).unwrap();
        assert_eq!(json, "\"inactivity\"");
    }

    #[test]
    fn flow_label_serializes_kebab_case() {
        let json = serde_json::to_string(&FlowLabel::DeepFlow).unwrap();
        assert_eq!(json, "\"deep-flow\"");
    }

    #[test]
    fn legacy_app_record_deserializes() {
        let raw = r#"{
            "id": "lq1x-abc",
            "tabId": "tab-1",
            "projectRoot": null,
            "cwd": "/work/scratch",
            "startedAt": "2026-01-31T09:00:00.000Z",
            "activity": ["2026-01-31T09:00:00.000Z"],
            "idleGaps": [{"startAt": "2026-01-31T09:01:00.000Z", "endAt": "2026-01-31T09:07:00.000Z", "durationMs": 360000}],
            "parkedThoughts": [{"text": "check the cache", "createdAt": "2026-01-31T09:02:00.000Z"}]
        }"#;
        let session: Session = serde_json::from_str(raw).expect("legacy record");
        assert_eq!(session.handle, "tab-1");
        assert_eq!(session.repo_key, "");
        assert_eq!(session.idle_gaps[0].duration_ms, 360_000);
        assert_eq!(session.parked_thoughts[0].id, "");
        assert!(!session.is_ended());
    }

    #[test]
    fn session_status_is_tagged() {
        let status = SessionStatus::Active {
            idle_for_ms: 1_000,
            paused: false,
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["state"], "active");
        assert_eq!(json["idleForMs"], 1_000);
    }
}
