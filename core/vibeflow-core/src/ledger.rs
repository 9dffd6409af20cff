//! Per-session activity bookkeeping and idle-gap detection.
//!
//! The ledger never polls time. The engine feeds it activity timestamps and
//! the supervisor tick decides when an idle gap opens:
//!
//! ```text
//! active ──(tick: idle_for >= threshold)──▶ idle-pending
//!   ▲                                             │
//!   └──────────(activity: gap recorded)───────────┘
//! ```
//!
//! `last_activity_at` is exact; the session's `activity` log is sampled at
//! most once per sample interval to bound its size.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{IdleGap, Session};

/// Live tracking state for one active session. Persisted so a restarted
/// process can pick the session back up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityLedger {
    pub session_id: String,
    pub last_activity_at: DateTime<Utc>,
    pub last_sample_at: DateTime<Utc>,
    /// Set while an idle gap is open.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idle_started_at: Option<DateTime<Utc>>,
}

/// What a single `record_activity` call changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActivityOutcome {
    pub closed_gap: Option<IdleGap>,
    pub sampled: bool,
}

impl ActivityOutcome {
    pub fn changed(&self) -> bool {
        self.sampled || self.closed_gap.is_some()
    }
}

impl ActivityLedger {
    pub fn new(session_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            session_id: session_id.to_string(),
            last_activity_at: now,
            last_sample_at: now,
            idle_started_at: None,
        }
    }

    pub fn is_idle_pending(&self) -> bool {
        self.idle_started_at.is_some()
    }

    pub fn idle_for(&self, now: DateTime<Utc>) -> Duration {
        (now - self.last_activity_at).max(Duration::zero())
    }

    /// Records activity at `now`, closing any open idle gap.
    pub fn record_activity(
        &mut self,
        session: &mut Session,
        now: DateTime<Utc>,
        sample_interval: Duration,
    ) -> ActivityOutcome {
        // Clock skew must not move the ledger backwards.
        let now = now.max(self.last_activity_at);
        self.last_activity_at = now;

        let closed_gap = self.close_idle_gap(session, now);

        let sampled = now - self.last_sample_at >= sample_interval;
        if sampled {
            session.activity.push(now);
            self.last_sample_at = now;
        }

        ActivityOutcome { closed_gap, sampled }
    }

    /// Enters idle-pending with the gap starting at the last activity.
    /// Returns false if a gap was already open.
    pub fn open_idle_gap(&mut self) -> bool {
        if self.idle_started_at.is_some() {
            return false;
        }
        self.idle_started_at = Some(self.last_activity_at);
        true
    }

    /// Closes the open gap as of `now`. Zero-length gaps are dropped.
    pub fn close_idle_gap(&mut self, session: &mut Session, now: DateTime<Utc>) -> Option<IdleGap> {
        let started = self.idle_started_at.take()?;
        let floor = session
            .idle_gaps
            .last()
            .map(|gap| gap.end_at)
            .unwrap_or(session.started_at);
        let gap = IdleGap::new(started.max(floor), now)?;
        session.idle_gaps.push(gap.clone());
        Some(gap)
    }

    /// The open gap as it would look if closed at `now`, for live views.
    pub fn provisional_gap(&self, now: DateTime<Utc>) -> Option<IdleGap> {
        self.idle_started_at
            .and_then(|started| IdleGap::new(started, now))
    }
}
