//! Plain-text rendering for terminal output.

use std::fmt::Write;

use chrono::{DateTime, Local, Utc};
use vibeflow_core::{ParkedThought, SessionStatus, SessionView, TimeEcho};

/// `1h 05m`, `4m 09s`, `12s`.
pub fn format_duration(ms: i64) -> String {
    let total = (ms / 1000).max(0);
    let hours = total / 3600;
    let minutes = (total % 3600) / 60;
    let seconds = total % 60;
    if hours > 0 {
        format!("{hours}h {minutes:02}m")
    } else if minutes > 0 {
        format!("{minutes}m {seconds:02}s")
    } else {
        format!("{seconds}s")
    }
}

/// `01:02:03` or `02:03`, for the live timer.
pub fn format_clock(ms: i64) -> String {
    let total = (ms / 1000).max(0);
    let hours = total / 3600;
    let minutes = (total % 3600) / 60;
    let seconds = total % 60;
    if hours > 0 {
        format!("{hours:02}:{minutes:02}:{seconds:02}")
    } else {
        format!("{minutes:02}:{seconds:02}")
    }
}

pub fn format_time(at: DateTime<Utc>) -> String {
    at.with_timezone(&Local).format("%Y-%m-%d %H:%M").to_string()
}

fn status_label(view: &SessionView) -> String {
    match &view.status {
        SessionStatus::Active { paused: true, .. } => "active (paused)".to_string(),
        SessionStatus::Active { .. } => "active".to_string(),
        SessionStatus::Ended { reason, .. } => format!("ended ({reason})"),
    }
}

/// Multi-line summary used by `status`, `resume`, `end` and `receipt`.
pub fn session_summary(view: &SessionView, now: DateTime<Utc>) -> String {
    let session = &view.session;
    let summary = &view.flow_summary;
    let mut out = String::new();

    let _ = writeln!(out, "Repo: {}", session.repo_name());
    let _ = writeln!(out, "Session ID: {}", session.id);
    let _ = writeln!(out, "Status: {}", status_label(view));
    let _ = writeln!(out, "Started: {}", format_time(session.started_at));
    if let Some(ended_at) = session.ended_at {
        let _ = writeln!(out, "Ended: {}", format_time(ended_at));
    }
    let _ = writeln!(out, "Duration: {}", format_duration(session.duration_ms(now)));
    let _ = writeln!(
        out,
        "Intent: {}",
        session
            .intent
            .as_ref()
            .map(|i| i.text.as_str())
            .unwrap_or("Not set")
    );
    let _ = writeln!(out, "Parked: {}", session.parked_thoughts.len());
    let _ = writeln!(
        out,
        "Flow: {} (active {}, idle {})",
        summary.label,
        format_duration(summary.total_active_ms),
        format_duration(summary.total_idle_ms)
    );
    let _ = writeln!(
        out,
        "Blocks: {} deep ({} longest), {} drift, {} context-loss gaps",
        summary.deep_flow_blocks,
        format_duration(summary.longest_deep_flow_ms),
        summary.drift_blocks,
        summary.context_loss_gaps
    );
    if let SessionStatus::Active { idle_for_ms, .. } = view.status {
        if idle_for_ms >= 1000 {
            let _ = writeln!(out, "Idle for: {}", format_duration(idle_for_ms));
        }
    }
    out
}

/// One line per session for `history`.
pub fn history_line(view: &SessionView, now: DateTime<Utc>) -> String {
    let session = &view.session;
    format!(
        "- {} - {} - {} - {} - {}",
        session.id,
        format_time(session.started_at),
        format_duration(session.duration_ms(now)),
        view.flow_summary.label,
        session
            .intent
            .as_ref()
            .map(|i| i.text.as_str())
            .unwrap_or("No intent")
    )
}

pub fn echo_lines(echoes: &[TimeEcho]) -> String {
    let mut out = String::new();
    for echo in echoes {
        let _ = writeln!(
            out,
            "  [{}] {} (left {})",
            echo.id,
            echo.text,
            format_time(echo.created_at)
        );
    }
    out
}

pub fn thought_lines(thoughts: &[ParkedThought]) -> String {
    let mut out = String::new();
    for thought in thoughts {
        let _ = writeln!(
            out,
            "  [{}] {} ({})",
            thought.id,
            thought.text,
            format_time(thought.created_at)
        );
    }
    out
}
