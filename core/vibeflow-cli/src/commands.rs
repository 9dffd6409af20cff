//! One function per `vf` subcommand.
//!
//! Every function takes an already-opened engine, the directory the command
//! is scoped to, and the writer for user-facing output. Opening, the catch-up
//! tick and the final flush happen in [`with_engine`].

use std::env;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration as StdDuration;

use chrono::Duration;
use tracing::{debug, warn};
use vibeflow_core::{
    load_settings, parse_duration_spec, repo_display_name, resolve_repo_key, EndReason,
    EngineConfig, FlowEngine, FlowError, IdleTimeout, SessionStatus, StartOutcome,
    StorageConfig, SystemClock, IDLE_TIMEOUT_ENV,
};

use crate::error::CliError;
use crate::render::{
    echo_lines, format_clock, format_duration, format_time, history_line, session_summary,
    thought_lines,
};

const START_REASON: &str = "cli";
const WATCH_INTERVAL: StdDuration = StdDuration::from_secs(1);

// ─────────────────────────────────────────────────────────────────────────────
// Setup
// ─────────────────────────────────────────────────────────────────────────────

/// Resolves `path` against the current directory. `None` means the current
/// directory itself.
pub fn target_dir(path: Option<&Path>) -> Result<PathBuf, CliError> {
    let cwd = env::current_dir()?;
    Ok(match path {
        Some(p) if p.is_absolute() => p.to_path_buf(),
        Some(p) => cwd.join(p),
        None => cwd,
    })
}

/// Builds the engine config: `--idle-timeout` flag, then `VF_IDLE_TIMEOUT`,
/// then `vibeflow.toml`, then the surface preset.
pub fn engine_config(
    storage: &StorageConfig,
    preset: EngineConfig,
    flag: Option<IdleTimeout>,
) -> EngineConfig {
    let mut config = match load_settings(&storage.settings_file()) {
        Ok(settings) => preset.with_settings(&settings),
        Err(e) => {
            warn!(error = %e, "Ignoring malformed settings file");
            eprintln!("warning: {}", e);
            preset
        }
    };

    if let Some(timeout) = env_idle_timeout() {
        config = config.with_auto_end(timeout);
    }
    if let Some(timeout) = flag {
        config = config.with_auto_end(timeout);
    }
    debug!(auto_end = %config.auto_end, "Engine config resolved");
    config
}

fn env_idle_timeout() -> Option<IdleTimeout> {
    let raw = env::var(IDLE_TIMEOUT_ENV)
        .ok()
        .filter(|v| !v.trim().is_empty())?;
    match raw.parse() {
        Ok(timeout) => Some(timeout),
        Err(e) => {
            warn!(value = %raw, error = %e, "Ignoring invalid {}", IDLE_TIMEOUT_ENV);
            None
        }
    }
}

pub fn open_engine(storage: &StorageConfig, config: EngineConfig) -> Result<FlowEngine, CliError> {
    Ok(FlowEngine::open(storage, config, Arc::new(SystemClock))?)
}

/// Opens the engine, runs the catch-up tick, runs `f`, then flushes.
pub fn with_engine<F>(storage: &StorageConfig, config: EngineConfig, f: F) -> Result<(), CliError>
where
    F: FnOnce(&mut FlowEngine, &mut dyn Write) -> Result<(), CliError>,
{
    let mut engine = open_engine(storage, config)?;
    let report = engine.tick()?;
    if !report.auto_ended.is_empty() {
        debug!(count = report.auto_ended.len(), "Catch-up tick ended idle sessions");
    }

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    let result = f(&mut engine, &mut out);
    engine.flush_now()?;
    result
}

/// clap value parser for `--after`.
pub fn parse_delay(text: &str) -> Result<Duration, FlowError> {
    Ok(parse_duration_spec(text)?.unwrap_or_else(Duration::zero))
}

fn join_text(words: &[String]) -> String {
    words.join(" ")
}

fn name_of(dir: &Path) -> String {
    repo_display_name(&resolve_repo_key(dir))
}

// ─────────────────────────────────────────────────────────────────────────────
// Lifecycle
// ─────────────────────────────────────────────────────────────────────────────

pub fn start(engine: &mut FlowEngine, dir: &Path, out: &mut dyn Write) -> Result<(), CliError> {
    let handle = resolve_repo_key(dir);
    let now = engine.now();
    match engine.start_session(&handle, dir, Some(START_REASON))? {
        StartOutcome::AlreadyActive { session } => {
            writeln!(out, "Session already active:")?;
            write!(out, "{}", session_summary(&session, now))?;
        }
        StartOutcome::Started { session, echoes } => {
            writeln!(out, "Session started.")?;
            write!(out, "{}", session_summary(&session, now))?;
            if !echoes.is_empty() {
                writeln!(out, "\nTime echoes from earlier sessions ({}):", echoes.len())?;
                write!(out, "{}", echo_lines(&echoes))?;
            }
        }
    }
    Ok(())
}

/// Records activity; silent when nothing is active so shell hooks stay quiet.
pub fn ping(engine: &mut FlowEngine, dir: &Path) -> Result<(), CliError> {
    let handle = resolve_repo_key(dir);
    match engine.record_activity(&handle, "ping") {
        Ok(_) | Err(FlowError::NoActiveSession { .. }) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

pub fn end(engine: &mut FlowEngine, dir: &Path, out: &mut dyn Write) -> Result<(), CliError> {
    let handle = resolve_repo_key(dir);
    let now = engine.now();
    match engine.end_session(&handle, EndReason::Manual)? {
        Some(view) => {
            writeln!(out, "Session ended.")?;
            write!(out, "{}", session_summary(&view, now))?;
        }
        None => writeln!(out, "No active session to end.")?,
    }
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Notes
// ─────────────────────────────────────────────────────────────────────────────

pub fn intent(
    engine: &mut FlowEngine,
    dir: &Path,
    words: &[String],
    out: &mut dyn Write,
) -> Result<(), CliError> {
    engine.set_intent(&resolve_repo_key(dir), &join_text(words))?;
    writeln!(out, "Intent saved.")?;
    Ok(())
}

pub fn park(
    engine: &mut FlowEngine,
    dir: &Path,
    words: &[String],
    out: &mut dyn Write,
) -> Result<(), CliError> {
    engine.add_parked_thought(&resolve_repo_key(dir), &join_text(words))?;
    writeln!(out, "Thought parked.")?;
    Ok(())
}

pub fn echo(
    engine: &mut FlowEngine,
    dir: &Path,
    words: &[String],
    after: Option<Duration>,
    out: &mut dyn Write,
) -> Result<(), CliError> {
    let echo = engine.queue_time_echo(&resolve_repo_key(dir), &join_text(words), after)?;
    if echo.deliver_at > echo.created_at {
        writeln!(
            out,
            "Time echo saved. Delivered to the first session after {}.",
            format_time(echo.deliver_at)
        )?;
    } else {
        writeln!(out, "Time echo saved for your next session.")?;
    }
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Reads
// ─────────────────────────────────────────────────────────────────────────────

pub fn status(engine: &FlowEngine, dir: &Path, out: &mut dyn Write) -> Result<(), CliError> {
    let key = resolve_repo_key(dir);
    let now = engine.now();
    if let Some(active) = engine.get_active_session(&key) {
        write!(out, "{}", session_summary(&active, now))?;
        return Ok(());
    }
    match engine.get_last_session_for_repo(&key) {
        Some(last) => {
            writeln!(out, "No active session. Last session:")?;
            write!(out, "{}", session_summary(&last, now))?;
        }
        None => writeln!(out, "No sessions found for this repo.")?,
    }
    Ok(())
}

/// Re-reads the store once per second and redraws a single status line
/// until the session ends. Reads a detached snapshot each time: other `vf`
/// processes own the files, including any corrupt ones.
pub fn watch(storage: &StorageConfig, config: EngineConfig, dir: &Path) -> Result<(), CliError> {
    let key = resolve_repo_key(dir);
    let stdout = std::io::stdout();
    let mut painted = false;

    loop {
        let engine = FlowEngine::open_snapshot(storage, config.clone(), Arc::new(SystemClock))?;
        let mut out = stdout.lock();
        let Some(view) = engine.get_active_session(&key) else {
            if painted {
                writeln!(out)?;
                writeln!(out, "Session ended.")?;
            } else {
                drop(out);
                return status(&engine, dir, &mut stdout.lock());
            }
            return Ok(());
        };

        let now = engine.now();
        let mut line = format!(
            "\r\x1b[2K{}  {}  {}",
            view.session.repo_name(),
            format_clock(view.session.duration_ms(now)),
            view.flow_summary.label
        );
        if let SessionStatus::Active { idle_for_ms, .. } = view.status {
            if idle_for_ms >= engine.config().idle_threshold.num_milliseconds() {
                line.push_str(&format!("  idle {}", format_duration(idle_for_ms)));
            }
        }
        write!(out, "{}", line)?;
        out.flush()?;
        painted = true;
        drop(out);

        thread::sleep(WATCH_INTERVAL);
    }
}

pub fn resume(engine: &FlowEngine, dir: &Path, out: &mut dyn Write) -> Result<(), CliError> {
    let key = resolve_repo_key(dir);
    let now = engine.now();
    if let Some(active) = engine.get_active_session(&key) {
        writeln!(out, "Active session:")?;
        write!(out, "{}", session_summary(&active, now))?;
    } else if let Some(last) = engine.get_last_session_for_repo(&key) {
        writeln!(out, "Last session:")?;
        write!(out, "{}", session_summary(&last, now))?;
        let thoughts = &last.session.parked_thoughts;
        if !thoughts.is_empty() {
            writeln!(out, "\nParked last time:")?;
            write!(out, "{}", thought_lines(thoughts))?;
        }
    } else {
        writeln!(out, "No sessions found for this repo.")?;
    }
    Ok(())
}

pub fn history(
    engine: &FlowEngine,
    dir: &Path,
    limit: usize,
    out: &mut dyn Write,
) -> Result<(), CliError> {
    let sessions = engine.get_repo_sessions(&resolve_repo_key(dir), Some(limit));
    if sessions.is_empty() {
        writeln!(out, "No sessions found for this repo.")?;
        return Ok(());
    }
    let now = engine.now();
    writeln!(out, "Recent sessions ({}):", sessions.len())?;
    for view in &sessions {
        writeln!(out, "{}", history_line(view, now))?;
    }
    Ok(())
}

/// Receipt for `id`, or for the newest session in this repo.
pub fn receipt(
    engine: &FlowEngine,
    dir: &Path,
    id: Option<&str>,
    out: &mut dyn Write,
) -> Result<(), CliError> {
    let view = match id {
        Some(id) => engine
            .get_session(id)
            .ok_or_else(|| FlowError::SessionNotFound { id: id.to_string() })?,
        None => engine
            .get_repo_sessions(&resolve_repo_key(dir), Some(1))
            .into_iter()
            .next()
            .ok_or_else(|| CliError::Message("No session found to print a receipt.".into()))?,
    };

    writeln!(out, "VibeFlow Session Receipt")?;
    write!(out, "{}", session_summary(&view, engine.now()))?;
    if !view.session.parked_thoughts.is_empty() {
        writeln!(out, "\nParked thoughts:")?;
        write!(out, "{}", thought_lines(&view.session.parked_thoughts))?;
    }
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Repo Context
// ─────────────────────────────────────────────────────────────────────────────

pub fn list_thoughts(engine: &mut FlowEngine, dir: &Path, out: &mut dyn Write) -> Result<(), CliError> {
    let thoughts = engine.get_parked_thoughts(&resolve_repo_key(dir));
    if thoughts.is_empty() {
        writeln!(out, "No parked thoughts for this repo.")?;
    } else {
        writeln!(out, "Parked thoughts ({}):", thoughts.len())?;
        write!(out, "{}", thought_lines(&thoughts))?;
    }
    Ok(())
}

pub fn delete_thought(
    engine: &mut FlowEngine,
    dir: &Path,
    id: &str,
    out: &mut dyn Write,
) -> Result<(), CliError> {
    engine.delete_parked_thought(&resolve_repo_key(dir), id)?;
    writeln!(out, "Thought deleted.")?;
    Ok(())
}

pub fn list_echoes(engine: &FlowEngine, dir: &Path, out: &mut dyn Write) -> Result<(), CliError> {
    let echoes = engine.delivered_time_echoes(&resolve_repo_key(dir));
    if echoes.is_empty() {
        writeln!(out, "No delivered time echoes for this repo.")?;
    } else {
        writeln!(out, "Delivered time echoes ({}):", echoes.len())?;
        write!(out, "{}", echo_lines(&echoes))?;
    }
    Ok(())
}

pub fn park_echo(
    engine: &mut FlowEngine,
    dir: &Path,
    id: &str,
    out: &mut dyn Write,
) -> Result<(), CliError> {
    engine.park_time_echo(&resolve_repo_key(dir), id)?;
    writeln!(out, "Time echo parked as a thought.")?;
    Ok(())
}

pub fn discard_echo(
    engine: &mut FlowEngine,
    dir: &Path,
    id: &str,
    out: &mut dyn Write,
) -> Result<(), CliError> {
    engine.discard_time_echo(&resolve_repo_key(dir), id)?;
    writeln!(out, "Time echo discarded.")?;
    Ok(())
}

pub fn delete_session(engine: &mut FlowEngine, id: &str, out: &mut dyn Write) -> Result<(), CliError> {
    let removed = engine.delete_session(id)?;
    writeln!(out, "Deleted session {}.", removed.id)?;
    Ok(())
}

pub fn forget(engine: &mut FlowEngine, dir: &Path, out: &mut dyn Write) -> Result<(), CliError> {
    let removed = engine.delete_repo_context(&resolve_repo_key(dir))?;
    writeln!(
        out,
        "Forgot {} session(s), parked thoughts and time echoes for {}.",
        removed,
        name_of(dir)
    )?;
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Trace
// ─────────────────────────────────────────────────────────────────────────────

pub fn set_trace(
    engine: &mut FlowEngine,
    dir: &Path,
    include: bool,
    out: &mut dyn Write,
) -> Result<(), CliError> {
    engine.set_include_trace(&resolve_repo_key(dir), include)?;
    if include {
        writeln!(
            out,
            "Trace on for {}. Ended sessions are written to .vibeflow/trace.json.",
            name_of(dir)
        )?;
    } else {
        writeln!(out, "Trace off for {}.", name_of(dir))?;
    }
    Ok(())
}

pub fn show_trace(engine: &FlowEngine, dir: &Path, out: &mut dyn Write) -> Result<(), CliError> {
    let key = resolve_repo_key(dir);
    let state = if engine.get_include_trace(&key) { "on" } else { "off" };
    let Some(trace) = engine.read_trace(&key)? else {
        writeln!(out, "No trace recorded for this repo (trace is {}).", state)?;
        return Ok(());
    };

    writeln!(out, "Trace ({} sessions, trace is {}):", trace.sessions.len(), state)?;
    for entry in trace.sessions.iter().rev() {
        writeln!(
            out,
            "- {} - {} - {} - {} - {}",
            entry.session_id,
            format_time(entry.started_at),
            format_duration(entry.flow_summary.session_duration_ms),
            entry.flow_summary.label,
            entry
                .intent
                .as_ref()
                .map(|i| i.text.as_str())
                .unwrap_or("No intent")
        )?;
    }
    Ok(())
}
