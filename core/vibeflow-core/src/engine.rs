//! The session engine.
//!
//! `FlowEngine` owns the registry of active sessions (handle -> ledger), the
//! persisted store, and two deadlines: the supervisor tick and the debounced
//! save. It never sleeps and never spawns. Time comes from its [`Clock`] and
//! deferred work runs when the host calls [`FlowEngine::run_due`]. Long-running
//! hosts wrap it in [`crate::supervisor::FlowSupervisor`]; the CLI drives it
//! directly, one command per process.
//!
//! Writes are debounced except for transitions that must survive a crash:
//! session end (manual, auto, shutdown) and deletions flush immediately.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{debug, info, trace, warn};

use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::error::{FlowError, Result};
use crate::flow::{compute_flow_summary, summarize};
use crate::ledger::{ActivityLedger, ActivityOutcome};
use crate::persistence::{ActiveLedgers, SessionStore};
use crate::repo::resolve_repo_key;
use crate::schedule::{SaveScheduler, TickSchedule};
use crate::storage::StorageConfig;
use crate::thoughts::{add_thought, clean_text, delete_thought, normalize_thought_ids};
use crate::trace::{append_trace, read_trace, set_excluded, TraceFile};
use crate::types::{
    EndReason, Intent, ParkedThought, RecentSession, Session, SessionStatus, SessionView,
    TimeEcho,
};

pub const DEFAULT_RECENT_LIMIT: usize = 3;

/// Result of [`FlowEngine::start_session`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "camelCase")]
pub enum StartOutcome {
    /// A new session; `echoes` were delivered from the repo mailbox.
    Started {
        session: SessionView,
        echoes: Vec<TimeEcho>,
    },
    /// The handle already had an active session. Nothing changed.
    AlreadyActive { session: SessionView },
}

impl StartOutcome {
    pub fn session(&self) -> &SessionView {
        match self {
            StartOutcome::Started { session, .. } | StartOutcome::AlreadyActive { session } => {
                session
            }
        }
    }

    pub fn is_new(&self) -> bool {
        matches!(self, StartOutcome::Started { .. })
    }
}

/// What one supervisor tick did.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TickReport {
    /// Handles whose idle gap was opened by this tick.
    pub opened_gaps: Vec<String>,
    pub auto_ended: Vec<SessionView>,
}

impl TickReport {
    pub fn is_empty(&self) -> bool {
        self.opened_gaps.is_empty() && self.auto_ended.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineHealth {
    pub now: DateTime<Utc>,
    pub active_sessions: usize,
    pub total_sessions: usize,
    pub repos: usize,
    pub tick_armed: bool,
    pub save_pending: bool,
    pub persistent: bool,
    pub auto_end: String,
}

pub struct FlowEngine {
    config: EngineConfig,
    clock: Arc<dyn Clock>,
    store: SessionStore,
    registry: ActiveLedgers,
    ticker: TickSchedule,
    saver: SaveScheduler,
    /// Snapshot engines never write trace artifacts either.
    detached: bool,
}

impl FlowEngine {
    /// Loads persisted state and resumes the sessions it lists as active.
    pub fn open(storage: &StorageConfig, config: EngineConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        let loaded = SessionStore::load(storage)?;
        let mut engine = Self::with_store(loaded.store, config, clock);
        engine.rehydrate(loaded.active)?;
        debug!(
            root = %storage.root().display(),
            sessions = engine.store.sessions.len(),
            active = engine.registry.len(),
            "Engine opened"
        );
        Ok(engine)
    }

    /// Opens a detached view of the store for readers that must not write:
    /// corrupt files stay where they are and nothing is ever flushed back.
    pub fn open_snapshot(
        storage: &StorageConfig,
        config: EngineConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let loaded = SessionStore::load_snapshot(storage)?;
        let mut engine = Self::with_store(loaded.store, config, clock);
        engine.detached = true;
        engine.rehydrate(loaded.active)?;
        Ok(engine)
    }

    /// An engine that never touches the filesystem.
    pub fn in_memory(config: EngineConfig, clock: Arc<dyn Clock>) -> Self {
        Self::with_store(SessionStore::new_in_memory(), config, clock)
    }

    fn with_store(store: SessionStore, config: EngineConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            ticker: TickSchedule::new(config.tick_interval),
            saver: SaveScheduler::new(config.save_debounce),
            config,
            clock,
            store,
            registry: ActiveLedgers::new(),
            detached: false,
        }
    }

    fn rehydrate(&mut self, markers: ActiveLedgers) -> Result<()> {
        let now = self.clock.now();
        let mut dirty = false;

        for (handle, ledger) in markers {
            match self.store.session(&ledger.session_id) {
                Some(session) if !session.is_ended() && session.handle == handle => {
                    self.registry.insert(handle, ledger);
                }
                _ => {
                    warn!(
                        handle = %handle,
                        session_id = %ledger.session_id,
                        "Dropping stale active-session marker"
                    );
                    dirty = true;
                }
            }
        }

        // Sessions left open by a process that died without a marker.
        let orphans: Vec<(String, DateTime<Utc>)> = self
            .store
            .sessions
            .iter()
            .filter(|s| !s.is_ended() && !self.is_registered(&s.id))
            .map(|s| {
                let last_seen = s.activity.last().copied().unwrap_or(s.started_at);
                (s.id.clone(), last_seen.max(s.started_at))
            })
            .collect();
        for (session_id, last_seen) in &orphans {
            if self
                .finish(session_id, None, *last_seen, EndReason::Shutdown)
                .is_some()
            {
                info!(session_id = %session_id, "Closed orphaned session at its last activity");
            }
        }

        if !self.registry.is_empty() {
            self.ticker.arm(now);
        }
        if !orphans.is_empty() {
            self.flush_now()?;
        } else if dirty {
            self.schedule_save(now);
        }
        Ok(())
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Lifecycle
    // ─────────────────────────────────────────────────────────────────────────

    /// Starts a session for `handle` in `cwd`. Idempotent while one is active.
    pub fn start_session(
        &mut self,
        handle: &str,
        cwd: &Path,
        reason: Option<&str>,
    ) -> Result<StartOutcome> {
        let handle = handle.trim();
        if handle.is_empty() {
            return Err(FlowError::EmptyText {
                field: "Session handle",
            });
        }
        let now = self.clock.now();

        if let Some(ledger) = self.registry.get(handle) {
            if let Some(session) = self.store.session(&ledger.session_id) {
                debug!(handle = %handle, session_id = %session.id, "Session already active");
                return Ok(StartOutcome::AlreadyActive {
                    session: self.view(session, now),
                });
            }
            self.registry.remove(handle);
        }

        let repo_key = resolve_repo_key(cwd);
        let session = Session::new(
            handle,
            repo_key.clone(),
            cwd.display().to_string(),
            now,
            reason.map(str::to_string),
        );
        self.registry
            .insert(handle.to_string(), ActivityLedger::new(&session.id, now));
        if self.ticker.arm(now) {
            debug!("Supervisor tick armed");
        }

        let echoes = self
            .store
            .repos
            .get_mut(&repo_key)
            .map(|ctx| ctx.drain_echoes(now))
            .unwrap_or_default();

        info!(
            session_id = %session.id,
            handle = %handle,
            repo_key = %repo_key,
            echoes = echoes.len(),
            "Session started"
        );

        let view = self.view(&session, now);
        self.store.sessions.push(session);
        self.schedule_save(now);
        Ok(StartOutcome::Started {
            session: view,
            echoes,
        })
    }

    /// Ends the active session for `handle`. `None` when there was none.
    pub fn end_session(&mut self, handle: &str, reason: EndReason) -> Result<Option<SessionView>> {
        let now = self.clock.now();
        let Some(ledger) = self.registry.remove(handle) else {
            debug!(handle = %handle, "No active session to end");
            return Ok(None);
        };

        let session_id = ledger.session_id.clone();
        let ended = self.finish(&session_id, Some(ledger), now, reason);
        self.disarm_if_idle();
        self.flush_now()?;
        Ok(ended.map(|session| self.view(&session, now)))
    }

    /// Ends every active session. Returns how many were ended.
    pub fn shutdown(&mut self, reason: EndReason) -> Result<usize> {
        let now = self.clock.now();
        let handles: Vec<String> = self.registry.keys().cloned().collect();
        let mut ended = 0;

        for handle in handles {
            if let Some(ledger) = self.registry.remove(&handle) {
                let session_id = ledger.session_id.clone();
                if self
                    .finish(&session_id, Some(ledger), now, reason.clone())
                    .is_some()
                {
                    ended += 1;
                }
            }
        }

        self.ticker.disarm();
        self.flush_now()?;
        info!(ended, reason = %reason, "Engine shut down");
        Ok(ended)
    }

    /// Closes the session record. Shared by every path that ends a session.
    fn finish(
        &mut self,
        session_id: &str,
        ledger: Option<ActivityLedger>,
        at: DateTime<Utc>,
        reason: EndReason,
    ) -> Option<Session> {
        let session = self.store.session_mut(session_id)?;
        if session.is_ended() {
            return None;
        }

        let mut end_at = at.max(session.started_at);
        if let Some(mut ledger) = ledger {
            end_at = end_at.max(ledger.last_activity_at);
            ledger.close_idle_gap(session, end_at);
        }
        session.ended_at = Some(end_at);
        session.end_reason = Some(reason.clone());
        session.flow_summary = Some(compute_flow_summary(session, end_at));
        let echoes = std::mem::take(&mut session.time_echoes);
        let snapshot = session.clone();

        if !echoes.is_empty() {
            let queued = self
                .store
                .repos
                .entry(snapshot.repo_key.clone())
                .or_default()
                .enqueue_echoes(echoes);
            debug!(repo_key = %snapshot.repo_key, queued, "Time echoes queued for next session");
        }

        self.write_trace(&snapshot, at);

        info!(
            session_id = %snapshot.id,
            handle = %snapshot.handle,
            repo_key = %snapshot.repo_key,
            reason = %reason,
            label = %snapshot.summary_as_of(end_at).label,
            "Session ended"
        );
        Some(snapshot)
    }

    fn write_trace(&self, session: &Session, now: DateTime<Utc>) {
        if self.detached {
            return;
        }
        let include = self
            .store
            .repos
            .get(&session.repo_key)
            .is_some_and(|ctx| ctx.include_trace);
        if !include {
            return;
        }

        match append_trace(Path::new(&session.repo_key), &session.repo_key, session, now) {
            Ok(true) => debug!(repo_key = %session.repo_key, "Trace artifact updated"),
            Ok(false) => {}
            Err(e) => warn!(repo_key = %session.repo_key, error = %e, "Failed to write trace artifact"),
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Activity & Notes
    // ─────────────────────────────────────────────────────────────────────────

    pub fn record_activity(&mut self, handle: &str, source: &str) -> Result<ActivityOutcome> {
        let now = self.clock.now();
        let (_, outcome) = touch(
            &mut self.registry,
            &mut self.store.sessions,
            handle,
            now,
            self.config.activity_sample_interval,
        )?;
        trace!(handle = %handle, source = %source, "Activity");
        if outcome.changed() {
            self.schedule_save(now);
        }
        Ok(outcome)
    }

    pub fn set_intent(&mut self, handle: &str, text: &str) -> Result<Intent> {
        let text = clean_text(text, "Intent")?;
        let now = self.clock.now();
        let (session, _) = touch(
            &mut self.registry,
            &mut self.store.sessions,
            handle,
            now,
            self.config.activity_sample_interval,
        )?;

        let intent = Intent { text, set_at: now };
        session.intent = Some(intent.clone());
        session.intents.push(intent.clone());
        debug!(handle = %handle, session_id = %session.id, "Intent set");

        self.schedule_save(now);
        Ok(intent)
    }

    pub fn add_parked_thought(&mut self, handle: &str, text: &str) -> Result<ParkedThought> {
        let text = clean_text(text, "Parked thought")?;
        let now = self.clock.now();
        let (session, _) = touch(
            &mut self.registry,
            &mut self.store.sessions,
            handle,
            now,
            self.config.activity_sample_interval,
        )?;

        let ctx = self.store.repos.entry(session.repo_key.clone()).or_default();
        let thought = add_thought(session, ctx, &text, now)?;
        debug!(handle = %handle, thought_id = %thought.id, "Thought parked");

        self.schedule_save(now);
        Ok(thought)
    }

    /// Leaves a note for the next session on this repo. `delay` pushes its
    /// delivery further out.
    pub fn queue_time_echo(
        &mut self,
        handle: &str,
        text: &str,
        delay: Option<Duration>,
    ) -> Result<TimeEcho> {
        let text = clean_text(text, "Time echo")?;
        let now = self.clock.now();
        let (session, _) = touch(
            &mut self.registry,
            &mut self.store.sessions,
            handle,
            now,
            self.config.activity_sample_interval,
        )?;

        let delay = delay.filter(|d| *d > Duration::zero());
        let echo = TimeEcho::new(&text, &session.id, now, delay)?;
        session.time_echoes.push(echo.clone());
        debug!(handle = %handle, echo_id = %echo.id, deliver_at = %echo.deliver_at, "Time echo queued");

        self.schedule_save(now);
        Ok(echo)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Reads
    // ─────────────────────────────────────────────────────────────────────────

    pub fn get_active_session(&self, handle: &str) -> Option<SessionView> {
        let ledger = self.registry.get(handle)?;
        let session = self.store.session(&ledger.session_id)?;
        Some(self.view(session, self.clock.now()))
    }

    /// The most recently ended session.
    pub fn get_last_session(&self) -> Option<SessionView> {
        let session = self.store.sessions.iter().rev().find(|s| s.is_ended())?;
        Some(self.view(session, self.clock.now()))
    }

    pub fn get_last_session_for_repo(&self, repo_key: &str) -> Option<SessionView> {
        let session = self
            .store
            .sessions
            .iter()
            .rev()
            .find(|s| s.is_ended() && s.repo_key == repo_key)?;
        Some(self.view(session, self.clock.now()))
    }

    pub fn get_session(&self, id: &str) -> Option<SessionView> {
        let session = self.store.session(id)?;
        Some(self.view(session, self.clock.now()))
    }

    /// Every session, newest first.
    pub fn get_all_sessions(&self) -> Vec<SessionView> {
        let now = self.clock.now();
        self.store
            .sessions
            .iter()
            .rev()
            .map(|s| self.view(s, now))
            .collect()
    }

    /// Newest ended sessions, at most one per repo.
    pub fn get_recent_sessions(&self, limit: usize) -> Vec<RecentSession> {
        let mut seen = HashSet::new();
        self.store
            .sessions
            .iter()
            .rev()
            .filter(|s| s.is_ended())
            .filter(|s| seen.insert(s.repo_key.clone()))
            .take(limit)
            .map(RecentSession::from)
            .collect()
    }

    /// Sessions for one repo, newest first.
    pub fn get_repo_sessions(&self, repo_key: &str, limit: Option<usize>) -> Vec<SessionView> {
        let now = self.clock.now();
        self.store
            .sessions
            .iter()
            .rev()
            .filter(|s| s.repo_key == repo_key)
            .take(limit.unwrap_or(usize::MAX))
            .map(|s| self.view(s, now))
            .collect()
    }

    pub fn active_handles(&self) -> Vec<String> {
        self.registry.keys().cloned().collect()
    }

    pub fn health(&self) -> EngineHealth {
        EngineHealth {
            now: self.clock.now(),
            active_sessions: self.registry.len(),
            total_sessions: self.store.sessions.len(),
            repos: self.store.repos.len(),
            tick_armed: self.ticker.is_armed(),
            save_pending: self.saver.is_pending(),
            persistent: !self.store.is_in_memory(),
            auto_end: self.config.auto_end.to_string(),
        }
    }

    fn view(&self, session: &Session, now: DateTime<Utc>) -> SessionView {
        if let Some(ended_at) = session.ended_at {
            return SessionView {
                session: session.clone(),
                flow_summary: session.summary_as_of(ended_at),
                status: SessionStatus::Ended {
                    ended_at,
                    reason: session.end_reason.clone().unwrap_or(EndReason::Manual),
                },
            };
        }

        let ledger = self
            .registry
            .get(&session.handle)
            .filter(|ledger| ledger.session_id == session.id);
        let (flow_summary, idle_for) = match ledger {
            Some(ledger) => {
                let mut gaps = session.idle_gaps.clone();
                gaps.extend(ledger.provisional_gap(now));
                (
                    summarize(session.started_at, &gaps, now),
                    ledger.idle_for(now),
                )
            }
            None => (compute_flow_summary(session, now), Duration::zero()),
        };

        SessionView {
            session: session.clone(),
            flow_summary,
            status: SessionStatus::Active {
                idle_for_ms: idle_for.num_milliseconds(),
                paused: idle_for >= self.config.idle_threshold,
            },
        }
    }

    fn is_registered(&self, session_id: &str) -> bool {
        self.registry
            .values()
            .any(|ledger| ledger.session_id == session_id)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Deletion
    // ─────────────────────────────────────────────────────────────────────────

    /// Removes one session record. Repo-scoped thoughts are kept.
    pub fn delete_session(&mut self, id: &str) -> Result<Session> {
        let index = self
            .store
            .sessions
            .iter()
            .position(|s| s.id == id)
            .ok_or_else(|| FlowError::SessionNotFound { id: id.to_string() })?;
        let session = self.store.sessions.remove(index);
        self.registry.retain(|_, ledger| ledger.session_id != id);
        self.disarm_if_idle();
        self.flush_now()?;
        info!(session_id = %id, repo_key = %session.repo_key, "Session deleted");
        Ok(session)
    }

    /// Removes every session of the repo and its context. Returns the number
    /// of sessions removed.
    pub fn delete_repo_context(&mut self, repo_key: &str) -> Result<usize> {
        let ids: HashSet<String> = self
            .store
            .sessions
            .iter()
            .filter(|s| s.repo_key == repo_key)
            .map(|s| s.id.clone())
            .collect();

        self.store.sessions.retain(|s| s.repo_key != repo_key);
        self.registry
            .retain(|_, ledger| !ids.contains(&ledger.session_id));
        let had_context = self.store.repos.remove(repo_key).is_some();
        self.disarm_if_idle();
        self.flush_now()?;

        info!(repo_key = %repo_key, sessions = ids.len(), had_context, "Repo context deleted");
        Ok(ids.len())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Mailbox
    // ─────────────────────────────────────────────────────────────────────────

    /// Delivers due pending echoes. Empty when nothing is pending.
    pub fn drain_time_echoes(&mut self, repo_key: &str) -> Vec<TimeEcho> {
        let now = self.clock.now();
        let drained = self
            .store
            .repos
            .get_mut(repo_key)
            .map(|ctx| ctx.drain_echoes(now))
            .unwrap_or_default();
        if !drained.is_empty() {
            debug!(repo_key = %repo_key, count = drained.len(), "Time echoes delivered");
            self.schedule_save(now);
        }
        drained
    }

    /// Delivered echoes not yet parked or discarded.
    pub fn delivered_time_echoes(&self, repo_key: &str) -> Vec<TimeEcho> {
        self.store
            .repos
            .get(repo_key)
            .map(|ctx| ctx.delivered_echoes.clone())
            .unwrap_or_default()
    }

    pub fn park_time_echo(&mut self, repo_key: &str, id: &str) -> Result<ParkedThought> {
        let now = self.clock.now();
        let ctx = self
            .store
            .repos
            .get_mut(repo_key)
            .ok_or_else(|| FlowError::EchoNotFound { id: id.to_string() })?;
        let thought = ctx.park_echo(id, now)?;
        debug!(repo_key = %repo_key, echo_id = %id, "Time echo parked");
        self.schedule_save(now);
        Ok(thought)
    }

    pub fn discard_time_echo(&mut self, repo_key: &str, id: &str) -> Result<TimeEcho> {
        let now = self.clock.now();
        let ctx = self
            .store
            .repos
            .get_mut(repo_key)
            .ok_or_else(|| FlowError::EchoNotFound { id: id.to_string() })?;
        let echo = ctx.discard_echo(id)?;
        debug!(repo_key = %repo_key, echo_id = %id, "Time echo discarded");
        self.schedule_save(now);
        Ok(echo)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Parked Thoughts
    // ─────────────────────────────────────────────────────────────────────────

    pub fn get_parked_thoughts(&mut self, repo_key: &str) -> Vec<ParkedThought> {
        let Some(ctx) = self.store.repos.get_mut(repo_key) else {
            return Vec::new();
        };
        let fixed = normalize_thought_ids(&mut ctx.parked_thoughts);
        let thoughts = ctx.parked_thoughts.clone();
        if fixed > 0 {
            let now = self.clock.now();
            self.schedule_save(now);
        }
        thoughts
    }

    /// Deletes the thought everywhere it is stored.
    pub fn delete_parked_thought(&mut self, repo_key: &str, id: &str) -> Result<usize> {
        let removed = delete_thought(
            self.store.repos.get_mut(repo_key),
            &mut self.store.sessions,
            id,
        )?;
        self.flush_now()?;
        info!(repo_key = %repo_key, thought_id = %id, copies = removed, "Parked thought deleted");
        Ok(removed)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Trace Artifact
    // ─────────────────────────────────────────────────────────────────────────

    pub fn set_include_trace(&mut self, repo_key: &str, include: bool) -> Result<()> {
        let now = self.clock.now();
        self.store
            .repos
            .entry(repo_key.to_string())
            .or_default()
            .include_trace = include;

        let root = Path::new(repo_key);
        if root.is_dir() {
            if let Err(e) = set_excluded(root, !include) {
                warn!(repo_key = %repo_key, error = %e, "Failed to update git exclude");
            }
        }

        debug!(repo_key = %repo_key, include, "Trace inclusion updated");
        self.schedule_save(now);
        Ok(())
    }

    pub fn get_include_trace(&self, repo_key: &str) -> bool {
        self.store
            .repos
            .get(repo_key)
            .is_some_and(|ctx| ctx.include_trace)
    }

    pub fn read_trace(&self, repo_key: &str) -> Result<Option<TraceFile>> {
        read_trace(Path::new(repo_key))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Supervision & Saving
    // ─────────────────────────────────────────────────────────────────────────

    /// One sweep over active sessions: open idle gaps, auto-end the idle.
    pub fn tick(&mut self) -> Result<TickReport> {
        let now = self.clock.now();
        let mut report = TickReport::default();
        let mut to_end = Vec::new();

        for (handle, ledger) in self.registry.iter_mut() {
            let idle_for = ledger.idle_for(now);
            if idle_for >= self.config.idle_threshold && ledger.open_idle_gap() {
                debug!(handle = %handle, session_id = %ledger.session_id, "Idle gap opened");
                report.opened_gaps.push(handle.clone());
            }
            if let Some(limit) = self.config.auto_end.as_duration() {
                if idle_for >= limit {
                    to_end.push(handle.clone());
                }
            }
        }

        for handle in to_end {
            let Some(mut ledger) = self.registry.remove(&handle) else {
                continue;
            };
            // An auto-end shorter than the idle threshold still records the idle stretch.
            ledger.open_idle_gap();
            let session_id = ledger.session_id.clone();
            let idle_ms = ledger.idle_for(now).num_milliseconds();
            if let Some(session) = self.finish(&session_id, Some(ledger), now, EndReason::Inactivity) {
                info!(handle = %handle, session_id = %session_id, idle_ms, "Session auto-ended after inactivity");
                report.auto_ended.push(self.view(&session, now));
            }
        }

        self.disarm_if_idle();
        if !report.auto_ended.is_empty() {
            self.flush_now()?;
        } else if !report.opened_gaps.is_empty() {
            self.schedule_save(now);
        }
        Ok(report)
    }

    /// Runs whatever is due at the current clock time.
    pub fn run_due(&mut self) -> Result<Option<TickReport>> {
        let now = self.clock.now();
        let report = if self.ticker.take_due(now) {
            Some(self.tick()?)
        } else {
            None
        };
        self.flush_due()?;
        Ok(report)
    }

    /// True while a tick or a save is scheduled.
    pub fn needs_wakeups(&self) -> bool {
        self.ticker.is_armed() || self.saver.is_pending()
    }

    /// Earliest scheduled deadline, if any.
    pub fn next_deadline(&self) -> Option<DateTime<Utc>> {
        match (self.ticker.next_at(), self.saver.due_at()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Cancels any pending debounced save and writes now.
    pub fn flush_now(&mut self) -> Result<()> {
        self.saver.cancel();
        self.store.save(&self.registry)
    }

    /// Writes if the debounce window has elapsed. A failed write is
    /// rescheduled.
    pub fn flush_due(&mut self) -> Result<bool> {
        let now = self.clock.now();
        if !self.saver.take_due(now) {
            return Ok(false);
        }
        match self.store.save(&self.registry) {
            Ok(()) => {
                debug!("Debounced save written");
                Ok(true)
            }
            Err(e) => {
                self.saver.schedule_debounced(now);
                Err(e)
            }
        }
    }

    fn schedule_save(&mut self, now: DateTime<Utc>) {
        self.saver.schedule_debounced(now);
    }

    fn disarm_if_idle(&mut self) {
        if self.registry.is_empty() && self.ticker.disarm() {
            debug!("Supervisor tick disarmed");
        }
    }
}

/// Records activity for the active session behind `handle`.
fn touch<'a>(
    registry: &mut ActiveLedgers,
    sessions: &'a mut [Session],
    handle: &str,
    now: DateTime<Utc>,
    sample_interval: Duration,
) -> Result<(&'a mut Session, ActivityOutcome)> {
    let no_session = || FlowError::NoActiveSession {
        handle: handle.to_string(),
    };
    let ledger = registry.get_mut(handle).ok_or_else(no_session)?;
    let session = sessions
        .iter_mut()
        .find(|s| s.id == ledger.session_id && !s.is_ended())
        .ok_or_else(no_session)?;

    let outcome = ledger.record_activity(session, now, sample_interval);
    if let Some(gap) = &outcome.closed_gap {
        debug!(
            handle = %handle,
            session_id = %session.id,
            idle_ms = gap.duration_ms,
            "Idle gap closed"
        );
    }
    Ok((session, outcome))
}
