//! Deadline bookkeeping for deferred work.
//!
//! Neither type owns a thread or a timer. They only remember when something
//! is due; whoever drives the engine (the supervisor thread, or a CLI
//! invocation) asks `take_due(now)` and acts on the answer.

use chrono::{DateTime, Duration, Utc};

/// Coalesces bursts of "please save" into one write per window.
#[derive(Debug, Clone)]
pub struct SaveScheduler {
    window: Duration,
    due_at: Option<DateTime<Utc>>,
}

impl SaveScheduler {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            due_at: None,
        }
    }

    /// Arms a save one window from `now` unless one is already pending.
    /// Returns true if this call armed it.
    pub fn schedule_debounced(&mut self, now: DateTime<Utc>) -> bool {
        if self.due_at.is_some() {
            return false;
        }
        self.due_at = Some(now + self.window);
        true
    }

    pub fn is_pending(&self) -> bool {
        self.due_at.is_some()
    }

    pub fn due_at(&self) -> Option<DateTime<Utc>> {
        self.due_at
    }

    /// Clears and returns true once the window has elapsed.
    pub fn take_due(&mut self, now: DateTime<Utc>) -> bool {
        match self.due_at {
            Some(due) if now >= due => {
                self.due_at = None;
                true
            }
            _ => false,
        }
    }

    /// Drops the pending save, e.g. after a forced flush.
    pub fn cancel(&mut self) -> bool {
        self.due_at.take().is_some()
    }
}

/// A periodic deadline that is only armed while there is something to watch.
#[derive(Debug, Clone)]
pub struct TickSchedule {
    interval: Duration,
    next_at: Option<DateTime<Utc>>,
}

impl TickSchedule {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            next_at: None,
        }
    }

    /// Arms the schedule if it is not already running.
    pub fn arm(&mut self, now: DateTime<Utc>) -> bool {
        if self.next_at.is_some() {
            return false;
        }
        self.next_at = Some(now + self.interval);
        true
    }

    pub fn disarm(&mut self) -> bool {
        self.next_at.take().is_some()
    }

    pub fn is_armed(&self) -> bool {
        self.next_at.is_some()
    }

    pub fn next_at(&self) -> Option<DateTime<Utc>> {
        self.next_at
    }

    /// True when a tick is due; the next one is scheduled one interval after
    /// `now` so a stalled driver does not fire a burst of catch-up ticks.
    pub fn take_due(&mut self, now: DateTime<Utc>) -> bool {
        match self.next_at {
            Some(next) if now >= next => {
                self.next_at = Some(now + self.interval);
                true
            }
            _ => false,
        }
    }
}
