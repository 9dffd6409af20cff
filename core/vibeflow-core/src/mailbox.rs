//! Time Echo mailbox - notes a session leaves for the next one on its repo.
//!
//! Each echo id lives in exactly one place at a time:
//!
//! ```text
//! session.time_echoes ──end──▶ pending ──drain──▶ delivered ──park──▶ parked thoughts
//!                                                     └───discard──▶ (gone)
//! ```
//!
//! `delivered` survives restarts so a client can re-display echoes it has not
//! acted on yet; a second drain returns nothing new.

use chrono::{DateTime, Duration, Utc};

use crate::error::{FlowError, Result};
use crate::types::{new_id, ParkedThought, RepoContext, TimeEcho};

impl TimeEcho {
    /// A new echo authored by `source_session_id`, deliverable after `delay`.
    /// A delay that lands outside the representable date range is rejected.
    pub fn new(
        text: &str,
        source_session_id: &str,
        now: DateTime<Utc>,
        delay: Option<Duration>,
    ) -> Result<Self> {
        let delay = delay.unwrap_or_else(Duration::zero);
        let deliver_at =
            now.checked_add_signed(delay)
                .ok_or_else(|| FlowError::InvalidDuration {
                    value: format!("{}ms", delay.num_milliseconds()),
                })?;
        Ok(Self {
            id: new_id(),
            text: text.to_string(),
            created_at: now,
            deliver_at,
            delivered_at: None,
            source_session_id: source_session_id.to_string(),
        })
    }
}

impl RepoContext {
    /// Appends echoes to the pending queue, skipping ids already present
    /// anywhere in the mailbox.
    pub fn enqueue_echoes(&mut self, echoes: Vec<TimeEcho>) -> usize {
        let mut added = 0;
        for echo in echoes {
            if self.knows_echo(&echo.id) {
                continue;
            }
            self.pending_echoes.push(echo);
            added += 1;
        }
        added
    }

    /// Moves every pending echo that is due into `delivered` and returns them.
    /// Echoes scheduled for later stay pending, in order.
    pub fn drain_echoes(&mut self, now: DateTime<Utc>) -> Vec<TimeEcho> {
        let (due, later): (Vec<TimeEcho>, Vec<TimeEcho>) = std::mem::take(&mut self.pending_echoes)
            .into_iter()
            .partition(|echo| echo.deliver_at <= now);
        self.pending_echoes = later;

        let delivered: Vec<TimeEcho> = due
            .into_iter()
            .map(|mut echo| {
                echo.delivered_at = Some(now);
                echo
            })
            .collect();
        self.delivered_echoes.extend(delivered.iter().cloned());
        delivered
    }

    /// Turns a delivered echo into a parked thought with the same id.
    pub fn park_echo(&mut self, id: &str, now: DateTime<Utc>) -> Result<ParkedThought> {
        let echo = self.take_delivered(id)?;
        let thought = ParkedThought {
            id: echo.id,
            text: echo.text,
            created_at: now,
        };
        self.parked_thoughts.push(thought.clone());
        Ok(thought)
    }

    /// Drops a delivered echo.
    pub fn discard_echo(&mut self, id: &str) -> Result<TimeEcho> {
        self.take_delivered(id)
    }

    fn take_delivered(&mut self, id: &str) -> Result<TimeEcho> {
        let index = self
            .delivered_echoes
            .iter()
            .position(|echo| echo.id == id)
            .ok_or_else(|| FlowError::EchoNotFound { id: id.to_string() })?;
        Ok(self.delivered_echoes.remove(index))
    }

    fn knows_echo(&self, id: &str) -> bool {
        self.pending_echoes.iter().any(|e| e.id == id)
            || self.delivered_echoes.iter().any(|e| e.id == id)
            || self.parked_thoughts.iter().any(|t| t.id == id)
    }
}
