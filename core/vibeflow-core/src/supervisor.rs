//! Background driver for long-running hosts.
//!
//! One thread per engine. It parks on a condvar while the engine has nothing
//! scheduled and polls `run_due()` while a tick or save is armed. Caller
//! operations and the thread share the same mutex, so a tick can never
//! interleave with an end or a delete.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::engine::FlowEngine;
use crate::error::Result;
use crate::types::EndReason;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);

struct Shared {
    engine: Mutex<FlowEngine>,
    wake: Condvar,
    stopping: AtomicBool,
    poll_interval: Duration,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, FlowEngine> {
        self.engine.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct FlowSupervisor {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl FlowSupervisor {
    pub fn spawn(engine: FlowEngine) -> std::io::Result<Self> {
        Self::spawn_with_interval(engine, DEFAULT_POLL_INTERVAL)
    }

    pub fn spawn_with_interval(engine: FlowEngine, poll_interval: Duration) -> std::io::Result<Self> {
        let shared = Arc::new(Shared {
            engine: Mutex::new(engine),
            wake: Condvar::new(),
            stopping: AtomicBool::new(false),
            poll_interval,
        });

        let worker_state = Arc::clone(&shared);
        let worker = thread::Builder::new()
            .name("vibeflow-supervisor".to_string())
            .spawn(move || run(worker_state))?;

        debug!(poll_ms = poll_interval.as_millis() as u64, "Supervisor started");
        Ok(Self {
            shared,
            worker: Some(worker),
        })
    }

    /// Runs `f` with exclusive access to the engine, then wakes the worker in
    /// case `f` armed a tick or a save.
    pub fn with_engine<R>(&self, f: impl FnOnce(&mut FlowEngine) -> R) -> R {
        let result = {
            let mut engine = self.shared.lock();
            f(&mut engine)
        };
        self.shared.wake.notify_all();
        result
    }

    pub fn is_running(&self) -> bool {
        self.worker.is_some()
    }

    /// Stops the worker, then ends every active session with `reason` and
    /// flushes. Returns how many sessions were ended. Later calls return 0.
    pub fn shutdown(&mut self, reason: EndReason) -> Result<usize> {
        let Some(worker) = self.worker.take() else {
            return Ok(0);
        };

        // Set under the engine lock: the worker checks the flag and parks on the
        // condvar while holding it, so the notify cannot fall between the two.
        {
            let _engine = self.shared.lock();
            self.shared.stopping.store(true, Ordering::SeqCst);
        }
        self.shared.wake.notify_all();
        if worker.join().is_err() {
            warn!("Supervisor thread panicked");
        }

        let ended = self.shared.lock().shutdown(reason)?;
        info!(ended, "Supervisor stopped");
        Ok(ended)
    }
}

impl Drop for FlowSupervisor {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown(EndReason::Shutdown) {
            warn!(error = %err, "Supervisor shutdown on drop failed");
        }
    }
}

fn run(shared: Arc<Shared>) {
    let mut engine = shared.lock();
    loop {
        if shared.stopping.load(Ordering::SeqCst) {
            break;
        }

        if engine.needs_wakeups() {
            match engine.run_due() {
                Ok(Some(report)) if !report.auto_ended.is_empty() => {
                    debug!(count = report.auto_ended.len(), "Tick auto-ended sessions");
                }
                Ok(_) => {}
                Err(err) => warn!(error = %err, "Supervisor pass failed"),
            }
            engine = shared
                .wake
                .wait_timeout(engine, shared.poll_interval)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|poisoned| poisoned.into_inner().0);
        } else {
            engine = shared
                .wake
                .wait(engine)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}
