//! # vibeflow-core
//!
//! Session lifecycle and flow-state engine for VibeFlow, shared by the `vf`
//! CLI and the long-running `vf serve` host.
//!
//! ## Design Principles
//!
//! - **Synchronous**: No async runtime. [`FlowEngine`] is a plain state machine;
//!   [`FlowSupervisor`] adds one thread and a mutex for hosts that need ticks.
//! - **Injected time**: Every operation reads time from a [`Clock`], so idle
//!   detection and classification are reproducible under test.
//! - **Graceful degradation**: Missing or corrupt files load as empty state,
//!   never as a startup failure. Reads return `None`/empty rather than errors.
//! - **One engine, two presets**: CLI and app differ only in [`EngineConfig`].
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use vibeflow_core::{EngineConfig, EndReason, FlowEngine, StorageConfig, Surface, SystemClock};
//!
//! let storage = StorageConfig::for_surface(Surface::Cli)?;
//! let mut engine = FlowEngine::open(&storage, EngineConfig::cli(), Arc::new(SystemClock))?;
//! engine.start_session("tab-1", std::path::Path::new("."), Some("manual"))?;
//! engine.set_intent("tab-1", "fix the flaky login test")?;
//! let ended = engine.end_session("tab-1", EndReason::Manual)?;
//! ```

pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod flow;
pub mod ledger;
pub mod mailbox;
pub mod persistence;
pub mod repo;
pub mod schedule;
pub mod storage;
pub mod supervisor;
pub mod thoughts;
pub mod trace;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::*;
pub use engine::{EngineHealth, FlowEngine, StartOutcome, TickReport, DEFAULT_RECENT_LIMIT};
pub use error::{FlowError, Result};
pub use flow::{active_blocks, compute_flow_summary, summarize, ActiveBlock};
pub use ledger::{ActivityLedger, ActivityOutcome};
pub use persistence::{ActiveLedgers, LoadedStore, SessionStore};
pub use repo::{find_repo_root, repo_display_name, resolve_repo_key};
pub use schedule::{SaveScheduler, TickSchedule};
pub use storage::*;
pub use supervisor::{FlowSupervisor, DEFAULT_POLL_INTERVAL};
pub use trace::{TraceEntry, TraceFile};
pub use types::*;
