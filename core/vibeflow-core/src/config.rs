//! Engine thresholds, surface presets and the optional `vibeflow.toml` settings.
//!
//! The CLI and the long-running app share one engine; only their defaults
//! differ. A CLI session models a repo you may come back to after lunch, an
//! app session models a terminal tab.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use chrono::Duration;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{FlowError, Result};

pub const IDLE_THRESHOLD_MINUTES: i64 = 5;
pub const ACTIVITY_SAMPLE_MS: i64 = 1_000;
pub const TICK_INTERVAL_SECS: i64 = 10;
pub const SAVE_DEBOUNCE_MS: i64 = 2_000;
pub const CLI_AUTO_END_HOURS: i64 = 4;
pub const APP_AUTO_END_MINUTES: i64 = 10;

pub const IDLE_TIMEOUT_ENV: &str = "VF_IDLE_TIMEOUT";

static DURATION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^\s*(\d+)\s*(m|min|mins|h|hr|hrs)?\s*$").unwrap());

/// Parses `"10"`, `"10m"` or `"4h"`. `Ok(None)` means the value disables the
/// feature (`off`, `never`, `disabled`, or any zero).
pub fn parse_duration_spec(text: &str) -> Result<Option<Duration>> {
    let trimmed = text.trim();
    if matches!(
        trimmed.to_ascii_lowercase().as_str(),
        "off" | "never" | "disabled" | "none"
    ) {
        return Ok(None);
    }

    let invalid = || FlowError::InvalidDuration {
        value: text.to_string(),
    };
    let caps = DURATION_RE.captures(trimmed).ok_or_else(invalid)?;
    let amount: i64 = caps[1].parse().map_err(|_| invalid())?;
    if amount == 0 {
        return Ok(None);
    }

    let hours = caps
        .get(2)
        .map(|unit| unit.as_str().to_ascii_lowercase().starts_with('h'))
        .unwrap_or(false);
    let duration = if hours {
        Duration::try_hours(amount)
    } else {
        Duration::try_minutes(amount)
    };
    duration.map(Some).ok_or_else(invalid)
}

// ─────────────────────────────────────────────────────────────────────────────
// Idle Timeout
// ─────────────────────────────────────────────────────────────────────────────

/// How long a session may sit idle before the supervisor ends it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleTimeout {
    Off,
    After(Duration),
}

impl IdleTimeout {
    pub fn as_duration(self) -> Option<Duration> {
        match self {
            IdleTimeout::Off => None,
            IdleTimeout::After(d) => Some(d),
        }
    }
}

impl FromStr for IdleTimeout {
    type Err = FlowError;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match parse_duration_spec(s)? {
            Some(d) => IdleTimeout::After(d),
            None => IdleTimeout::Off,
        })
    }
}

impl fmt::Display for IdleTimeout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let IdleTimeout::After(d) = self else {
            return write!(f, "off");
        };
        // Whole minutes, rounded up: "0m" would read back as off.
        let ms = d.num_milliseconds().max(1);
        let minutes = ms / 60_000 + i64::from(ms % 60_000 != 0);
        if minutes % 60 == 0 {
            write!(f, "{}h", minutes / 60)
        } else {
            write!(f, "{}m", minutes)
        }
    }
}

impl Serialize for IdleTimeout {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for IdleTimeout {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Minutes(u32),
            Text(String),
        }

        let text = match Raw::deserialize(deserializer)? {
            Raw::Minutes(m) => m.to_string(),
            Raw::Text(t) => t,
        };
        text.parse().map_err(serde::de::Error::custom)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Engine Config
// ─────────────────────────────────────────────────────────────────────────────

/// Thresholds the engine runs with.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Inactivity after which an idle gap is opened.
    pub idle_threshold: Duration,
    /// Inactivity after which the session is force-ended.
    pub auto_end: IdleTimeout,
    /// Minimum spacing between entries in the coalesced activity log.
    pub activity_sample_interval: Duration,
    /// Supervisor sweep period.
    pub tick_interval: Duration,
    /// Coalescing window for non-critical writes.
    pub save_debounce: Duration,
}

impl EngineConfig {
    pub fn cli() -> Self {
        Self {
            auto_end: IdleTimeout::After(Duration::hours(CLI_AUTO_END_HOURS)),
            ..Self::base()
        }
    }

    pub fn app() -> Self {
        Self {
            auto_end: IdleTimeout::After(Duration::minutes(APP_AUTO_END_MINUTES)),
            ..Self::base()
        }
    }

    fn base() -> Self {
        Self {
            idle_threshold: Duration::minutes(IDLE_THRESHOLD_MINUTES),
            auto_end: IdleTimeout::Off,
            activity_sample_interval: Duration::milliseconds(ACTIVITY_SAMPLE_MS),
            tick_interval: Duration::seconds(TICK_INTERVAL_SECS),
            save_debounce: Duration::milliseconds(SAVE_DEBOUNCE_MS),
        }
    }

    pub fn with_auto_end(mut self, auto_end: IdleTimeout) -> Self {
        self.auto_end = auto_end;
        self
    }

    /// Applies user settings on top of the surface preset.
    pub fn with_settings(mut self, settings: &Settings) -> Self {
        if let Some(timeout) = settings.idle_timeout {
            self.auto_end = timeout;
        }
        if let Some(minutes) = settings.idle_threshold_minutes.filter(|m| *m > 0) {
            self.idle_threshold = Duration::minutes(i64::from(minutes));
        }
        self
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Settings File
// ─────────────────────────────────────────────────────────────────────────────

/// Contents of `vibeflow.toml`. Every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub idle_timeout: Option<IdleTimeout>,
    pub idle_threshold_minutes: Option<u32>,
}

/// Loads settings, returning defaults when the file does not exist.
pub fn load_settings(path: &Path) -> Result<Settings> {
    if !path.exists() {
        return Ok(Settings::default());
    }

    let content = fs_err::read_to_string(path).map_err(|e| FlowError::Io {
        context: format!("reading settings {}", path.display()),
        source: e,
    })?;
    toml::from_str::<Settings>(&content).map_err(|e| FlowError::ConfigMalformed {
        path: path.to_path_buf(),
        details: e.to_string(),
    })
}
