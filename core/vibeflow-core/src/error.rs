//! Error types for vibeflow-core operations.
//!
//! Recoverable conditions (no active session, unknown ids) are ordinary
//! variants so callers can react to them; idempotent no-ops are not errors.

use std::path::PathBuf;

/// All errors that can occur in vibeflow-core operations.
#[derive(Debug, thiserror::Error)]
pub enum FlowError {
    // ─────────────────────────────────────────────────────────────────────
    // Session Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("No active session for {handle}")]
    NoActiveSession { handle: String },

    #[error("Session not found: {id}")]
    SessionNotFound { id: String },

    #[error("{field} text is required")]
    EmptyText { field: &'static str },

    // ─────────────────────────────────────────────────────────────────────
    // Repo Context Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Parked thought not found: {id}")]
    ThoughtNotFound { id: String },

    #[error("Time echo not found: {id}")]
    EchoNotFound { id: String },

    // ─────────────────────────────────────────────────────────────────────
    // Configuration Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Invalid duration '{value}' (expected minutes, '<n>m', '<n>h' or 'off')")]
    InvalidDuration { value: String },

    #[error("Could not determine a data directory for VibeFlow")]
    DataDirNotFound,

    #[error("Configuration file malformed: {path}: {details}")]
    ConfigMalformed { path: PathBuf, details: String },

    // ─────────────────────────────────────────────────────────────────────
    // I/O Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("I/O error: {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error: {context}: {source}")]
    Json {
        context: String,
        #[source]
        source: serde_json::Error,
    },
}

impl FlowError {
    /// Stable snake_case code for protocol responses.
    pub fn code(&self) -> &'static str {
        match self {
            FlowError::NoActiveSession { .. } => "no_active_session",
            FlowError::SessionNotFound { .. }
            | FlowError::ThoughtNotFound { .. }
            | FlowError::EchoNotFound { .. } => "not_found",
            FlowError::EmptyText { .. } | FlowError::InvalidDuration { .. } => "invalid_params",
            FlowError::DataDirNotFound | FlowError::ConfigMalformed { .. } => "config_error",
            FlowError::Io { .. } | FlowError::Json { .. } => "storage_error",
        }
    }

    /// True for conditions the caller can recover from by changing its input.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, FlowError::Io { .. } | FlowError::Json { .. })
    }
}

/// Convenience type alias for Results using FlowError.
pub type Result<T> = std::result::Result<T, FlowError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_variants_share_a_code() {
        let session = FlowError::SessionNotFound { id: "a".into() };
        let thought = FlowError::ThoughtNotFound { id: "b".into() };
        let echo = FlowError::EchoNotFound { id: "c".into() };
        assert_eq!(session.code(), "not_found");
        assert_eq!(thought.code(), "not_found");
        assert_eq!(echo.code(), "not_found");
    }

    #[test]
    fn io_errors_are_not_recoverable() {
        let err = FlowError::Io {
            context: "writing sessions".into(),
            source: std::io::Error::other("disk full"),
        };
        assert!(!err.is_recoverable());
        assert!(FlowError::NoActiveSession {
            handle: "tab-1".into()
        }
        .is_recoverable());
    }

    #[test]
    fn messages_name_the_subject() {
        let err = FlowError::EmptyText { field: "Intent" };
        assert_eq!(err.to_string(), "Intent text is required");
    }
}
