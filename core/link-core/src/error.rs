//! Error types for the lifecycle manager.
//! Recoverable failures are absorbed by recovery; these types exist so they can
//! be logged and surfaced with a consistent, human-readable reason.

use std::path::PathBuf;

use crate::state::ConnectionStatus;

// ═══════════════════════════════════════════════════════════════════════════════
// Backend Call Errors
// ═══════════════════════════════════════════════════════════════════════════════

/// Failure of a single backend call, as seen by the driver.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    #[error("bridge transport failed: {0}")]
    Transport(String),

    #[error("backend rejected {operation}: {message}")]
    Rejected { operation: String, message: String },

    #[error("backend call timed out after {secs}s")]
    Timeout { secs: u64 },

    #[error("backend call aborted: {0}")]
    Crashed(String),
}

impl BackendError {
    /// Transport hiccups, timeouts and crashes are worth retrying; an explicit
    /// rejection is an answer, not a hiccup.
    pub fn is_transient(&self) -> bool {
        !matches!(self, BackendError::Rejected { .. })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Lifecycle Errors
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    // ─────────────────────────────────────────────────────────────────────
    // Runtime taxonomy
    // ─────────────────────────────────────────────────────────────────────
    #[error("Transient backend failure: {0}")]
    TransientBackend(String),

    #[error("Authentication failed: {0}")]
    AuthFailure(String),

    #[error("Session drift detected: {0}")]
    SessionDrift(String),

    #[error("Session could not be recovered: {0}")]
    FatalSessionCorruption(String),

    #[error("Malformed push event: {0}")]
    MalformedEvent(String),

    #[error("Illegal transition {from} -> {to}")]
    IllegalTransition {
        from: ConnectionStatus,
        to: ConnectionStatus,
    },

    // ─────────────────────────────────────────────────────────────────────
    // Configuration
    // ─────────────────────────────────────────────────────────────────────
    #[error("Configuration read failed: {path}: {source}")]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Configuration malformed: {path}: {details}")]
    ConfigMalformed { path: PathBuf, details: String },

    #[error("Home directory not found")]
    HomeDirNotFound,

    #[error("Lifecycle driver has stopped")]
    DriverStopped,
}

impl From<BackendError> for LinkError {
    fn from(err: BackendError) -> Self {
        LinkError::TransientBackend(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, LinkError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejection_is_not_transient() {
        let err = BackendError::Rejected {
            operation: "connect".to_string(),
            message: "session locked".to_string(),
        };
        assert!(!err.is_transient());
        assert!(BackendError::Timeout { secs: 60 }.is_transient());
        assert!(BackendError::Transport("socket closed".to_string()).is_transient());
    }

    #[test]
    fn illegal_transition_renders_status_names() {
        let err = LinkError::IllegalTransition {
            from: ConnectionStatus::Disconnected,
            to: ConnectionStatus::Connected,
        };
        assert_eq!(err.to_string(), "Illegal transition disconnected -> connected");
    }
}
