//! Error taxonomy for interpretation sessions.
//!
//! Component-local failures (one optional capture source, one malformed
//! audio chunk) are absorbed where they happen. Everything that reaches the
//! caller of [`crate::voice::SessionOrchestrator::start`] is a
//! [`SessionError`], always reported after a full teardown.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    // Lifecycle errors
    #[error("An interpretation session is already active")]
    AlreadyActive,

    #[error("Role cannot change while a session is {state}")]
    RoleLocked { state: String },

    #[error("Session start was cancelled by stop()")]
    Cancelled,

    // Capture errors
    #[error("Audio capture unavailable: {message}")]
    PermissionDenied { message: String },

    // Remote engine errors
    #[error("Interpretation engine handshake failed: {message}")]
    HandshakeFailure { message: String },

    #[error("Interpretation engine transport error: {message}")]
    Transport { message: String },

    // Audio payload errors
    #[error("Malformed audio chunk: {message}")]
    Codec { message: String },

    // Broadcast relay errors
    #[error("Broadcast relay error: {message}")]
    Relay { message: String },

    // Configuration errors
    #[error("Invalid configuration: {message}")]
    Config { message: String },
}

impl SessionError {
    /// Whether this error ends the session it occurred in.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::Codec { .. } | Self::RoleLocked { .. })
    }
}

pub type Result<T> = std::result::Result<T, SessionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_failure_display() {
        let error = SessionError::HandshakeFailure {
            message: "setupComplete timeout (15s)".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Interpretation engine handshake failed: setupComplete timeout (15s)"
        );
    }

    #[test]
    fn permission_denied_display() {
        let error = SessionError::PermissionDenied {
            message: "no capture source granted".to_string(),
        };
        assert!(error.to_string().contains("no capture source granted"));
    }

    #[test]
    fn codec_errors_are_not_fatal() {
        let error = SessionError::Codec {
            message: "odd byte count".to_string(),
        };
        assert!(!error.is_fatal());
        assert!(SessionError::Transport {
            message: "reset".into()
        }
        .is_fatal());
        assert!(SessionError::AlreadyActive.is_fatal());
    }
}
