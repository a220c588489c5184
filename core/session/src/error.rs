//! Error types for the session client.

use std::path::PathBuf;

use tandem_protocol::{ErrorCode, ErrorInfo};

use crate::capture::SourceKind;

// ═══════════════════════════════════════════════════════════════════════════════
// Deferred failures
// ═══════════════════════════════════════════════════════════════════════════════

/// What a [`crate::channel::Deferred`] fails with.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ChannelError {
    #[error("Connection to coordinator lost")]
    ConnectionLost,

    #[error("Request cancelled")]
    Cancelled,

    #[error("Coordinator rejected request: {0}")]
    Remote(ErrorInfo),

    #[error("Malformed reply: {0}")]
    Decode(String),

    #[error("Command could not be sent: {0}")]
    Encode(String),
}

impl ChannelError {
    /// Error code reported by the coordinator, if the failure came from it.
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            ChannelError::Remote(info) => Some(info.code),
            _ => None,
        }
    }

    pub fn is_version_conflict(&self) -> bool {
        self.code() == Some(ErrorCode::VersionConflict)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Session errors
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    // ─────────────────────────────────────────────────────────────────────
    // Transport
    // ─────────────────────────────────────────────────────────────────────
    #[error("Failed to connect to coordinator at {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Channel(#[from] ChannelError),

    // ─────────────────────────────────────────────────────────────────────
    // Capture
    // ─────────────────────────────────────────────────────────────────────
    #[error("Capture source {kind} failed to hook: {message}")]
    Hook { kind: SourceKind, message: String },

    // ─────────────────────────────────────────────────────────────────────
    // Persistence and configuration
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

    #[error("Configuration file malformed: {path}: {details}")]
    ConfigMalformed { path: PathBuf, details: String },

    #[error("Home directory not found")]
    NoHomeDir,
}

pub type Result<T> = std::result::Result<T, SessionError>;
