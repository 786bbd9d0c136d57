//! Error types for BuildNet
//!
//! Each concern gets its own error enum so callers can tell transient
//! backend trouble apart from build failures and ledger tampering.
//! `BuildNetError` is the umbrella used at component boundaries and by
//! the HTTP layer.

use axum::http::StatusCode;
use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// State backend
// ============================================================================

/// Errors raised by a [`crate::state::StateBackend`].
///
/// A missing key is `Ok(None)`, never an error.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid key: {0}")]
    InvalidKey(String),
}

impl BackendError {
    /// Only connectivity failures are worth retrying
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

impl From<serde_json::Error> for BackendError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

// ============================================================================
// Ledger
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IntegrityErrorKind {
    ChainBreak,
    ChecksumMismatch,
    MissingEntry,
}

impl fmt::Display for IntegrityErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::ChainBreak => "CHAIN_BREAK",
            Self::ChecksumMismatch => "CHECKSUM_MISMATCH",
            Self::MissingEntry => "MISSING_ENTRY",
        };
        f.write_str(s)
    }
}

/// A break in the ledger hash chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind} at sequence {sequence_number}: {detail}")]
pub struct IntegrityError {
    pub kind: IntegrityErrorKind,
    pub sequence_number: u64,
    pub detail: String,
}

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("Unbalanced transaction {transaction_id}: debits {debits}, credits {credits}")]
    Unbalanced {
        transaction_id: String,
        debits: i64,
        credits: i64,
    },

    #[error("Timed out waiting for ledger lock after {0:?}")]
    LockTimeout(std::time::Duration),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

// ============================================================================
// Build failures
// ============================================================================

/// Adapter-reported build failure, normalized across tools
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildError {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column: Option<u32>,
}

impl BuildError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            file: None,
            line: None,
            column: None,
        }
    }

    pub fn at(mut self, file: impl Into<String>, line: Option<u32>, column: Option<u32>) -> Self {
        self.file = Some(file.into());
        self.line = line;
        self.column = column;
        self
    }
}

impl fmt::Display for BuildError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)?;
        if let Some(file) = &self.file {
            write!(f, " ({}", file)?;
            if let Some(line) = self.line {
                write!(f, ":{}", line)?;
                if let Some(col) = self.column {
                    write!(f, ":{}", col)?;
                }
            }
            write!(f, ")")?;
        }
        Ok(())
    }
}

impl std::error::Error for BuildError {}

// ============================================================================
// Umbrella
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum BuildNetError {
    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Integrity error: {0}")]
    Integrity(#[from] IntegrityError),

    #[error("Build error: {0}")]
    Build(#[from] BuildError),

    #[error("Claim lost: {0}")]
    ClaimLost(String),

    #[error("Heartbeat timeout: {0}")]
    HeartbeatTimeout(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Watch error: {0}")]
    Watch(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BuildNetError {
    /// Convert error to HTTP status code
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Backend(BackendError::Unavailable(_)) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Backend(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Ledger(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Integrity(_) => StatusCode::CONFLICT,
            Self::Build(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::ClaimLost(_) => StatusCode::CONFLICT,
            Self::HeartbeatTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Watch(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Serialization(_) => StatusCode::BAD_REQUEST,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<notify::Error> for BuildNetError {
    fn from(err: notify::Error) -> Self {
        Self::Watch(err.to_string())
    }
}

impl From<toml::de::Error> for BuildNetError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("Invalid TOML: {}", err))
    }
}

/// Result type alias for BuildNet operations
pub type Result<T> = std::result::Result<T, BuildNetError>;
