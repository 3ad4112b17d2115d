//! Error types for the firewall policy engine.
//!
//! Filter engine drivers report [`EngineError`]. Everything above the engine
//! returns [`PolicyError`], which collapses into a [`PolicyStatus`] at the
//! outer boundary.

use thiserror::Error;

use crate::types::PolicyStatus;

/// Failure reported by a [`FilterEngine`](crate::engine::FilterEngine) driver.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The transaction lock was not acquired within the lock timeout
    #[error("timed out waiting for the transaction lock")]
    LockTimeout,

    /// Operation requires an open session
    #[error("no open filter engine session")]
    SessionClosed,

    /// Session is already open
    #[error("filter engine session already open")]
    SessionOpen,

    /// Operation requires an active transaction
    #[error("no active transaction")]
    NoTransaction,

    /// `begin` called while this session already holds a transaction
    #[error("transaction already in progress")]
    TransactionActive,

    /// Filter, provider or sublayer rejected by the engine
    #[error("rejected by filter engine: {0}")]
    Rejected(String),

    /// Referenced object does not exist
    #[error("object not found: {0}")]
    NotFound(String),

    /// Commit failed; the transaction had no effect
    #[error("commit failed: {0}")]
    Commit(String),

    /// External command (e.g. `nft`) failed
    #[error("command `{program}` failed: {detail}")]
    Command { program: String, detail: String },

    /// I/O error while talking to the engine
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Error type for policy operations.
#[derive(Debug, Error)]
pub enum PolicyError {
    /// Caller-supplied parameters failed validation; nothing was touched
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Called before initialization or after deinitialization
    #[error("firewall is not initialized")]
    NotInitialized,

    /// Transaction lock not acquired in time; nothing was changed
    #[error("timed out waiting for the filter engine transaction lock")]
    LockTimeout,

    /// Engine rejected the update; the transaction was aborted
    #[error("filter engine failure: {0}")]
    Engine(EngineError),

    /// Configuration file could not be used
    #[error("configuration error: {0}")]
    Config(String),
}

impl PolicyError {
    /// Status code reported across the ABI boundary.
    pub fn status(&self) -> PolicyStatus {
        match self {
            PolicyError::LockTimeout => PolicyStatus::LockTimeout,
            _ => PolicyStatus::GeneralFailure,
        }
    }

    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        PolicyError::InvalidInput(msg.into())
    }
}

impl From<EngineError> for PolicyError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::LockTimeout => PolicyError::LockTimeout,
            other => PolicyError::Engine(other),
        }
    }
}

impl From<serde_json::Error> for PolicyError {
    fn from(e: serde_json::Error) -> Self {
        PolicyError::Config(e.to_string())
    }
}

/// Result type alias for policy operations.
pub type Result<T> = std::result::Result<T, PolicyError>;
