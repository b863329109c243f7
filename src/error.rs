// src/error.rs
// Error types for the forwarding engine

use thiserror::Error;

/// Error taxonomy a `Transport` implementation must classify into
/// The worker's retry/failure policy branches on these kinds,
/// so new variants must not be added without updating that policy.
#[derive(Error, Debug, Clone)]
pub enum TransportError {
    #[error("flood wait: retry after {0}s")]
    FloodWait(u64),
    #[error("write permission denied on target")]
    WritePermissionDenied,
    #[error("entity not found")]
    NotFound,
    #[error("private chat, cannot resolve")]
    PrivateForbidden,
    #[error("session no longer authorized")]
    NotAuthorized,
    #[error("transient error: {0}")]
    Transient(String),
    #[error("unexpected error: {0}")]
    Unexpected(String),
}

pub type TransportResult<T> = Result<T, TransportError>;

/// Errors surfaced by the durable Progress Store.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("job not found: {0}")]
    JobNotFound(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Top-level engine error, used by the supervisor and worker once an
/// error has left its originating component's narrower type.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("job not found: {0}")]
    JobNotFound(String),
    #[error("account not found: {0}")]
    AccountNotFound(String),
    #[error("no eligible account for job")]
    NoEligibleAccount,
    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
