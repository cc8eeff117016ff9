//! Error taxonomy for the engine.
//!
//! Three layers: [`StoreError`] for the relational store, [`ProviderError`]
//! for outbound model-provider calls, and [`EngineError`] unifying both for
//! pipeline and API callers. Task-level failure codes that travel inside
//! `multivector-failed` payloads live in [`codes`].

use thiserror::Error;

/// Failure semantics of every store write.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),

    /// Unique or foreign-key violation.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Lock contention that survived the internal retry budget.
    #[error("store busy after {attempts} attempts")]
    Busy { attempts: u32 },

    /// Disk-level failure. Non-recoverable; triggers graceful shutdown.
    #[error("fatal store error: {0}")]
    Fatal(String),
}

impl StoreError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, StoreError::Fatal(_))
    }
}

/// Outcome of a capability-router invocation that did not succeed.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// No enabled model is assigned to the capability.
    #[error("no model assigned for capability '{capability}'")]
    ModelMissing { capability: &'static str },

    /// Provider returned a non-success status. 4xx is permanent, 5xx transient.
    #[error("provider http {status}: {message}")]
    Http { status: u16, message: String },

    #[error("provider rate limited")]
    RateLimited,

    /// Deadline expired. Always retryable.
    #[error("provider call timed out after {seconds}s")]
    Timeout { seconds: u64 },

    /// Response body did not match the expected shape.
    #[error("malformed provider response: {0}")]
    Malformed(String),

    #[error("provider transport error: {0}")]
    Transport(String),
}

impl ProviderError {
    /// Transient errors are retried with backoff; permanent ones short-circuit.
    pub fn is_retryable(&self) -> bool {
        match self {
            ProviderError::RateLimited | ProviderError::Timeout { .. } => true,
            ProviderError::Http { status, .. } => *status >= 500,
            ProviderError::Transport(_) => true,
            ProviderError::ModelMissing { .. } | ProviderError::Malformed(_) => false,
        }
    }
}

/// Unified engine error surfaced to the HTTP layer and pipelines.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("io error: {0}")]
    Io(String),

    /// Precondition failures with a stable reason code ("not_ready", ...).
    #[error("rejected: {reason}")]
    Rejected { reason: &'static str, detail: String },

    #[error("task failed: {code}")]
    Task { code: &'static str, detail: String },
}

impl From<std::io::Error> for EngineError {
    fn from(e: std::io::Error) -> Self {
        EngineError::Io(e.to_string())
    }
}

pub type StoreResult<T> = Result<T, StoreError>;
pub type EngineResult<T> = Result<T, EngineError>;

/// Stable failure codes carried in user-visible failure events.
pub mod codes {
    pub const CANCELLED: &str = "cancelled";
    pub const CAPABILITY_REASSIGNED: &str = "capability_reassigned";
    pub const MODEL_MISSING: &str = "model_missing";
    pub const MALFORMED_FILE: &str = "malformed_file";
    pub const UNSUPPORTED_FORMAT: &str = "unsupported_format";
    pub const RETRY_EXHAUSTED: &str = "retry_exhausted";
    pub const DEADLINE_EXCEEDED: &str = "deadline_exceeded";

    // Co-reading rejection reasons.
    pub const NOT_PINNED: &str = "not_pinned";
    pub const NOT_READY: &str = "not_ready";
    pub const WRONG_MODALITY: &str = "wrong_modality";
    pub const ALREADY_CO_READING: &str = "already_co_reading";
    pub const NOT_CO_READING: &str = "not_co_reading";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_errors_retryability() {
        assert!(ProviderError::Http { status: 503, message: String::new() }.is_retryable());
        assert!(!ProviderError::Http { status: 401, message: String::new() }.is_retryable());
        assert!(ProviderError::RateLimited.is_retryable());
        assert!(!ProviderError::ModelMissing { capability: "text" }.is_retryable());
    }

    #[test]
    fn fatal_is_flagged() {
        assert!(StoreError::Fatal("disk full".into()).is_fatal());
        assert!(!StoreError::Busy { attempts: 5 }.is_fatal());
    }
}
