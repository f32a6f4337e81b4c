use std::time::Duration;

use thiserror::Error;

use crate::domain::SequenceNr;

/// Failure reported by a worker for one call.
#[derive(Debug, Clone, Error)]
#[error("worker failed: {0}")]
pub struct WorkerError(pub String);

impl WorkerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Outcome errors of a call through the circuit breaker.
///
/// `Timeout` and `Failure` count against the breaker; `CircuitOpen` never
/// reached the worker and leaves the failure count alone.
#[derive(Debug, Clone, Error)]
pub enum CallError {
    #[error("call timed out after {after:?}")]
    Timeout { after: Duration },

    #[error("call failed: {0}")]
    Failure(String),

    #[error("circuit breaker is open for {component}")]
    CircuitOpen { component: String },

    #[error("call gate is no longer running")]
    GateClosed,
}

impl CallError {
    /// Does this outcome count as a breaker failure?
    pub fn is_breaker_failure(&self) -> bool {
        matches!(self, CallError::Timeout { .. } | CallError::Failure(_))
    }
}

/// Durable store errors.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("ledger i/o: {0}")]
    Io(#[from] std::io::Error),

    #[error("ledger entry encode: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("ledger corrupt at line {line}: {source}")]
    Corrupt {
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("ledger sequence went backwards at {found} (after {previous})")]
    OutOfOrder {
        previous: SequenceNr,
        found: SequenceNr,
    },

    #[error("ledger unavailable: {0}")]
    Unavailable(String),

    #[error("ledger background task failed: {0}")]
    Join(String),
}

/// Why a submission was not accepted. Both are surfaced to the submitter.
#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("backpressure: {pending} deliveries pending (limit {limit})")]
    BackpressureRejected { pending: usize, limit: usize },

    #[error("could not persist delivery: {0}")]
    PersistenceWriteFailure(#[source] LedgerError),

    #[error("dispatcher is no longer running")]
    DispatcherClosed,
}

/// Invalid configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config i/o: {0}")]
    Io(#[from] std::io::Error),

    #[error("config parse: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Umbrella error for wiring and the CLI.
#[derive(Debug, Error)]
pub enum CourierError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Build(#[from] crate::app::BuildError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Submit(#[from] SubmitError),

    #[error("{0}")]
    Other(String),
}
