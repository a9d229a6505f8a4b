//! Typed error definitions for the execution engine.
//!
//! [`EngineError`] is the taxonomy every component reports through. Calls
//! wrapped by a [`CircuitBreaker`](crate::breaker::CircuitBreaker) fail with
//! [`BreakerError`] first and are mapped into [`EngineError`] at the call site.

use std::fmt;

use thiserror::Error;

/// Convenience alias used across the engine crates.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Why a dependency refused to run a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnavailableReason {
    /// The breaker is open and the reset timeout has not elapsed yet.
    CircuitOpen,
    /// The breaker's pending-call queue is at capacity.
    QueueFull,
}

impl fmt::Display for UnavailableReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CircuitOpen => write!(f, "circuit open"),
            Self::QueueFull => write!(f, "queue full"),
        }
    }
}

/// Domain-specific errors for the execution engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A breaker short-circuited the call. The work is postponed, not failed:
    /// callers retry once the breaker's cooldown has run out.
    #[error("dependency '{dependency}' unavailable: {reason}")]
    DependencyUnavailable {
        dependency: String,
        reason: UnavailableReason,
    },

    /// A broker or collaborator call failed; eligible for bounded retry.
    #[error("transient execution failure: {0}")]
    TransientExecution(String),

    /// Retries exhausted or a non-retryable rejection (e.g. approval denied).
    #[error("terminal execution failure: {0}")]
    TerminalExecution(String),

    /// The reconnect budget for a feed key was exhausted.
    #[error("feed '{key}' unreachable after {attempts} reconnect attempts")]
    FeedUnreachable { key: String, attempts: u32 },

    /// Malformed order or alert parameters, rejected before persisting.
    #[error("invalid spec: {0}")]
    InvalidSpec(String),

    /// Referenced order or alert does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Durable store read or write failure.
    #[error("store error: {0}")]
    Store(String),

    /// Configuration parsing or validation error.
    #[error("config error: {0}")]
    Config(String),
}

impl EngineError {
    /// Whether the scheduler's bounded retry applies to this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientExecution(_))
    }

    /// The breaker name when a breaker refused the call without running it.
    pub fn unavailable_dependency(&self) -> Option<&str> {
        match self {
            Self::DependencyUnavailable { dependency, .. } => Some(dependency),
            _ => None,
        }
    }
}

/// Failure of a call made through a circuit breaker.
#[derive(Debug, Error)]
pub enum BreakerError {
    /// Rejected without invoking the action: the breaker is open.
    #[error("circuit '{0}' is open")]
    Open(String),

    /// Rejected without invoking the action: too many calls pending.
    #[error("circuit '{0}' queue is full")]
    QueueFull(String),

    /// The action ran and failed; the original error is passed through.
    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

impl BreakerError {
    /// Whether the wrapped action was actually invoked.
    pub fn was_invoked(&self) -> bool {
        matches!(self, Self::Failed(_))
    }

    /// Convert into the engine taxonomy. Action failures become transient.
    pub fn into_engine(self) -> EngineError {
        match self {
            Self::Open(dependency) => EngineError::DependencyUnavailable {
                dependency,
                reason: UnavailableReason::CircuitOpen,
            },
            Self::QueueFull(dependency) => EngineError::DependencyUnavailable {
                dependency,
                reason: UnavailableReason::QueueFull,
            },
            Self::Failed(e) => EngineError::TransientExecution(format!("{e:#}")),
        }
    }
}

impl From<BreakerError> for EngineError {
    fn from(e: BreakerError) -> Self {
        e.into_engine()
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        Self::Store(e.to_string())
    }
}

impl From<std::io::Error> for EngineError {
    fn from(e: std::io::Error) -> Self {
        Self::Store(e.to_string())
    }
}
