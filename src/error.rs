//! Error types for runnel operations
//!
//! Errors fall into four families, and the retry/fallback combinators key off
//! that classification via [`Error::category`]:
//!
//! - **Work** errors are raised by the leaf runnable's own logic. They are the
//!   only errors the [`RunnableRetry`](crate::runnable::RunnableRetry) and
//!   [`RunnableWithFallbacks`](crate::runnable::RunnableWithFallbacks)
//!   combinators recover from.
//! - **Composition** errors are bookkeeping mistakes at a combinator boundary
//!   (mismatched batch/config lengths, an empty fallback list). Never retried.
//! - **Control** errors are cancellation and recursion-budget exhaustion. They
//!   are fatal and propagate through every combinator without re-attempts.
//! - **Protocol** errors are internal invariant violations in the v1/v2 event
//!   projectors. They indicate a bug in this crate, not a caller mistake.
//!
//! The original error is preserved end-to-end: no combinator re-wraps an error
//! it propagates, so callers can pattern-match on the variant that the failing
//! runnable produced.

use thiserror::Error;

/// Result type alias for runnel operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error category for systematic error handling
///
/// Use this instead of matching variants when deciding whether an error is
/// safe to retry or must abort the whole pipeline.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Raised by a runnable's own work function. Retryable by policy.
    Work,
    /// Raised by a combinator's bookkeeping (bad lengths, empty lists).
    Composition,
    /// Cancellation or recursion-budget exhaustion. Fatal, never retried.
    Control,
    /// Internal invariant violation in the event-stream projectors.
    Protocol,
}

/// Error type for all runnel operations
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum Error {
    /// Error raised by a runnable's work function.
    ///
    /// Leaf runnables produce these; combinators propagate them unchanged so
    /// retry/fallback policies can inspect the original message.
    #[error("{0}")]
    Work(String),

    /// Input validation error at a composition boundary.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Configuration error (bad combinator construction or config values).
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Serialization/deserialization error at the erased step boundary.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A callback handler failed and opted into raising.
    #[error("Callback error: {0}")]
    Callback(String),

    /// The call was cancelled via the config's cancellation token.
    ///
    /// Non-retryable: retry and fallback policies propagate this immediately.
    #[error("Operation cancelled")]
    Cancelled,

    /// The config's recursion budget was exhausted by nested dispatch.
    ///
    /// Non-retryable, and distinct from cancellation.
    #[error("Recursion limit reached when invoking nested runnables; raise recursion_limit if this composition is intentionally deep")]
    RecursionLimit,

    /// Internal consistency violation in the v1/v2 event projectors.
    #[error("Event protocol error: {0}")]
    Protocol(String),
}

impl Error {
    /// Create a work error from any displayable value.
    ///
    /// Non-error thrown values are normalized through this constructor at the
    /// outermost catch; everything else keeps its original variant.
    pub fn work(msg: impl Into<String>) -> Self {
        Error::Work(msg.into())
    }

    /// Classify this error for retry/fallback policy decisions.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::Work(_) | Error::Serialization(_) | Error::Callback(_) => ErrorCategory::Work,
            Error::InvalidInput(_) | Error::Configuration(_) => ErrorCategory::Composition,
            Error::Cancelled | Error::RecursionLimit => ErrorCategory::Control,
            Error::Protocol(_) => ErrorCategory::Protocol,
        }
    }

    /// Whether this is a control error (cancellation, recursion limit).
    ///
    /// Control errors abort retries and skip fallbacks.
    #[must_use]
    pub fn is_control(&self) -> bool {
        self.category() == ErrorCategory::Control
    }
}
