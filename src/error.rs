//! Error taxonomy shared across the pipeline and retrieval surfaces.
//!
//! Failures fall into distinct classes with different handling policies:
//! validation errors are rejected immediately, rate limits are retryable
//! with backoff, provider errors exhaust a retry budget and then flag the
//! affected chunk for manual retry, and storage/invariant errors are logged
//! and surfaced, never swallowed.

use std::time::Duration;

/// Crate-wide error type. Callers match on the variant to decide whether a
/// failure is retryable, user-caused, or requires investigation.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed query or parameters. Rejected immediately, never retried.
    #[error("validation error: {0}")]
    Validation(String),

    /// The embedding provider signalled a rate limit. Retryable with backoff.
    #[error("rate limited by embedding provider{}", match .retry_after {
        Some(d) => format!(" (retry after {}s)", d.as_secs()),
        None => String::new(),
    })]
    RateLimit {
        /// Provider-suggested delay, when the response carried one.
        retry_after: Option<Duration>,
    },

    /// The embedding call failed or returned unparseable data.
    #[error("embedding provider error: {0}")]
    Provider(String),

    /// Persistence failure from the underlying store.
    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    /// A data invariant was violated (e.g. a document reached index upsert
    /// with zero chunks). Excluded from automatic retry.
    #[error("invariant violated: {0}")]
    Invariant(String),

    /// An operation conflicts with current state (e.g. starting a run while
    /// one is active).
    #[error("conflict: {0}")]
    Conflict(String),
}

impl Error {
    /// Short stable code used in logs and the HTTP error envelope.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Validation(_) => "validation",
            Error::RateLimit { .. } => "rate_limited",
            Error::Provider(_) => "provider_error",
            Error::Storage(_) => "storage_error",
            Error::Invariant(_) => "invariant",
            Error::Conflict(_) => "conflict",
        }
    }

    /// Whether the caller may retry after a delay.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::RateLimit { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;
