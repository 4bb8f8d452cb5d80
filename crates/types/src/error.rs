//! Unified error type for the clashgate workspace.

use thiserror::Error;

/// Enumerates all error kinds that can occur across clashgate crates.
///
/// Statuses reported by the upstream API are not errors: the proxy relays
/// them verbatim.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Configuration loading or validation error, including an empty
    /// credential pool. Fatal at startup.
    #[error("configuration error: {0}")]
    Config(String),

    /// No rate-limit token became available before the admission deadline.
    #[error("rate limited: aggregate key throughput exhausted")]
    RateLimited,

    /// DNS, connect or I/O failure talking to the upstream API.
    #[error("upstream transport error: {0}")]
    Transport(String),

    /// The upstream call exceeded its deadline.
    #[error("upstream request timed out")]
    Timeout,

    /// Developer-portal credential provisioning failure.
    #[error("portal error: {0}")]
    Portal(String),

    /// The inbound request could not be turned into an upstream request.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// JSON serialization or deserialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

// ── Feature-gated From impls ──────────────────────────────────────────────────

#[cfg(feature = "reqwest")]
impl From<reqwest::Error> for GatewayError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout
        } else {
            Self::Transport(e.to_string())
        }
    }
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, GatewayError>;
