//! Error taxonomy
//!
//! Transport and storage transience is recovered locally; domain rejections
//! (qualifier, risk gate, staleness) are structured records, not errors.

use thiserror::Error;

/// Failures of the pure AMM math. `InvalidInput` is a programmer error and
/// is logged at WARN by callers; `InsufficientLiquidity` discards the
/// candidate silently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MathError {
    #[error("invalid input: amounts and reserves must be positive")]
    InvalidInput,
    #[error("insufficient liquidity for requested output")]
    InsufficientLiquidity,
}

/// Transport-level failures from the RPC pool. Retried against the active
/// endpoint, then failed over to the next one.
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("rpc timeout after {0:?}")]
    Timeout(std::time::Duration),
    #[error("rpc connection refused or dropped: {0}")]
    Refused(String),
    #[error("malformed rpc response: {0}")]
    Malformed(String),
    /// All endpoints failed for one logical call.
    #[error("all {attempts} rpc attempts failed; last: {last}")]
    Exhausted { attempts: u32, last: String },
    #[error("endpoint has no websocket transport for subscriptions: {0}")]
    NoSubscriptionTransport(String),
}

/// Durable-store failures. Transient unavailability is buffered by the
/// orchestrator; only a sustained outage escalates to shutdown.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(#[from] rusqlite::Error),
    #[error("record not found: {0}")]
    NotFound(String),
}

/// Fatal configuration problems. Reported once at startup; exit code 1.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}
