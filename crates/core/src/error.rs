//! Error types for the Parley domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each bounded context has its own error variant.

use thiserror::Error;

/// The top-level error type for all Parley operations.
#[derive(Debug, Error)]
pub enum Error {
    // --- Provider errors ---
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    // --- Tool errors ---
    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),

    // --- Bus errors ---
    #[error("Bus error: {0}")]
    Bus(#[from] BusError),

    // --- Session errors ---
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    // --- Agent protocol errors ---
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    // --- Configuration errors ---
    #[error("Configuration error: {message}")]
    Config { message: String },

    // --- Serialization ---
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // --- Budget ---
    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Cancelled")]
    Cancelled,

    // --- Generic ---
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether this error ends the agent loop gracefully instead of failing the task.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout(_))
    }
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

// --- Bounded context errors ---

#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("API request failed: {message} (status: {status_code})")]
    ApiError { status_code: u16, message: String },

    #[error("Rate limited by provider, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Stream interrupted: {0}")]
    StreamInterrupted(String),

    #[error("Provider not configured: {0}")]
    NotConfigured(String),

    #[error("Network error: {0}")]
    Network(String),
}

#[derive(Debug, Clone, Error)]
pub enum ToolError {
    #[error("Tool not found: {0}")]
    NotFound(String),

    #[error("Tool provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("Tool execution failed: {tool_name}: {reason}")]
    ExecutionFailed { tool_name: String, reason: String },

    #[error("RPC error from {provider}: {message}")]
    Rpc { provider: String, message: String },

    #[error("Tool provider {provider} timed out after {timeout_secs}s")]
    Timeout { provider: String, timeout_secs: u64 },
}

#[derive(Debug, Clone, Error)]
pub enum BusError {
    #[error("Bus connection failed: {0}")]
    Connection(String),

    #[error("Bus payload could not be encoded: {0}")]
    Serialization(String),

    #[error("Bus is closed")]
    Closed,
}

impl BusError {
    /// Whether a fresh connection could plausibly fix this error.
    pub fn is_connection(&self) -> bool {
        matches!(self, BusError::Connection(_))
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Session I/O failed for {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Session could not be encoded: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// A malformed `<action>` or `<communication>` body.
///
/// Always recovered by the agent loop; never fails a task.
#[derive(Debug, Clone, Error)]
pub enum ProtocolError {
    #[error("Invalid JSON in <{section}>: {reason}")]
    InvalidJson { section: String, reason: String },

    #[error("Missing field '{field}' in <{section}>")]
    MissingField { section: String, field: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_error_displays_correctly() {
        let err = Error::Provider(ProviderError::ApiError {
            status_code: 429,
            message: "Too many requests".into(),
        });
        assert!(err.to_string().contains("429"));
        assert!(err.to_string().contains("Too many requests"));
    }

    #[test]
    fn tool_error_displays_correctly() {
        let err = Error::Tool(ToolError::ExecutionFailed {
            tool_name: "echo".into(),
            reason: "boom".into(),
        });
        assert!(err.to_string().contains("echo"));
        assert!(err.to_string().contains("boom"));
    }

    #[test]
    fn timeout_is_graceful() {
        assert!(Error::Timeout("iteration 3".into()).is_timeout());
        assert!(!Error::Internal("x".into()).is_timeout());
    }

    #[test]
    fn only_connection_errors_are_retryable() {
        assert!(BusError::Connection("reset".into()).is_connection());
        assert!(!BusError::Closed.is_connection());
        assert!(!BusError::Serialization("bad".into()).is_connection());
    }
}
