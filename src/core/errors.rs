//! Error types shared across the tool-server layer.
//!
//! Transport failures stay inside [`TransportError`]; the tool client maps them
//! onto [`McpError`], which is the only error type the registry and the
//! orchestrator ever see.

use crate::core::config::io::ConfigError;
use thiserror::Error;

/// Failures surfaced by tool clients and the client registry.
#[derive(Debug, Error)]
pub enum McpError {
    /// Transport unreachable, spawn failure or dial timeout.
    #[error("Failed to connect to {server}: {reason}")]
    Connect { server: String, reason: String },

    /// The initialize/initialized negotiation was rejected or malformed.
    #[error("Handshake with {server} failed: {reason}")]
    Handshake { server: String, reason: String },

    #[error("No client found for tool: {0}")]
    ToolNotFound(String),

    /// The server reported an error or returned something unparseable.
    #[error("Tool {tool} failed: {reason}")]
    ToolExecution { tool: String, reason: String },

    #[error("{operation} timed out after {seconds}s")]
    Timeout { operation: String, seconds: u64 },

    /// Malformed server descriptor on add/update/delete.
    #[error("Invalid server configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Persist(#[from] ConfigError),
}

impl McpError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, McpError::Timeout { .. })
    }
}

/// Low-level failures of a single transport adapter.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("transport is closed")]
    Closed,

    #[error("no response within {0}s")]
    Timeout(u64),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("server error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("protocol error: {0}")]
    Protocol(String),
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        TransportError::Io(err.to_string())
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        TransportError::Http(err.to_string())
    }
}

/// Failures talking to the model backend.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("request to model backend failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("model backend returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("could not decode model response: {0}")]
    Decode(String),

    #[error("model backend returned no choices")]
    EmptyResponse,

    #[error("OPENAI_API_KEY is not set")]
    MissingApiKey,
}

/// Reasons a conversation turn stops without a final answer. The history is
/// always left reconciled.
#[derive(Debug, Error)]
pub enum ConversationError {
    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("model kept requesting tools after {0} rounds")]
    RoundLimit(usize),
}
