//! MCP error types.

use crate::protocol::JsonRpcError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// A line that is not a valid protocol envelope. Fatal to that message only.
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    #[error("message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },

    #[error("failed to spawn server '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// The peer went away; every pending and future call fails with this.
    #[error("connection to server lost")]
    ConnectionLost,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("session not initialized")]
    NotInitialized,

    #[error("session already initialized")]
    AlreadyInitialized,

    #[error("session closed")]
    Closed,

    #[error("unsupported protocol version: {0}")]
    UnsupportedProtocolVersion(String),

    #[error("timeout waiting for response")]
    Timeout,

    #[error("failed to serialize message: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("JSON-RPC error: {0}")]
    JsonRpc(#[from] JsonRpcError),

    #[error("unknown tool: {0}")]
    UnknownTool(String),

    #[error("invalid arguments for '{tool}': {reason}")]
    InvalidArguments { tool: String, reason: String },

    #[error("tool registered twice: {0}")]
    DuplicateTool(String),

    #[error("invalid input schema for '{tool}': {reason}")]
    InvalidSchema { tool: String, reason: String },
}

impl Error {
    /// Whether this error means the session can no longer carry calls.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::ConnectionLost | Self::Closed | Self::Io(_) | Self::Spawn { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
