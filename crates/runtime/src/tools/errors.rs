use thiserror::Error;

/// Errors that can occur during tool execution.
///
/// Only [`ToolError::Connection`] ends a query; everything else is reported
/// back to the model as a failed tool result.
#[derive(Debug, Clone, Error)]
pub enum ToolError {
    #[error("tool not found: {0}")]
    NotFound(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("timed out")]
    Timeout,
    #[error("execution failed: {0}")]
    Execution(String),
    #[error("tool server unavailable: {0}")]
    Connection(String),
}

impl ToolError {
    /// Whether the conversation can go on after this error.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Self::Connection(_))
    }
}

impl From<mcp::Error> for ToolError {
    fn from(err: mcp::Error) -> Self {
        match err {
            mcp::Error::UnknownTool(name) => Self::NotFound(name),
            mcp::Error::InvalidArguments { reason, .. } => Self::InvalidInput(reason),
            mcp::Error::Timeout => Self::Timeout,
            mcp::Error::JsonRpc(e) => Self::Execution(e.to_string()),
            mcp::Error::InvalidResponse(e) => Self::Execution(e),
            other => Self::Connection(other.to_string()),
        }
    }
}
