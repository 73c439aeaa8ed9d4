//! Skiff runtime: model backends, tool hosts, and the orchestration loop.
//!
//! # Overview
//!
//! - **Session**: a conversation that sends queries to a model, runs the
//!   tools it asks for, and returns its final answer.
//! - **Backend**: a trait abstracting the reasoning engine (Anthropic, etc.).
//! - **ToolHost**: a trait abstracting where tools run; [`McpToolHost`]
//!   runs them on an MCP server child process.
//!
//! # Example
//!
//! ```no_run
//! use mcp::{ClientInfo, ServerConfig};
//! use runtime::{AnthropicBackend, McpToolHost, Session};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let backend = AnthropicBackend::builder("sk-ant-api01-...", "claude-sonnet-4-20250514").build();
//! let config = ServerConfig::new("weather", "skiff-weather");
//! let host = McpToolHost::connect(config, ClientInfo::new("skiff", "0.1.0")).await?;
//!
//! let mut session = Session::new(backend, host);
//! let answer = session.chat("Any weather alerts in CA?").await?;
//! println!("{answer}");
//!
//! session.end().shutdown().await?;
//! # Ok(())
//! # }
//! ```

mod error;
pub mod model;
pub mod providers;
mod session;
pub mod tools;

pub use error::{Error, Result};
pub use model::{
    Backend, Message, ModelError, ModelRequest, ModelResponse, Part, Role, ToolCall, ToolOutcome,
    ToolResult, ToolSpec, Usage,
};
pub use providers::AnthropicBackend;
pub use session::{DEFAULT_MAX_ROUNDS, Session};
pub use tools::{McpToolHost, ToolError, ToolHost};
