//! MCP (Model Context Protocol) over stdio, both ends.
//!
//! The client side spawns a tool server as a child process and talks to it
//! through a [`Session`]; the server side exposes a [`ToolRegistry`] over its
//! own stdin/stdout.
//!
//! # Example
//!
//! ```no_run
//! use mcp::{Client, ClientInfo, ServerConfig};
//!
//! # async fn example() -> mcp::Result<()> {
//! let config = ServerConfig::new("weather", "skiff-weather");
//! let client = Client::connect(config, ClientInfo::new("skiff", "0.1.0")).await?;
//!
//! for tool in client.tools().await {
//!     println!("Tool: {}", tool.name);
//! }
//!
//! let mut args = serde_json::Map::new();
//! args.insert("state".into(), "CA".into());
//! let result = client.session().call_tool("get_alerts", Some(args)).await?;
//! println!("{}", result.text());
//!
//! client.shutdown().await?;
//! # Ok(())
//! # }
//! ```

mod client;
pub mod codec;
mod error;
mod protocol;
mod server;
mod session;
mod transport;

pub use client::Client;
pub use error::{Error, Result};
pub use protocol::{
    CallToolParams, CallToolResult, ClientCapabilities, ClientInfo, InitializeParams,
    InitializeResult, JSONRPC_VERSION, JsonRpcError, JsonRpcNotification, JsonRpcRequest,
    JsonRpcResponse, LATEST_PROTOCOL_VERSION, ListToolsResult, Message, RequestId,
    ResponsePayload, SUPPORTED_PROTOCOL_VERSIONS, ServerCapabilities, ServerInfo, Tool,
    ToolContent, ToolsCapability, error_codes,
};
pub use server::{Server, ToolFault, ToolRegistry};
pub use session::{DEFAULT_TIMEOUT, NotificationHandler, Session, SessionState};
pub use transport::{MAX_MESSAGE_SIZE, ServerConfig, StdioTransport};
