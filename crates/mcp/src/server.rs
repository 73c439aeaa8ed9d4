//! Server side: tool registry and the stdio serve loop.

use std::any::Any;
use std::collections::BTreeMap;
use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::pin::Pin;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::codec;
use crate::error::{Error, Result};
use crate::protocol::{
    CallToolParams, CallToolResult, InitializeParams, InitializeResult, JsonRpcError,
    JsonRpcRequest, JsonRpcResponse, LATEST_PROTOCOL_VERSION, ListToolsResult, Message,
    SUPPORTED_PROTOCOL_VERSIONS, ServerCapabilities, ServerInfo, Tool, ToolContent,
    ToolsCapability, error_codes,
};
use crate::transport::read_line;

/// A failure raised by a tool implementation.
///
/// Reported to the caller as an `is_error` result, never as a protocol error.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct ToolFault(String);

impl ToolFault {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl From<String> for ToolFault {
    fn from(message: String) -> Self {
        Self(message)
    }
}

impl From<&str> for ToolFault {
    fn from(message: &str) -> Self {
        Self(message.to_string())
    }
}

type ToolFuture = Pin<Box<dyn Future<Output = std::result::Result<String, ToolFault>> + Send>>;
type Handler = Arc<dyn Fn(Map<String, Value>) -> ToolFuture + Send + Sync>;

struct Entry {
    tool: Tool,
    validator: jsonschema::Validator,
    handler: Handler,
}

/// Tools exposed by a server, keyed by name.
#[derive(Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Entry>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool with its input schema.
    ///
    /// Fails on a duplicate name or a schema that does not compile. Both are
    /// configuration errors meant to stop the server before it serves.
    pub fn register<F, Fut>(
        &mut self,
        name: impl Into<String>,
        description: impl Into<String>,
        schema: Value,
        handler: F,
    ) -> Result<()>
    where
        F: Fn(Map<String, Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<String, ToolFault>> + Send + 'static,
    {
        let name = name.into();
        if self.tools.contains_key(&name) {
            return Err(Error::DuplicateTool(name));
        }

        if !schema.is_object() {
            return Err(Error::InvalidSchema {
                tool: name,
                reason: "schema must be a JSON object".into(),
            });
        }
        let validator = jsonschema::validator_for(&schema).map_err(|e| Error::InvalidSchema {
            tool: name.clone(),
            reason: e.to_string(),
        })?;

        let description = description.into();
        let tool = Tool {
            name: name.clone(),
            description: (!description.is_empty()).then_some(description),
            input_schema: schema,
        };
        let handler: Handler = Arc::new(move |args| -> ToolFuture { Box::pin(handler(args)) });

        debug!(tool = %name, "registered tool");
        self.tools.insert(
            name,
            Entry {
                tool,
                validator,
                handler,
            },
        );
        Ok(())
    }

    /// Descriptors for every registered tool, sorted by name.
    pub fn describe(&self) -> Vec<Tool> {
        self.tools.values().map(|entry| entry.tool.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Validate arguments and run the tool.
    ///
    /// Errors are limited to `UnknownTool` and `InvalidArguments`. Whatever the
    /// implementation does, including panicking, ends up in the returned result.
    pub async fn dispatch(
        &self,
        name: &str,
        arguments: Option<Map<String, Value>>,
    ) -> Result<CallToolResult> {
        let entry = self
            .tools
            .get(name)
            .ok_or_else(|| Error::UnknownTool(name.to_string()))?;

        let arguments = arguments.unwrap_or_default();
        let instance = Value::Object(arguments.clone());
        let problems: Vec<String> = entry
            .validator
            .iter_errors(&instance)
            .map(|e| e.to_string())
            .collect();
        if !problems.is_empty() {
            return Err(Error::InvalidArguments {
                tool: name.to_string(),
                reason: problems.join("; "),
            });
        }

        let handler = entry.handler.clone();
        let future = match catch_unwind(AssertUnwindSafe(|| handler(arguments))) {
            Ok(future) => future,
            Err(panic) => return Ok(fault(name, &panic_message(panic.as_ref()))),
        };

        // A spawned task turns a panic into a JoinError instead of unwinding here.
        match tokio::spawn(future).await {
            Ok(Ok(text)) => Ok(CallToolResult::success(vec![ToolContent::text(text)])),
            Ok(Err(e)) => Ok(fault(name, &e.to_string())),
            Err(e) if e.is_panic() => Ok(fault(name, &panic_message(e.into_panic().as_ref()))),
            Err(e) => Ok(fault(name, &e.to_string())),
        }
    }
}

fn fault(tool: &str, message: &str) -> CallToolResult {
    warn!(%tool, error = %message, "tool failed");
    CallToolResult::error(format!("Error executing tool {tool}: {message}"))
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "tool panicked".to_string()
    }
}

/// An MCP server answering requests from one client over a line stream.
pub struct Server {
    info: ServerInfo,
    registry: Arc<ToolRegistry>,
}

impl Server {
    pub fn new(name: impl Into<String>, version: impl Into<String>, registry: ToolRegistry) -> Self {
        Self {
            info: ServerInfo {
                name: name.into(),
                version: Some(version.into()),
            },
            registry: Arc::new(registry),
        }
    }

    /// Serve on the process's stdin/stdout until the client hangs up.
    pub async fn serve_stdio(self) -> Result<()> {
        self.serve(tokio::io::stdin(), tokio::io::stdout()).await
    }

    /// Serve until `reader` reaches EOF.
    ///
    /// `tools/call` requests run concurrently; every other request is
    /// answered in arrival order.
    pub async fn serve<R, W>(self, reader: R, writer: W) -> Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        info!(server = %self.info.name, tools = self.registry.len(), "serving");

        let (tx, rx) = mpsc::unbounded_channel::<JsonRpcResponse>();
        let writer_task = tokio::spawn(write_loop(writer, rx));

        let mut reader = BufReader::new(reader);
        let mut calls = JoinSet::new();
        let mut initialized = false;

        loop {
            let buf = match read_line(&mut reader).await {
                Ok(Some(buf)) => buf,
                Ok(None) => break,
                Err(e @ (Error::MessageTooLarge { .. } | Error::MalformedMessage(_))) => {
                    warn!(error = %e, "dropping unreadable message");
                    continue;
                }
                Err(e) => return Err(e),
            };

            // Reap finished calls so the set stays small on long sessions.
            while calls.try_join_next().is_some() {}

            let Ok(line) = std::str::from_utf8(&buf) else {
                warn!("dropping non-UTF-8 message");
                continue;
            };
            if line.trim().is_empty() {
                continue;
            }

            let request = match codec::decode(line) {
                Ok(Message::Request(request)) => request,
                Ok(Message::Notification(notification)) => {
                    debug!(method = %notification.method, "notification");
                    continue;
                }
                Ok(Message::Response(response)) => {
                    debug!(id = %response.id, "ignoring response from client");
                    continue;
                }
                Err(e) => {
                    warn!(error = %e, "dropping malformed message");
                    continue;
                }
            };

            debug!(method = %request.method, id = %request.id, "request");

            if request.method == "tools/call" && initialized {
                let registry = self.registry.clone();
                let tx = tx.clone();
                calls.spawn(async move {
                    let response = call_tool(&registry, request).await;
                    let _ = tx.send(response);
                });
                continue;
            }

            let response = self.handle(request, &mut initialized);
            if tx.send(response).is_err() {
                break;
            }
        }

        while calls.join_next().await.is_some() {}
        drop(tx);
        let _ = writer_task.await;

        info!(server = %self.info.name, "client disconnected");
        Ok(())
    }

    fn handle(&self, request: JsonRpcRequest, initialized: &mut bool) -> JsonRpcResponse {
        let id = request.id.clone();
        let outcome = match request.method.as_str() {
            "initialize" if *initialized => Err(JsonRpcError::new(
                error_codes::INVALID_REQUEST,
                "already initialized",
            )),
            "initialize" => self.initialize(request.params).inspect(|_| *initialized = true),
            "ping" => Ok(Value::Object(Map::new())),
            "tools/list" | "tools/call" if !*initialized => Err(JsonRpcError::new(
                error_codes::INVALID_REQUEST,
                "server not initialized",
            )),
            "tools/list" => to_value(ListToolsResult {
                tools: self.registry.describe(),
            }),
            method => Err(JsonRpcError::method_not_found(method)),
        };

        match outcome {
            Ok(result) => JsonRpcResponse::success(id, result),
            Err(error) => JsonRpcResponse::failure(id, error),
        }
    }

    fn initialize(&self, params: Option<Value>) -> std::result::Result<Value, JsonRpcError> {
        let params: InitializeParams = parse_params(params)?;

        let protocol_version = if SUPPORTED_PROTOCOL_VERSIONS.contains(&params.protocol_version.as_str())
        {
            params.protocol_version
        } else {
            LATEST_PROTOCOL_VERSION.to_string()
        };

        info!(
            client = %params.client_info.name,
            version = %protocol_version,
            "client initialized"
        );

        to_value(InitializeResult {
            protocol_version,
            capabilities: ServerCapabilities {
                tools: Some(ToolsCapability::default()),
                ..Default::default()
            },
            server_info: self.info.clone(),
            instructions: None,
        })
    }
}

async fn call_tool(registry: &ToolRegistry, request: JsonRpcRequest) -> JsonRpcResponse {
    let params: CallToolParams = match parse_params(request.params) {
        Ok(params) => params,
        Err(error) => return JsonRpcResponse::failure(request.id, error),
    };

    let outcome = registry
        .dispatch(&params.name, params.arguments)
        .await
        .map_err(|e| match e {
            Error::UnknownTool(name) => {
                JsonRpcError::new(error_codes::UNKNOWN_TOOL, format!("unknown tool: {name}"))
            }
            Error::InvalidArguments { reason, .. } => JsonRpcError::invalid_params(reason),
            other => JsonRpcError::new(error_codes::INTERNAL_ERROR, other.to_string()),
        })
        .and_then(to_value);

    match outcome {
        Ok(result) => JsonRpcResponse::success(request.id, result),
        Err(error) => JsonRpcResponse::failure(request.id, error),
    }
}

async fn write_loop<W>(mut writer: W, mut rx: mpsc::UnboundedReceiver<JsonRpcResponse>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(response) = rx.recv().await {
        let line = match codec::encode(&response.into()) {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, "failed to encode response");
                continue;
            }
        };
        let written = async {
            writer.write_all(line.as_bytes()).await?;
            writer.flush().await
        }
        .await;
        if let Err(e) = written {
            warn!(error = %e, "failed to write response");
            break;
        }
    }
}

fn parse_params<T: DeserializeOwned>(params: Option<Value>) -> std::result::Result<T, JsonRpcError> {
    serde_json::from_value(params.unwrap_or_else(|| Value::Object(Map::new())))
        .map_err(|e| JsonRpcError::invalid_params(e.to_string()))
}

fn to_value(result: impl serde::Serialize) -> std::result::Result<Value, JsonRpcError> {
    serde_json::to_value(result)
        .map_err(|e| JsonRpcError::new(error_codes::INTERNAL_ERROR, e.to_string()))
}
