//! Request/response session over a line transport.
//!
//! Outgoing requests get a fresh id and a pending slot; a single background
//! task reads every incoming line and routes it: responses to their slot by
//! id, notifications to the registered handler, server requests to a small
//! built-in responder. Responses may arrive in any order.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::codec;
use crate::error::{Error, Result};
use crate::protocol::{
    CallToolParams, CallToolResult, ClientInfo, InitializeParams, InitializeResult,
    JsonRpcError, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, ListToolsResult,
    Message, RequestId, SUPPORTED_PROTOCOL_VERSIONS, Tool, error_codes,
};
use crate::transport::StdioTransport;

/// Default timeout for a single request.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Callback for server notifications.
pub type NotificationHandler = Arc<dyn Fn(JsonRpcNotification) + Send + Sync>;

/// Session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    Initializing,
    Ready,
    Closed,
}

type Slot = oneshot::Sender<std::result::Result<Value, JsonRpcError>>;

#[derive(Default)]
struct Pending {
    slots: HashMap<RequestId, Slot>,
    lost: bool,
}

/// State shared with the receive task.
struct Shared {
    pending: Mutex<Pending>,
    handler: Mutex<Option<NotificationHandler>>,
}

impl Shared {
    /// Fail every pending call and refuse new ones.
    async fn fail_pending(&self) {
        let mut pending = self.pending.lock().await;
        pending.lost = true;
        let dropped = pending.slots.len();
        // Dropping the senders wakes each caller with ConnectionLost.
        pending.slots.clear();
        if dropped > 0 {
            debug!(dropped, "failed pending calls");
        }
    }

    async fn dispatch(&self, message: Message, transport: &StdioTransport) {
        match message {
            Message::Response(response) => {
                let slot = self.pending.lock().await.slots.remove(&response.id);
                match slot {
                    Some(slot) => {
                        // The caller may have timed out and gone away.
                        let _ = slot.send(response.into_result());
                    }
                    None => warn!(id = %response.id, "dropping response for unknown request"),
                }
            }
            Message::Notification(notification) => {
                let handler = self.handler.lock().await.clone();
                match handler {
                    Some(handler) => handler(notification),
                    None => debug!(method = %notification.method, "unhandled notification"),
                }
            }
            Message::Request(request) => {
                let response = match request.method.as_str() {
                    "ping" => JsonRpcResponse::success(request.id, Value::Object(Map::new())),
                    method => {
                        JsonRpcResponse::failure(request.id, JsonRpcError::method_not_found(method))
                    }
                };
                let sent = match codec::encode(&response.into()) {
                    Ok(line) => transport.send(&line).await,
                    Err(e) => Err(e),
                };
                if let Err(e) = sent {
                    warn!(error = %e, "failed to answer server request");
                }
            }
        }
    }
}

/// Removes a request's pending slot when the request ends.
///
/// A response that already arrived has taken the slot, so this is then a
/// no-op. Ids are never reused, so it cannot touch another request's slot.
struct SlotGuard {
    shared: Arc<Shared>,
    id: Option<RequestId>,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        let Some(id) = self.id.take() else {
            return;
        };
        if let Ok(mut pending) = self.shared.pending.try_lock() {
            pending.slots.remove(&id);
            return;
        }
        let shared = self.shared.clone();
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                shared.pending.lock().await.slots.remove(&id);
            });
        }
    }
}

async fn receive_loop(transport: Arc<StdioTransport>, shared: Arc<Shared>) {
    loop {
        match transport.receive().await {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                debug!(server = %transport.name(), %line, "recv");
                match codec::decode(&line) {
                    Ok(message) => shared.dispatch(message, &transport).await,
                    Err(e) => warn!(error = %e, "dropping malformed message"),
                }
            }
            Ok(None) => {
                debug!(server = %transport.name(), "server closed its output");
                break;
            }
            Err(e @ (Error::MalformedMessage(_) | Error::MessageTooLarge { .. })) => {
                warn!(error = %e, "dropping malformed message");
            }
            Err(e) => {
                warn!(error = %e, "receive failed");
                break;
            }
        }
    }

    shared.fail_pending().await;
}

/// A client-side MCP session.
pub struct Session {
    transport: Arc<StdioTransport>,
    shared: Arc<Shared>,
    state: Mutex<SessionState>,
    next_id: AtomicI64,
    receiver: Mutex<Option<JoinHandle<()>>>,
    timeout: Option<Duration>,
    server_info: Mutex<Option<InitializeResult>>,
    tools: Mutex<Vec<Tool>>,
}

impl Session {
    /// Start a session on the transport with the default request timeout.
    pub fn new(transport: StdioTransport) -> Self {
        Self::with_timeout(transport, Some(DEFAULT_TIMEOUT))
    }

    /// Start a session on the transport. Spawns the receive task.
    pub fn with_timeout(transport: StdioTransport, timeout: Option<Duration>) -> Self {
        let transport = Arc::new(transport);
        let shared = Arc::new(Shared {
            pending: Mutex::new(Pending::default()),
            handler: Mutex::new(None),
        });
        let receiver = tokio::spawn(receive_loop(transport.clone(), shared.clone()));

        Self {
            transport,
            shared,
            state: Mutex::new(SessionState::Uninitialized),
            next_id: AtomicI64::new(1),
            receiver: Mutex::new(Some(receiver)),
            timeout,
            server_info: Mutex::new(None),
            tools: Mutex::new(Vec::new()),
        }
    }

    /// Get the server name.
    pub fn name(&self) -> &str {
        self.transport.name()
    }

    pub async fn state(&self) -> SessionState {
        *self.state.lock().await
    }

    /// Route server notifications to `handler`.
    pub async fn set_notification_handler(
        &self,
        handler: impl Fn(JsonRpcNotification) + Send + Sync + 'static,
    ) {
        *self.shared.handler.lock().await = Some(Arc::new(handler));
    }

    /// Perform the handshake. Must be the first call, and only once.
    pub async fn initialize(&self, client_info: ClientInfo) -> Result<InitializeResult> {
        {
            let mut state = self.state.lock().await;
            match *state {
                SessionState::Uninitialized => *state = SessionState::Initializing,
                SessionState::Initializing | SessionState::Ready => {
                    return Err(Error::AlreadyInitialized);
                }
                SessionState::Closed => return Err(Error::Closed),
            }
        }

        let outcome = self.handshake(client_info).await;

        let mut state = self.state.lock().await;
        match outcome {
            Ok(result) => {
                if *state == SessionState::Initializing {
                    *state = SessionState::Ready;
                }
                *self.server_info.lock().await = Some(result.clone());
                Ok(result)
            }
            Err(e) => {
                if *state == SessionState::Initializing {
                    *state = SessionState::Uninitialized;
                }
                Err(e)
            }
        }
    }

    async fn handshake(&self, client_info: ClientInfo) -> Result<InitializeResult> {
        let params = InitializeParams::new(client_info);
        let result: InitializeResult = self.request("initialize", Some(params)).await?;

        if !SUPPORTED_PROTOCOL_VERSIONS.contains(&result.protocol_version.as_str()) {
            return Err(Error::UnsupportedProtocolVersion(result.protocol_version));
        }

        self.notify("notifications/initialized", None::<()>).await?;

        debug!(
            server = %result.server_info.name,
            version = %result.protocol_version,
            "session ready"
        );
        Ok(result)
    }

    /// Get server info (after initialization).
    pub async fn server_info(&self) -> Option<InitializeResult> {
        self.server_info.lock().await.clone()
    }

    /// Ask the server for its tools.
    pub async fn list_tools(&self) -> Result<Vec<Tool>> {
        self.require_ready().await?;
        let result: ListToolsResult = self.request("tools/list", None::<()>).await?;
        *self.tools.lock().await = result.tools.clone();
        Ok(result.tools)
    }

    /// Tools from the most recent `list_tools`.
    pub async fn tools(&self) -> Vec<Tool> {
        self.tools.lock().await.clone()
    }

    /// Call a tool by name.
    ///
    /// A tool that runs and fails returns `Ok` with `is_error` set. Unknown
    /// tools and rejected arguments are reported by the server.
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Option<Map<String, Value>>,
    ) -> Result<CallToolResult> {
        self.require_ready().await?;

        let params = CallToolParams {
            name: name.to_string(),
            arguments,
        };

        self.request("tools/call", Some(params))
            .await
            .map_err(|e| match e {
                Error::JsonRpc(err) if err.code == error_codes::UNKNOWN_TOOL => {
                    Error::UnknownTool(name.to_string())
                }
                Error::JsonRpc(err) if err.code == error_codes::INVALID_PARAMS => {
                    Error::InvalidArguments {
                        tool: name.to_string(),
                        reason: err.message,
                    }
                }
                other => other,
            })
    }

    /// Close the session: stop receiving, close the transport, fail pending calls.
    pub async fn close(&self) -> Result<()> {
        {
            let mut state = self.state.lock().await;
            if *state == SessionState::Closed {
                return Ok(());
            }
            *state = SessionState::Closed;
        }

        if let Some(receiver) = self.receiver.lock().await.take() {
            receiver.abort();
            let _ = receiver.await;
        }

        let closed = self.transport.close().await;
        self.shared.fail_pending().await;
        closed
    }

    // --- Internal methods ---

    async fn require_ready(&self) -> Result<()> {
        match *self.state.lock().await {
            SessionState::Ready => Ok(()),
            SessionState::Closed => Err(Error::Closed),
            SessionState::Uninitialized | SessionState::Initializing => {
                Err(Error::NotInitialized)
            }
        }
    }

    fn next_request_id(&self) -> RequestId {
        RequestId::Number(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    async fn request<P, R>(&self, method: &str, params: Option<P>) -> Result<R>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        let id = self.next_request_id();
        let request = JsonRpcRequest::new(id.clone(), method).with_params(params)?;
        let line = codec::encode(&request.into())?;

        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.shared.pending.lock().await;
            if pending.lost {
                return Err(Error::ConnectionLost);
            }
            pending.slots.insert(id.clone(), tx);
        }
        // Releases the slot on every exit, including the caller dropping us.
        let _slot = SlotGuard {
            shared: self.shared.clone(),
            id: Some(id.clone()),
        };

        debug!(server = %self.name(), %method, %id, "send");
        self.transport.send(&line).await?;

        let reply = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, rx)
                .await
                .map_err(|_| Error::Timeout)?,
            None => rx.await,
        };

        let value = reply.map_err(|_| Error::ConnectionLost)??;
        serde_json::from_value(value).map_err(|e| Error::InvalidResponse(format!("{method}: {e}")))
    }

    async fn notify<P>(&self, method: &str, params: Option<P>) -> Result<()>
    where
        P: Serialize,
    {
        let notification = JsonRpcNotification::new(method).with_params(params)?;
        let line = codec::encode(&notification.into())?;
        self.transport.send(&line).await
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        // The transport's child is killed on drop; the reader must not outlive us.
        if let Some(receiver) = self.receiver.get_mut().take() {
            receiver.abort();
        }
    }
}
