use crate::core::config::data::ServerDescriptor;
use crate::core::errors::{McpError, TransportError};
use crate::mcp::protocol::{
    call_tool_request, extract_tool_result, initialize_request, initialized_notification,
    list_tools_request, parse_initialize_result, parse_list_tools, JsonRpcNotification,
    JsonRpcRequest, ToolCallOutcome, ToolDescriptor, METHOD_INITIALIZE, METHOD_INITIALIZED,
    METHOD_NOT_FOUND, METHOD_TOOLS_LIST,
};
use crate::mcp::transport::{generate_call_id, DefaultConnector, McpTransport, TransportConnector};
use rust_mcp_schema::{InitializeResult, RequestId};
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

pub const TOOL_CALL_TIMEOUT: Duration = Duration::from_secs(30);
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    Connecting,
    HandshakeInitialize,
    HandshakeInitialized,
    Ready,
}

impl ClientState {
    pub fn as_str(self) -> &'static str {
        match self {
            ClientState::Disconnected => "disconnected",
            ClientState::Connecting => "connecting",
            ClientState::HandshakeInitialize => "initializing",
            ClientState::HandshakeInitialized => "initialized",
            ClientState::Ready => "ready",
        }
    }
}

impl fmt::Display for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time view of one client, for status listings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientStatus {
    pub state: ClientState,
    pub tool_count: usize,
    pub last_error: Option<String>,
    pub session_id: Option<String>,
}

struct ClientInner {
    state: ClientState,
    transport: Option<Arc<dyn McpTransport>>,
    tools: Vec<ToolDescriptor>,
    last_error: Option<String>,
    server_info: Option<InitializeResult>,
}

impl Default for ClientInner {
    fn default() -> Self {
        Self {
            state: ClientState::Disconnected,
            transport: None,
            tools: Vec::new(),
            last_error: None,
            server_info: None,
        }
    }
}

/// One tool server: its transport plus the handshake and tool catalog.
pub struct ToolClient {
    descriptor: ServerDescriptor,
    connector: Arc<dyn TransportConnector>,
    inner: RwLock<ClientInner>,
    connect_lock: Mutex<()>,
    next_request_id: AtomicI64,
    call_timeout: Duration,
}

impl ToolClient {
    pub fn new(descriptor: ServerDescriptor) -> Self {
        Self::with_connector(descriptor, Arc::new(DefaultConnector))
    }

    pub fn with_connector(
        descriptor: ServerDescriptor,
        connector: Arc<dyn TransportConnector>,
    ) -> Self {
        Self {
            descriptor,
            connector,
            inner: RwLock::new(ClientInner::default()),
            connect_lock: Mutex::new(()),
            next_request_id: AtomicI64::new(0),
            call_timeout: TOOL_CALL_TIMEOUT,
        }
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn descriptor(&self) -> &ServerDescriptor {
        &self.descriptor
    }

    pub async fn state(&self) -> ClientState {
        self.inner.read().await.state
    }

    pub async fn last_error(&self) -> Option<String> {
        self.inner.read().await.last_error.clone()
    }

    /// The `initialize` result, when the server sent a well-formed one.
    pub async fn server_info(&self) -> Option<InitializeResult> {
        self.inner.read().await.server_info.clone()
    }

    pub async fn status(&self) -> ClientStatus {
        let inner = self.inner.read().await;
        ClientStatus {
            state: inner.state,
            tool_count: inner.tools.len(),
            last_error: inner.last_error.clone(),
            session_id: inner
                .transport
                .as_ref()
                .and_then(|transport| transport.session_id()),
        }
    }

    /// Opens the transport and runs the handshake. Failures come back as a
    /// value and leave the client `Disconnected` with the reason recorded, so
    /// a later [`ToolClient::connect`] can retry.
    pub async fn connect(&self) -> Result<(), McpError> {
        let _guard = self.connect_lock.lock().await;
        self.release_transport().await;
        self.set_state(ClientState::Connecting).await;
        debug!(
            server = %self.descriptor.name,
            transport = %self.descriptor.transport,
            "Connecting to tool server"
        );

        let transport = match self.connector.open(&self.descriptor).await {
            Ok(transport) => transport,
            Err(err) => {
                let reason = match err {
                    TransportError::Timeout(seconds) => {
                        format!("no answer from server within {seconds}s")
                    }
                    other => other.to_string(),
                };
                let err = McpError::Connect {
                    server: self.descriptor.name.clone(),
                    reason,
                };
                return Err(self.record_failure(err).await);
            }
        };
        self.handshake(transport).await
    }

    /// Runs the handshake over an already-open transport.
    pub async fn connect_with(&self, transport: Arc<dyn McpTransport>) -> Result<(), McpError> {
        let _guard = self.connect_lock.lock().await;
        self.release_transport().await;
        self.handshake(transport).await
    }

    async fn handshake(&self, transport: Arc<dyn McpTransport>) -> Result<(), McpError> {
        {
            let mut inner = self.inner.write().await;
            inner.transport = Some(Arc::clone(&transport));
            inner.state = ClientState::HandshakeInitialize;
        }

        let sent = JsonRpcRequest::from_client(self.next_id(), initialize_request());
        let initialized = match sent {
            Ok(request) => transport.initialize(request, HANDSHAKE_TIMEOUT).await,
            Err(err) => Err(err),
        };
        let server_info = match initialized {
            Ok(result) => result.and_then(|result| self.read_server_info(result)),
            Err(err) => {
                let err = self.handshake_error(METHOD_INITIALIZE, err);
                return Err(self.abort_handshake(transport, err).await);
            }
        };
        self.set_state(ClientState::HandshakeInitialized).await;

        let notified = match JsonRpcNotification::from_client(initialized_notification()) {
            Ok(notification) => transport.notify(notification).await,
            Err(err) => Err(err),
        };
        if let Err(err) = notified {
            let err = self.handshake_error(METHOD_INITIALIZED, err);
            return Err(self.abort_handshake(transport, err).await);
        }

        let tools = match self.fetch_tools(transport.as_ref()).await {
            Ok(tools) => tools,
            Err(err) => return Err(self.abort_handshake(transport, err).await),
        };

        info!(
            server = %self.descriptor.name,
            tools = tools.len(),
            "Tool server ready"
        );
        let mut inner = self.inner.write().await;
        inner.state = ClientState::Ready;
        inner.tools = tools;
        inner.last_error = None;
        inner.server_info = server_info;
        Ok(())
    }

    /// A missing or odd `initialize` result is tolerated; it only means no
    /// server details are kept.
    fn read_server_info(&self, result: Value) -> Option<InitializeResult> {
        match parse_initialize_result(result) {
            Ok(info) => {
                debug!(
                    server = %self.descriptor.name,
                    server_name = %info.server_info.name,
                    protocol = %info.protocol_version,
                    "Server identified itself"
                );
                Some(info)
            }
            Err(reason) => {
                debug!(server = %self.descriptor.name, reason = %reason, "Unrecognized initialize result");
                None
            }
        }
    }

    async fn fetch_tools(&self, transport: &dyn McpTransport) -> Result<Vec<ToolDescriptor>, McpError> {
        let request = JsonRpcRequest::from_client(self.next_id(), list_tools_request())
            .map_err(|err| self.handshake_error(METHOD_TOOLS_LIST, err))?;
        let response = transport
            .request(request, HANDSHAKE_TIMEOUT)
            .await
            .map_err(|err| self.handshake_error(METHOD_TOOLS_LIST, err))?;
        match response.into_result() {
            Ok(result) => parse_list_tools(result, &self.descriptor.name).map_err(|reason| {
                McpError::Handshake {
                    server: self.descriptor.name.clone(),
                    reason: format!("malformed tools/list result: {reason}"),
                }
            }),
            Err(TransportError::Rpc { code, .. }) if code == METHOD_NOT_FOUND => {
                debug!(server = %self.descriptor.name, "Server does not list tools");
                Ok(Vec::new())
            }
            Err(err) => Err(self.handshake_error(METHOD_TOOLS_LIST, err)),
        }
    }

    fn handshake_error(&self, step: &str, err: TransportError) -> McpError {
        let server = self.descriptor.name.clone();
        match err {
            TransportError::Timeout(seconds) => McpError::Timeout {
                operation: format!("{step} on {server}"),
                seconds,
            },
            TransportError::Closed => McpError::Connect {
                server,
                reason: format!("server went away during {step}"),
            },
            other => McpError::Handshake {
                server,
                reason: format!("{step}: {other}"),
            },
        }
    }

    async fn abort_handshake(&self, transport: Arc<dyn McpTransport>, err: McpError) -> McpError {
        transport.close().await;
        self.record_failure(err).await
    }

    async fn record_failure(&self, err: McpError) -> McpError {
        let mut inner = self.inner.write().await;
        self.mark_failed(&mut inner, &err);
        err
    }

    /// Like [`Self::record_failure`], but only while `failed` is still the
    /// live transport. A reconnect may already have replaced it.
    async fn record_transport_failure(
        &self,
        failed: &Arc<dyn McpTransport>,
        err: McpError,
    ) -> McpError {
        let mut inner = self.inner.write().await;
        let live = inner
            .transport
            .as_ref()
            .is_some_and(|transport| Arc::ptr_eq(transport, failed));
        if live {
            self.mark_failed(&mut inner, &err);
        } else {
            debug!(server = %self.descriptor.name, error = %err, "Ignoring failure of a replaced transport");
        }
        err
    }

    fn mark_failed(&self, inner: &mut ClientInner, err: &McpError) {
        warn!(server = %self.descriptor.name, error = %err, "Tool server connection failed");
        inner.state = ClientState::Disconnected;
        inner.transport = None;
        inner.tools.clear();
        inner.last_error = Some(err.to_string());
    }

    /// Last successfully discovered catalog; empty until a connect succeeds.
    pub async fn list_tools(&self) -> Vec<ToolDescriptor> {
        self.inner.read().await.tools.clone()
    }

    /// Invokes `name` with a fresh call id, bounded by the call timeout.
    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, McpError> {
        let transport = self.ready_transport().await?;
        let call_id = generate_call_id();
        debug!(
            server = %self.descriptor.name,
            tool = %name,
            request_id = %call_id,
            "Calling tool"
        );
        let request = call_tool_request(name, arguments)
            .and_then(|request| {
                JsonRpcRequest::from_client(RequestId::String(call_id), request)
                    .map_err(|err| err.to_string())
            })
            .map_err(|reason| McpError::ToolExecution {
                tool: name.to_string(),
                reason,
            })?;

        let response = match transport.request(request, self.call_timeout).await {
            Ok(response) => response,
            Err(TransportError::Timeout(seconds)) => {
                return Err(McpError::Timeout {
                    operation: format!("tools/call {name}"),
                    seconds,
                })
            }
            Err(TransportError::Closed) => {
                let err = McpError::Connect {
                    server: self.descriptor.name.clone(),
                    reason: "connection closed".to_string(),
                };
                return Err(self.record_transport_failure(&transport, err).await);
            }
            Err(other) => {
                return Err(McpError::ToolExecution {
                    tool: name.to_string(),
                    reason: other.to_string(),
                })
            }
        };

        let result = response.into_result().map_err(|err| McpError::ToolExecution {
            tool: name.to_string(),
            reason: err.to_string(),
        })?;
        match extract_tool_result(result) {
            ToolCallOutcome::Success(value) => Ok(value),
            ToolCallOutcome::Failure(reason) => Err(McpError::ToolExecution {
                tool: name.to_string(),
                reason,
            }),
        }
    }

    async fn ready_transport(&self) -> Result<Arc<dyn McpTransport>, McpError> {
        let inner = self.inner.read().await;
        match (&inner.state, &inner.transport) {
            (ClientState::Ready, Some(transport)) if !transport.is_closed() => {
                Ok(Arc::clone(transport))
            }
            _ => Err(McpError::Connect {
                server: self.descriptor.name.clone(),
                reason: inner
                    .last_error
                    .clone()
                    .unwrap_or_else(|| "not connected".to_string()),
            }),
        }
    }

    /// Releases the transport. Later calls fail fast until reconnected.
    pub async fn close(&self) {
        self.release_transport().await;
        debug!(server = %self.descriptor.name, "Tool client closed");
    }

    async fn release_transport(&self) {
        let transport = {
            let mut inner = self.inner.write().await;
            inner.state = ClientState::Disconnected;
            inner.tools.clear();
            inner.transport.take()
        };
        if let Some(transport) = transport {
            transport.close().await;
        }
    }

    async fn set_state(&self, state: ClientState) {
        self.inner.write().await.state = state;
    }

    fn next_id(&self) -> RequestId {
        RequestId::Integer(self.next_request_id.fetch_add(1, Ordering::SeqCst))
    }
}
