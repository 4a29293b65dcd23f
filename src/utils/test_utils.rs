//! In-process doubles for transports, executors, backends and SSE servers.

use crate::api::{AssistantReply, ChatToolDefinition, ModelBackend};
use crate::core::config::data::{ServerDescriptor, TransportKind};
use crate::core::errors::{BackendError, McpError, TransportError};
use crate::core::message::Message;
use crate::core::orchestrator::ToolExecutor;
use crate::mcp::demo::{error_result, text_result, DemoToolServer};
use crate::mcp::protocol::{
    JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, ToolDescriptor, METHOD_INITIALIZE,
    METHOD_TOOLS_CALL, METHOD_TOOLS_LIST,
};
use crate::mcp::transport::{McpTransport, PendingRequests, TransportConnector};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// How a [`MockTransport`] answers one request.
#[derive(Debug, Clone)]
pub enum MockReply {
    Result(Value),
    RpcError(i64, String),
    After(Duration, Value),
    /// Never answers; the caller's deadline decides.
    Silent,
    Fail(TransportError),
}

type MockHandler = Arc<dyn Fn(&JsonRpcRequest) -> MockReply + Send + Sync>;

pub struct MockTransport {
    handler: MockHandler,
    pending: PendingRequests,
    closed: AtomicBool,
    requests: Mutex<Vec<JsonRpcRequest>>,
    notifications: Mutex<Vec<String>>,
}

impl MockTransport {
    pub fn new(handler: impl Fn(&JsonRpcRequest) -> MockReply + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            handler: Arc::new(handler),
            pending: PendingRequests::default(),
            closed: AtomicBool::new(false),
            requests: Mutex::new(Vec::new()),
            notifications: Mutex::new(Vec::new()),
        })
    }

    /// Answers the handshake and `tools/list` for `tools`, and delegates
    /// `tools/call` to `on_call(name, arguments)`.
    pub fn tool_server(
        tools: &[&str],
        on_call: impl Fn(&str, &Value) -> MockReply + Send + Sync + 'static,
    ) -> Arc<Self> {
        let catalog: Vec<Value> = tools
            .iter()
            .map(|name| json!({"name": name, "description": format!("{name} tool")}))
            .collect();
        Self::new(move |request| match request.method.as_str() {
            METHOD_INITIALIZE => MockReply::Result(json!({
                "protocolVersion": "2024-11-05",
                "capabilities": {},
                "serverInfo": {"name": "mock", "version": "0.0.0"}
            })),
            METHOD_TOOLS_LIST => MockReply::Result(json!({ "tools": catalog })),
            METHOD_TOOLS_CALL => {
                let name = request.params["name"].as_str().unwrap_or_default();
                on_call(name, &request.params["arguments"])
            }
            other => MockReply::RpcError(-32601, format!("Method not found: {other}")),
        })
    }

    /// Every tool call answers with its own name as text.
    pub fn echo_server(tools: &[&str]) -> Arc<Self> {
        Self::tool_server(tools, |name, _| MockReply::Result(text_result(name)))
    }

    pub fn requests(&self) -> Vec<JsonRpcRequest> {
        self.requests.lock().expect("requests lock").clone()
    }

    pub fn notifications(&self) -> Vec<String> {
        self.notifications.lock().expect("notifications lock").clone()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

#[async_trait]
impl McpTransport for MockTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::LocalProcess
    }

    async fn request(
        &self,
        request: JsonRpcRequest,
        timeout: Duration,
    ) -> Result<JsonRpcResponse, TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        self.requests.lock().expect("requests lock").push(request.clone());
        let key = request
            .id_key()
            .ok_or_else(|| TransportError::Protocol("missing id".to_string()))?;
        let call = self.pending.register(key.clone());

        match (self.handler)(&request) {
            MockReply::Result(result) => {
                self.pending
                    .settle(&key, JsonRpcResponse::success(request.id.clone(), result));
            }
            MockReply::RpcError(code, message) => {
                self.pending
                    .settle(&key, JsonRpcResponse::failure(request.id.clone(), code, message));
            }
            MockReply::After(delay, result) => {
                let pending = self.pending.clone();
                let id = request.id.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    pending.settle(&key, JsonRpcResponse::success(id, result));
                });
            }
            MockReply::Silent => {}
            MockReply::Fail(err) => return Err(err),
        }
        call.wait(timeout).await
    }

    async fn notify(&self, notification: JsonRpcNotification) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        self.notifications
            .lock()
            .expect("notifications lock")
            .push(notification.method);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.pending.fail_all(TransportError::Closed);
    }
}

type TransportFactory = Arc<dyn Fn() -> Result<Arc<dyn McpTransport>, TransportError> + Send + Sync>;

/// Hands out a fresh mock transport per server name on every open, after an
/// optional per-server delay.
#[derive(Default)]
pub struct MockConnector {
    servers: HashMap<String, (Duration, TransportFactory)>,
    opened: Mutex<Vec<String>>,
}

impl MockConnector {
    pub fn with_server(
        mut self,
        name: &str,
        delay: Duration,
        factory: impl Fn() -> Arc<MockTransport> + Send + Sync + 'static,
    ) -> Self {
        let factory: TransportFactory = Arc::new(move || {
            let transport: Arc<dyn McpTransport> = factory();
            Ok(transport)
        });
        self.servers.insert(name.to_string(), (delay, factory));
        self
    }

    pub fn with_failing_server(mut self, name: &str, reason: &str) -> Self {
        let reason = reason.to_string();
        let factory: TransportFactory = Arc::new(move || Err(TransportError::Io(reason.clone())));
        self.servers
            .insert(name.to_string(), (Duration::ZERO, factory));
        self
    }

    pub fn opened(&self) -> Vec<String> {
        self.opened.lock().expect("opened lock").clone()
    }
}

#[async_trait]
impl TransportConnector for MockConnector {
    async fn open(
        &self,
        descriptor: &ServerDescriptor,
    ) -> Result<Arc<dyn McpTransport>, TransportError> {
        self.opened
            .lock()
            .expect("opened lock")
            .push(descriptor.name.clone());
        let Some((delay, factory)) = self.servers.get(&descriptor.name).cloned() else {
            return Err(TransportError::Io(format!(
                "no mock server named {}",
                descriptor.name
            )));
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        factory()
    }
}

pub fn stdio_descriptor(name: &str) -> ServerDescriptor {
    ServerDescriptor::local_process(name, "mock-server", Vec::new())
}

/// Per-tool scripted behavior for [`MockExecutor`].
#[derive(Debug, Clone)]
pub struct ScriptedTool {
    pub delay: Duration,
    pub result: Result<Value, String>,
}

#[derive(Default)]
pub struct MockExecutor {
    tools: HashMap<String, ScriptedTool>,
    completed: Mutex<Vec<String>>,
    calls: Mutex<Vec<(String, Value)>>,
}

impl MockExecutor {
    pub fn with_tool(mut self, name: &str, delay: Duration, result: Result<Value, String>) -> Self {
        self.tools
            .insert(name.to_string(), ScriptedTool { delay, result });
        self
    }

    /// Tool names in the order their executions finished.
    pub fn completed(&self) -> Vec<String> {
        self.completed.lock().expect("completed lock").clone()
    }

    pub fn calls(&self) -> Vec<(String, Value)> {
        self.calls.lock().expect("calls lock").clone()
    }
}

#[async_trait]
impl ToolExecutor for MockExecutor {
    async fn tool_catalog(&self) -> Vec<ToolDescriptor> {
        let mut names: Vec<&String> = self.tools.keys().collect();
        names.sort();
        names
            .into_iter()
            .map(|name| ToolDescriptor {
                name: name.clone(),
                description: format!("{name} tool"),
                input_schema: json!({"type": "object", "properties": {}}),
                server_name: "mock".to_string(),
            })
            .collect()
    }

    async fn execute_tool(&self, name: &str, arguments: Value) -> Result<Value, McpError> {
        self.calls
            .lock()
            .expect("calls lock")
            .push((name.to_string(), arguments));
        let Some(tool) = self.tools.get(name).cloned() else {
            return Err(McpError::ToolNotFound(name.to_string()));
        };
        if !tool.delay.is_zero() {
            tokio::time::sleep(tool.delay).await;
        }
        self.completed
            .lock()
            .expect("completed lock")
            .push(name.to_string());
        tool.result.map_err(|reason| McpError::ToolExecution {
            tool: name.to_string(),
            reason,
        })
    }
}

/// Replays scripted replies and records the history of every request.
#[derive(Default)]
pub struct MockBackend {
    replies: Mutex<VecDeque<Result<AssistantReply, BackendError>>>,
    requests: Mutex<Vec<Vec<Message>>>,
    tool_counts: Mutex<Vec<usize>>,
}

impl MockBackend {
    pub fn new(replies: Vec<AssistantReply>) -> Self {
        Self {
            replies: Mutex::new(replies.into_iter().map(Ok).collect()),
            ..Self::default()
        }
    }

    pub fn push_error(&self, error: BackendError) {
        self.replies.lock().expect("replies lock").push_back(Err(error));
    }

    pub fn requests(&self) -> Vec<Vec<Message>> {
        self.requests.lock().expect("requests lock").clone()
    }

    pub fn tool_counts(&self) -> Vec<usize> {
        self.tool_counts.lock().expect("tool counts lock").clone()
    }
}

#[async_trait]
impl ModelBackend for MockBackend {
    async fn complete(
        &self,
        messages: &[Message],
        tools: &[ChatToolDefinition],
    ) -> Result<AssistantReply, BackendError> {
        self.requests
            .lock()
            .expect("requests lock")
            .push(messages.to_vec());
        self.tool_counts
            .lock()
            .expect("tool counts lock")
            .push(tools.len());
        self.replies
            .lock()
            .expect("replies lock")
            .pop_front()
            .unwrap_or_else(|| Ok(AssistantReply::text("done")))
    }
}

pub fn clear_proxy_env() {
    std::env::remove_var("HTTP_PROXY");
    std::env::remove_var("http_proxy");
    std::env::remove_var("HTTPS_PROXY");
    std::env::remove_var("https_proxy");
    std::env::remove_var("ALL_PROXY");
    std::env::remove_var("all_proxy");
    std::env::set_var("NO_PROXY", "*");
    std::env::set_var("no_proxy", "*");
}

pub fn sse_frame(event: Option<&str>, data: &str) -> String {
    let mut frame = String::new();
    if let Some(event) = event {
        frame.push_str(&format!("event: {event}\n"));
    }
    for line in data.lines() {
        frame.push_str(&format!("data: {line}\n"));
    }
    frame.push('\n');
    frame
}

/// What a [`MockSseServer`] does with one POST.
#[derive(Debug, Clone)]
pub struct MockSseReply {
    pub status: u16,
    pub body: String,
    /// Frames pushed to every open event stream before the POST is answered.
    pub events: Vec<String>,
}

impl MockSseReply {
    pub fn accepted() -> Self {
        Self {
            status: 202,
            body: "Accept".to_string(),
            events: Vec::new(),
        }
    }

    pub fn json(value: Value) -> Self {
        Self {
            status: 200,
            body: value.to_string(),
            events: Vec::new(),
        }
    }

    pub fn status(status: u16, body: &str) -> Self {
        Self {
            status,
            body: body.to_string(),
            events: Vec::new(),
        }
    }

    pub fn with_event(mut self, frame: String) -> Self {
        self.events.push(frame);
        self
    }
}

#[derive(Debug, Clone)]
pub struct CapturedRequest {
    pub request_line: String,
    pub headers: Vec<(String, String)>,
    pub body: Value,
}

impl CapturedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn method(&self) -> Option<&str> {
        self.body.get("method").and_then(Value::as_str)
    }

    pub fn path(&self) -> &str {
        self.request_line.split_whitespace().nth(1).unwrap_or_default()
    }
}

type SseHandler = Arc<dyn Fn(&Value) -> MockSseReply + Send + Sync>;

/// Minimal SSE tool server: `GET /sse` opens an event stream that first
/// replays `intro` frames; POSTs go to `handler`, and any events it returns
/// are broadcast to open streams.
pub struct MockSseServer {
    addr: std::net::SocketAddr,
    captured: Arc<tokio::sync::Mutex<Vec<CapturedRequest>>>,
    events: broadcast::Sender<String>,
    task: JoinHandle<()>,
}

impl MockSseServer {
    pub async fn start(
        intro: Vec<String>,
        handler: impl Fn(&Value) -> MockSseReply + Send + Sync + 'static,
    ) -> Self {
        clear_proxy_env();
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("listener should bind");
        let addr = listener.local_addr().expect("local addr should resolve");
        let captured = Arc::new(tokio::sync::Mutex::new(Vec::new()));
        let (events, _) = broadcast::channel(64);
        let handler: SseHandler = Arc::new(handler);
        let intro = Arc::new(intro);

        let task = {
            let captured = Arc::clone(&captured);
            let events = events.clone();
            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    let captured = Arc::clone(&captured);
                    let events = events.clone();
                    let handler = Arc::clone(&handler);
                    let intro = Arc::clone(&intro);
                    tokio::spawn(async move {
                        let _ = serve_connection(stream, captured, events, handler, intro).await;
                    });
                }
            })
        };

        Self {
            addr,
            captured,
            events,
            task,
        }
    }

    /// Serves the demo arithmetic tools the way asynchronous SSE servers
    /// do: every POST is acknowledged with "Accept" and the JSON-RPC answer
    /// arrives on the event stream.
    pub async fn demo(tools: &[&str], session_id: &str) -> Self {
        let server = DemoToolServer::with_tools(tools);
        let intro = vec![
            sse_frame(Some("session"), session_id),
            sse_frame(Some("endpoint"), "/messages/"),
        ];
        Self::start(intro, move |body| {
            let mut reply = MockSseReply::accepted();
            if let Some(answer) = server.handle_message(body) {
                reply = reply.with_event(sse_frame(Some("message"), &answer.to_string()));
            }
            reply
        })
        .await
    }

    pub fn stream_url(&self) -> String {
        format!("http://{}/sse", self.addr)
    }

    pub fn descriptor(&self, name: &str) -> ServerDescriptor {
        ServerDescriptor::sse(name, self.stream_url())
    }

    pub fn push_event(&self, frame: String) {
        let _ = self.events.send(frame);
    }

    pub async fn captured(&self) -> Vec<CapturedRequest> {
        self.captured.lock().await.clone()
    }
}

impl Drop for MockSseServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve_connection(
    mut stream: TcpStream,
    captured: Arc<tokio::sync::Mutex<Vec<CapturedRequest>>>,
    events: broadcast::Sender<String>,
    handler: SseHandler,
    intro: Arc<Vec<String>>,
) -> Result<(), String> {
    let (request_line, headers, body) = read_http_request(&mut stream).await?;

    if request_line.starts_with("GET") {
        let mut rx = events.subscribe();
        let mut head = String::from(
            "HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\ncache-control: no-cache\r\n\r\n",
        );
        for frame in intro.iter() {
            head.push_str(frame);
        }
        stream
            .write_all(head.as_bytes())
            .await
            .map_err(|err| err.to_string())?;
        loop {
            match rx.recv().await {
                Ok(frame) => stream
                    .write_all(frame.as_bytes())
                    .await
                    .map_err(|err| err.to_string())?,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return Ok(()),
            }
        }
    }

    let body_json: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);
    captured.lock().await.push(CapturedRequest {
        request_line,
        headers,
        body: body_json.clone(),
    });
    let reply = handler(&body_json);
    for frame in reply.events {
        let _ = events.send(frame);
    }
    let content_type = if reply.body.trim_start().starts_with('{') {
        "application/json"
    } else {
        "text/plain"
    };
    let response = format!(
        "HTTP/1.1 {} Mock\r\ncontent-type: {}\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
        reply.status,
        content_type,
        reply.body.len(),
        reply.body
    );
    stream
        .write_all(response.as_bytes())
        .await
        .map_err(|err| err.to_string())?;
    let _ = stream.shutdown().await;
    Ok(())
}

pub async fn read_http_request(
    stream: &mut TcpStream,
) -> Result<(String, Vec<(String, String)>, Vec<u8>), String> {
    let mut buffer = Vec::new();
    let mut header_end = None;
    while header_end.is_none() {
        let mut chunk = [0_u8; 1024];
        let read = stream
            .read(&mut chunk)
            .await
            .map_err(|err| err.to_string())?;
        if read == 0 {
            return Err("Unexpected EOF while reading HTTP headers".to_string());
        }
        buffer.extend_from_slice(&chunk[..read]);
        header_end = buffer
            .windows(4)
            .position(|window| window == b"\r\n\r\n")
            .map(|index| index + 4);
    }

    let header_end = header_end.expect("header end should exist");
    let header_text =
        std::str::from_utf8(&buffer[..header_end]).map_err(|err| err.to_string())?;
    let mut lines = header_text.split("\r\n").filter(|line| !line.is_empty());
    let request_line = lines
        .next()
        .ok_or_else(|| "Missing HTTP request line".to_string())?
        .to_string();

    let mut headers = Vec::new();
    let mut content_length = 0_usize;
    for line in lines {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim().to_string();
        if name.eq_ignore_ascii_case("content-length") {
            content_length = value.parse::<usize>().map_err(|err| err.to_string())?;
        }
        headers.push((name.to_string(), value));
    }

    let mut body = buffer[header_end..].to_vec();
    while body.len() < content_length {
        let mut chunk = vec![0_u8; content_length - body.len()];
        let read = stream
            .read(&mut chunk)
            .await
            .map_err(|err| err.to_string())?;
        if read == 0 {
            return Err("Unexpected EOF while reading HTTP body".to_string());
        }
        body.extend_from_slice(&chunk[..read]);
    }
    body.truncate(content_length);

    Ok((request_line, headers, body))
}

/// Tool-call results that fail with `isError`, for error-path tests.
pub fn failing_result(text: &str) -> MockReply {
    MockReply::Result(error_result(text))
}
