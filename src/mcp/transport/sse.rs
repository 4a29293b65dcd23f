//! SSE event stream plus HTTP POST message endpoint.
//!
//! The server announces where to POST (and usually which session to use)
//! through out-of-band events on the stream; responses to POSTed requests
//! come back as `message` events correlated by id.

use super::{generate_session_id, McpTransport, PendingRequests, SSE_CONNECT_TIMEOUT};
use crate::core::config::data::{ServerDescriptor, TransportKind};
use crate::core::errors::TransportError;
use crate::mcp::protocol::{id_key, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};
use crate::utils::url::{query_param, resolve_endpoint_url, with_query_param};
use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Url;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub const SESSION_HEADER: &str = "X-Session-ID";
pub const SESSION_QUERY_PARAM: &str = "session_id";
const EVENT_STREAM_ACCEPT: &str = "text/event-stream";
const JSON_CONTENT_TYPE: &str = "application/json";

/// How long the handshake waits for an `endpoint` event before falling back
/// to posting at the stream URL.
pub const ENDPOINT_GRACE: Duration = Duration::from_secs(1);

/// How long an acknowledged `initialize` waits for its result to arrive on
/// the event stream before the handshake moves on without it.
const INITIALIZE_RESULT_GRACE: Duration = Duration::from_millis(500);

const HTTP_POOL_IDLE_TIMEOUT_SECONDS: u64 = 90;
const HTTP_POOL_MAX_IDLE_PER_HOST: usize = 8;

const SESSION_KEYS: [&str; 3] = ["session_id", "sessionId", "sessionID"];
const SESSION_QUERY_KEYS: [&str; 3] = ["session_id", "sessionId", "session"];
const ENDPOINT_KEYS: [&str; 3] = ["endpoint", "path", "messageEndpoint"];

/// Builds the HTTP client for SSE servers. No overall request timeout: the
/// event stream is long-lived, so POSTs set their own.
pub fn build_sse_http_client() -> Result<reqwest::Client, TransportError> {
    reqwest::Client::builder()
        .connect_timeout(SSE_CONNECT_TIMEOUT)
        .pool_idle_timeout(Duration::from_secs(HTTP_POOL_IDLE_TIMEOUT_SECONDS))
        .pool_max_idle_per_host(HTTP_POOL_MAX_IDLE_PER_HOST)
        .build()
        .map_err(TransportError::from)
}

pub fn is_event_stream_content_type(content_type: &str) -> bool {
    content_type
        .split(';')
        .next()
        .map(str::trim)
        .is_some_and(|value| value.eq_ignore_ascii_case(EVENT_STREAM_ACCEPT))
}

/// Splits a byte stream into lines, keeping blank lines because they
/// delimit events.
#[derive(Default)]
pub struct SseLineBuffer {
    buffer: Vec<u8>,
}

impl SseLineBuffer {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        let mut lines = Vec::new();
        let mut start = 0;

        while let Some(relative_pos) = self.buffer[start..].iter().position(|b| *b == b'\n') {
            let newline_index = start + relative_pos;
            let mut line_end = newline_index;
            if line_end > start && self.buffer[line_end - 1] == b'\r' {
                line_end -= 1;
            }
            lines.push(String::from_utf8_lossy(&self.buffer[start..line_end]).into_owned());
            start = newline_index + 1;
        }

        if start > 0 {
            self.buffer.drain(..start);
        }
        lines
    }

    /// Returns the unterminated tail, if any.
    pub fn finish(&mut self) -> Option<String> {
        if self.buffer.is_empty() {
            return None;
        }
        let tail = String::from_utf8_lossy(&self.buffer).trim_end_matches('\r').to_string();
        self.buffer.clear();
        Some(tail)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    /// Event name; `message` when the server sent none.
    pub event: String,
    pub data: String,
}

/// Incremental `event:`/`data:` frame decoder.
#[derive(Default)]
pub struct SseEventDecoder {
    lines: SseLineBuffer,
    event: Option<String>,
    data: Vec<String>,
}

impl SseEventDecoder {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        let mut events = Vec::new();
        for line in self.lines.push(chunk) {
            if let Some(event) = self.process_line(&line) {
                events.push(event);
            }
        }
        events
    }

    pub fn finish(&mut self) -> Vec<SseEvent> {
        let mut events = Vec::new();
        if let Some(line) = self.lines.finish() {
            if let Some(event) = self.process_line(&line) {
                events.push(event);
            }
        }
        if let Some(event) = self.dispatch() {
            events.push(event);
        }
        events
    }

    fn process_line(&mut self, line: &str) -> Option<SseEvent> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseEvent> {
        let event = self.event.take();
        if self.data.is_empty() {
            return None;
        }
        let data = std::mem::take(&mut self.data).join("\n");
        Some(SseEvent {
            event: event
                .filter(|name| !name.is_empty())
                .unwrap_or_else(|| "message".to_string()),
            data,
        })
    }
}

/// Normalized content of an `endpoint` event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EndpointInfo {
    pub path: Option<String>,
    pub session_id: Option<String>,
}

/// Accepts a bare path/URL or a JSON object with the path and/or session id
/// under any recognized key spelling.
pub fn normalize_endpoint(data: &str) -> EndpointInfo {
    let trimmed = data.trim();
    if trimmed.starts_with('{') {
        if let Ok(Value::Object(object)) = serde_json::from_str::<Value>(trimmed) {
            let pick = |keys: &[&str]| {
                keys.iter().find_map(|key| {
                    object
                        .get(*key)
                        .and_then(Value::as_str)
                        .map(str::trim)
                        .filter(|value| !value.is_empty())
                        .map(str::to_string)
                })
            };
            let path = pick(&ENDPOINT_KEYS);
            let session_id = pick(&SESSION_KEYS).or_else(|| {
                path.as_deref()
                    .and_then(|path| session_from_path(path))
            });
            return EndpointInfo { path, session_id };
        }
    }

    if trimmed.is_empty() {
        return EndpointInfo::default();
    }
    EndpointInfo {
        path: Some(trimmed.to_string()),
        session_id: session_from_path(trimmed),
    }
}

fn session_from_path(path: &str) -> Option<String> {
    if !path.contains('?') {
        return None;
    }
    let absolute = if path.starts_with("http://") || path.starts_with("https://") {
        path.to_string()
    } else {
        format!("http://endpoint.invalid/{}", path.trim_start_matches('/'))
    };
    let url = Url::parse(&absolute).ok()?;
    query_param(&url, &SESSION_QUERY_KEYS)
}

/// Session bookkeeping for one SSE server.
#[derive(Debug)]
struct SessionState {
    local_session: String,
    server_session: Option<String>,
}

impl SessionState {
    fn effective(&self) -> String {
        self.server_session
            .clone()
            .unwrap_or_else(|| self.local_session.clone())
    }
}

/// Events and the reader task share these with the transport.
#[derive(Clone)]
struct StreamShared {
    server_name: String,
    pending: PendingRequests,
    session: Arc<Mutex<SessionState>>,
    closed: Arc<AtomicBool>,
}

impl StreamShared {
    /// The first server-provided session id wins for the connection's life.
    fn observe_server_session(&self, session_id: &str) -> bool {
        let session_id = session_id.trim();
        if session_id.is_empty() {
            return false;
        }
        let mut session = self.session.lock().unwrap_or_else(PoisonError::into_inner);
        match &session.server_session {
            Some(existing) => {
                if existing != session_id {
                    debug!(
                        server = %self.server_name,
                        kept = %existing,
                        ignored = %session_id,
                        "Ignoring later session id"
                    );
                }
                false
            }
            None => {
                debug!(server = %self.server_name, session_id = %session_id, "Server assigned session id");
                session.server_session = Some(session_id.to_string());
                true
            }
        }
    }

    fn handle_event(&self, event: SseEvent, endpoint_tx: &watch::Sender<Option<String>>) {
        match event.event.as_str() {
            "endpoint" => {
                let info = normalize_endpoint(&event.data);
                debug!(server = %self.server_name, endpoint = ?info.path, "Received endpoint event");
                if let Some(session_id) = info.session_id.as_deref() {
                    self.observe_server_session(session_id);
                }
                if let Some(path) = info.path {
                    endpoint_tx.send_replace(Some(path));
                }
            }
            "session" | "session_id" | "sessionId" => {
                let info = normalize_endpoint(&event.data);
                let session_id = if event.data.trim().starts_with('{') {
                    info.session_id
                } else {
                    Some(event.data.trim().to_string())
                };
                if let Some(session_id) = session_id {
                    self.observe_server_session(&session_id);
                }
            }
            "message" => self.handle_message(&event.data),
            other => {
                debug!(server = %self.server_name, event = %other, "Ignoring SSE event");
            }
        }
    }

    fn handle_message(&self, data: &str) {
        let value = match serde_json::from_str::<Value>(data) {
            Ok(value) => value,
            Err(err) => {
                debug!(server = %self.server_name, error = %err, "Ignoring non-JSON SSE message");
                return;
            }
        };
        let items = match value {
            Value::Array(items) => items,
            other => vec![other],
        };
        for item in items {
            if let Some(session_id) = item.get("session_id").and_then(Value::as_str) {
                self.observe_server_session(session_id);
            }
            let Some(response) = JsonRpcResponse::from_value(&item) else {
                continue;
            };
            let Some(key) = id_key(&response.id) else {
                continue;
            };
            debug!(server = %self.server_name, response_id = %key, "Received SSE response");
            self.pending.settle(&key, response);
        }
    }
}

pub struct SseTransport {
    shared: StreamShared,
    stream_url: Url,
    http: reqwest::Client,
    endpoint_rx: watch::Receiver<Option<String>>,
    reader_task: Mutex<Option<JoinHandle<()>>>,
}

impl SseTransport {
    pub async fn connect(descriptor: &ServerDescriptor) -> Result<Arc<Self>, TransportError> {
        let http = build_sse_http_client()?;
        Self::connect_with_client(descriptor, http).await
    }

    /// Opens the event stream, bounded by [`SSE_CONNECT_TIMEOUT`].
    pub async fn connect_with_client(
        descriptor: &ServerDescriptor,
        http: reqwest::Client,
    ) -> Result<Arc<Self>, TransportError> {
        let stream_url = Url::parse(&descriptor.remote_url)
            .map_err(|err| TransportError::Protocol(format!("invalid url: {err}")))?;
        debug!(server = %descriptor.name, url = %stream_url, "Opening SSE stream");

        let request = http
            .get(stream_url.clone())
            .header(reqwest::header::ACCEPT, EVENT_STREAM_ACCEPT)
            .send();
        let response = tokio::time::timeout(SSE_CONNECT_TIMEOUT, request)
            .await
            .map_err(|_| TransportError::Timeout(SSE_CONNECT_TIMEOUT.as_secs()))??;

        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Http(format!(
                "event stream returned {status}"
            )));
        }
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("")
            .to_string();
        if !is_event_stream_content_type(&content_type) {
            return Err(TransportError::Protocol(format!(
                "expected text/event-stream, got {content_type:?}"
            )));
        }

        let shared = StreamShared {
            server_name: descriptor.name.clone(),
            pending: PendingRequests::default(),
            session: Arc::new(Mutex::new(SessionState {
                local_session: generate_session_id(&descriptor.name),
                server_session: None,
            })),
            closed: Arc::new(AtomicBool::new(false)),
        };
        let (endpoint_tx, endpoint_rx) = watch::channel(None);
        let reader_task = Self::spawn_stream_reader(shared.clone(), response, endpoint_tx);

        Ok(Arc::new(Self {
            shared,
            stream_url,
            http,
            endpoint_rx,
            reader_task: Mutex::new(Some(reader_task)),
        }))
    }

    fn spawn_stream_reader(
        shared: StreamShared,
        response: reqwest::Response,
        endpoint_tx: watch::Sender<Option<String>>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut stream = response.bytes_stream();
            let mut decoder = SseEventDecoder::default();
            while let Some(chunk) = stream.next().await {
                match chunk {
                    Ok(chunk) => {
                        for event in decoder.push(&chunk) {
                            shared.handle_event(event, &endpoint_tx);
                        }
                    }
                    Err(err) => {
                        warn!(server = %shared.server_name, error = %err, "SSE stream failed");
                        break;
                    }
                }
            }
            for event in decoder.finish() {
                shared.handle_event(event, &endpoint_tx);
            }
            debug!(server = %shared.server_name, "SSE stream ended");
            shared.closed.store(true, Ordering::SeqCst);
            shared.pending.fail_all(TransportError::Closed);
        })
    }

    pub fn server_session_id(&self) -> Option<String> {
        self.shared
            .session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .server_session
            .clone()
    }

    /// Number of calls still waiting for a response.
    pub fn pending_len(&self) -> usize {
        self.shared.pending.len()
    }

    pub fn endpoint_path(&self) -> Option<String> {
        self.endpoint_rx.borrow().clone()
    }

    fn effective_session(&self) -> String {
        self.shared
            .session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .effective()
    }

    /// Waits up to `grace` for the server to announce its message endpoint.
    pub async fn wait_for_endpoint(&self, grace: Duration) -> bool {
        let mut rx = self.endpoint_rx.clone();
        if rx.borrow().is_some() {
            return true;
        }
        let outcome = tokio::time::timeout(grace, rx.wait_for(|endpoint| endpoint.is_some())).await;
        matches!(outcome, Ok(Ok(_)))
    }

    /// Destination for POSTs: announced endpoint (or the stream URL) with the
    /// current session id as query parameter.
    pub fn message_url(&self, session_id: &str) -> Result<Url, TransportError> {
        let base = match self.endpoint_path() {
            Some(endpoint) => {
                resolve_endpoint_url(&self.stream_url, &endpoint).map_err(TransportError::Protocol)?
            }
            None => self.stream_url.clone(),
        };
        Ok(with_query_param(base, SESSION_QUERY_PARAM, session_id))
    }

    async fn post(&self, mut body: Value, timeout: Duration) -> Result<String, TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let session_id = self.effective_session();
        let url = self.message_url(&session_id)?;
        if let Value::Object(object) = &mut body {
            object.insert(
                SESSION_QUERY_PARAM.to_string(),
                Value::String(session_id.clone()),
            );
        }
        debug!(server = %self.shared.server_name, url = %url, "POSTing SSE message");

        let response = self
            .http
            .post(url)
            .timeout(timeout)
            .header(reqwest::header::CONTENT_TYPE, JSON_CONTENT_TYPE)
            .header(SESSION_HEADER, &session_id)
            .json(&body)
            .send()
            .await
            .map_err(|err| {
                if err.is_timeout() {
                    TransportError::Timeout(timeout.as_secs())
                } else {
                    TransportError::from(err)
                }
            })?;
        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(TransportError::Http(format!("{status}: {}", text.trim())));
        }
        Ok(text)
    }
}

fn inline_response(body: &str) -> Option<JsonRpcResponse> {
    let trimmed = body.trim();
    if !trimmed.starts_with('{') {
        return None;
    }
    serde_json::from_str::<Value>(trimmed)
        .ok()
        .and_then(|value| JsonRpcResponse::from_value(&value))
}

#[async_trait]
impl McpTransport for SseTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Sse
    }

    /// Success is any 2xx: a plain "Accept", a JSON acknowledgement, or a
    /// full JSON-RPC result. Only a JSON-RPC error is a rejection. The result
    /// may come inline or as a `message` event; whichever lands first wins.
    async fn initialize(
        &self,
        request: JsonRpcRequest,
        timeout: Duration,
    ) -> Result<Option<Value>, TransportError> {
        if !self.wait_for_endpoint(ENDPOINT_GRACE).await {
            debug!(
                server = %self.shared.server_name,
                "No endpoint announced; posting to the stream URL"
            );
        }
        let key = request
            .id_key()
            .ok_or_else(|| TransportError::Protocol("request id must be a string or number".into()))?;
        let started = Instant::now();
        let call = self.shared.pending.register(key.clone());
        let body = serde_json::to_value(&request)
            .map_err(|err| TransportError::Protocol(err.to_string()))?;
        let text = self.post(body, timeout).await?;

        let trimmed = text.trim();
        if !trimmed.is_empty() && !trimmed.eq_ignore_ascii_case("accept") {
            match serde_json::from_str::<Value>(trimmed) {
                Ok(value) => {
                    if let Some(session_id) = value.get("session_id").and_then(Value::as_str) {
                        self.shared.observe_server_session(session_id);
                    }
                    if let Some(response) = JsonRpcResponse::from_value(&value) {
                        self.shared.pending.settle(&key, response);
                    }
                }
                Err(_) => {
                    debug!(
                        server = %self.shared.server_name,
                        body = %trimmed,
                        "Non-JSON initialize acknowledgement"
                    );
                }
            }
        }

        let grace = INITIALIZE_RESULT_GRACE.min(timeout.saturating_sub(started.elapsed()));
        match call.wait(grace).await {
            Ok(response) => response.into_result().map(Some),
            Err(TransportError::Timeout(_)) => {
                debug!(server = %self.shared.server_name, "Initialize acknowledged without a result");
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    async fn request(
        &self,
        request: JsonRpcRequest,
        timeout: Duration,
    ) -> Result<JsonRpcResponse, TransportError> {
        let key = request
            .id_key()
            .ok_or_else(|| TransportError::Protocol("request id must be a string or number".into()))?;
        let started = Instant::now();
        let call = self.shared.pending.register(key.clone());
        let body = serde_json::to_value(&request)
            .map_err(|err| TransportError::Protocol(err.to_string()))?;

        let text = self.post(body, timeout).await?;
        if let Some(response) = inline_response(&text) {
            if id_key(&response.id).as_deref() == Some(key.as_str()) {
                self.shared.pending.settle(&key, response);
            }
        }

        let remaining = timeout.saturating_sub(started.elapsed());
        call.wait(remaining).await.map_err(|err| match err {
            TransportError::Timeout(_) => TransportError::Timeout(timeout.as_secs()),
            other => other,
        })
    }

    async fn notify(&self, notification: JsonRpcNotification) -> Result<(), TransportError> {
        let body = serde_json::to_value(&notification)
            .map_err(|err| TransportError::Protocol(err.to_string()))?;
        self.post(body, Duration::from_secs(30)).await.map(|_| ())
    }

    fn session_id(&self) -> Option<String> {
        Some(self.effective_session())
    }

    fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        let task = self
            .reader_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.abort();
        }
        self.shared.pending.fail_all(TransportError::Closed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_buffer_handles_chunk_boundaries_and_blank_lines() {
        let mut buffer = SseLineBuffer::default();
        assert_eq!(buffer.push(b"data: one\r\n\r\n"), vec!["data: one", ""]);
        assert!(buffer.push(b"data: t").is_empty());
        assert_eq!(buffer.push(b"wo\n"), vec!["data: two"]);
        assert_eq!(buffer.finish(), None);
    }

    #[test]
    fn decoder_assembles_named_and_default_events() {
        let mut decoder = SseEventDecoder::default();
        let events = decoder.push(
            b": keepalive\nevent: endpoint\ndata: /messages?session_id=abc\n\ndata: {\"id\":1}\n\n",
        );
        assert_eq!(
            events,
            vec![
                SseEvent {
                    event: "endpoint".to_string(),
                    data: "/messages?session_id=abc".to_string(),
                },
                SseEvent {
                    event: "message".to_string(),
                    data: "{\"id\":1}".to_string(),
                },
            ]
        );
    }

    #[test]
    fn decoder_joins_multiline_data_and_flushes_on_finish() {
        let mut decoder = SseEventDecoder::default();
        assert!(decoder.push(b"event: message\ndata: {\"a\":\ndata: 1}").is_empty());
        let events = decoder.finish();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "{\"a\":\n1}");
    }

    #[test]
    fn endpoint_bare_string_with_session_query() {
        assert_eq!(
            normalize_endpoint("/messages/?session_id=abc123"),
            EndpointInfo {
                path: Some("/messages/?session_id=abc123".to_string()),
                session_id: Some("abc123".to_string()),
            }
        );
        assert_eq!(
            normalize_endpoint("messages"),
            EndpointInfo {
                path: Some("messages".to_string()),
                session_id: None,
            }
        );
    }

    #[test]
    fn endpoint_json_variants_are_normalized() {
        let snake = normalize_endpoint(r#"{"endpoint": "/rpc", "session_id": "s1"}"#);
        assert_eq!(snake.path.as_deref(), Some("/rpc"));
        assert_eq!(snake.session_id.as_deref(), Some("s1"));

        let camel = normalize_endpoint(r#"{"path": "/rpc", "sessionId": "s2"}"#);
        assert_eq!(camel.path.as_deref(), Some("/rpc"));
        assert_eq!(camel.session_id.as_deref(), Some("s2"));

        let upper = normalize_endpoint(r#"{"sessionID": "s3"}"#);
        assert_eq!(upper.path, None);
        assert_eq!(upper.session_id.as_deref(), Some("s3"));

        let from_query = normalize_endpoint(r#"{"endpoint": "/rpc?sessionId=s4"}"#);
        assert_eq!(from_query.session_id.as_deref(), Some("s4"));
    }

    #[test]
    fn event_stream_content_type_parser_handles_parameters_and_case() {
        assert!(is_event_stream_content_type("text/event-stream"));
        assert!(is_event_stream_content_type(
            "Text/Event-Stream; charset=UTF-8"
        ));
        assert!(!is_event_stream_content_type("application/json"));
    }

    fn shared_for_test() -> StreamShared {
        StreamShared {
            server_name: "test".to_string(),
            pending: PendingRequests::default(),
            session: Arc::new(Mutex::new(SessionState {
                local_session: "session_test_local".to_string(),
                server_session: None,
            })),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    #[test]
    fn first_server_session_wins() {
        let shared = shared_for_test();
        let (endpoint_tx, endpoint_rx) = watch::channel(None);

        assert_eq!(
            shared.session.lock().expect("lock").effective(),
            "session_test_local"
        );

        shared.handle_event(
            SseEvent {
                event: "session".to_string(),
                data: "server-1".to_string(),
            },
            &endpoint_tx,
        );
        shared.handle_event(
            SseEvent {
                event: "endpoint".to_string(),
                data: r#"{"endpoint": "/messages", "sessionId": "server-2"}"#.to_string(),
            },
            &endpoint_tx,
        );

        assert_eq!(shared.session.lock().expect("lock").effective(), "server-1");
        assert_eq!(endpoint_rx.borrow().as_deref(), Some("/messages"));
    }

    #[tokio::test]
    async fn duplicate_message_events_settle_once() {
        let shared = shared_for_test();
        let (endpoint_tx, _endpoint_rx) = watch::channel(None);
        let call = shared.pending.register("call_1".to_string());

        for value in [1, 2] {
            shared.handle_event(
                SseEvent {
                    event: "message".to_string(),
                    data: format!(r#"{{"jsonrpc":"2.0","id":"call_1","result":{{"v":{value}}}}}"#),
                },
                &endpoint_tx,
            );
        }

        let response = call
            .wait(Duration::from_secs(1))
            .await
            .expect("first event settles the call");
        assert_eq!(response.result, Some(serde_json::json!({"v": 1})));
        assert!(shared.pending.is_empty());
    }
}
