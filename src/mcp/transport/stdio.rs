use super::{McpTransport, PendingRequests};
use crate::core::config::data::{ServerDescriptor, TransportKind};
use crate::core::errors::TransportError;
use crate::mcp::protocol::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::debug;

const STDIN_LOCK_TIMEOUT: Duration = Duration::from_secs(10);
const STDIN_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Newline-delimited JSON-RPC over a child process's stdin/stdout.
pub struct StdioTransport {
    server_name: String,
    writer: Mutex<BoxedWriter>,
    pending: PendingRequests,
    closed: Arc<AtomicBool>,
    child: Mutex<Option<Child>>,
    reader_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl StdioTransport {
    /// Spawns the configured command with piped stdio.
    pub fn spawn(descriptor: &ServerDescriptor) -> Result<Arc<Self>, TransportError> {
        debug!(
            server = %descriptor.name,
            command = %descriptor.command,
            args = ?descriptor.args,
            "Starting stdio tool server"
        );
        let mut cmd = Command::new(&descriptor.command);
        cmd.args(&descriptor.args)
            .envs(&descriptor.env)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn()?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| TransportError::Io("Unable to retrieve stdin.".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TransportError::Io("Unable to retrieve stdout.".to_string()))?;
        if let Some(stderr) = child.stderr.take() {
            Self::spawn_stderr_drain(descriptor.name.clone(), stderr);
        }

        Ok(Self::build(descriptor.name.clone(), stdout, stdin, Some(child)))
    }

    /// Wires an already-open duplex pair; used for spawned children and for
    /// in-process servers.
    pub fn from_streams<R, W>(server_name: String, reader: R, writer: W) -> Arc<Self>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self::build(server_name, reader, writer, None)
    }

    fn build<R, W>(server_name: String, reader: R, writer: W, child: Option<Child>) -> Arc<Self>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let pending = PendingRequests::default();
        let closed = Arc::new(AtomicBool::new(false));
        let reader_task = Self::spawn_stdout_reader(
            server_name.clone(),
            reader,
            pending.clone(),
            closed.clone(),
        );

        Arc::new(Self {
            server_name,
            writer: Mutex::new(Box::new(writer)),
            pending,
            closed,
            child: Mutex::new(child),
            reader_task: std::sync::Mutex::new(Some(reader_task)),
        })
    }

    fn spawn_stdout_reader<R>(
        server_name: String,
        reader: R,
        pending: PendingRequests,
        closed: Arc<AtomicBool>,
    ) -> JoinHandle<()>
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        tokio::spawn(async move {
            let mut reader = BufReader::new(reader);
            let mut buf = Vec::new();
            loop {
                buf.clear();
                match reader.read_until(b'\n', &mut buf).await {
                    Ok(0) => break,
                    Ok(_) => {}
                    Err(err) => {
                        debug!(server = %server_name, error = %err, "Stdio read failed");
                        break;
                    }
                }
                let Ok(line) = std::str::from_utf8(&buf) else {
                    debug!(server = %server_name, "Skipping non-UTF-8 stdout line");
                    continue;
                };
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let value = match serde_json::from_str::<Value>(line) {
                    Ok(value) => value,
                    Err(_) => {
                        debug!(server = %server_name, "Ignoring non-JSON stdout line");
                        continue;
                    }
                };
                match value {
                    Value::Array(items) => {
                        for item in items {
                            Self::dispatch_message(&server_name, &pending, item);
                        }
                    }
                    other => Self::dispatch_message(&server_name, &pending, other),
                }
            }
            debug!(server = %server_name, "Stdio tool server closed its stdout");
            closed.store(true, Ordering::SeqCst);
            pending.fail_all(TransportError::Closed);
        })
    }

    fn spawn_stderr_drain(server_name: String, stderr: tokio::process::ChildStderr) {
        tokio::spawn(async move {
            let mut reader = BufReader::new(stderr);
            let mut buf = Vec::new();
            loop {
                buf.clear();
                match reader.read_until(b'\n', &mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {
                        let line = String::from_utf8_lossy(&buf);
                        debug!(server = %server_name, stderr = %line.trim_end(), "Tool server stderr");
                    }
                }
            }
        });
    }

    fn dispatch_message(server_name: &str, pending: &PendingRequests, message: Value) {
        match JsonRpcResponse::from_value(&message) {
            Some(response) => {
                let Some(key) = crate::mcp::protocol::id_key(&response.id) else {
                    return;
                };
                debug!(server = %server_name, response_id = %key, "Received stdio response");
                pending.settle(&key, response);
            }
            None => {
                let method = message
                    .get("method")
                    .and_then(Value::as_str)
                    .unwrap_or("<none>");
                debug!(server = %server_name, method = %method, "Ignoring server-initiated message");
            }
        }
    }

    async fn write_message<T: Serialize>(&self, message: &T) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let mut payload =
            serde_json::to_vec(message).map_err(|err| TransportError::Protocol(err.to_string()))?;
        payload.push(b'\n');

        let mut writer = tokio::time::timeout(STDIN_LOCK_TIMEOUT, self.writer.lock())
            .await
            .map_err(|_| TransportError::Io("Timed out waiting for stdin lock.".to_string()))?;
        debug!(server = %self.server_name, bytes = payload.len(), "Writing stdio message");
        tokio::time::timeout(STDIN_WRITE_TIMEOUT, writer.write_all(&payload))
            .await
            .map_err(|_| TransportError::Io("Timed out writing to stdin.".to_string()))??;
        tokio::time::timeout(STDIN_WRITE_TIMEOUT, writer.flush())
            .await
            .map_err(|_| TransportError::Io("Timed out flushing stdin.".to_string()))??;
        Ok(())
    }
}

#[async_trait]
impl McpTransport for StdioTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::LocalProcess
    }

    async fn request(
        &self,
        request: JsonRpcRequest,
        timeout: Duration,
    ) -> Result<JsonRpcResponse, TransportError> {
        let key = request
            .id_key()
            .ok_or_else(|| TransportError::Protocol("request id must be a string or number".into()))?;
        let call = self.pending.register(key);
        debug!(
            server = %self.server_name,
            request_id = %call.key(),
            method = %request.method,
            "Sending stdio request"
        );
        self.write_message(&request).await?;
        call.wait(timeout).await
    }

    async fn notify(&self, notification: JsonRpcNotification) -> Result<(), TransportError> {
        debug!(server = %self.server_name, method = %notification.method, "Sending stdio notification");
        self.write_message(&notification).await
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.pending.fail_all(TransportError::Closed);
        let _ = self.writer.lock().await.shutdown().await;
        if let Some(mut child) = self.child.lock().await.take() {
            if let Err(err) = child.kill().await {
                debug!(server = %self.server_name, error = %err, "Failed to kill tool server");
            }
        }
        let task = self
            .reader_task
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.abort();
        }
    }
}
