//! Shared transport abstractions.
//!
//! Both adapters correlate responses to requests through [`PendingRequests`],
//! so the exactly-once and cleanup guarantees live in one place.

use crate::core::config::data::{ServerDescriptor, TransportKind};
use crate::core::errors::TransportError;
use crate::mcp::protocol::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::debug;

pub mod sse;
pub mod stdio;

pub use sse::SseTransport;
pub use stdio::StdioTransport;

/// Dial bound for opening an SSE event stream.
pub const SSE_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[async_trait]
/// Wire contract shared by the local-process and SSE adapters.
pub trait McpTransport: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Sends the `initialize` request. Returns the server's result when it
    /// produced one; SSE servers may only acknowledge with a plain "Accept".
    async fn initialize(
        &self,
        request: JsonRpcRequest,
        timeout: Duration,
    ) -> Result<Option<Value>, TransportError> {
        self.request(request, timeout)
            .await?
            .into_result()
            .map(Some)
    }

    async fn request(
        &self,
        request: JsonRpcRequest,
        timeout: Duration,
    ) -> Result<JsonRpcResponse, TransportError>;

    async fn notify(&self, notification: JsonRpcNotification) -> Result<(), TransportError>;

    /// Session identifier currently in effect, if the transport has one.
    fn session_id(&self) -> Option<String> {
        None
    }

    fn is_closed(&self) -> bool;

    async fn close(&self);
}

/// Opens the wire transport for a descriptor. Tool clients go through this
/// seam so tests can substitute in-process servers.
#[async_trait]
pub trait TransportConnector: Send + Sync {
    async fn open(
        &self,
        descriptor: &ServerDescriptor,
    ) -> Result<Arc<dyn McpTransport>, TransportError>;
}

/// Spawns local processes and dials SSE servers.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultConnector;

#[async_trait]
impl TransportConnector for DefaultConnector {
    async fn open(
        &self,
        descriptor: &ServerDescriptor,
    ) -> Result<Arc<dyn McpTransport>, TransportError> {
        match descriptor.transport {
            TransportKind::LocalProcess => {
                let transport: Arc<dyn McpTransport> = StdioTransport::spawn(descriptor)?;
                Ok(transport)
            }
            TransportKind::Sse => {
                let transport: Arc<dyn McpTransport> = SseTransport::connect(descriptor).await?;
                Ok(transport)
            }
        }
    }
}

type Settlement = Result<JsonRpcResponse, TransportError>;

/// Outstanding requests keyed by normalized JSON-RPC id.
#[derive(Clone, Default)]
pub struct PendingRequests {
    inner: Arc<Mutex<HashMap<String, oneshot::Sender<Settlement>>>>,
}

impl PendingRequests {
    pub fn register(&self, key: String) -> PendingCall {
        let (tx, rx) = oneshot::channel();
        self.lock().insert(key.clone(), tx);
        PendingCall {
            key,
            rx,
            pending: self.clone(),
        }
    }

    /// Delivers a response to its waiter. Returns false when nobody is
    /// waiting, which includes a second delivery for an already settled id.
    pub fn settle(&self, key: &str, response: JsonRpcResponse) -> bool {
        let sender = self.lock().remove(key);
        match sender {
            Some(tx) => tx.send(Ok(response)).is_ok(),
            None => {
                debug!(request_id = %key, "Dropping response with no pending request");
                false
            }
        }
    }

    /// Fails every outstanding request, e.g. after the peer went away.
    pub fn fail_all(&self, error: TransportError) {
        let drained: Vec<_> = self.lock().drain().collect();
        for (_, tx) in drained {
            let _ = tx.send(Err(error.clone()));
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn remove(&self, key: &str) {
        self.lock().remove(key);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, oneshot::Sender<Settlement>>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Handle for one outstanding request; dropping it deregisters the id, so
/// every exit path (response, error, timeout, cancellation) cleans up.
pub struct PendingCall {
    key: String,
    rx: oneshot::Receiver<Settlement>,
    pending: PendingRequests,
}

impl PendingCall {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub async fn wait(mut self, timeout: Duration) -> Result<JsonRpcResponse, TransportError> {
        match tokio::time::timeout(timeout, &mut self.rx).await {
            Ok(Ok(settlement)) => settlement,
            Ok(Err(_)) => Err(TransportError::Closed),
            Err(_) => Err(TransportError::Timeout(timeout.as_secs())),
        }
    }
}

impl Drop for PendingCall {
    fn drop(&mut self) {
        self.pending.remove(&self.key);
    }
}

const BASE36: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

fn random_base36(len: usize) -> String {
    let mut bytes = vec![0_u8; len];
    if getrandom::fill(&mut bytes).is_err() {
        let nanos = chrono::Utc::now().timestamp_subsec_nanos();
        for (index, byte) in bytes.iter_mut().enumerate() {
            *byte = (nanos >> (index % 4 * 8)) as u8 ^ index as u8;
        }
    }
    bytes
        .into_iter()
        .map(|byte| BASE36[byte as usize % BASE36.len()] as char)
        .collect()
}

/// Caller-generated id for a tool call, unique per outstanding call.
pub fn generate_call_id() -> String {
    format!(
        "call_{}_{}",
        chrono::Utc::now().timestamp_millis(),
        random_base36(7)
    )
}

/// Temporary session id used until an SSE server announces its own.
pub fn generate_session_id(server_name: &str) -> String {
    format!(
        "session_{}_{}_{}",
        server_name,
        chrono::Utc::now().timestamp_millis(),
        random_base36(7)
    )
}
