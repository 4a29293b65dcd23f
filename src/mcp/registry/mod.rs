//! Live set of tool clients keyed by server name, plus the tool-name index
//! used to route calls.
//!
//! Structural changes (add/update/delete/refresh) are expected from a single
//! caller at a time. Lookups and tool execution may run concurrently with
//! them: map entries are replaced whole, never mutated in place.

use crate::core::config::data::{Config, ServerDescriptor, TransportKind};
use crate::core::config::store::ConfigStore;
use crate::core::errors::McpError;
use crate::core::orchestrator::ToolExecutor;
use crate::mcp::client::{ClientState, ToolClient};
use crate::mcp::protocol::ToolDescriptor;
use crate::mcp::transport::{DefaultConnector, TransportConnector};
use async_trait::async_trait;
use futures_util::future::join_all;
use futures_util::{stream, StreamExt};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tracing::{debug, info, warn};

pub const MCP_STARTUP_CONCURRENCY_LIMIT: usize = 3;
const CLIENT_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

type ClientMap = HashMap<String, Arc<ToolClient>>;

/// Row of [`ClientRegistry::list_servers`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerStatus {
    pub name: String,
    pub transport: TransportKind,
    pub state: ClientState,
    pub tool_count: usize,
    pub last_error: Option<String>,
    pub session_id: Option<String>,
}

/// Outcome of connecting every configured server.
#[derive(Debug, Default)]
pub struct InitializeReport {
    pub connected: Vec<String>,
    pub failed: Vec<(String, McpError)>,
}

pub struct ClientRegistry {
    clients: RwLock<ClientMap>,
    tool_index: RwLock<ClientMap>,
    store: Option<ConfigStore>,
    connector: Arc<dyn TransportConnector>,
    call_timeout: Option<Duration>,
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientRegistry {
    /// In-memory registry; add/update/delete are not persisted.
    pub fn new() -> Self {
        Self {
            clients: RwLock::new(HashMap::new()),
            tool_index: RwLock::new(HashMap::new()),
            store: None,
            connector: Arc::new(DefaultConnector),
            call_timeout: None,
        }
    }

    /// Registry whose structural changes are written back to `path`.
    pub fn with_persistence(path: PathBuf) -> Self {
        Self {
            store: Some(ConfigStore::new(path)),
            ..Self::new()
        }
    }

    pub fn with_connector(mut self, connector: Arc<dyn TransportConnector>) -> Self {
        self.connector = connector;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = Some(timeout);
        self
    }

    pub fn config_path(&self) -> Option<&Path> {
        self.store.as_ref().map(ConfigStore::path)
    }

    fn new_client(&self, descriptor: ServerDescriptor) -> Arc<ToolClient> {
        let client = ToolClient::with_connector(descriptor, Arc::clone(&self.connector));
        let client = match self.call_timeout {
            Some(timeout) => client.with_call_timeout(timeout),
            None => client,
        };
        Arc::new(client)
    }

    fn clients(&self) -> RwLockReadGuard<'_, ClientMap> {
        self.clients.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn clients_mut(&self) -> RwLockWriteGuard<'_, ClientMap> {
        self.clients.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn index(&self) -> RwLockReadGuard<'_, ClientMap> {
        self.tool_index.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn index_mut(&self) -> RwLockWriteGuard<'_, ClientMap> {
        self.tool_index.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn snapshot(&self) -> Vec<Arc<ToolClient>> {
        self.clients().values().cloned().collect()
    }

    /// Registers and connects every valid entry of `config`. Servers connect
    /// concurrently; each catalog is merged as soon as its server is ready,
    /// so on a name collision the server that finished last wins.
    pub async fn initialize_from_config(&self, config: &Config) -> InitializeReport {
        let (descriptors, invalid) = config.server_descriptors();
        let mut report = InitializeReport::default();
        for (name, err) in invalid {
            warn!(server = %name, error = %err, "Skipping invalid server entry");
            report.failed.push((name, err));
        }

        let clients: Vec<Arc<ToolClient>> = descriptors
            .into_iter()
            .map(|descriptor| {
                let client = self.new_client(descriptor);
                self.clients_mut()
                    .insert(client.name().to_string(), Arc::clone(&client));
                client
            })
            .collect();

        let mut outcomes = stream::iter(clients)
            .map(|client| async move {
                let outcome = client.connect().await;
                (client, outcome)
            })
            .buffer_unordered(MCP_STARTUP_CONCURRENCY_LIMIT);

        while let Some((client, outcome)) = outcomes.next().await {
            match outcome {
                Ok(()) => {
                    self.merge_tools(&client).await;
                    report.connected.push(client.name().to_string());
                }
                Err(err) => report.failed.push((client.name().to_string(), err)),
            }
        }

        info!(
            connected = report.connected.len(),
            failed = report.failed.len(),
            "Tool servers initialized"
        );
        report
    }

    /// Loads the config file (the registry's own file when persistence is
    /// enabled) and initializes from it.
    pub async fn initialize_from_path(&self, path: &Path) -> Result<InitializeReport, McpError> {
        let config = match &self.store {
            Some(store) if store.path() == path => store.load_with_cache()?,
            _ => Config::load_from_path(path)?,
        };
        Ok(self.initialize_from_config(&config).await)
    }

    async fn merge_tools(&self, client: &Arc<ToolClient>) {
        let tools = client.list_tools().await;
        let mut index = self.index_mut();
        for tool in tools {
            if let Some(previous) = index.insert(tool.name.clone(), Arc::clone(client)) {
                if !Arc::ptr_eq(&previous, client) {
                    info!(
                        tool = %tool.name,
                        previous = %previous.name(),
                        server = %client.name(),
                        "Tool name collision; last registered server wins"
                    );
                }
            }
        }
    }

    fn unindex(&self, client: &Arc<ToolClient>) {
        self.index_mut()
            .retain(|_, owner| !Arc::ptr_eq(owner, client));
    }

    fn persist_with<F>(&self, mutator: F) -> Result<(), McpError>
    where
        F: FnOnce(&mut Config) -> Result<(), McpError>,
    {
        match &self.store {
            Some(store) => store.mutate(mutator),
            None => Ok(()),
        }
    }

    /// Persists then connects a new server. A failed connect keeps the client
    /// registered, reporting the failure through its status.
    pub async fn add_server(&self, descriptor: ServerDescriptor) -> Result<ServerStatus, McpError> {
        descriptor.validate()?;
        let name = descriptor.name.clone();
        if self.clients().contains_key(&name) {
            return Err(already_exists(&name));
        }
        self.persist_with(|config| {
            if config.mcp_servers.contains_key(&name) {
                return Err(already_exists(&name));
            }
            config.mcp_servers.insert(name.clone(), descriptor.to_entry());
            Ok(())
        })?;

        let client = self.new_client(descriptor);
        self.clients_mut().insert(name.clone(), Arc::clone(&client));
        info!(server = %name, "Added tool server");
        self.connect_and_merge(&client).await;
        Ok(status_of(&client).await)
    }

    /// Replaces an existing server's descriptor. The old client is unindexed
    /// and closed before the replacement connects.
    pub async fn update_server(
        &self,
        descriptor: ServerDescriptor,
    ) -> Result<ServerStatus, McpError> {
        descriptor.validate()?;
        let name = descriptor.name.clone();
        let Some(previous) = self.get_client_by_server_name(&name) else {
            return Err(not_found(&name));
        };
        self.persist_with(|config| {
            config.mcp_servers.insert(name.clone(), descriptor.to_entry());
            Ok(())
        })?;

        self.unindex(&previous);
        previous.close().await;

        let client = self.new_client(descriptor);
        self.clients_mut().insert(name.clone(), Arc::clone(&client));
        info!(server = %name, "Updated tool server");
        self.connect_and_merge(&client).await;
        Ok(status_of(&client).await)
    }

    pub async fn delete_server(&self, name: &str) -> Result<(), McpError> {
        let Some(client) = self.get_client_by_server_name(name) else {
            return Err(not_found(name));
        };
        self.persist_with(|config| {
            config.mcp_servers.remove(name);
            Ok(())
        })?;

        self.unindex(&client);
        client.close().await;
        self.clients_mut().remove(name);
        info!(server = %name, "Removed tool server");
        Ok(())
    }

    /// Disconnects, reconnects and re-indexes one server without touching
    /// the others. Returns the connect outcome.
    pub async fn refresh_server(&self, name: &str) -> Result<(), McpError> {
        let Some(client) = self.get_client_by_server_name(name) else {
            return Err(not_found(name));
        };
        debug!(server = %name, "Refreshing tool server");
        self.unindex(&client);
        client.close().await;
        let outcome = client.connect().await;
        if outcome.is_ok() {
            self.merge_tools(&client).await;
        }
        outcome
    }

    async fn connect_and_merge(&self, client: &Arc<ToolClient>) {
        if client.connect().await.is_ok() {
            self.merge_tools(client).await;
        }
    }

    /// Status of every registered server, sorted by name.
    pub async fn list_servers(&self) -> Vec<ServerStatus> {
        let clients = self.snapshot();
        let mut statuses = join_all(clients.iter().map(status_of)).await;
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        statuses
    }

    /// Every discovered tool across all clients, tagged with its server.
    pub async fn get_all_tools(&self) -> Vec<ToolDescriptor> {
        let mut clients = self.snapshot();
        clients.sort_by(|a, b| a.name().cmp(b.name()));
        join_all(clients.iter().map(|client| client.list_tools()))
            .await
            .into_iter()
            .flatten()
            .collect()
    }

    pub async fn list_tools(&self) -> Vec<ToolDescriptor> {
        self.get_all_tools().await
    }

    /// Tools reachable by name: for colliding names, only the descriptor of
    /// the server the index routes to.
    pub async fn routable_tools(&self) -> Vec<ToolDescriptor> {
        let routes: HashMap<String, String> = self
            .index()
            .iter()
            .map(|(tool, client)| (tool.clone(), client.name().to_string()))
            .collect();
        self.get_all_tools()
            .await
            .into_iter()
            .filter(|tool| routes.get(&tool.name) == Some(&tool.server_name))
            .collect()
    }

    pub fn get_client_by_tool_name(&self, tool_name: &str) -> Option<Arc<ToolClient>> {
        self.index().get(tool_name).cloned()
    }

    pub fn get_client_by_server_name(&self, server_name: &str) -> Option<Arc<ToolClient>> {
        self.clients().get(server_name).cloned()
    }

    pub async fn execute_tool(&self, tool_name: &str, arguments: Value) -> Result<Value, McpError> {
        let Some(client) = self.get_client_by_tool_name(tool_name) else {
            return Err(McpError::ToolNotFound(tool_name.to_string()));
        };
        debug!(tool = %tool_name, server = %client.name(), "Routing tool call");
        client.call_tool(tool_name, arguments).await
    }

    /// Closes every client concurrently. A client that does not close in time
    /// is logged and left behind.
    pub async fn cleanup(&self) {
        let clients: Vec<Arc<ToolClient>> = self.clients_mut().drain().map(|(_, c)| c).collect();
        self.index_mut().clear();
        join_all(clients.iter().map(|client| async move {
            if tokio::time::timeout(CLIENT_CLOSE_TIMEOUT, client.close())
                .await
                .is_err()
            {
                warn!(server = %client.name(), "Timed out closing tool server");
            }
        }))
        .await;
        debug!(closed = clients.len(), "Tool clients cleaned up");
    }
}

#[async_trait]
impl ToolExecutor for ClientRegistry {
    async fn tool_catalog(&self) -> Vec<ToolDescriptor> {
        self.routable_tools().await
    }

    async fn execute_tool(&self, name: &str, arguments: Value) -> Result<Value, McpError> {
        ClientRegistry::execute_tool(self, name, arguments).await
    }
}

async fn status_of(client: &Arc<ToolClient>) -> ServerStatus {
    let status = client.status().await;
    ServerStatus {
        name: client.name().to_string(),
        transport: client.descriptor().transport,
        state: status.state,
        tool_count: status.tool_count,
        last_error: status.last_error,
        session_id: status.session_id,
    }
}

fn already_exists(name: &str) -> McpError {
    McpError::Config(format!("Server with name \"{name}\" already exists"))
}

fn not_found(name: &str) -> McpError {
    McpError::Config(format!("Server with name \"{name}\" not found"))
}
