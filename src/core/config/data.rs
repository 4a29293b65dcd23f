use crate::core::errors::McpError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_MODEL: &str = "gpt-4o";

/// One entry of the `mcpServers` map, exactly as persisted.
///
/// Either `command` (local process) or `url` (SSE) must be present; the
/// transport is inferred from whichever is set unless `transport` overrides it.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, Eq)]
pub struct ServerEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<HashMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transport: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Default, Clone)]
pub struct Config {
    /// Tool servers keyed by their unique name
    #[serde(default, rename = "mcpServers", alias = "mcp_servers")]
    pub mcp_servers: BTreeMap<String, ServerEntry>,
    /// Model used by `chat` when no `--model` is given
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// OpenAI-compatible API root (e.g., "https://api.openai.com/v1")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    LocalProcess,
    Sse,
}

impl TransportKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TransportKind::LocalProcess => "stdio",
            TransportKind::Sse => "sse",
        }
    }

    fn parse(value: &str) -> Result<Self, McpError> {
        match value.trim().to_ascii_lowercase().as_str() {
            "stdio" | "local" | "local-process" => Ok(TransportKind::LocalProcess),
            "sse" | "http" => Ok(TransportKind::Sse),
            other => Err(McpError::Config(format!("unsupported transport: {other}"))),
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Validated, immutable description of one tool server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerDescriptor {
    pub name: String,
    pub transport: TransportKind,
    pub command: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub remote_url: String,
}

impl ServerDescriptor {
    pub fn local_process(
        name: impl Into<String>,
        command: impl Into<String>,
        args: Vec<String>,
    ) -> Self {
        Self {
            name: name.into(),
            transport: TransportKind::LocalProcess,
            command: command.into(),
            args,
            env: HashMap::new(),
            remote_url: String::new(),
        }
    }

    pub fn sse(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            transport: TransportKind::Sse,
            command: String::new(),
            args: Vec::new(),
            env: HashMap::new(),
            remote_url: url.into(),
        }
    }

    pub fn from_entry(name: &str, entry: &ServerEntry) -> Result<Self, McpError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(McpError::Config("server name is missing".to_string()));
        }

        let command = entry.command.as_deref().map(str::trim).unwrap_or_default();
        let url = entry.url.as_deref().map(str::trim).unwrap_or_default();

        let transport = match entry.transport.as_deref() {
            Some(explicit) => TransportKind::parse(explicit)?,
            None if !url.is_empty() => TransportKind::Sse,
            None if !command.is_empty() => TransportKind::LocalProcess,
            None => {
                return Err(McpError::Config(
                    "either command or url must be provided".to_string(),
                ))
            }
        };

        let descriptor = Self {
            name: name.to_string(),
            transport,
            command: command.to_string(),
            args: entry.args.clone().unwrap_or_default(),
            env: entry.env.clone().unwrap_or_default(),
            remote_url: url.to_string(),
        };
        descriptor.validate()?;
        Ok(descriptor)
    }

    pub fn validate(&self) -> Result<(), McpError> {
        if self.name.trim().is_empty() {
            return Err(McpError::Config("server name is missing".to_string()));
        }
        match self.transport {
            TransportKind::LocalProcess if self.command.trim().is_empty() => Err(
                McpError::Config(format!("server \"{}\" needs a command", self.name)),
            ),
            TransportKind::Sse => {
                let parsed = reqwest::Url::parse(&self.remote_url).map_err(|err| {
                    McpError::Config(format!("server \"{}\" has an invalid url: {err}", self.name))
                })?;
                if !matches!(parsed.scheme(), "http" | "https") {
                    return Err(McpError::Config(format!(
                        "server \"{}\" url must be http or https",
                        self.name
                    )));
                }
                Ok(())
            }
            TransportKind::LocalProcess => Ok(()),
        }
    }

    pub fn to_entry(&self) -> ServerEntry {
        match self.transport {
            TransportKind::LocalProcess => ServerEntry {
                command: Some(self.command.clone()),
                args: (!self.args.is_empty()).then(|| self.args.clone()),
                env: (!self.env.is_empty()).then(|| self.env.clone()),
                url: None,
                transport: None,
            },
            TransportKind::Sse => ServerEntry {
                url: Some(self.remote_url.clone()),
                ..ServerEntry::default()
            },
        }
    }
}

impl Config {
    /// Normalizes every configured server. Invalid entries are returned
    /// separately so one bad entry cannot hide the rest.
    pub fn server_descriptors(&self) -> (Vec<ServerDescriptor>, Vec<(String, McpError)>) {
        let mut valid = Vec::new();
        let mut invalid = Vec::new();
        for (name, entry) in &self.mcp_servers {
            match ServerDescriptor::from_entry(name, entry) {
                Ok(descriptor) => valid.push(descriptor),
                Err(err) => invalid.push((name.clone(), err)),
            }
        }
        (valid, invalid)
    }

    pub fn base_url(&self) -> String {
        std::env::var("OPENAI_BASE_URL")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .or_else(|| self.base_url.clone())
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
    }

    pub fn model(&self) -> String {
        self.model
            .clone()
            .unwrap_or_else(|| DEFAULT_MODEL.to_string())
    }
}

/// Get a user-friendly display string for a path
/// Converts absolute paths under $HOME to `~` notation on Unix-like systems
pub fn path_display<P: AsRef<Path>>(path: P) -> String {
    let path = path.as_ref();

    #[cfg(unix)]
    {
        if let Some(home) = std::env::var_os("HOME") {
            let home_path = PathBuf::from(home);
            if let Ok(relative) = path.strip_prefix(&home_path) {
                return format!("~/{}", relative.display());
            }
        }
    }

    path.display().to_string()
}
