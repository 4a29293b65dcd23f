//! Arithmetic tool server speaking newline-delimited JSON-RPC.
//!
//! `toolrelay demo-server` runs it on stdin/stdout; tests run it over
//! in-memory pipes or behind a mock SSE endpoint.

use crate::mcp::protocol::{
    id_key, JsonRpcResponse, JSONRPC_VERSION, MCP_PROTOCOL_VERSION, METHOD_INITIALIZE,
    METHOD_NOT_FOUND, METHOD_TOOLS_CALL, METHOD_TOOLS_LIST,
};
use rust_mcp_schema::{ContentBlock, TextContent};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::debug;

const INVALID_REQUEST: i64 = -32600;
const SERVER_NAME: &str = "toolrelay-demo";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DemoTool {
    Add,
    Subtract,
    Multiply,
    Divide,
}

impl DemoTool {
    const ALL: [DemoTool; 4] = [
        DemoTool::Add,
        DemoTool::Subtract,
        DemoTool::Multiply,
        DemoTool::Divide,
    ];

    fn name(self) -> &'static str {
        match self {
            DemoTool::Add => "add",
            DemoTool::Subtract => "subtract",
            DemoTool::Multiply => "multiply",
            DemoTool::Divide => "divide",
        }
    }

    fn description(self) -> &'static str {
        match self {
            DemoTool::Add => "Add two numbers",
            DemoTool::Subtract => "Subtract b from a",
            DemoTool::Multiply => "Multiply two numbers",
            DemoTool::Divide => "Divide a by b",
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|tool| tool.name() == name)
    }

    fn apply(self, a: f64, b: f64) -> Result<f64, String> {
        match self {
            DemoTool::Add => Ok(a + b),
            DemoTool::Subtract => Ok(a - b),
            DemoTool::Multiply => Ok(a * b),
            DemoTool::Divide if b == 0.0 => Err("Cannot divide by zero".to_string()),
            DemoTool::Divide => Ok(a / b),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DemoToolServer {
    tools: Vec<DemoTool>,
}

impl Default for DemoToolServer {
    fn default() -> Self {
        Self {
            tools: DemoTool::ALL.to_vec(),
        }
    }
}

impl DemoToolServer {
    /// Restricts the catalog to the named tools; unknown names are ignored.
    pub fn with_tools(names: &[&str]) -> Self {
        Self {
            tools: names.iter().filter_map(|name| DemoTool::from_name(name)).collect(),
        }
    }

    pub fn tool_names(&self) -> Vec<&'static str> {
        self.tools.iter().map(|tool| tool.name()).collect()
    }

    /// Answers one JSON-RPC message. Notifications get no answer.
    pub fn handle_message(&self, message: &Value) -> Option<Value> {
        let id = message.get("id").cloned();
        let method = message.get("method").and_then(Value::as_str);

        let response = match (id, method) {
            (None, _) => return None,
            (Some(id), None) => JsonRpcResponse::failure(id, INVALID_REQUEST, "missing method"),
            (Some(id), Some(METHOD_INITIALIZE)) => JsonRpcResponse::success(
                id,
                json!({
                    "protocolVersion": MCP_PROTOCOL_VERSION,
                    "capabilities": { "tools": {} },
                    "serverInfo": { "name": SERVER_NAME, "version": env!("CARGO_PKG_VERSION") }
                }),
            ),
            (Some(id), Some(METHOD_TOOLS_LIST)) => {
                JsonRpcResponse::success(id, json!({ "tools": self.catalog() }))
            }
            (Some(id), Some(METHOD_TOOLS_CALL)) => {
                let params = message.get("params").cloned().unwrap_or(Value::Null);
                JsonRpcResponse::success(id, self.call(&params))
            }
            (Some(id), Some(other)) => {
                JsonRpcResponse::failure(id, METHOD_NOT_FOUND, format!("Method not found: {other}"))
            }
        };
        serde_json::to_value(response).ok()
    }

    fn catalog(&self) -> Vec<Value> {
        self.tools
            .iter()
            .map(|tool| {
                json!({
                    "name": tool.name(),
                    "description": tool.description(),
                    "inputSchema": {
                        "type": "object",
                        "properties": {
                            "a": { "type": "number" },
                            "b": { "type": "number" }
                        },
                        "required": ["a", "b"]
                    }
                })
            })
            .collect()
    }

    fn call(&self, params: &Value) -> Value {
        let name = params.get("name").and_then(Value::as_str).unwrap_or_default();
        let Some(tool) = self.tools.iter().copied().find(|tool| tool.name() == name) else {
            return error_result(&format!("Unknown tool: {name}"));
        };
        let arguments = params.get("arguments").cloned().unwrap_or(Value::Null);
        let operands = (
            arguments.get("a").and_then(Value::as_f64),
            arguments.get("b").and_then(Value::as_f64),
        );
        let (Some(a), Some(b)) = operands else {
            return error_result("Arguments a and b must be numbers");
        };
        match tool.apply(a, b) {
            Ok(value) => text_result(&format_number(value)),
            Err(reason) => error_result(&reason),
        }
    }

    /// Serves newline-delimited JSON-RPC until the reader reaches EOF.
    pub async fn serve<R, W>(&self, reader: R, mut writer: W) -> std::io::Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            if reader.read_until(b'\n', &mut buf).await? == 0 {
                break;
            }
            let line = String::from_utf8_lossy(&buf);
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let reply = match serde_json::from_str::<Value>(line) {
                Ok(message) => {
                    let method = message
                        .get("method")
                        .and_then(serde_json::Value::as_str)
                        .unwrap_or("<none>");
                    debug!(
                        method,
                        request_id = ?message.get("id").and_then(id_key),
                        "Demo server received message"
                    );
                    self.handle_message(&message)
                }
                Err(err) => Some(json!({
                    "jsonrpc": JSONRPC_VERSION,
                    "id": Value::Null,
                    "error": { "code": -32700, "message": format!("Parse error: {err}") }
                })),
            };
            if let Some(reply) = reply {
                let mut bytes = serde_json::to_vec(&reply)?;
                bytes.push(b'\n');
                writer.write_all(&bytes).await?;
                writer.flush().await?;
            }
        }
        Ok(())
    }
}

fn text_block(text: &str) -> ContentBlock {
    ContentBlock::TextContent(TextContent::new(text.to_string(), None, None))
}

pub fn text_result(text: &str) -> Value {
    json!({ "content": [text_block(text)] })
}

pub fn error_result(text: &str) -> Value {
    json!({ "content": [text_block(text)], "isError": true })
}

/// Integral values print without a fractional part.
fn format_number(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        value.to_string()
    }
}
