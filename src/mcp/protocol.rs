//! JSON-RPC envelopes shared by both transports. MCP payloads are built from
//! and parsed into `rust_mcp_schema` types; the envelopes stay loose because
//! SSE servers answer with ids, sessions and batches in many shapes.

use crate::core::errors::TransportError;
use rust_mcp_schema::schema_utils::{
    ClientMessage, FromMessage, MessageFromClient, NotificationFromClient, RequestFromClient,
};
use rust_mcp_schema::{
    CallToolRequestParams, CallToolResult, ClientCapabilities, ContentBlock, Implementation,
    InitializeRequestParams, InitializeResult, ListToolsResult, RequestId, Tool,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::debug;

pub const JSONRPC_VERSION: &str = "2.0";
pub const MCP_PROTOCOL_VERSION: &str = "2024-11-05";
pub const CLIENT_NAME: &str = "toolrelay";

pub const METHOD_INITIALIZE: &str = "initialize";
pub const METHOD_INITIALIZED: &str = "notifications/initialized";
pub const METHOD_TOOLS_LIST: &str = "tools/list";
pub const METHOD_TOOLS_CALL: &str = "tools/call";

/// JSON-RPC code used by servers to indicate an unsupported method.
pub const METHOD_NOT_FOUND: i64 = -32601;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: Value,
    pub method: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub params: Value,
}

impl JsonRpcRequest {
    /// Frames a typed MCP request under `id`.
    pub fn from_client(id: RequestId, request: RequestFromClient) -> Result<Self, TransportError> {
        let message =
            ClientMessage::from_message(MessageFromClient::RequestFromClient(request), Some(id))
                .map_err(|err| TransportError::Protocol(err.to_string()))?;
        reframe(&message)
    }


    pub fn new(id: impl Into<Value>, method: &str, params: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: id.into(),
            method: method.to_string(),
            params,
        }
    }

    pub fn id_key(&self) -> Option<String> {
        id_key(&self.id)
    }
}

/// A request without an id; the server never answers it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JsonRpcNotification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub params: Value,
}

impl JsonRpcNotification {
    pub fn from_client(notification: NotificationFromClient) -> Result<Self, TransportError> {
        let message = ClientMessage::from_message(
            MessageFromClient::NotificationFromClient(notification),
            None,
        )
        .map_err(|err| TransportError::Protocol(err.to_string()))?;
        reframe(&message)
    }
}

fn reframe<T: serde::de::DeserializeOwned>(message: &ClientMessage) -> Result<T, TransportError> {
    serde_json::to_value(message)
        .and_then(serde_json::from_value)
        .map_err(|err| TransportError::Protocol(err.to_string()))
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JsonRpcResponse {
    #[serde(default)]
    pub jsonrpc: String,
    #[serde(default)]
    pub id: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: Value, code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.into(),
                data: None,
            }),
        }
    }

    /// Decodes a value only when it carries an id plus a result or error, so
    /// server-initiated requests and notifications are never mistaken for
    /// responses.
    pub fn from_value(value: &Value) -> Option<Self> {
        let object = value.as_object()?;
        if !object.contains_key("id") || object.contains_key("method") {
            return None;
        }
        if !object.contains_key("result") && !object.contains_key("error") {
            return None;
        }
        serde_json::from_value(value.clone()).ok()
    }

    pub fn into_result(self) -> Result<Value, TransportError> {
        if let Some(error) = self.error {
            return Err(TransportError::Rpc {
                code: error.code,
                message: error.message,
            });
        }
        Ok(self.result.unwrap_or(Value::Null))
    }
}

/// Normalizes a JSON-RPC id to the string key used by pending-call maps.
pub fn id_key(id: &Value) -> Option<String> {
    match id {
        Value::String(text) => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

/// Tool catalog entry as returned by `tools/list`, tagged with its owner.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "inputSchema", default = "empty_object_schema")]
    pub input_schema: Value,
    #[serde(rename = "serverName", default)]
    pub server_name: String,
}

impl ToolDescriptor {
    pub fn from_tool(tool: Tool, server_name: &str) -> Self {
        let input_schema =
            serde_json::to_value(&tool.input_schema).unwrap_or_else(|_| empty_object_schema());
        Self {
            name: tool.name,
            description: tool.description.unwrap_or_default(),
            input_schema,
            server_name: server_name.to_string(),
        }
    }
}

fn empty_object_schema() -> Value {
    json!({"type": "object", "properties": {}})
}

pub fn client_details() -> InitializeRequestParams {
    let capabilities =
        serde_json::from_value::<ClientCapabilities>(json!({"roots": {"listChanged": true}}))
            .unwrap_or_default();
    InitializeRequestParams {
        capabilities,
        client_info: Implementation {
            name: CLIENT_NAME.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            title: None,
            description: None,
            icons: Vec::new(),
            website_url: None,
        },
        meta: None,
        protocol_version: MCP_PROTOCOL_VERSION.to_string(),
    }
}

pub fn initialize_request() -> RequestFromClient {
    RequestFromClient::InitializeRequest(client_details())
}

pub fn initialized_notification() -> NotificationFromClient {
    NotificationFromClient::InitializedNotification(None)
}

pub fn list_tools_request() -> RequestFromClient {
    RequestFromClient::ListToolsRequest(None)
}

/// `arguments` must be an object; null means no arguments.
pub fn call_tool_request(name: &str, arguments: Value) -> Result<RequestFromClient, String> {
    let arguments = match arguments {
        Value::Null => Map::new(),
        Value::Object(map) => map,
        other => return Err(format!("tool arguments must be a JSON object, got {other}")),
    };
    let params = CallToolRequestParams::new(name).with_arguments(arguments);
    Ok(RequestFromClient::CallToolRequest(params))
}

pub fn parse_initialize_result(result: Value) -> Result<InitializeResult, String> {
    let result =
        serde_json::from_value::<InitializeResult>(result).map_err(|err| err.to_string())?;
    if result.protocol_version.trim().is_empty() {
        return Err("Unexpected initialize response.".to_string());
    }
    Ok(result)
}

/// Servers often omit `inputSchema` or its `type`; fill both in before the
/// typed parse so such tools still register.
fn normalize_tool_list(result: &mut Value) {
    let Value::Object(object) = result else {
        return;
    };
    let Value::Array(tools) = object
        .entry("tools")
        .or_insert_with(|| Value::Array(Vec::new()))
    else {
        return;
    };
    for tool in tools.iter_mut() {
        let Value::Object(tool) = tool else {
            continue;
        };
        let schema = tool
            .entry("inputSchema")
            .or_insert_with(empty_object_schema);
        match schema {
            Value::Object(schema) => {
                schema
                    .entry("type")
                    .or_insert_with(|| Value::String("object".to_string()));
            }
            other => *other = empty_object_schema(),
        }
    }
}

pub fn parse_list_tools(
    mut result: Value,
    server_name: &str,
) -> Result<Vec<ToolDescriptor>, String> {
    normalize_tool_list(&mut result);
    let list = serde_json::from_value::<ListToolsResult>(result).map_err(|err| err.to_string())?;
    Ok(list
        .tools
        .into_iter()
        .map(|tool| ToolDescriptor::from_tool(tool, server_name))
        .collect())
}

/// Outcome of a `tools/call` after unwrapping the MCP content envelope.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolCallOutcome {
    Success(Value),
    /// The server flagged the call with `isError`; carries its text.
    Failure(String),
}

/// Prefers the first textual content item, parsed as JSON when possible and
/// otherwise wrapped as `{"text": ...}`; falls back to the raw result.
pub fn extract_tool_result(result: Value) -> ToolCallOutcome {
    let is_error = result
        .get("isError")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let first_text = match serde_json::from_value::<CallToolResult>(result.clone()) {
        Ok(parsed) => parsed.content.into_iter().next().and_then(|block| match block {
            ContentBlock::TextContent(text) => Some(text.text),
            _ => None,
        }),
        Err(err) => {
            debug!(error = %err, "tools/call result is not a CallToolResult");
            None
        }
    };

    if is_error {
        return ToolCallOutcome::Failure(
            first_text.unwrap_or_else(|| "tool reported an error".to_string()),
        );
    }

    match first_text {
        Some(text) => match serde_json::from_str::<Value>(&text) {
            Ok(parsed) => ToolCallOutcome::Success(parsed),
            Err(_) => ToolCallOutcome::Success(json!({ "text": text })),
        },
        None => ToolCallOutcome::Success(result),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_text_content_is_parsed_as_json() {
        let result = json!({"content": [{"type": "text", "text": "3"}]});
        assert_eq!(extract_tool_result(result), ToolCallOutcome::Success(json!(3)));
    }

    #[test]
    fn plain_text_content_is_wrapped() {
        let result = json!({"content": [{"type": "text", "text": "sunny"}]});
        assert_eq!(
            extract_tool_result(result),
            ToolCallOutcome::Success(json!({"text": "sunny"}))
        );
    }

    #[test]
    fn error_flag_becomes_failure() {
        let result = json!({
            "content": [{"type": "text", "text": "division by zero"}],
            "isError": true
        });
        assert_eq!(
            extract_tool_result(result),
            ToolCallOutcome::Failure("division by zero".to_string())
        );
    }

    #[test]
    fn result_without_text_is_returned_whole() {
        let result = json!({"content": [{"type": "image", "data": "..."}]});
        assert_eq!(
            extract_tool_result(result.clone()),
            ToolCallOutcome::Success(result)
        );
    }

    #[test]
    fn response_detection_ignores_requests_and_notifications() {
        let response = json!({"jsonrpc": "2.0", "id": 1, "result": {}});
        let request = json!({"jsonrpc": "2.0", "id": 1, "method": "ping"});
        let notification = json!({"jsonrpc": "2.0", "method": "notifications/progress"});
        assert!(JsonRpcResponse::from_value(&response).is_some());
        assert!(JsonRpcResponse::from_value(&request).is_none());
        assert!(JsonRpcResponse::from_value(&notification).is_none());
        assert!(JsonRpcResponse::from_value(&json!({"id": "x"})).is_none());
    }

    #[test]
    fn list_tools_tags_owner_and_defaults_schema() {
        let tools = parse_list_tools(
            json!({"tools": [{"name": "add", "description": "Add two numbers"}, {"name": "noop"}]}),
            "Demo",
        )
        .expect("tools should parse");
        assert_eq!(tools.len(), 2);
        assert!(tools.iter().all(|tool| tool.server_name == "Demo"));
        assert_eq!(tools[1].input_schema["type"], "object");
    }

    #[test]
    fn initialize_request_carries_protocol_and_client_info() {
        let request = JsonRpcRequest::from_client(RequestId::Integer(0), initialize_request())
            .expect("initialize should frame");
        assert_eq!(request.jsonrpc, JSONRPC_VERSION);
        assert_eq!(request.id, json!(0));
        assert_eq!(request.method, METHOD_INITIALIZE);
        assert_eq!(request.params["protocolVersion"], MCP_PROTOCOL_VERSION);
        assert_eq!(request.params["clientInfo"]["name"], CLIENT_NAME);
        assert_eq!(request.params["capabilities"]["roots"]["listChanged"], true);
    }

    #[test]
    fn tool_call_request_keeps_string_id_and_arguments() {
        let request = JsonRpcRequest::from_client(
            RequestId::String("call_1_abc".to_string()),
            call_tool_request("add", json!({"a": 1, "b": 2})).expect("object arguments"),
        )
        .expect("call should frame");
        assert_eq!(request.id_key().as_deref(), Some("call_1_abc"));
        assert_eq!(request.method, METHOD_TOOLS_CALL);
        assert_eq!(request.params["name"], "add");
        assert_eq!(request.params["arguments"], json!({"a": 1, "b": 2}));

        assert!(call_tool_request("add", json!([1, 2])).is_err());
    }

    #[test]
    fn initialized_notification_has_no_id() {
        let notification = JsonRpcNotification::from_client(initialized_notification())
            .expect("notification should frame");
        assert_eq!(notification.method, METHOD_INITIALIZED);
        let wire = serde_json::to_value(&notification).expect("serialize");
        assert!(wire.get("id").is_none());
    }

    #[test]
    fn initialize_result_is_typed() {
        let result = parse_initialize_result(json!({
            "protocolVersion": "2024-11-05",
            "capabilities": {"tools": {}},
            "serverInfo": {"name": "demo", "version": "1.0.0"}
        }))
        .expect("valid initialize result");
        assert_eq!(result.server_info.name, "demo");
        assert!(parse_initialize_result(json!({"protocolVersion": " "})).is_err());
    }

    #[test]
    fn id_keys_normalize_numbers_and_strings() {
        assert_eq!(id_key(&json!(7)), Some("7".to_string()));
        assert_eq!(id_key(&json!("call_1")), Some("call_1".to_string()));
        assert_eq!(id_key(&Value::Null), None);
    }
}
