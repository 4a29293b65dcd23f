//! Chat-completions wire types for OpenAI-compatible model backends.

use crate::mcp::protocol::ToolDescriptor;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub mod backend;

pub use backend::{AssistantReply, ModelBackend, OpenAiCompatibleBackend};

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ChatMessage {
    pub role: String,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ChatToolCall>>,
}

#[derive(Debug, Serialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<ChatToolDefinition>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<String>,
}

/// Assistant message inside a non-streaming completion; `content` is null
/// when the model only requests tools.
#[derive(Debug, Deserialize)]
pub struct ChatResponseMessage {
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub tool_calls: Option<Vec<ChatToolCall>>,
}

#[derive(Debug, Deserialize)]
pub struct ChatResponseChoice {
    pub message: ChatResponseMessage,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ChatResponse {
    #[serde(default)]
    pub choices: Vec<ChatResponseChoice>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ChatToolCall {
    pub id: String,
    #[serde(rename = "type", default = "function_kind")]
    pub kind: String,
    pub function: ChatToolCallFunction,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ChatToolCallFunction {
    pub name: String,
    #[serde(default)]
    pub arguments: String,
}

#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct ChatToolDefinition {
    #[serde(rename = "type")]
    pub kind: String,
    pub function: ChatToolFunction,
}

#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct ChatToolFunction {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub parameters: Value,
}

fn function_kind() -> String {
    "function".to_string()
}

impl From<&ToolDescriptor> for ChatToolDefinition {
    fn from(tool: &ToolDescriptor) -> Self {
        Self {
            kind: function_kind(),
            function: ChatToolFunction {
                name: tool.name.clone(),
                description: (!tool.description.trim().is_empty())
                    .then(|| tool.description.clone()),
                parameters: tool.input_schema.clone(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn tool_descriptors_become_function_definitions() {
        let tool = ToolDescriptor {
            name: "multiply".to_string(),
            description: "Multiply two numbers".to_string(),
            input_schema: json!({"type": "object", "properties": {"a": {"type": "number"}}}),
            server_name: "Demo-SSE".to_string(),
        };
        let definition = serde_json::to_value(ChatToolDefinition::from(&tool)).expect("serialize");
        assert_eq!(
            definition,
            json!({
                "type": "function",
                "function": {
                    "name": "multiply",
                    "description": "Multiply two numbers",
                    "parameters": {"type": "object", "properties": {"a": {"type": "number"}}}
                }
            })
        );
    }

    #[test]
    fn tool_call_response_parses_with_null_content() {
        let response: ChatResponse = serde_json::from_value(json!({
            "choices": [{
                "message": {
                    "role": "assistant",
                    "content": null,
                    "tool_calls": [{
                        "id": "call_1",
                        "type": "function",
                        "function": {"name": "add", "arguments": "{\"a\":1,\"b\":2}"}
                    }]
                },
                "finish_reason": "tool_calls"
            }]
        }))
        .expect("response should parse");
        let message = &response.choices[0].message;
        assert_eq!(message.content, None);
        let calls = message.tool_calls.as_ref().expect("tool calls");
        assert_eq!(calls[0].function.name, "add");
    }
}
