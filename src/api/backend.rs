use crate::api::{ChatRequest, ChatResponse, ChatToolDefinition};
use crate::core::config::data::Config;
use crate::core::errors::BackendError;
use crate::core::message::{Message, ToolCallRequest};
use crate::utils::url::construct_api_url;
use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

const BACKEND_REQUEST_TIMEOUT: Duration = Duration::from_secs(120);
const TOOL_CHOICE_AUTO: &str = "auto";

/// One model response: either a final answer or a set of tool calls, possibly
/// with accompanying text.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AssistantReply {
    pub content: String,
    pub tool_calls: Vec<ToolCallRequest>,
}

impl AssistantReply {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            tool_calls: Vec::new(),
        }
    }

    pub fn tool_calls(content: impl Into<String>, tool_calls: Vec<ToolCallRequest>) -> Self {
        Self {
            content: content.into(),
            tool_calls,
        }
    }
}

#[async_trait]
pub trait ModelBackend: Send + Sync {
    async fn complete(
        &self,
        messages: &[Message],
        tools: &[ChatToolDefinition],
    ) -> Result<AssistantReply, BackendError>;
}

/// Non-streaming `chat/completions` client.
pub struct OpenAiCompatibleBackend {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl OpenAiCompatibleBackend {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> Result<Self, BackendError> {
        let client = reqwest::Client::builder()
            .timeout(BACKEND_REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
        })
    }

    /// Reads `OPENAI_API_KEY`; base URL and model come from the config unless
    /// overridden.
    pub fn from_env(config: &Config, model: Option<String>) -> Result<Self, BackendError> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .ok()
            .filter(|key| !key.trim().is_empty())
            .ok_or(BackendError::MissingApiKey)?;
        Self::new(
            config.base_url(),
            api_key,
            model.unwrap_or_else(|| config.model()),
        )
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn build_request(&self, messages: &[Message], tools: &[ChatToolDefinition]) -> ChatRequest {
        let has_tools = !tools.is_empty();
        ChatRequest {
            model: self.model.clone(),
            messages: messages.iter().map(Message::to_api).collect(),
            stream: false,
            tools: has_tools.then(|| tools.to_vec()),
            tool_choice: has_tools.then(|| TOOL_CHOICE_AUTO.to_string()),
        }
    }
}

#[async_trait]
impl ModelBackend for OpenAiCompatibleBackend {
    async fn complete(
        &self,
        messages: &[Message],
        tools: &[ChatToolDefinition],
    ) -> Result<AssistantReply, BackendError> {
        let request = self.build_request(messages, tools);
        let chat_url = construct_api_url(&self.base_url, "chat/completions");
        debug!(
            url = %chat_url,
            model = %self.model,
            messages = request.messages.len(),
            tools = tools.len(),
            "Sending completion request"
        );

        let response = self
            .client
            .post(chat_url)
            .header("Content-Type", "application/json")
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(BackendError::Status {
                status: status.as_u16(),
                body: summarize_api_error(&body),
            });
        }

        let parsed: ChatResponse =
            serde_json::from_str(&body).map_err(|err| BackendError::Decode(err.to_string()))?;
        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or(BackendError::EmptyResponse)?;
        debug!(finish_reason = ?choice.finish_reason, "Completion received");

        Ok(AssistantReply {
            content: choice.message.content.unwrap_or_default(),
            tool_calls: choice
                .message
                .tool_calls
                .unwrap_or_default()
                .into_iter()
                .map(ToolCallRequest::from)
                .collect(),
        })
    }
}

/// Pulls the human-readable message out of an API error body when there is
/// one, otherwise returns the trimmed body.
fn summarize_api_error(body: &str) -> String {
    let trimmed = body.trim();
    let Ok(value) = serde_json::from_str::<serde_json::Value>(trimmed) else {
        return trimmed.to_string();
    };
    value
        .pointer("/error/message")
        .and_then(|v| v.as_str())
        .or_else(|| value.get("error").and_then(|v| v.as_str()))
        .or_else(|| value.get("message").and_then(|v| v.as_str()))
        .map(|text| text.split_whitespace().collect::<Vec<_>>().join(" "))
        .unwrap_or_else(|| trimmed.to_string())
}
