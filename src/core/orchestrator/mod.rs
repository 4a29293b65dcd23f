//! Multi-round tool-augmented conversation loop.
//!
//! Each round sends the history plus the tool catalog to the model. Tool
//! calls in the reply are executed (concurrently) and their results appended
//! in request order before the next round; a reply without tool calls ends
//! the turn.

use crate::api::{ChatToolDefinition, ModelBackend};
use crate::core::errors::{ConversationError, McpError};
use crate::core::message::{Message, Role, ToolCallRequest};
use crate::mcp::protocol::ToolDescriptor;
use async_trait::async_trait;
use futures_util::future::join_all;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub const DEFAULT_MAX_ROUNDS: usize = 16;

/// Content used for a requested call that never produced a result.
pub const MISSING_RESULT_ERROR: &str = "Tool call did not produce a result";

/// Routes tool calls by name. Implemented by the client registry.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    /// Tools the model may call, one entry per routable name.
    async fn tool_catalog(&self) -> Vec<ToolDescriptor>;

    async fn execute_tool(&self, name: &str, arguments: Value) -> Result<Value, McpError>;
}

/// Progress notifications for a host rendering the turn as it happens.
#[derive(Debug, Clone, PartialEq)]
pub enum ConversationEvent {
    /// Text that accompanied a tool request.
    AssistantMessage(String),
    ToolUse {
        id: String,
        name: String,
        arguments: String,
    },
    ToolResult {
        id: String,
        name: String,
        content: String,
        is_error: bool,
    },
    FinalAnswer(String),
}

pub type EventSender = mpsc::UnboundedSender<ConversationEvent>;

pub struct ConversationOrchestrator {
    backend: Arc<dyn ModelBackend>,
    executor: Arc<dyn ToolExecutor>,
    max_rounds: usize,
}

struct ToolOutcome {
    message: Message,
    name: String,
    is_error: bool,
}

impl ConversationOrchestrator {
    pub fn new(backend: Arc<dyn ModelBackend>, executor: Arc<dyn ToolExecutor>) -> Self {
        Self {
            backend,
            executor,
            max_rounds: DEFAULT_MAX_ROUNDS,
        }
    }

    pub fn with_max_rounds(mut self, max_rounds: usize) -> Self {
        self.max_rounds = max_rounds.max(1);
        self
    }

    /// Runs one turn to completion and returns the final assistant text.
    ///
    /// On error the history is still reconciled: every requested tool call
    /// has exactly one tool message.
    pub async fn run_turn(
        &self,
        history: &mut Vec<Message>,
        events: Option<&EventSender>,
    ) -> Result<String, ConversationError> {
        let catalog = self.executor.tool_catalog().await;
        let tools: Vec<ChatToolDefinition> = catalog.iter().map(ChatToolDefinition::from).collect();
        debug!(tools = tools.len(), "Starting conversation turn");

        for round in 1..=self.max_rounds {
            reconcile_tool_results(history);
            let reply = self.backend.complete(history, &tools).await?;

            if reply.tool_calls.is_empty() {
                debug!(round, "Model produced a final answer");
                emit(events, ConversationEvent::FinalAnswer(reply.content.clone()));
                history.push(Message::assistant(reply.content.clone()));
                return Ok(reply.content);
            }

            info!(round, calls = reply.tool_calls.len(), "Model requested tools");
            if !reply.content.trim().is_empty() {
                emit(events, ConversationEvent::AssistantMessage(reply.content.clone()));
            }
            history.push(Message::assistant_with_tool_calls(
                reply.content,
                reply.tool_calls.clone(),
            ));

            let results = self.execute_round(&reply.tool_calls, events).await;
            history.extend(results);
        }

        reconcile_tool_results(history);
        warn!(max_rounds = self.max_rounds, "Conversation turn hit the round limit");
        Err(ConversationError::RoundLimit(self.max_rounds))
    }

    /// Dispatches every call of a round at once; results come back in request
    /// order regardless of completion order.
    async fn execute_round(
        &self,
        calls: &[ToolCallRequest],
        events: Option<&EventSender>,
    ) -> Vec<Message> {
        for call in calls {
            emit(
                events,
                ConversationEvent::ToolUse {
                    id: call.id.clone(),
                    name: call.tool_name.clone(),
                    arguments: call.arguments_json.clone(),
                },
            );
        }

        let outcomes = join_all(calls.iter().map(|call| self.execute_call(call))).await;

        outcomes
            .into_iter()
            .map(|outcome| {
                emit(
                    events,
                    ConversationEvent::ToolResult {
                        id: outcome.message.tool_call_id.clone().unwrap_or_default(),
                        name: outcome.name,
                        content: outcome.message.content.clone(),
                        is_error: outcome.is_error,
                    },
                );
                outcome.message
            })
            .collect()
    }

    async fn execute_call(&self, call: &ToolCallRequest) -> ToolOutcome {
        let result = match parse_arguments(&call.arguments_json) {
            Ok(arguments) => self
                .executor
                .execute_tool(&call.tool_name, arguments)
                .await
                .map_err(|err| err.to_string()),
            Err(reason) => Err(reason),
        };

        let (content, is_error) = match result {
            Ok(value) => match serde_json::to_string(&value) {
                Ok(content) => (content, false),
                Err(err) => (error_content(&err.to_string()), true),
            },
            Err(reason) => {
                warn!(tool = %call.tool_name, request_id = %call.id, error = %reason, "Tool call failed");
                (error_content(&reason), true)
            }
        };

        ToolOutcome {
            message: Message::tool_result(call.id.clone(), content),
            name: call.tool_name.clone(),
            is_error,
        }
    }
}

fn emit(events: Option<&EventSender>, event: ConversationEvent) {
    if let Some(events) = events {
        let _ = events.send(event);
    }
}

fn parse_arguments(raw: &str) -> Result<Value, String> {
    if raw.trim().is_empty() {
        return Ok(json!({}));
    }
    serde_json::from_str(raw).map_err(|err| format!("Invalid tool arguments: {err}"))
}

fn error_content(reason: &str) -> String {
    json!({ "error": reason }).to_string()
}

/// Makes the tool messages after the latest tool-requesting assistant
/// message match its calls one to one, in request order. Missing results get
/// a synthesized error; duplicates and unknown ids are dropped.
pub fn reconcile_tool_results(history: &mut Vec<Message>) {
    let Some(anchor) = history.iter().rposition(Message::requests_tools) else {
        return;
    };
    let block_start = anchor + 1;
    let block_end = history[block_start..]
        .iter()
        .position(|message| message.role != Role::Tool)
        .map_or(history.len(), |offset| block_start + offset);

    let calls = history[anchor].tool_calls.clone();
    let block: Vec<Message> = history.drain(block_start..block_end).collect();
    let mut by_id: HashMap<String, Message> = HashMap::new();
    for message in block {
        let Some(id) = message.tool_call_id.clone() else {
            continue;
        };
        by_id.entry(id).or_insert(message);
    }

    let mut ordered = Vec::with_capacity(calls.len());
    for call in &calls {
        match by_id.remove(&call.id) {
            Some(message) => ordered.push(message),
            None => {
                warn!(tool = %call.tool_name, request_id = %call.id, "Synthesizing missing tool result");
                ordered.push(Message::tool_result(
                    call.id.clone(),
                    error_content(MISSING_RESULT_ERROR),
                ));
            }
        }
    }
    for id in by_id.keys() {
        debug!(request_id = %id, "Dropping tool result with no matching call");
    }

    history.splice(block_start..block_start, ordered);
}
