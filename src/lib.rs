//! toolrelay connects a tool-calling chat model to any number of MCP tool
//! servers.
//!
//! The crate is organized around a small set of collaborating layers:
//! - [`mcp`] speaks JSON-RPC to tool servers over stdio pipes or SSE plus
//!   HTTP POST, runs the per-server handshake, and keeps the registry that
//!   routes tool names to the server that owns them.
//! - [`core`] holds configuration, the error taxonomy, the conversation data
//!   model, and the orchestrator that alternates model rounds with tool
//!   execution.
//! - [`api`] defines the chat-completions payloads and the HTTP model backend.
//! - [`cli`] is the command-line front end used by `src/main.rs`.

pub mod api;
pub mod cli;
pub mod core;
pub mod mcp;
pub mod utils;
