//! Command-line interface parsing and handling
//!
//! Every command except `demo-server` loads the server map, connects what it
//! needs through a [`ClientRegistry`], and tears all clients down before
//! returning.

use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{ArgAction, Parser, Subcommand};
use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::api::OpenAiCompatibleBackend;
use crate::core::config::data::{path_display, Config, ServerDescriptor};
use crate::core::message::Message;
use crate::core::orchestrator::{ConversationEvent, ConversationOrchestrator};
use crate::mcp::demo::DemoToolServer;
use crate::mcp::registry::{ClientRegistry, InitializeReport, ServerStatus};
use crate::utils::logging::{init_tracing, TranscriptLog};

#[derive(Parser, Debug)]
#[command(name = "toolrelay", version)]
#[command(about = "Drive MCP tool servers from a tool-calling chat model")]
#[command(
    long_about = "toolrelay connects to the MCP tool servers listed in its config file \
(local processes over stdio, or remote servers over SSE) and routes a chat model's \
tool calls to them.\n\n\
Environment Variables:\n\
  OPENAI_API_KEY     API key for the chat model backend\n\
  OPENAI_BASE_URL    Custom API base URL (defaults to https://api.openai.com/v1)\n\
  TOOLRELAY_CONFIG   Config file path (overridden by --config)\n\
  RUST_LOG           Log filter (overrides -v)"
)]
pub struct Args {
    #[command(subcommand)]
    pub command: Commands,

    /// Config file (TOML, or JSON when the name ends in .json)
    #[arg(short = 'c', long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Increase log verbosity (-v, -vv, -vvv); logs go to stderr
    #[arg(short = 'v', long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    /// Append the chat transcript to this file
    #[arg(short = 'l', long, global = true, value_name = "FILE")]
    pub log: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Connect every configured server and print its status
    Servers,
    /// Print the tool catalog of every connected server
    Tools,
    /// Call one tool by name
    Call {
        tool: String,
        /// Arguments as a JSON object (defaults to {})
        arguments: Option<String>,
    },
    /// Add a server to the config and connect it
    Add {
        name: String,
        #[command(flatten)]
        target: ServerTarget,
    },
    /// Replace a configured server's launch settings
    Update {
        name: String,
        #[command(flatten)]
        target: ServerTarget,
    },
    /// Remove a server from the config
    Remove { name: String },
    /// Reconnect one server and re-read its tools
    Refresh { name: String },
    /// Run one tool-augmented conversation turn
    Chat {
        /// Model id (defaults to the configured model)
        #[arg(short = 'm', long)]
        model: Option<String>,
        /// System prompt placed before the user message
        #[arg(short = 's', long)]
        system: Option<String>,
        /// Maximum model rounds before giving up
        #[arg(long, value_name = "N")]
        max_rounds: Option<usize>,
        #[arg(required = true, trailing_var_arg = true, value_name = "PROMPT")]
        prompt: Vec<String>,
    },
    /// Serve the built-in arithmetic tools over stdio
    DemoServer {
        /// Only expose these tools (add, subtract, multiply, divide)
        #[arg(long = "tool", value_name = "NAME")]
        tools: Vec<String>,
    },
}

/// Where a server lives: a local command or an SSE URL.
#[derive(clap::Args, Debug, Clone, PartialEq, Eq)]
pub struct ServerTarget {
    /// Command that starts a stdio server
    #[arg(long, conflicts_with = "url", required_unless_present = "url")]
    pub command: Option<String>,
    /// Argument passed to the command (repeatable)
    #[arg(long = "arg", value_name = "ARG", allow_hyphen_values = true, requires = "command")]
    pub args: Vec<String>,
    /// Environment variable for the command (repeatable)
    #[arg(long = "env", value_name = "KEY=VALUE", value_parser = parse_env_pair, requires = "command")]
    pub env: Vec<(String, String)>,
    /// Event-stream URL of an SSE server
    #[arg(long)]
    pub url: Option<String>,
}

impl ServerTarget {
    pub fn into_descriptor(self, name: &str) -> ServerDescriptor {
        match (self.command, self.url) {
            (Some(command), _) => {
                let mut descriptor = ServerDescriptor::local_process(name, command, self.args);
                descriptor.env = self.env.into_iter().collect();
                descriptor
            }
            (None, url) => ServerDescriptor::sse(name, url.unwrap_or_default()),
        }
    }
}

fn parse_env_pair(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("expected KEY=VALUE, got \"{raw}\"")),
    }
}

pub fn parse_tool_arguments(raw: Option<&str>) -> Result<Value, String> {
    let Some(raw) = raw.filter(|raw| !raw.trim().is_empty()) else {
        return Ok(json!({}));
    };
    match serde_json::from_str::<Value>(raw) {
        Ok(value @ Value::Object(_)) => Ok(value),
        Ok(_) => Err("tool arguments must be a JSON object".to_string()),
        Err(err) => Err(format!("invalid tool arguments: {err}")),
    }
}

pub fn format_status(status: &ServerStatus) -> String {
    let mut line = format!(
        "{:<20} {:<6} {:<24} {} tool(s)",
        status.name,
        status.transport.as_str(),
        status.state.as_str(),
        status.tool_count
    );
    if let Some(session) = &status.session_id {
        line.push_str(&format!("  session={session}"));
    }
    if let Some(error) = &status.last_error {
        line.push_str(&format!("  error: {error}"));
    }
    line
}

fn print_report(report: &InitializeReport) {
    for (name, err) in &report.failed {
        eprintln!("⚠️  {name}: {err}");
    }
}

pub fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();
    init_tracing(args.verbose);
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(run(args))
}

pub async fn run(args: Args) -> Result<(), Box<dyn Error>> {
    if let Commands::DemoServer { tools } = &args.command {
        let server = if tools.is_empty() {
            DemoToolServer::default()
        } else {
            let names: Vec<&str> = tools.iter().map(String::as_str).collect();
            DemoToolServer::with_tools(&names)
        };
        server
            .serve(tokio::io::stdin(), tokio::io::stdout())
            .await?;
        return Ok(());
    }

    let config_path = Config::resolve_path(args.config.as_deref())?;
    let registry = Arc::new(ClientRegistry::with_persistence(config_path.clone()));
    let outcome = dispatch(args, &registry, config_path).await;
    registry.cleanup().await;
    outcome
}

async fn dispatch(
    args: Args,
    registry: &Arc<ClientRegistry>,
    config_path: PathBuf,
) -> Result<(), Box<dyn Error>> {
    match args.command {
        Commands::Add { name, target } => {
            let status = registry.add_server(target.into_descriptor(&name)).await?;
            println!("✅ Added {name} to {}", path_display(&config_path));
            println!("{}", format_status(&status));
            Ok(())
        }
        Commands::Servers => {
            let report = registry.initialize_from_path(&config_path).await?;
            print_report(&report);
            let statuses = registry.list_servers().await;
            if statuses.is_empty() {
                println!("No servers configured in {}", path_display(&config_path));
            }
            for status in statuses {
                println!("{}", format_status(&status));
            }
            Ok(())
        }
        Commands::Tools => {
            let report = registry.initialize_from_path(&config_path).await?;
            print_report(&report);
            for tool in registry.get_all_tools().await {
                println!("{}/{}  {}", tool.server_name, tool.name, tool.description);
            }
            Ok(())
        }
        Commands::Call { tool, arguments } => {
            let arguments = parse_tool_arguments(arguments.as_deref())?;
            let report = registry.initialize_from_path(&config_path).await?;
            print_report(&report);
            let value = registry.execute_tool(&tool, arguments).await?;
            println!("{}", serde_json::to_string_pretty(&value)?);
            Ok(())
        }
        Commands::Update { name, target } => {
            registry.initialize_from_path(&config_path).await?;
            let status = registry.update_server(target.into_descriptor(&name)).await?;
            println!("✅ Updated {name}");
            println!("{}", format_status(&status));
            Ok(())
        }
        Commands::Remove { name } => {
            registry.initialize_from_path(&config_path).await?;
            registry.delete_server(&name).await?;
            println!("✅ Removed {name} from {}", path_display(&config_path));
            Ok(())
        }
        Commands::Refresh { name } => {
            registry.initialize_from_path(&config_path).await?;
            registry.refresh_server(&name).await?;
            if let Some(status) = registry
                .list_servers()
                .await
                .into_iter()
                .find(|status| status.name == name)
            {
                println!("{}", format_status(&status));
            }
            Ok(())
        }
        Commands::Chat {
            model,
            system,
            max_rounds,
            prompt,
        } => {
            let config = Config::load_from_path(&config_path)?;
            let backend = OpenAiCompatibleBackend::from_env(&config, model)?;
            let report = registry.initialize_from_config(&config).await;
            print_report(&report);

            let transcript = args.log.map(TranscriptLog::open).transpose()?;
            let mut orchestrator =
                ConversationOrchestrator::new(Arc::new(backend), Arc::clone(registry) as _);
            if let Some(max_rounds) = max_rounds {
                orchestrator = orchestrator.with_max_rounds(max_rounds);
            }

            let mut history = Vec::new();
            if let Some(system) = system {
                history.push(Message::system(system));
            }
            history.push(Message::user(prompt.join(" ")));

            let (tx, mut rx) = mpsc::unbounded_channel();
            let printer = tokio::spawn(async move {
                while let Some(event) = rx.recv().await {
                    print_event(&event);
                }
            });
            let outcome = orchestrator.run_turn(&mut history, Some(&tx)).await;
            drop(tx);
            let _ = printer.await;

            if let Some(transcript) = &transcript {
                for message in &history {
                    transcript.append(message)?;
                }
            }
            let answer = outcome?;
            println!("{answer}");
            Ok(())
        }
        Commands::DemoServer { .. } => Ok(()),
    }
}

fn print_event(event: &ConversationEvent) {
    match event {
        ConversationEvent::AssistantMessage(text) => eprintln!("💬 {text}"),
        ConversationEvent::ToolUse {
            name, arguments, ..
        } => eprintln!("🔧 {name} {arguments}"),
        ConversationEvent::ToolResult {
            name,
            content,
            is_error,
            ..
        } => {
            let marker = if *is_error { "❌" } else { "✅" };
            eprintln!("{marker} {name} → {content}");
        }
        ConversationEvent::FinalAnswer(_) => {}
    }
}
