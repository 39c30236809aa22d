// Agent Chat Desktop - command line entry point
//
// `replay` drives the chat engine from a JSON-lines script of user actions
// and backend frames. Outbound events are printed and session requests are
// answered from the file history store, so a recorded conversation can be
// re-run offline.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uuid::Uuid;

use agent_chat_core::{encode_client_event, ClientEvent, Message, MessageKind, ServerEvent};
use agent_chat_desktop::services::chat::{ChatEngine, ChatTransport, PromptOptions};
use agent_chat_desktop::storage::{ConfigService, FileHistoryStore, HistoryStore};
use agent_chat_desktop::utils::error::AppResult;

#[derive(Debug, Parser)]
#[command(name = "agent-chat-desktop", version, about = "Multi-agent streaming chat engine")]
struct Cli {
    /// Config file (defaults to ~/.agent-chat/config.json)
    #[arg(long, global = true, env = "AGENT_CHAT_CONFIG")]
    config: Option<PathBuf>,

    /// History directory (overrides the config file)
    #[arg(long, global = true, env = "AGENT_CHAT_HISTORY_DIR")]
    history_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Replay a JSON-lines script through the engine
    Replay {
        script: PathBuf,

        /// Model sent with prompts that do not name one
        #[arg(long, default_value = "default")]
        model: String,
    },
    /// List the stored sessions of an agent
    Sessions { agent_id: String },
}

/// One line of a replay script
#[derive(Debug, Deserialize)]
#[serde(tag = "step", rename_all = "camelCase", rename_all_fields = "camelCase")]
enum ReplayStep {
    SelectAgent { agent_id: String },
    Prompt {
        text: String,
        #[serde(default)]
        model: Option<String>,
    },
    Abort,
    NewSession,
    SwitchSession { session_id: String },
    Scope {
        #[serde(default)]
        scope: Option<String>,
    },
    /// Let wall-clock time pass so metrics windows can elapse
    Wait { ms: u64 },
    /// A backend frame, `{"event": ..., "payload": ...}`
    Server { frame: ServerEvent },
}

/// Prints outbound events and answers session queries from the history store
struct LoopbackTransport {
    history: Arc<FileHistoryStore>,
    replies: mpsc::UnboundedSender<ServerEvent>,
}

impl LoopbackTransport {
    fn reply(&self, event: ServerEvent) {
        if self.replies.send(event).is_err() {
            tracing::warn!("Replay loop is gone, dropping loopback reply");
        }
    }

    async fn latest_session(&self, agent_id: &str) -> AppResult<Option<String>> {
        let sessions = self.history.list_sessions(agent_id).await?;
        Ok(sessions.first().map(|s| s.id.clone()))
    }
}

#[async_trait]
impl ChatTransport for LoopbackTransport {
    async fn send(&self, event: ClientEvent) -> AppResult<()> {
        println!(">> {}", encode_client_event(&event)?);

        match event {
            ClientEvent::GetAgentSessions { agent_id } => {
                let sessions = self.history.list_sessions(&agent_id).await?;
                let current_session_id = sessions.first().map(|s| s.id.clone());
                self.reply(ServerEvent::AgentSessions {
                    agent_id,
                    sessions,
                    current_session_id,
                });
            }
            ClientEvent::LoadSessionHistory { agent_id, session_id } => {
                let session_id = match session_id {
                    Some(id) => id,
                    None => match self.latest_session(&agent_id).await? {
                        Some(id) => id,
                        None => Uuid::new_v4().to_string(),
                    },
                };
                let messages = self
                    .history
                    .load_session(&agent_id, &session_id)
                    .await?
                    .map(|s| s.messages)
                    .unwrap_or_default();
                self.reply(ServerEvent::SessionHistory {
                    agent_id,
                    session_id,
                    messages,
                });
            }
            _ => {}
        }
        Ok(())
    }
}

async fn apply_step(engine: &mut ChatEngine, step: ReplayStep) -> AppResult<()> {
    match step {
        ReplayStep::SelectAgent { agent_id } => engine.select_agent(agent_id).await?,
        ReplayStep::Prompt { text, model } => {
            let options = PromptOptions {
                model,
                ..PromptOptions::default()
            };
            let request_id = engine.send_prompt(text, options).await?;
            tracing::debug!(request_id = %request_id, "Prompt sent");
        }
        ReplayStep::Abort => {
            engine.abort_current().await?;
        }
        ReplayStep::NewSession => {
            engine.create_session().await?;
        }
        ReplayStep::SwitchSession { session_id } => engine.switch_session(session_id).await?,
        ReplayStep::Scope { scope } => engine.set_scope(scope).await,
        ReplayStep::Wait { ms } => tokio::time::sleep(Duration::from_millis(ms)).await,
        ReplayStep::Server { frame } => engine.receive(frame).await,
    }
    Ok(())
}

fn label(msg: &Message) -> String {
    match &msg.kind {
        MessageKind::Prompt => "you".to_string(),
        MessageKind::StreamingPlaceholder => "...".to_string(),
        MessageKind::Response => msg.agent_ref.clone().unwrap_or_else(|| "agent".to_string()),
        MessageKind::ToolCall { name } => format!("tool call {}", name),
        MessageKind::ToolResult { name } => format!("tool result {}", name),
    }
}

async fn replay(cli_config: &ConfigService, history_dir: PathBuf, script: &Path, model: String) -> anyhow::Result<()> {
    let content = tokio::fs::read_to_string(script)
        .await
        .with_context(|| format!("Failed to read replay script {}", script.display()))?;

    let config = cli_config.get_config_clone();
    let grace = config.metrics.grace_window_ms;
    let store = Arc::new(FileHistoryStore::new(history_dir));
    let (reply_tx, mut reply_rx) = mpsc::unbounded_channel();
    let transport = Arc::new(LoopbackTransport {
        history: store.clone(),
        replies: reply_tx,
    });
    let mut engine = ChatEngine::new(config, transport, store)?.with_default_model(model);

    for (index, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let step: ReplayStep = serde_json::from_str(line)
            .with_context(|| format!("{}:{}: invalid replay step", script.display(), index + 1))?;

        if let Err(e) = apply_step(&mut engine, step).await {
            tracing::warn!(line = index + 1, error = %e, "Replay step rejected");
        }
        while let Ok(reply) = reply_rx.try_recv() {
            engine.receive(reply).await;
        }
        engine.drain_deferred().await;
    }

    // Let outstanding metrics windows (and their retries) run out
    tokio::time::sleep(Duration::from_millis(grace + 10)).await;
    while engine.drain_deferred().await > 0 {
        tokio::time::sleep(Duration::from_millis(grace + 10)).await;
    }

    println!();
    for msg in engine.messages() {
        println!("{:>20} | {}", label(msg), msg.content);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => ConfigService::with_path(path)?,
        None => ConfigService::new()?,
    };
    tracing::debug!(path = %config.path().display(), "Configuration loaded");
    let history_dir = match cli.history_dir {
        Some(dir) => dir,
        None => config.history_dir()?,
    };

    match cli.command {
        Command::Replay { script, model } => replay(&config, history_dir, &script, model).await,
        Command::Sessions { agent_id } => {
            let store = FileHistoryStore::new(history_dir);
            for summary in store.list_sessions(&agent_id).await? {
                println!(
                    "{}  {}  {:>4} messages  {}",
                    summary.last_updated.format("%Y-%m-%d %H:%M"),
                    summary.id,
                    summary.message_count,
                    summary.title.as_deref().unwrap_or("(untitled)")
                );
            }
            Ok(())
        }
    }
}
