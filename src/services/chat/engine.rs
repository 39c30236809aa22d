//! Chat Engine
//!
//! Async shell around the conversation reducer. The engine owns the
//! [`ConversationState`], reduces one event at a time and performs the
//! resulting effects against the injected transport and history store.
//!
//! Deferred metrics windows run as spawned timer tasks that post
//! `MetricsWindowElapsed` back into the engine's own queue, so they are
//! reduced in order with everything else.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use agent_chat_core::{decode_server_event, AgentId, ClientEvent, Message, RequestId, ServerEvent, SessionId};

use crate::models::settings::EngineConfig;
use crate::storage::history::HistoryStore;
use crate::utils::error::{AppError, AppResult};

use super::reducer::{reduce, ConversationState, Effect, EngineEvent, PromptSubmission};
use super::transport::ChatTransport;

const DEFAULT_MODEL: &str = "default";

/// Per-prompt options forwarded with `sendChatPrompt`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PromptOptions {
    /// Overrides the engine's default model
    pub model: Option<String>,
    pub thinking_tokens: u32,
    pub requested_tools: Vec<String>,
    pub attributes: Map<String, Value>,
}

/// Performs reducer effects against the outside world
struct EffectRunner {
    transport: Arc<dyn ChatTransport>,
    history: Arc<dyn HistoryStore>,
    deferred_tx: mpsc::UnboundedSender<EngineEvent>,
}

pub struct ChatEngine {
    state: ConversationState,
    runner: EffectRunner,
    default_model: String,
    deferred_rx: mpsc::UnboundedReceiver<EngineEvent>,
}

impl ChatEngine {
    pub fn new(
        config: EngineConfig,
        transport: Arc<dyn ChatTransport>,
        history: Arc<dyn HistoryStore>,
    ) -> AppResult<Self> {
        let state = ConversationState::new(config)?;
        let (deferred_tx, deferred_rx) = mpsc::unbounded_channel();
        Ok(Self {
            state,
            runner: EffectRunner {
                transport,
                history,
                deferred_tx,
            },
            default_model: DEFAULT_MODEL.to_string(),
            deferred_rx,
        })
    }

    /// Builder: model used when a prompt does not name one
    pub fn with_default_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = model.into();
        self
    }

    pub fn state(&self) -> &ConversationState {
        &self.state
    }

    pub fn config(&self) -> &EngineConfig {
        self.state.config()
    }

    /// The visible conversation
    pub fn messages(&self) -> &[Message] {
        self.state.messages()
    }

    pub fn active_agent(&self) -> Option<&AgentId> {
        self.state.active_agent()
    }

    /// Reduce one event now and perform its effects
    pub async fn handle(&mut self, event: EngineEvent) {
        self.handle_at(event, Utc::now()).await;
    }

    /// Reduce one event at an explicit time and perform its effects
    pub async fn handle_at(&mut self, event: EngineEvent, now: DateTime<Utc>) {
        debug!(event = event.name(), "Reducing event");
        let effects = reduce(&mut self.state, event, now);
        for effect in effects {
            self.runner.execute(effect).await;
        }
    }

    /// Feed one backend event
    pub async fn receive(&mut self, event: ServerEvent) {
        self.handle(EngineEvent::Server(event)).await;
    }

    /// Decode and feed one raw JSON frame from the backend
    pub async fn receive_frame(&mut self, frame: &str) -> AppResult<()> {
        let event = decode_server_event(frame)?;
        self.receive(event).await;
        Ok(())
    }

    /// Submit a prompt for the active agent
    pub async fn send_prompt(&mut self, prompt: impl Into<String>, options: PromptOptions) -> AppResult<RequestId> {
        let prompt = prompt.into();
        if prompt.trim().is_empty() {
            return Err(AppError::validation("Prompt cannot be empty"));
        }
        let agent_id = self
            .state
            .active_agent()
            .cloned()
            .ok_or_else(|| AppError::validation("No agent selected"))?;
        if self.state.tracker().has_pending_for(&agent_id) {
            return Err(AppError::validation(format!(
                "Agent {} already has a prompt in flight",
                agent_id
            )));
        }

        let request_id = Uuid::new_v4().to_string();
        let submission = PromptSubmission {
            request_id: request_id.clone(),
            prompt,
            model: options.model.unwrap_or_else(|| self.default_model.clone()),
            thinking_tokens: options.thinking_tokens,
            requested_tools: options.requested_tools,
            attributes: options.attributes,
        };
        self.handle(EngineEvent::SubmitPrompt(submission)).await;
        Ok(request_id)
    }

    /// Abort an in-flight request
    pub async fn abort(&mut self, request_id: &str) -> AppResult<()> {
        if !self.state.tracker().is_pending(request_id) {
            return Err(AppError::not_found(format!("No pending request {}", request_id)));
        }
        self.handle(EngineEvent::Abort {
            request_id: request_id.to_string(),
        })
        .await;
        Ok(())
    }

    /// Abort whatever request is in focus
    pub async fn abort_current(&mut self) -> AppResult<RequestId> {
        let request_id = self
            .state
            .current_request()
            .cloned()
            .ok_or_else(|| AppError::not_found("No request in flight"))?;
        self.abort(&request_id).await?;
        Ok(request_id)
    }

    pub async fn select_agent(&mut self, agent_id: impl Into<AgentId>) -> AppResult<()> {
        let agent_id = agent_id.into();
        if agent_id.trim().is_empty() {
            return Err(AppError::validation("Agent id cannot be empty"));
        }
        self.handle(EngineEvent::SelectAgent { agent_id }).await;
        Ok(())
    }

    pub async fn set_scope(&mut self, scope: Option<String>) {
        self.handle(EngineEvent::SetScope { scope }).await;
    }

    pub async fn switch_session(&mut self, session_id: impl Into<SessionId>) -> AppResult<()> {
        if self.state.active_agent().is_none() {
            return Err(AppError::validation("No agent selected"));
        }
        self.handle(EngineEvent::SwitchSession {
            session_id: session_id.into(),
        })
        .await;
        Ok(())
    }

    /// Start a fresh session for the active agent
    pub async fn create_session(&mut self) -> AppResult<SessionId> {
        if self.state.active_agent().is_none() {
            return Err(AppError::validation("No agent selected"));
        }
        let session_id = Uuid::new_v4().to_string();
        self.handle(EngineEvent::CreateSession {
            session_id: session_id.clone(),
        })
        .await;
        Ok(session_id)
    }

    /// Wait for the next deferred event (an elapsed metrics window)
    pub async fn next_deferred(&mut self) -> Option<EngineEvent> {
        self.deferred_rx.recv().await
    }

    /// Reduce every deferred event that is already due, without waiting
    pub async fn drain_deferred(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(event) = self.deferred_rx.try_recv() {
            self.handle(event).await;
            handled += 1;
        }
        handled
    }

    /// Process events until the inbound channel closes
    pub async fn run(mut self, mut inbound: mpsc::Receiver<EngineEvent>) -> Self {
        info!("Chat engine started");
        loop {
            tokio::select! {
                event = inbound.recv() => match event {
                    Some(event) => self.handle(event).await,
                    None => break,
                },
                Some(event) = self.deferred_rx.recv() => self.handle(event).await,
            }
        }
        info!("Inbound channel closed, chat engine stopped");
        self
    }
}

impl EffectRunner {
    async fn execute(&self, effect: Effect) {
        match effect {
            Effect::Send(event) => self.send(event).await,
            Effect::PersistSession(session) => {
                if let Err(e) = self.history.save_session(&session).await {
                    warn!(agent_id = %session.agent_id, session_id = %session.id, error = %e, "Failed to persist session");
                }
            }
            Effect::FileForeignResponse {
                agent_id,
                session_id,
                messages,
            } => {
                if let Err(e) = self
                    .history
                    .append_messages(&agent_id, &session_id, &messages)
                    .await
                {
                    warn!(agent_id = %agent_id, session_id = %session_id, error = %e, "Failed to file background response");
                }
            }
            Effect::ScheduleMetrics { response_id, delay_ms } => {
                let tx = self.deferred_tx.clone();
                tokio::spawn(async move {
                    if delay_ms > 0 {
                        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                    }
                    let _ = tx.send(EngineEvent::MetricsWindowElapsed { response_id });
                });
            }
            Effect::ReportMetrics(report) => {
                info!(
                    response_id = %report.response_id,
                    agent_id = %report.agent_id,
                    latency_ms = ?report.latency_ms,
                    total_ms = report.total_ms,
                    total_bytes = report.total_bytes,
                    streamed_bytes = report.streamed_bytes,
                    confidence = report.confidence,
                    "Response metrics"
                );
                self.send(ClientEvent::AgentStatusMessage {
                    agent_id: report.agent_id.clone(),
                    text: report.to_string(),
                })
                .await;
            }
        }
    }

    async fn send(&self, event: ClientEvent) {
        if let Err(e) = self.transport.send(event).await {
            warn!(error = %e, "Failed to send event to backend");
        }
    }
}
