//! Conversation Data Model
//!
//! Messages and sessions as they travel between the chat engine, the backend
//! and the history store. A message's lifecycle state is carried by its
//! [`MessageKind`] variant rather than by side flags, so every consumer has to
//! handle each state explicitly.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifier of an agent (one conversational persona with its own history).
pub type AgentId = String;
/// Client-assigned identifier of a submitted prompt.
pub type RequestId = String;
/// Transport-assigned identifier of a streamed answer. May differ from the request id.
pub type ResponseId = String;
/// Identifier of one saved conversation thread of an agent.
pub type SessionId = String;

/// What a message is, and where it is in its lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageKind {
    /// Text the user submitted
    Prompt,
    /// Provisional entry shown between submission and the first chunk
    StreamingPlaceholder,
    /// Answer text from the backend (streaming or finalized)
    Response,
    /// The backend announced a tool invocation
    ToolCall { name: String },
    /// Output of a tool the backend invoked
    ToolResult { name: String },
}

/// Context-window usage attached to a finalized response.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ContextUsage {
    pub prompt_tokens: u64,
    pub max_context: u64,
    pub usage_percent: f64,
}

/// A single entry of a conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    #[serde(flatten)]
    pub kind: MessageKind,
    pub content: String,
    /// Owning agent. Never reassigned once set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_ref: Option<AgentId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<RequestId>,
    #[serde(default)]
    pub is_streaming: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_usage: Option<ContextUsage>,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    fn new(id: impl Into<String>, kind: MessageKind, content: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            kind,
            content: content.into(),
            agent_ref: None,
            request_id: None,
            is_streaming: false,
            context_usage: None,
            timestamp,
        }
    }

    /// A prompt submitted by the user
    pub fn prompt(id: impl Into<String>, content: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self::new(id, MessageKind::Prompt, content, timestamp)
    }

    /// The "Thinking…" entry created on submission
    pub fn placeholder(id: impl Into<String>, content: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        let mut msg = Self::new(id, MessageKind::StreamingPlaceholder, content, timestamp);
        msg.is_streaming = true;
        msg
    }

    /// A response that is still receiving chunks
    pub fn streaming_response(id: impl Into<String>, content: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        let mut msg = Self::new(id, MessageKind::Response, content, timestamp);
        msg.is_streaming = true;
        msg
    }

    /// A finalized response
    pub fn response(id: impl Into<String>, content: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self::new(id, MessageKind::Response, content, timestamp)
    }

    pub fn tool_call(
        id: impl Into<String>,
        name: impl Into<String>,
        content: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self::new(id, MessageKind::ToolCall { name: name.into() }, content, timestamp)
    }

    pub fn tool_result(
        id: impl Into<String>,
        name: impl Into<String>,
        content: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self::new(id, MessageKind::ToolResult { name: name.into() }, content, timestamp)
    }

    /// Builder: set the owning agent
    pub fn with_agent(mut self, agent_id: impl Into<AgentId>) -> Self {
        self.agent_ref = Some(agent_id.into());
        self
    }

    /// Builder: set the request this message belongs to
    pub fn with_request(mut self, request_id: impl Into<RequestId>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn is_placeholder(&self) -> bool {
        matches!(self.kind, MessageKind::StreamingPlaceholder)
    }

    pub fn is_tool_call(&self) -> bool {
        matches!(self.kind, MessageKind::ToolCall { .. })
    }

    pub fn is_prompt(&self) -> bool {
        matches!(self.kind, MessageKind::Prompt)
    }

    /// Settled messages are the ones worth persisting: not a placeholder and
    /// not a response that is still streaming.
    pub fn is_settled(&self) -> bool {
        !self.is_placeholder() && !self.is_streaming
    }

    pub fn belongs_to_request(&self, request_id: &str) -> bool {
        self.request_id.as_deref() == Some(request_id)
    }
}

/// One saved conversation thread scoped to a single agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: SessionId,
    pub agent_id: AgentId,
    /// External context (project/container) the session was held in
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(default)]
    pub messages: Vec<Message>,
    pub last_updated: DateTime<Utc>,
}

impl Session {
    pub fn new(id: impl Into<SessionId>, agent_id: impl Into<AgentId>, last_updated: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            agent_id: agent_id.into(),
            scope: None,
            messages: Vec::new(),
            last_updated,
        }
    }

    /// Build a listing entry for this session
    pub fn summary(&self) -> SessionSummary {
        let title = self
            .messages
            .iter()
            .find(|m| m.is_prompt())
            .map(|m| truncate_title(&m.content));
        SessionSummary {
            id: self.id.clone(),
            agent_id: self.agent_id.clone(),
            title,
            message_count: self.messages.len(),
            last_updated: self.last_updated,
        }
    }
}

const TITLE_MAX_CHARS: usize = 60;

fn truncate_title(text: &str) -> String {
    let line = text.lines().next().unwrap_or("").trim();
    if line.chars().count() <= TITLE_MAX_CHARS {
        line.to_string()
    } else {
        let cut: String = line.chars().take(TITLE_MAX_CHARS).collect();
        format!("{}...", cut)
    }
}

/// Listing entry for an agent's sessions
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub id: SessionId,
    pub agent_id: AgentId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub message_count: usize,
    pub last_updated: DateTime<Utc>,
}
