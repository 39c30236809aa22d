//! Chat Wire Protocol
//!
//! Event types exchanged with the chat backend. Both directions use the same
//! frame shape: `{"event": "<name>", "payload": {...}}` with camelCase field
//! names, one frame per JSON line.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{CoreError, CoreResult};
use crate::message::{AgentId, Message, RequestId, ResponseId, SessionId, SessionSummary};

/// Events sent from the client to the backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(
    tag = "event",
    content = "payload",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum ClientEvent {
    /// Submit a prompt for an agent
    SendChatPrompt {
        request_id: RequestId,
        prompt: String,
        model: String,
        agent_id: AgentId,
        #[serde(default)]
        thinking_tokens: u32,
        #[serde(default)]
        requested_tools: Vec<String>,
        /// Agent/user attribute fields forwarded verbatim
        #[serde(default, skip_serializing_if = "Map::is_empty")]
        attributes: Map<String, Value>,
    },

    /// Best-effort cancellation of an in-flight prompt
    AbortChatPrompt { request_id: RequestId },

    GetAgentSessions { agent_id: AgentId },

    SetCurrentSession {
        agent_id: AgentId,
        session_id: SessionId,
    },

    CreateNewSession { agent_id: AgentId },

    LoadSessionHistory {
        agent_id: AgentId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<SessionId>,
    },

    /// Forward a computed metrics report for display
    AgentStatusMessage { agent_id: AgentId, text: String },
}

/// Events received from the backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(
    tag = "event",
    content = "payload",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum ServerEvent {
    /// Streaming fragment of response `id`
    ChatResponseChunk { id: ResponseId, chunk: String },

    /// Finalization of response `id`
    ChatResponse {
        id: ResponseId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<RequestId>,
        #[serde(default)]
        content: String,
        timestamp: DateTime<Utc>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tool_name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tool_result: Option<String>,
    },

    /// Terminal failure of the current request
    ChatError(String),

    /// Abort acknowledged
    ChatAborted,

    /// Usage/performance side channel
    TokenUsage(TokenUsage),

    /// Explicit first-chunk timing hint
    FirstChunkTime {
        request_id: RequestId,
        response_id: ResponseId,
        timestamp: DateTime<Utc>,
    },

    AgentSessions {
        agent_id: AgentId,
        sessions: Vec<SessionSummary>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        current_session_id: Option<SessionId>,
    },

    SessionHistory {
        agent_id: AgentId,
        session_id: SessionId,
        #[serde(default)]
        messages: Vec<Message>,
    },

    NewSessionCreated {
        agent_id: AgentId,
        session_id: SessionId,
    },
}

/// Token usage report. Its timing relative to the final response is not
/// guaranteed, and `request_id` may be missing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<RequestId>,
    pub prompt_tokens: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_tokens: Option<u64>,
    pub max_context: u64,
    pub usage_percent: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timings: Option<Timings>,
}

/// Backend-side performance numbers
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Timings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_ms: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub predicted_ms: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub predicted_per_second: Option<f64>,
}

impl ServerEvent {
    /// Wire name of the event, for logging
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::ChatResponseChunk { .. } => "chatResponseChunk",
            ServerEvent::ChatResponse { .. } => "chatResponse",
            ServerEvent::ChatError(_) => "chatError",
            ServerEvent::ChatAborted => "chatAborted",
            ServerEvent::TokenUsage(_) => "tokenUsage",
            ServerEvent::FirstChunkTime { .. } => "firstChunkTime",
            ServerEvent::AgentSessions { .. } => "agentSessions",
            ServerEvent::SessionHistory { .. } => "sessionHistory",
            ServerEvent::NewSessionCreated { .. } => "newSessionCreated",
        }
    }
}

/// Decode one JSON frame received from the backend.
pub fn decode_server_event(line: &str) -> CoreResult<ServerEvent> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Err(CoreError::parse("empty frame"));
    }
    serde_json::from_str(trimmed).map_err(|e| CoreError::parse(format!("invalid server event: {}", e)))
}

/// Encode a client event as a single JSON line.
pub fn encode_client_event(event: &ClientEvent) -> CoreResult<String> {
    Ok(serde_json::to_string(event)?)
}
