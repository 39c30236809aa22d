//! Request Models
//!
//! Bookkeeping for one submitted prompt, from submission until its metrics
//! report has been emitted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use agent_chat_core::{AgentId, Message, RequestId, ResponseId, TokenUsage};

/// Lifecycle record of one in-flight (or just-completed) request
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RequestRecord {
    pub request_id: RequestId,
    /// Owning agent, fixed at submission
    pub agent_id: AgentId,
    pub start_time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_id: Option<ResponseId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_chunk_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_chunk_time: Option<DateTime<Utc>>,
    /// When the final response was processed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// UTF-8 bytes of streamed content
    pub bytes_received: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_usage: Option<TokenUsage>,
    /// Prompt message, detached here when the visible list is cleared mid-flight
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt: Option<Message>,
    /// Grace windows already spent waiting for token usage
    pub metrics_attempts: u32,
}

impl RequestRecord {
    pub fn new(request_id: impl Into<RequestId>, agent_id: impl Into<AgentId>, start_time: DateTime<Utc>) -> Self {
        Self {
            request_id: request_id.into(),
            agent_id: agent_id.into(),
            start_time,
            response_id: None,
            first_chunk_time: None,
            last_chunk_time: None,
            completed_at: None,
            bytes_received: 0,
            token_usage: None,
            prompt: None,
            metrics_attempts: 0,
        }
    }

    /// Record a chunk arrival
    pub fn mark_chunk(&mut self, bytes: usize, at: DateTime<Utc>) {
        self.bytes_received += bytes;
        if self.first_chunk_time.is_none() {
            self.first_chunk_time = Some(at);
        }
        self.last_chunk_time = Some(at);
    }

    /// Forget chunk marks that were credited to this request by mistake
    pub fn clear_chunk_marks(&mut self) {
        self.first_chunk_time = None;
        self.last_chunk_time = None;
        self.bytes_received = 0;
        self.response_id = None;
    }

    /// Take over the marks of a stream that turned out to be ours
    pub fn absorb_chunks(
        &mut self,
        bytes: usize,
        first: Option<DateTime<Utc>>,
        last: Option<DateTime<Utc>>,
    ) {
        self.bytes_received += bytes;
        self.first_chunk_time = match (self.first_chunk_time, first) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        self.last_chunk_time = match (self.last_chunk_time, last) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
    }

    pub fn is_completed(&self) -> bool {
        self.completed_at.is_some()
    }
}
