//! Stream Accumulator
//!
//! Buffers chunk text per response id, records chunk timing and byte counts,
//! and keeps the response→request links learned from the backend. The
//! visible message for a stream always mirrors the full raw text collected so
//! far.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use agent_chat_core::{AgentId, Message, MessageKind, RequestId, ResponseId};

/// Accumulated state of one response stream
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamStats {
    pub request_id: Option<RequestId>,
    /// Raw concatenated chunk text (final content once finished)
    pub text: String,
    /// UTF-8 bytes received through chunks
    pub bytes: usize,
    pub first_chunk_at: Option<DateTime<Utc>>,
    pub last_chunk_at: Option<DateTime<Utc>>,
}

/// Where a chunk ended up in the visible message list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkPlacement {
    /// The message with the response id was updated
    Updated,
    /// The request's placeholder became the streaming response
    ReplacedPlaceholder,
    /// A trailing tool-call announcement was superseded
    ReplacedToolCall,
    /// No target existed; a new message was appended
    Appended,
}

#[derive(Debug, Default)]
pub struct StreamAccumulator {
    /// Streams still receiving chunks
    open: HashMap<ResponseId, StreamStats>,
    /// Finalized streams waiting for their metrics window
    completed: HashMap<ResponseId, StreamStats>,
    links: HashMap<ResponseId, RequestId>,
}

impl StreamAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Associate a response id with a request
    pub fn link(&mut self, response_id: &str, request_id: &str) {
        self.links
            .insert(response_id.to_string(), request_id.to_string());
        if let Some(stats) = self.open.get_mut(response_id) {
            stats.request_id = Some(request_id.to_string());
        }
    }

    pub fn request_for(&self, response_id: &str) -> Option<&RequestId> {
        self.links.get(response_id)
    }

    /// The stream a request currently has in progress, if any
    pub fn open_stream(&self, request_id: &str) -> Option<(&ResponseId, &StreamStats)> {
        self.open
            .iter()
            .find(|(_, s)| s.request_id.as_deref() == Some(request_id))
    }

    /// State of a stream that is still receiving chunks
    pub fn open_stats(&self, response_id: &str) -> Option<&StreamStats> {
        self.open.get(response_id)
    }

    pub fn has_open_stream(&self, request_id: &str) -> bool {
        self.open_stream(request_id).is_some()
    }

    /// Append a chunk and return the stream's state afterwards
    pub fn push_chunk(&mut self, response_id: &str, chunk: &str, now: DateTime<Utc>) -> &StreamStats {
        let request_id = self.links.get(response_id).cloned();
        let stats = self
            .open
            .entry(response_id.to_string())
            .or_insert_with(|| StreamStats {
                request_id,
                ..StreamStats::default()
            });
        stats.text.push_str(chunk);
        stats.bytes += chunk.len();
        stats.first_chunk_at.get_or_insert(now);
        stats.last_chunk_at = Some(now);
        stats
    }

    /// Raw text collected for a response, open or finished
    pub fn text(&self, response_id: &str) -> Option<&str> {
        self.open
            .get(response_id)
            .or_else(|| self.completed.get(response_id))
            .map(|s| s.text.as_str())
    }

    /// Close a stream. A non-empty `final_content` replaces the accumulated
    /// text, since the backend's final payload is authoritative.
    pub fn finish(&mut self, response_id: &str, final_content: &str) {
        let mut stats = self.open.remove(response_id).unwrap_or_else(|| StreamStats {
            request_id: self.links.get(response_id).cloned(),
            ..StreamStats::default()
        });
        if !final_content.is_empty() {
            stats.text = final_content.to_string();
        }
        self.completed.insert(response_id.to_string(), stats);
    }

    /// Hand a finished stream over to metrics and forget it
    pub fn take_completed(&mut self, response_id: &str) -> Option<StreamStats> {
        self.links.remove(response_id);
        self.completed.remove(response_id)
    }

    /// Discard every stream of a request; returns the response ids it had.
    pub fn drop_request(&mut self, request_id: &str) -> Vec<ResponseId> {
        let response_ids: Vec<ResponseId> = self
            .links
            .iter()
            .filter(|(_, r)| r.as_str() == request_id)
            .map(|(resp, _)| resp.clone())
            .collect();
        for id in &response_ids {
            self.links.remove(id);
            self.open.remove(id);
            self.completed.remove(id);
        }
        response_ids
    }

    /// Mirror a stream's full text into the visible message list.
    ///
    /// Target order: the message carrying the response id, then the
    /// request's placeholder, then a trailing tool-call announcement of the
    /// same (or an unknown) request. Otherwise a new message is appended.
    pub fn place_chunk(
        &self,
        messages: &mut Vec<Message>,
        response_id: &str,
        request_id: Option<&str>,
        agent_id: Option<&AgentId>,
        full_text: &str,
        now: DateTime<Utc>,
    ) -> ChunkPlacement {
        if let Some(msg) = messages.iter_mut().find(|m| m.id == response_id) {
            let was_tool_call = msg.is_tool_call();
            if was_tool_call {
                // The backend reused the announcement's id for the answer
                msg.kind = MessageKind::Response;
                msg.timestamp = now;
            }
            msg.content = full_text.to_string();
            msg.is_streaming = true;
            return if was_tool_call {
                ChunkPlacement::ReplacedToolCall
            } else {
                ChunkPlacement::Updated
            };
        }

        let streaming = |timestamp: DateTime<Utc>| {
            let mut msg = Message::streaming_response(response_id, full_text, timestamp);
            msg.agent_ref = agent_id.cloned();
            msg.request_id = request_id.map(str::to_string);
            msg
        };

        if let Some(rid) = request_id {
            if let Some(idx) = messages
                .iter()
                .position(|m| m.is_placeholder() && m.belongs_to_request(rid))
            {
                let timestamp = messages[idx].timestamp;
                messages[idx] = streaming(timestamp);
                return ChunkPlacement::ReplacedPlaceholder;
            }
        }

        if let Some(last) = messages.last_mut() {
            let same_request = match (request_id, last.request_id.as_deref()) {
                (Some(rid), Some(owner)) => rid == owner,
                _ => true,
            };
            if last.is_tool_call() && same_request {
                *last = streaming(now);
                return ChunkPlacement::ReplacedToolCall;
            }
        }

        messages.push(streaming(now));
        ChunkPlacement::Appended
    }
}
