//! Request Tracker
//!
//! Owns the pending-request set, the immutable request→agent map and the
//! per-request lifecycle records. Several agents may have requests in flight
//! at the same time; the one-pending-prompt-per-agent rule is enforced by the
//! caller, not here.
//!
//! Aborted and failed requests are tombstoned for a configurable TTL so late
//! events for them can be recognized and dropped.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};

use agent_chat_core::{AgentId, RequestId, ResponseId};

use crate::models::request::RequestRecord;

/// A terminated request whose late events must be swallowed
#[derive(Debug, Clone)]
struct Tombstone {
    expires_at: DateTime<Utc>,
    /// Response ids known to belong to the request
    response_ids: Vec<ResponseId>,
}

#[derive(Debug, Default)]
pub struct RequestTracker {
    /// request → owning agent, for requests still in flight
    owners: HashMap<RequestId, AgentId>,
    /// Pending request ids in submission order
    pending: Vec<RequestId>,
    /// Lifecycle records; outlive `owners` until metrics are reported
    records: HashMap<RequestId, RequestRecord>,
    tombstones: HashMap<RequestId, Tombstone>,
}

impl RequestTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new in-flight request.
    ///
    /// No-op returning `false` when the id is already tracked or tombstoned.
    pub fn begin(&mut self, request_id: &str, agent_id: &str, now: DateTime<Utc>) -> bool {
        if self.owners.contains_key(request_id)
            || self.records.contains_key(request_id)
            || self.tombstones.contains_key(request_id)
        {
            return false;
        }
        self.owners.insert(request_id.to_string(), agent_id.to_string());
        self.pending.push(request_id.to_string());
        self.records.insert(
            request_id.to_string(),
            RequestRecord::new(request_id, agent_id, now),
        );
        true
    }

    /// Owning agent of an in-flight request
    pub fn resolve(&self, request_id: &str) -> Option<&AgentId> {
        self.owners.get(request_id)
    }

    /// Owning agent of a request that may already have terminated but whose
    /// record is still kept for metrics.
    pub fn resolve_any(&self, request_id: &str) -> Option<&AgentId> {
        self.resolve(request_id)
            .or_else(|| self.records.get(request_id).map(|r| &r.agent_id))
    }

    /// Remove a request from the pending set and the ownership map.
    ///
    /// The record is kept; see [`RequestTracker::take_record`].
    pub fn end(&mut self, request_id: &str) -> bool {
        self.pending.retain(|id| id != request_id);
        self.owners.remove(request_id).is_some()
    }

    pub fn is_pending(&self, request_id: &str) -> bool {
        self.owners.contains_key(request_id)
    }

    pub fn has_pending_for(&self, agent_id: &str) -> bool {
        self.owners.values().any(|owner| owner == agent_id)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn pending_ids(&self) -> &[RequestId] {
        &self.pending
    }

    /// Most recently submitted pending request of an agent
    pub fn latest_pending_for(&self, agent_id: &str) -> Option<&RequestId> {
        self.pending
            .iter()
            .rev()
            .find(|id| self.owners.get(*id).map(String::as_str) == Some(agent_id))
    }

    /// Most recently submitted pending request of any agent
    pub fn latest_pending(&self) -> Option<&RequestId> {
        self.pending.last()
    }

    /// Pending requests of an agent, oldest first
    pub fn pending_for(&self, agent_id: &str) -> Vec<RequestId> {
        self.pending
            .iter()
            .filter(|id| self.owners.get(*id).map(String::as_str) == Some(agent_id))
            .cloned()
            .collect()
    }

    pub fn record(&self, request_id: &str) -> Option<&RequestRecord> {
        self.records.get(request_id)
    }

    pub fn record_mut(&mut self, request_id: &str) -> Option<&mut RequestRecord> {
        self.records.get_mut(request_id)
    }

    /// Request id of the record that finalized as `response_id`
    pub fn request_for_response(&self, response_id: &str) -> Option<&RequestId> {
        self.records
            .values()
            .find(|r| r.response_id.as_deref() == Some(response_id))
            .map(|r| &r.request_id)
    }

    /// Remove and return a record once its metrics have been reported
    pub fn take_record(&mut self, request_id: &str) -> Option<RequestRecord> {
        self.records.remove(request_id)
    }

    /// The most recently completed request still waiting for token usage
    pub fn latest_awaiting_usage(&self) -> Option<&RequestId> {
        self.records
            .values()
            .filter(|r| r.is_completed() && r.token_usage.is_none())
            .max_by_key(|r| r.completed_at)
            .map(|r| &r.request_id)
    }

    /// Tombstone a terminated request for `ttl`.
    pub fn tombstone(
        &mut self,
        request_id: &str,
        response_ids: Vec<ResponseId>,
        now: DateTime<Utc>,
        ttl: Duration,
    ) {
        self.tombstones.insert(
            request_id.to_string(),
            Tombstone {
                expires_at: now + ttl,
                response_ids,
            },
        );
    }

    pub fn is_tombstoned(&self, request_id: &str) -> bool {
        self.tombstones.contains_key(request_id)
    }

    /// Whether a response id is known to belong to a tombstoned request
    pub fn is_tombstoned_response(&self, response_id: &str) -> bool {
        self.tombstones
            .values()
            .any(|t| t.response_ids.iter().any(|id| id == response_id))
    }

    /// Attribute an uncorrelated response id to the most recent tombstone that
    /// never saw a response, so the rest of its stream is dropped too.
    pub fn claim_unlinked_tombstone(&mut self, response_id: &str) -> Option<RequestId> {
        let (request_id, tombstone) = self
            .tombstones
            .iter_mut()
            .filter(|(_, t)| t.response_ids.is_empty())
            .max_by_key(|(_, t)| t.expires_at)?;
        tombstone.response_ids.push(response_id.to_string());
        Some(request_id.clone())
    }

    /// Forget tombstones whose TTL has elapsed
    pub fn purge_expired(&mut self, now: DateTime<Utc>) {
        self.tombstones.retain(|_, t| t.expires_at > now);
    }
}
