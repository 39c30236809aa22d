//! Conversation State Reducer
//!
//! All engine state lives in one [`ConversationState`]. Every input (user
//! action, backend event, elapsed metrics window) goes through [`reduce`],
//! which mutates the state and returns the side effects to perform. The
//! reducer never performs I/O itself, so event ordering is exactly the order
//! in which events are reduced.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Duration, Utc};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use agent_chat_core::{
    AgentId, ClientEvent, ContextUsage, Message, MessageKind, RequestId, ResponseId, ServerEvent,
    Session, SessionId, SessionSummary, TokenUsage,
};
use agent_chat_tools::content_parser::{is_tool_call_only, parse_final_answer};

use crate::models::metrics::MetricsReport;
use crate::models::settings::EngineConfig;
use crate::utils::error::{AppError, AppResult};

use super::accumulator::StreamAccumulator;
use super::metrics::MetricsCalculator;
use super::router::{Route, RouterState, SessionRouter};
use super::tracker::RequestTracker;

/// Upper bound for tombstone lifetimes
const MAX_TOMBSTONE_TTL_SECS: u64 = 86_400;

/// A prompt accepted by the engine, ready to be submitted for the active agent
#[derive(Debug, Clone, PartialEq)]
pub struct PromptSubmission {
    pub request_id: RequestId,
    pub prompt: String,
    pub model: String,
    pub thinking_tokens: u32,
    pub requested_tools: Vec<String>,
    pub attributes: Map<String, Value>,
}

/// Everything the reducer reacts to
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    SubmitPrompt(PromptSubmission),
    Abort { request_id: RequestId },
    SelectAgent { agent_id: AgentId },
    SetScope { scope: Option<String> },
    SwitchSession { session_id: SessionId },
    CreateSession { session_id: SessionId },
    Server(ServerEvent),
    MetricsWindowElapsed { response_id: ResponseId },
}

impl EngineEvent {
    /// Short name for logging
    pub fn name(&self) -> &'static str {
        match self {
            EngineEvent::SubmitPrompt(_) => "submitPrompt",
            EngineEvent::Abort { .. } => "abort",
            EngineEvent::SelectAgent { .. } => "selectAgent",
            EngineEvent::SetScope { .. } => "setScope",
            EngineEvent::SwitchSession { .. } => "switchSession",
            EngineEvent::CreateSession { .. } => "createSession",
            EngineEvent::Server(event) => event.name(),
            EngineEvent::MetricsWindowElapsed { .. } => "metricsWindowElapsed",
        }
    }
}

impl From<ServerEvent> for EngineEvent {
    fn from(event: ServerEvent) -> Self {
        EngineEvent::Server(event)
    }
}

/// Side effects requested by the reducer
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Send an event to the backend
    Send(ClientEvent),
    /// Save a session wholesale
    PersistSession(Session),
    /// Append messages to an agent's stored session without touching the
    /// visible list
    FileForeignResponse {
        agent_id: AgentId,
        session_id: SessionId,
        messages: Vec<Message>,
    },
    /// Deliver `MetricsWindowElapsed` after `delay_ms`
    ScheduleMetrics { response_id: ResponseId, delay_ms: u64 },
    /// Publish a finished metrics report
    ReportMetrics(MetricsReport),
}

/// Outcome of matching a response id to a request
enum Correlation {
    Request(RequestId),
    /// The response belongs to an aborted or failed request
    Dropped,
    Unknown,
}

/// The single authoritative engine state
#[derive(Debug)]
pub struct ConversationState {
    config: EngineConfig,
    router: SessionRouter,
    tracker: RequestTracker,
    accumulator: StreamAccumulator,
    metrics: MetricsCalculator,
    /// The visible conversation of the active agent
    messages: Vec<Message>,
    /// Response ids whose request ended with a final response, and when
    finalized: HashMap<ResponseId, DateTime<Utc>>,
    /// Locally aborted requests whose backend acknowledgement is outstanding
    abort_acks: VecDeque<RequestId>,
}

impl ConversationState {
    pub fn new(config: EngineConfig) -> AppResult<Self> {
        config.validate().map_err(AppError::validation)?;
        let metrics = MetricsCalculator::new(&config.metrics)?;
        Ok(Self {
            config,
            router: SessionRouter::new(),
            tracker: RequestTracker::new(),
            accumulator: StreamAccumulator::new(),
            metrics,
            messages: Vec::new(),
            finalized: HashMap::new(),
            abort_acks: VecDeque::new(),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn router(&self) -> &SessionRouter {
        &self.router
    }

    pub fn tracker(&self) -> &RequestTracker {
        &self.tracker
    }

    pub fn accumulator(&self) -> &StreamAccumulator {
        &self.accumulator
    }

    pub fn metrics(&self) -> &MetricsCalculator {
        &self.metrics
    }

    pub fn active_agent(&self) -> Option<&AgentId> {
        self.router.active_agent()
    }

    pub fn current_session(&self) -> Option<&SessionId> {
        self.active_agent()
            .and_then(|agent| self.router.current_session(agent))
    }

    pub fn sessions(&self, agent_id: &str) -> &[SessionSummary] {
        self.router.sessions(agent_id)
    }

    /// The request in focus: the active agent's pending request, otherwise
    /// the most recently submitted pending request.
    pub fn current_request(&self) -> Option<&RequestId> {
        self.active_agent()
            .and_then(|agent| self.tracker.latest_pending_for(agent))
            .or_else(|| self.tracker.latest_pending())
    }

    fn tombstone_ttl(&self) -> Duration {
        Duration::seconds(self.config.tombstone_ttl_secs.min(MAX_TOMBSTONE_TTL_SECS) as i64)
    }

    fn is_persistable(&self, msg: &Message) -> bool {
        let pending_prompt = msg.is_prompt()
            && msg
                .request_id
                .as_deref()
                .is_some_and(|rid| self.tracker.is_pending(rid));
        msg.is_settled() && !pending_prompt
    }

    fn persistable(&self) -> Vec<Message> {
        self.messages
            .iter()
            .filter(|m| self.is_persistable(m))
            .cloned()
            .collect()
    }

    /// Snapshot of the visible conversation, only once its history is loaded
    fn snapshot_visible(&mut self, now: DateTime<Utc>) -> Option<Session> {
        let RouterState::Active(agent) = self.router.state().clone() else {
            return None;
        };
        let messages = self.persistable();
        self.router.snapshot(&agent, messages, now)
    }

    fn correlate(&mut self, response_id: &str) -> Correlation {
        if let Some(rid) = self.accumulator.request_for(response_id).cloned() {
            if self.tracker.is_tombstoned(&rid) {
                return Correlation::Dropped;
            }
            return Correlation::Request(rid);
        }
        if self.tracker.is_tombstoned_response(response_id) {
            return Correlation::Dropped;
        }

        let free = |rid: &&RequestId| !self.accumulator.has_open_stream(rid);
        let candidate = self
            .active_agent()
            .and_then(|agent| self.tracker.latest_pending_for(agent))
            .filter(free)
            .or_else(|| match self.tracker.pending_ids() {
                [only] => Some(only).filter(free),
                _ => None,
            })
            .cloned();

        if let Some(rid) = candidate {
            self.accumulator.link(response_id, &rid);
            return Correlation::Request(rid);
        }
        if self.tracker.claim_unlinked_tombstone(response_id).is_some() {
            return Correlation::Dropped;
        }
        Correlation::Unknown
    }

    /// Drop a request's placeholder and freeze its partial stream
    fn settle_request_messages(&mut self, request_id: &str) {
        self.messages
            .retain(|m| !(m.is_placeholder() && m.belongs_to_request(request_id)));
        for msg in self
            .messages
            .iter_mut()
            .filter(|m| m.belongs_to_request(request_id))
        {
            msg.is_streaming = false;
        }
    }

    /// Stop tracking a request for good and swallow its late events
    fn terminate(&mut self, request_id: &str, now: DateTime<Utc>) {
        let ttl = self.tombstone_ttl();
        self.tracker.end(request_id);
        self.tracker.take_record(request_id);
        let response_ids = self.accumulator.drop_request(request_id);
        self.tracker.tombstone(request_id, response_ids, now, ttl);
    }

    /// Link a response to the request the backend named.
    ///
    /// A stream that was matched to another request before the backend said
    /// otherwise is moved: its visible message turns back into that request's
    /// placeholder and its chunk marks go to the named request.
    fn relink(&mut self, response_id: &str, request_id: &str) {
        let guessed = self.accumulator.request_for(response_id).cloned();
        self.accumulator.link(response_id, request_id);
        let Some(guessed) = guessed.filter(|g| g != request_id) else {
            return;
        };
        warn!(response_id = %response_id, guessed = %guessed, request_id = %request_id, "Response was matched to the wrong request, moving it");

        if let Some(idx) = self.messages.iter().position(|m| m.id == response_id) {
            if self.tracker.is_pending(&guessed) {
                let owner = self.tracker.resolve(&guessed).cloned();
                let placeholder = Message::placeholder(
                    placeholder_id(&guessed),
                    &self.config.placeholder_text,
                    self.messages[idx].timestamp,
                );
                self.messages[idx] = tag(placeholder, owner.as_ref(), Some(&guessed));
            } else {
                self.messages.remove(idx);
            }
        }
        if let Some(record) = self.tracker.record_mut(&guessed) {
            record.clear_chunk_marks();
        }

        let stats = self.accumulator.open_stats(response_id).cloned();
        if let Some(record) = self.tracker.record_mut(request_id) {
            if let Some(stats) = stats {
                record.absorb_chunks(stats.bytes, stats.first_chunk_at, stats.last_chunk_at);
            }
            record.response_id = Some(response_id.to_string());
        }
    }

    /// File what is left of a background agent's interrupted request into its
    /// history: the detached prompt, any partial answer and a closing note.
    fn file_interrupted(&mut self, request_id: &str, agent_id: &AgentId, note: Message, now: DateTime<Utc>) -> Effect {
        let rid = request_id.to_string();
        let mut messages: Vec<Message> = self
            .tracker
            .record_mut(request_id)
            .and_then(|r| r.prompt.take())
            .into_iter()
            .collect();
        if let Some((response_id, stats)) = self.accumulator.open_stream(request_id) {
            if !stats.text.is_empty() {
                let partial = Message::response(response_id.clone(), stats.text.clone(), now);
                messages.push(tag(partial, Some(agent_id), Some(&rid)));
            }
        }
        messages.push(tag(note, Some(agent_id), Some(&rid)));

        let session_id = self
            .router
            .ensure_current_session(agent_id, || format!("session-{}", request_id));
        info!(request_id = %request_id, agent_id = %agent_id, session_id = %session_id, "Filed interrupted request for background agent");
        Effect::FileForeignResponse {
            agent_id: agent_id.clone(),
            session_id,
            messages,
        }
    }

    /// Clear the visible list before it is replaced.
    ///
    /// Prompts of pending requests are detached into their records. Settled
    /// messages are saved: wholesale when the history was loaded, appended
    /// when the list was left mid-switch.
    fn flush_outgoing(&mut self, now: DateTime<Utc>) -> Vec<Effect> {
        let Some(agent) = self.active_agent().cloned() else {
            self.messages.clear();
            return Vec::new();
        };

        for msg in self.messages.iter().filter(|m| m.is_prompt()) {
            let Some(rid) = msg.request_id.as_deref() else {
                continue;
            };
            if !self.tracker.is_pending(rid) {
                continue;
            }
            if let Some(record) = self.tracker.record_mut(rid) {
                record.prompt = Some(msg.clone());
            }
        }

        let settled = self.persistable();
        self.messages.clear();
        if settled.is_empty() {
            return Vec::new();
        }

        if matches!(self.router.state(), RouterState::Active(_)) {
            self.router
                .snapshot(&agent, settled, now)
                .map(Effect::PersistSession)
                .into_iter()
                .collect()
        } else {
            let session_id = self
                .router
                .ensure_current_session(&agent, || format!("session-{}", now.timestamp_millis()));
            vec![Effect::FileForeignResponse {
                agent_id: agent,
                session_id,
                messages: settled,
            }]
        }
    }

    /// Put an agent's in-flight requests back on screen
    fn restore_pending(&mut self, agent_id: &str, now: DateTime<Utc>) {
        for rid in self.tracker.pending_for(agent_id) {
            if let Some(prompt) = self.tracker.record_mut(&rid).and_then(|r| r.prompt.take()) {
                self.messages.push(prompt);
            }
            let msg = match self.accumulator.open_stream(&rid) {
                Some((response_id, stats)) => {
                    Message::streaming_response(response_id.clone(), stats.text.clone(), now)
                }
                None => Message::placeholder(placeholder_id(&rid), &self.config.placeholder_text, now),
            };
            self.messages
                .push(msg.with_agent(agent_id).with_request(rid.clone()));
        }
    }
}

fn prompt_id(request_id: &str) -> String {
    format!("prompt-{}", request_id)
}

fn placeholder_id(request_id: &str) -> String {
    format!("placeholder-{}", request_id)
}

fn context_usage_of(usage: &TokenUsage) -> ContextUsage {
    ContextUsage {
        prompt_tokens: usage.prompt_tokens,
        max_context: usage.max_context,
        usage_percent: usage.usage_percent,
    }
}

fn tag(mut msg: Message, agent: Option<&AgentId>, request_id: Option<&RequestId>) -> Message {
    msg.agent_ref = agent.cloned();
    msg.request_id = request_id.cloned();
    msg
}

/// Apply one event to the state
pub fn reduce(state: &mut ConversationState, event: EngineEvent, now: DateTime<Utc>) -> Vec<Effect> {
    state.tracker.purge_expired(now);
    let guard_ttl = state.tombstone_ttl();
    state.finalized.retain(|_, at| *at + guard_ttl > now);

    match event {
        EngineEvent::SubmitPrompt(submission) => on_submit(state, submission, now),
        EngineEvent::Abort { request_id } => on_abort(state, &request_id, true, now),
        EngineEvent::SelectAgent { agent_id } => on_select_agent(state, agent_id, now),
        EngineEvent::SetScope { scope } => on_set_scope(state, scope, now),
        EngineEvent::SwitchSession { session_id } => on_switch_session(state, session_id, now),
        EngineEvent::CreateSession { session_id } => on_create_session(state, session_id, now),
        EngineEvent::MetricsWindowElapsed { response_id } => on_metrics_window(state, response_id, now),
        EngineEvent::Server(event) => match event {
            ServerEvent::ChatResponseChunk { id, chunk } => on_chunk(state, id, chunk, now),
            ServerEvent::ChatResponse {
                id,
                request_id,
                content,
                timestamp,
                tool_name,
                tool_result,
            } => on_response(
                state,
                FinalResponse {
                    id,
                    request_id,
                    content,
                    timestamp,
                    tool_name,
                    tool_result,
                },
                now,
            ),
            ServerEvent::ChatError(message) => on_error(state, message, now),
            ServerEvent::ChatAborted => on_aborted_ack(state, now),
            ServerEvent::TokenUsage(usage) => on_token_usage(state, usage, now),
            ServerEvent::FirstChunkTime {
                request_id,
                response_id,
                timestamp,
            } => on_first_chunk_time(state, request_id, response_id, timestamp),
            ServerEvent::AgentSessions {
                agent_id,
                sessions,
                current_session_id,
            } => on_agent_sessions(state, agent_id, sessions, current_session_id),
            ServerEvent::SessionHistory {
                agent_id,
                session_id,
                messages,
            } => on_session_history(state, agent_id, session_id, messages, now),
            ServerEvent::NewSessionCreated {
                agent_id,
                session_id,
            } => on_new_session_created(state, agent_id, session_id, now),
        },
    }
}

fn on_submit(state: &mut ConversationState, submission: PromptSubmission, now: DateTime<Utc>) -> Vec<Effect> {
    let Some(agent_id) = state.active_agent().cloned() else {
        warn!(request_id = %submission.request_id, "Prompt submitted with no active agent");
        return Vec::new();
    };
    if state.tracker.has_pending_for(&agent_id) {
        warn!(agent_id = %agent_id, "Agent already has a pending prompt");
        return Vec::new();
    }
    let rid = submission.request_id;
    if !state.tracker.begin(&rid, &agent_id, now) {
        debug!(request_id = %rid, "Request id already tracked");
        return Vec::new();
    }
    state
        .router
        .ensure_current_session(&agent_id, || format!("session-{}", rid));

    state.messages.push(
        Message::prompt(prompt_id(&rid), &submission.prompt, now)
            .with_agent(&agent_id)
            .with_request(&rid),
    );
    state.messages.push(
        Message::placeholder(placeholder_id(&rid), &state.config.placeholder_text, now)
            .with_agent(&agent_id)
            .with_request(&rid),
    );

    info!(request_id = %rid, agent_id = %agent_id, "Prompt submitted");
    vec![Effect::Send(ClientEvent::SendChatPrompt {
        request_id: rid,
        prompt: submission.prompt,
        model: submission.model,
        agent_id,
        thinking_tokens: submission.thinking_tokens,
        requested_tools: submission.requested_tools,
        attributes: submission.attributes,
    })]
}

fn on_chunk(state: &mut ConversationState, response_id: ResponseId, chunk: String, now: DateTime<Utc>) -> Vec<Effect> {
    if state.finalized.contains_key(&response_id) {
        debug!(response_id = %response_id, "Dropping chunk for finalized response");
        return Vec::new();
    }
    let request_id = match state.correlate(&response_id) {
        Correlation::Dropped => {
            debug!(response_id = %response_id, "Dropping chunk for terminated request");
            return Vec::new();
        }
        Correlation::Request(rid) => Some(rid),
        Correlation::Unknown => None,
    };

    let full_text = state.accumulator.push_chunk(&response_id, &chunk, now).text.clone();

    let mut owner = None;
    if let Some(rid) = request_id.as_deref() {
        if let Some(record) = state.tracker.record_mut(rid) {
            record.mark_chunk(chunk.len(), now);
            record.response_id = Some(response_id.clone());
        }
        owner = state.tracker.resolve_any(rid).cloned();
    }

    match state.router.route(owner.as_ref()) {
        Route::Foreign(agent_id) => {
            debug!(response_id = %response_id, agent_id = %agent_id, "Buffered chunk for background agent");
        }
        Route::Local => {
            let agent = owner.or_else(|| state.router.active_agent().cloned());
            let placement = state.accumulator.place_chunk(
                &mut state.messages,
                &response_id,
                request_id.as_deref(),
                agent.as_ref(),
                &full_text,
                now,
            );
            debug!(response_id = %response_id, ?placement, "Chunk applied");
        }
    }
    Vec::new()
}

struct FinalResponse {
    id: ResponseId,
    request_id: Option<RequestId>,
    content: String,
    timestamp: DateTime<Utc>,
    tool_name: Option<String>,
    tool_result: Option<String>,
}

/// Swap the streaming target of a response for its final form
fn place_final(messages: &mut Vec<Message>, produced: Vec<Message>, final_msg: Message, request_id: Option<&str>) {
    let target = messages
        .iter()
        .position(|m| m.id == final_msg.id)
        .or_else(|| {
            let rid = request_id?;
            messages
                .iter()
                .position(|m| m.is_placeholder() && m.belongs_to_request(rid))
                .or_else(|| {
                    messages
                        .iter()
                        .rposition(|m| m.is_streaming && m.belongs_to_request(rid))
                })
                .or_else(|| {
                    let last = messages.len().checked_sub(1)?;
                    (messages[last].is_tool_call() && messages[last].belongs_to_request(rid))
                        .then_some(last)
                })
        });

    match target {
        Some(idx) => {
            messages[idx] = final_msg;
            for (offset, msg) in produced.into_iter().enumerate() {
                messages.insert(idx + offset, msg);
            }
        }
        None => {
            messages.extend(produced);
            messages.push(final_msg);
        }
    }
}

fn on_response(state: &mut ConversationState, response: FinalResponse, now: DateTime<Utc>) -> Vec<Effect> {
    let FinalResponse {
        id,
        request_id,
        content,
        timestamp,
        tool_name,
        tool_result,
    } = response;

    if state.finalized.contains_key(&id) {
        debug!(response_id = %id, "Ignoring duplicate final response");
        return Vec::new();
    }

    let request_id = match request_id {
        Some(rid) if state.tracker.is_tombstoned(&rid) => {
            debug!(response_id = %id, request_id = %rid, "Dropping final response for terminated request");
            return Vec::new();
        }
        Some(rid) => {
            state.relink(&id, &rid);
            Some(rid)
        }
        None => match state.correlate(&id) {
            Correlation::Dropped => {
                debug!(response_id = %id, "Dropping final response for terminated request");
                return Vec::new();
            }
            Correlation::Request(rid) => Some(rid),
            Correlation::Unknown => None,
        },
    };

    let raw = if content.is_empty() {
        state.accumulator.text(&id).unwrap_or_default().to_string()
    } else {
        content
    };
    state.accumulator.finish(&id, &raw);

    let owner = request_id
        .as_deref()
        .and_then(|rid| state.tracker.resolve_any(rid))
        .cloned();
    let agent_ref = owner.clone().or_else(|| state.active_agent().cloned());

    let mut produced = Vec::new();
    if let (Some(name), Some(result)) = (tool_name, tool_result) {
        produced.push(tag(
            Message::tool_result(format!("{}-result", id), name, result, timestamp),
            agent_ref.as_ref(),
            request_id.as_ref(),
        ));
    }

    let tool_only = is_tool_call_only(&raw);
    let final_msg = if tool_only.is_only {
        Message::tool_call(&id, tool_only.name.unwrap_or_default(), raw.trim(), timestamp)
    } else {
        let mut msg = Message::response(&id, parse_final_answer(&raw), timestamp);
        msg.context_usage = request_id
            .as_deref()
            .and_then(|rid| state.tracker.record(rid))
            .and_then(|record| record.token_usage.as_ref())
            .map(context_usage_of);
        msg
    };
    let final_msg = tag(final_msg, agent_ref.as_ref(), request_id.as_ref());

    let route = state.router.route(owner.as_ref());
    let mut effects = Vec::new();
    match &route {
        Route::Local => {
            place_final(&mut state.messages, produced, final_msg, request_id.as_deref());
        }
        Route::Foreign(agent_id) => {
            let prompt = request_id
                .as_deref()
                .and_then(|rid| state.tracker.record_mut(rid))
                .and_then(|record| record.prompt.take());
            let mut entry: Vec<Message> = prompt.into_iter().collect();
            entry.extend(produced);
            entry.push(final_msg);

            let session_id = state
                .router
                .ensure_current_session(agent_id, || format!("session-{}", id));
            info!(response_id = %id, agent_id = %agent_id, session_id = %session_id, "Filed response for background agent");
            effects.push(Effect::FileForeignResponse {
                agent_id: agent_id.clone(),
                session_id,
                messages: entry,
            });
        }
    }

    let still_open = tool_only.is_only
        && request_id
            .as_deref()
            .is_some_and(|rid| state.tracker.is_pending(rid));
    if still_open {
        debug!(response_id = %id, "Tool call announced, request stays open");
        return effects;
    }
    state.finalized.insert(id.clone(), now);

    if let Some(rid) = request_id.as_deref() {
        if let Some(record) = state.tracker.record_mut(rid) {
            record.completed_at = Some(now);
            record.response_id = Some(id.clone());
        }
        state.tracker.end(rid);
        if state.tracker.record(rid).is_some() && state.metrics.try_schedule(&id) {
            effects.push(Effect::ScheduleMetrics {
                response_id: id.clone(),
                delay_ms: state.metrics.grace_window_ms(),
            });
        }
    }

    if route == Route::Local {
        if let Some(session) = state.snapshot_visible(now) {
            effects.push(Effect::PersistSession(session));
        }
    }
    effects
}

fn on_error(state: &mut ConversationState, message: String, now: DateTime<Utc>) -> Vec<Effect> {
    let target = state.current_request().cloned();
    warn!(request_id = ?target, error = %message, "Chat request failed");

    let id = match target.as_deref() {
        Some(rid) => format!("error-{}", rid),
        None => format!("error-{}", now.timestamp_millis()),
    };
    let note = Message::response(id, format!("Error: {}", message), now);
    let owner = target
        .as_deref()
        .and_then(|rid| state.tracker.resolve(rid))
        .cloned();

    let mut effects = Vec::new();
    let route = state.router.route(owner.as_ref());
    if let (Some(rid), Route::Foreign(agent_id)) = (target.as_deref(), &route) {
        effects.push(state.file_interrupted(rid, agent_id, note.clone(), now));
    }
    if let Some(rid) = target.as_deref() {
        state.settle_request_messages(rid);
        state.terminate(rid, now);
    }
    if route == Route::Local {
        let active = state.active_agent().cloned();
        state.messages.push(tag(note, active.as_ref(), target.as_ref()));
    }
    effects
}

fn on_abort(state: &mut ConversationState, request_id: &str, local: bool, now: DateTime<Utc>) -> Vec<Effect> {
    if !state.tracker.is_pending(request_id) {
        debug!(request_id = %request_id, "Abort for request that is not pending");
        return Vec::new();
    }
    let owner = state.tracker.resolve(request_id).cloned();
    let sentinel = Message::response(format!("aborted-{}", request_id), &state.config.abort_sentinel, now);

    let mut effects = Vec::new();
    let route = state.router.route(owner.as_ref());
    if let Route::Foreign(agent_id) = &route {
        effects.push(state.file_interrupted(request_id, agent_id, sentinel.clone(), now));
    }

    state.settle_request_messages(request_id);
    state.terminate(request_id, now);

    if route == Route::Local {
        state
            .messages
            .push(tag(sentinel, owner.as_ref(), Some(&request_id.to_string())));
    }

    info!(request_id = %request_id, local, "Request aborted");
    if local {
        state.abort_acks.push_back(request_id.to_string());
        effects.push(Effect::Send(ClientEvent::AbortChatPrompt {
            request_id: request_id.to_string(),
        }));
    }
    effects
}

fn on_aborted_ack(state: &mut ConversationState, now: DateTime<Utc>) -> Vec<Effect> {
    if let Some(rid) = state.abort_acks.pop_front() {
        debug!(request_id = %rid, "Abort acknowledged");
        return Vec::new();
    }
    match state.current_request().cloned() {
        Some(rid) => on_abort(state, &rid, false, now),
        None => {
            debug!("Abort acknowledged with nothing in flight");
            Vec::new()
        }
    }
}

fn on_token_usage(state: &mut ConversationState, usage: TokenUsage, now: DateTime<Utc>) -> Vec<Effect> {
    let target = match usage.request_id.as_deref() {
        Some(rid) if state.tracker.is_tombstoned(rid) => {
            debug!(request_id = %rid, "Dropping token usage for terminated request");
            return Vec::new();
        }
        Some(rid) if state.tracker.record(rid).is_none() => {
            debug!(request_id = %rid, "Token usage for unknown request");
            return Vec::new();
        }
        Some(rid) => rid.to_string(),
        None => match state
            .tracker
            .latest_awaiting_usage()
            .or_else(|| state.current_request())
            .cloned()
        {
            Some(rid) => rid,
            None => {
                debug!("Token usage with no request to attach to");
                return Vec::new();
            }
        },
    };

    let context = context_usage_of(&usage);
    if let Some(record) = state.tracker.record_mut(&target) {
        record.token_usage = Some(usage);
    }

    let mut updated = false;
    for msg in state
        .messages
        .iter_mut()
        .filter(|m| m.belongs_to_request(&target) && m.kind == MessageKind::Response)
    {
        msg.context_usage = Some(context);
        updated = true;
    }

    let settled = state
        .messages
        .iter()
        .any(|m| m.belongs_to_request(&target) && m.kind == MessageKind::Response && m.is_settled());
    if updated && settled {
        if let Some(session) = state.snapshot_visible(now) {
            return vec![Effect::PersistSession(session)];
        }
    }
    Vec::new()
}

fn on_first_chunk_time(
    state: &mut ConversationState,
    request_id: RequestId,
    response_id: ResponseId,
    timestamp: DateTime<Utc>,
) -> Vec<Effect> {
    if state.tracker.is_tombstoned(&request_id) {
        debug!(request_id = %request_id, "Dropping first-chunk hint for terminated request");
        return Vec::new();
    }
    state.relink(&response_id, &request_id);
    if let Some(record) = state.tracker.record_mut(&request_id) {
        record.first_chunk_time = Some(timestamp);
        record.response_id = Some(response_id);
    }
    Vec::new()
}

fn on_metrics_window(state: &mut ConversationState, response_id: ResponseId, now: DateTime<Utc>) -> Vec<Effect> {
    let Some(rid) = state.tracker.request_for_response(&response_id).cloned() else {
        debug!(response_id = %response_id, "Metrics window for unknown response");
        state.metrics.release(&response_id);
        return Vec::new();
    };

    let max_retries = state.metrics.max_retries();
    let retry = match state.tracker.record_mut(&rid) {
        Some(record) if record.token_usage.is_none() && record.metrics_attempts < max_retries => {
            record.metrics_attempts += 1;
            true
        }
        _ => false,
    };
    if retry {
        debug!(response_id = %response_id, "Token usage not in yet, extending metrics window");
        return vec![Effect::ScheduleMetrics {
            response_id,
            delay_ms: state.metrics.grace_window_ms(),
        }];
    }

    state.metrics.release(&response_id);
    let Some(record) = state.tracker.take_record(&rid) else {
        return Vec::new();
    };
    let content = state
        .accumulator
        .take_completed(&response_id)
        .map(|stats| stats.text)
        .unwrap_or_default();
    // Tool-call announcements of the same request are done with too
    state.accumulator.drop_request(&rid);
    let report = state.metrics.compute(&response_id, &record, &content, now);
    vec![Effect::ReportMetrics(report)]
}

fn on_select_agent(state: &mut ConversationState, agent_id: AgentId, now: DateTime<Utc>) -> Vec<Effect> {
    if matches!(state.router.state(), RouterState::Active(active) if *active == agent_id) {
        debug!(agent_id = %agent_id, "Agent already active");
        return Vec::new();
    }

    let mut effects = state.flush_outgoing(now);
    let from = state.router.begin_switch(agent_id.clone());
    info!(from = ?from, to = %agent_id, "Switching agent");

    effects.push(Effect::Send(ClientEvent::GetAgentSessions {
        agent_id: agent_id.clone(),
    }));
    effects.push(Effect::Send(ClientEvent::LoadSessionHistory {
        agent_id: agent_id.clone(),
        session_id: state.router.current_session(&agent_id).cloned(),
    }));
    state.restore_pending(&agent_id, now);
    effects
}

fn on_set_scope(state: &mut ConversationState, scope: Option<String>, now: DateTime<Utc>) -> Vec<Effect> {
    if state.router.scope() == scope.as_deref() {
        return Vec::new();
    }

    let mut effects = state.flush_outgoing(now);
    state.router.set_scope(scope);

    if let Some(agent_id) = state.active_agent().cloned() {
        state.router.begin_switch(agent_id.clone());
        effects.push(Effect::Send(ClientEvent::GetAgentSessions {
            agent_id: agent_id.clone(),
        }));
        effects.push(Effect::Send(ClientEvent::LoadSessionHistory {
            agent_id: agent_id.clone(),
            session_id: None,
        }));
        state.restore_pending(&agent_id, now);
    }
    effects
}

fn on_switch_session(state: &mut ConversationState, session_id: SessionId, now: DateTime<Utc>) -> Vec<Effect> {
    let Some(agent_id) = state.active_agent().cloned() else {
        warn!(session_id = %session_id, "Session switch with no active agent");
        return Vec::new();
    };
    let already_there = matches!(state.router.state(), RouterState::Active(_))
        && state.router.current_session(&agent_id) == Some(&session_id);
    if already_there {
        return Vec::new();
    }

    let mut effects = state.flush_outgoing(now);
    state.router.set_current_session(&agent_id, &session_id);
    state.router.begin_switch(agent_id.clone());

    effects.push(Effect::Send(ClientEvent::SetCurrentSession {
        agent_id: agent_id.clone(),
        session_id: session_id.clone(),
    }));
    effects.push(Effect::Send(ClientEvent::LoadSessionHistory {
        agent_id: agent_id.clone(),
        session_id: Some(session_id),
    }));
    state.restore_pending(&agent_id, now);
    effects
}

fn on_create_session(state: &mut ConversationState, session_id: SessionId, now: DateTime<Utc>) -> Vec<Effect> {
    let Some(agent_id) = state.active_agent().cloned() else {
        warn!(session_id = %session_id, "Session creation with no active agent");
        return Vec::new();
    };

    let mut effects = state.flush_outgoing(now);
    state.router.set_current_session(&agent_id, &session_id);
    state.router.note_session(&agent_id, &session_id, now);
    state.router.complete_switch(agent_id.clone());
    info!(agent_id = %agent_id, session_id = %session_id, "New session");

    effects.push(Effect::Send(ClientEvent::CreateNewSession {
        agent_id: agent_id.clone(),
    }));
    state.restore_pending(&agent_id, now);
    effects
}

fn on_agent_sessions(
    state: &mut ConversationState,
    agent_id: AgentId,
    sessions: Vec<SessionSummary>,
    current_session_id: Option<SessionId>,
) -> Vec<Effect> {
    if let Some(current) = current_session_id {
        if state.router.current_session(&agent_id).is_none() {
            state.router.set_current_session(&agent_id, current);
        }
    }
    state.router.set_sessions(agent_id, sessions);
    Vec::new()
}

fn on_session_history(
    state: &mut ConversationState,
    agent_id: AgentId,
    session_id: SessionId,
    messages: Vec<Message>,
    now: DateTime<Utc>,
) -> Vec<Effect> {
    let refresh = matches!(state.router.state(), RouterState::Active(active) if *active == agent_id)
        && state.router.current_session(&agent_id) == Some(&session_id);
    if !state.router.is_switching_to(&agent_id) && !refresh {
        debug!(agent_id = %agent_id, session_id = %session_id, "Ignoring history for inactive conversation");
        return Vec::new();
    }

    let local: Vec<Message> = std::mem::take(&mut state.messages)
        .into_iter()
        .filter(|m| !messages.iter().any(|h| h.id == m.id))
        .collect();
    let has_new_settled = local.iter().any(|m| state.is_persistable(m));

    debug!(agent_id = %agent_id, session_id = %session_id, loaded = messages.len(), kept = local.len(), "History loaded");
    state.messages = messages;
    state.messages.extend(local);
    state.router.set_current_session(&agent_id, session_id);
    state.router.complete_switch(agent_id);

    if has_new_settled {
        if let Some(session) = state.snapshot_visible(now) {
            return vec![Effect::PersistSession(session)];
        }
    }
    Vec::new()
}

fn on_new_session_created(
    state: &mut ConversationState,
    agent_id: AgentId,
    session_id: SessionId,
    now: DateTime<Utc>,
) -> Vec<Effect> {
    state.router.note_session(&agent_id, &session_id, now);
    if state.active_agent() == Some(&agent_id) {
        state.router.set_current_session(&agent_id, session_id);
    }
    Vec::new()
}
