//! Correlation Integration Tests
//!
//! Drives a `ChatEngine` with backend frames and checks:
//! - Streaming accumulation and thinking/answer separation
//! - Idempotent finalization and exactly-once metrics
//! - Abort and error handling, including late events
//! - Tool-call announcements superseded by the answer stream
//!
//! Metrics grace windows are set to 0 so deferred work runs as soon as the
//! test asks for it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;

use agent_chat_core::{ClientEvent, MessageKind, ServerEvent, TokenUsage};
use agent_chat_desktop::models::settings::EngineConfig;
use agent_chat_desktop::services::chat::{ChatEngine, ChatTransport, PromptOptions};
use agent_chat_desktop::storage::history::MemoryHistoryStore;
use agent_chat_desktop::utils::error::AppResult;

// ============================================================================
// Helpers
// ============================================================================

#[derive(Default)]
struct RecordingTransport {
    sent: Mutex<Vec<ClientEvent>>,
}

impl RecordingTransport {
    async fn status_messages(&self) -> Vec<String> {
        self.sent
            .lock()
            .await
            .iter()
            .filter_map(|e| match e {
                ClientEvent::AgentStatusMessage { text, .. } => Some(text.clone()),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl ChatTransport for RecordingTransport {
    async fn send(&self, event: ClientEvent) -> AppResult<()> {
        self.sent.lock().await.push(event);
        Ok(())
    }
}

fn new_engine() -> (ChatEngine, Arc<RecordingTransport>) {
    let transport = Arc::new(RecordingTransport::default());
    let engine = ChatEngine::new(
        EngineConfig::default().with_grace_window_ms(0),
        transport.clone(),
        Arc::new(MemoryHistoryStore::new()),
    )
    .unwrap();
    (engine, transport)
}

/// Engine with `agent` selected and an empty history loaded
async fn engine_with_agent(agent: &str) -> (ChatEngine, Arc<RecordingTransport>) {
    let (mut engine, transport) = new_engine();
    engine.select_agent(agent).await.unwrap();
    engine
        .receive(ServerEvent::SessionHistory {
            agent_id: agent.to_string(),
            session_id: "s1".to_string(),
            messages: Vec::new(),
        })
        .await;
    (engine, transport)
}

fn chunk(id: &str, text: &str) -> ServerEvent {
    ServerEvent::ChatResponseChunk {
        id: id.to_string(),
        chunk: text.to_string(),
    }
}

fn final_response(id: &str, request_id: Option<&str>, content: &str) -> ServerEvent {
    ServerEvent::ChatResponse {
        id: id.to_string(),
        request_id: request_id.map(str::to_string),
        content: content.to_string(),
        timestamp: Utc::now(),
        tool_name: None,
        tool_result: None,
    }
}

/// Run deferred metrics windows until none is left
async fn settle(engine: &mut ChatEngine) {
    while let Ok(Some(event)) = tokio::time::timeout(Duration::from_millis(200), engine.next_deferred()).await {
        engine.handle(event).await;
    }
}

// ============================================================================
// Streaming
// ============================================================================

#[tokio::test]
async fn test_streamed_answer_is_separated_from_thinking() {
    let (mut engine, transport) = engine_with_agent("a1").await;
    let rid = engine.send_prompt("Say hello", PromptOptions::default()).await.unwrap();

    engine.receive(chunk("resp1", "Hel")).await;
    engine.receive(chunk("resp1", "lo\n--\n")).await;
    engine.receive(chunk("resp1", "World")).await;

    let streaming = engine.messages().iter().find(|m| m.id == "resp1").unwrap();
    assert_eq!(streaming.content, "Hello\n--\nWorld");
    assert!(streaming.is_streaming);

    engine.receive(final_response("resp1", None, "")).await;

    let done = engine.messages().iter().find(|m| m.id == "resp1").unwrap();
    assert_eq!(done.content, "World");
    assert!(!done.is_streaming);
    assert_eq!(done.request_id.as_deref(), Some(rid.as_str()));
    assert!(!engine.messages().iter().any(|m| m.is_placeholder()));

    settle(&mut engine).await;
    let reports = transport.status_messages().await;
    assert_eq!(reports.len(), 1);
    assert!(reports[0].contains("(5B thinking, 5B answer)"));
}

#[tokio::test]
async fn test_final_content_overrides_accumulated_chunks() {
    let (mut engine, _) = engine_with_agent("a1").await;
    engine.send_prompt("q", PromptOptions::default()).await.unwrap();

    engine.receive(chunk("resp1", "draft")).await;
    engine.receive(final_response("resp1", None, "Answer: final text")).await;

    let done = engine.messages().iter().find(|m| m.id == "resp1").unwrap();
    assert_eq!(done.content, "final text");
}

#[tokio::test]
async fn test_zero_content_response_replaces_placeholder() {
    let (mut engine, transport) = engine_with_agent("a1").await;
    engine.send_prompt("q", PromptOptions::default()).await.unwrap();

    engine.receive(final_response("resp1", None, "")).await;

    assert_eq!(engine.messages().len(), 2);
    let done = &engine.messages()[1];
    assert_eq!(done.id, "resp1");
    assert_eq!(done.kind, MessageKind::Response);
    assert_eq!(done.content, "");

    settle(&mut engine).await;
    let reports = transport.status_messages().await;
    assert_eq!(reports.len(), 1);
    assert!(reports[0].contains("latency n/a"));
    assert!(reports[0].contains("| 0B"));
}

// ============================================================================
// Finalization and metrics
// ============================================================================

#[tokio::test]
async fn test_duplicate_final_response_reports_metrics_once() {
    let (mut engine, transport) = engine_with_agent("a1").await;
    let rid = engine.send_prompt("q", PromptOptions::default()).await.unwrap();

    engine.receive(chunk("resp1", "Hello")).await;
    engine.receive(final_response("resp1", Some(&rid), "")).await;
    let snapshot = engine.messages().to_vec();

    engine.receive(final_response("resp1", Some(&rid), "")).await;
    engine.receive(final_response("resp1", None, "")).await;
    assert_eq!(engine.messages(), &snapshot[..]);

    settle(&mut engine).await;
    assert_eq!(transport.status_messages().await.len(), 1);

    // Late chunks for a finalized response change nothing
    engine.receive(chunk("resp1", "more")).await;
    assert_eq!(engine.messages(), &snapshot[..]);
}

#[tokio::test]
async fn test_late_token_usage_lands_in_metrics() {
    let (mut engine, transport) = engine_with_agent("a1").await;
    engine.send_prompt("q", PromptOptions::default()).await.unwrap();

    engine.receive(chunk("resp1", &"x".repeat(300))).await;
    engine.receive(final_response("resp1", None, "")).await;
    engine
        .receive(ServerEvent::TokenUsage(TokenUsage {
            request_id: None,
            prompt_tokens: 200,
            completion_tokens: Some(75),
            total_tokens: Some(275),
            max_context: 4096,
            usage_percent: 6.7,
            timings: None,
        }))
        .await;

    let done = engine.messages().iter().find(|m| m.id == "resp1").unwrap();
    assert_eq!(done.context_usage.map(|c| c.prompt_tokens), Some(200));

    settle(&mut engine).await;
    let reports = transport.status_messages().await;
    assert_eq!(reports.len(), 1);
    // 300 chars (+10) with healthy context usage (+10)
    assert!(reports[0].contains("confidence 70%"));
    assert!(reports[0].contains("context 7%"));
}

#[tokio::test]
async fn test_metrics_report_targets_owning_agent() {
    let (mut engine, transport) = engine_with_agent("a1").await;
    engine.send_prompt("q", PromptOptions::default()).await.unwrap();
    engine.receive(final_response("resp1", None, "done")).await;
    settle(&mut engine).await;

    let sent = transport.sent.lock().await;
    assert!(sent.iter().any(|e| matches!(
        e,
        ClientEvent::AgentStatusMessage { agent_id, .. } if agent_id == "a1"
    )));
}

// ============================================================================
// Abort and errors
// ============================================================================

#[tokio::test]
async fn test_abort_before_first_chunk() {
    let (mut engine, transport) = engine_with_agent("a1").await;
    let rid = engine.send_prompt("long task", PromptOptions::default()).await.unwrap();

    engine.abort(&rid).await.unwrap();
    assert!(!engine.messages().iter().any(|m| m.is_placeholder()));
    assert_eq!(engine.messages().last().unwrap().content, "(Request aborted)");

    engine.receive(ServerEvent::ChatAborted).await;
    engine.receive(chunk("resp1", "too late")).await;
    engine.receive(final_response("resp1", None, "too late")).await;

    assert!(!engine.messages().iter().any(|m| m.id == "resp1"));
    assert!(!engine.state().tracker().is_pending(&rid));

    settle(&mut engine).await;
    let sent = transport.sent.lock().await;
    assert!(sent.iter().any(|e| matches!(
        e,
        ClientEvent::AbortChatPrompt { request_id } if *request_id == rid
    )));
    assert!(!sent.iter().any(|e| matches!(e, ClientEvent::AgentStatusMessage { .. })));
}

#[tokio::test]
async fn test_abort_mid_stream_drops_linked_chunks() {
    let (mut engine, _) = engine_with_agent("a1").await;
    let rid = engine.send_prompt("q", PromptOptions::default()).await.unwrap();

    engine.receive(chunk("resp1", "partial")).await;
    engine.abort_current().await.unwrap();
    engine.receive(chunk("resp1", " more")).await;

    let partial = engine.messages().iter().find(|m| m.id == "resp1").unwrap();
    assert_eq!(partial.content, "partial");
    assert!(!partial.is_streaming);

    // A new prompt for the same agent is accepted again
    let next = engine.send_prompt("again", PromptOptions::default()).await.unwrap();
    assert_ne!(next, rid);
}

#[tokio::test]
async fn test_backend_initiated_abort() {
    let (mut engine, transport) = engine_with_agent("a1").await;
    let rid = engine.send_prompt("q", PromptOptions::default()).await.unwrap();

    engine.receive(ServerEvent::ChatAborted).await;

    assert!(!engine.state().tracker().is_pending(&rid));
    assert_eq!(engine.messages().last().unwrap().content, "(Request aborted)");
    let sent = transport.sent.lock().await;
    assert!(!sent.iter().any(|e| matches!(e, ClientEvent::AbortChatPrompt { .. })));
}

#[tokio::test]
async fn test_chat_error_clears_pending_state() {
    let (mut engine, transport) = engine_with_agent("a1").await;
    let rid = engine.send_prompt("q", PromptOptions::default()).await.unwrap();

    engine
        .receive_frame(r#"{"event":"chatError","payload":"context window exceeded"}"#)
        .await
        .unwrap();

    assert!(!engine.state().tracker().is_pending(&rid));
    assert!(!engine.messages().iter().any(|m| m.is_placeholder()));
    assert_eq!(
        engine.messages().last().unwrap().content,
        "Error: context window exceeded"
    );

    settle(&mut engine).await;
    assert!(transport.status_messages().await.is_empty());
}

// ============================================================================
// Tool calls
// ============================================================================

#[tokio::test]
async fn test_tool_call_superseded_by_answer_stream() {
    let (mut engine, transport) = engine_with_agent("a1").await;
    let rid = engine.send_prompt("weather?", PromptOptions::default()).await.unwrap();

    let announcement = "```json\n{\"tool_call\": {\"name\": \"weather\", \"arguments\": {\"city\": \"Oslo\"}}}\n```";
    engine.receive(final_response("resp0", Some(&rid), announcement)).await;

    assert!(engine.state().tracker().is_pending(&rid));
    let last = engine.messages().last().unwrap();
    assert_eq!(last.kind, MessageKind::ToolCall { name: "weather".to_string() });

    engine.receive(chunk("resp1", "It is ")).await;
    engine.receive(chunk("resp1", "sunny")).await;
    assert_eq!(engine.messages().len(), 2);
    assert_eq!(engine.messages()[1].id, "resp1");

    engine
        .receive(ServerEvent::ChatResponse {
            id: "resp1".to_string(),
            request_id: Some(rid.clone()),
            content: String::new(),
            timestamp: Utc::now(),
            tool_name: Some("weather".to_string()),
            tool_result: Some("{\"sky\": \"clear\"}".to_string()),
        })
        .await;

    let kinds: Vec<MessageKind> = engine.messages().iter().map(|m| m.kind.clone()).collect();
    assert_eq!(
        kinds,
        vec![
            MessageKind::Prompt,
            MessageKind::ToolResult { name: "weather".to_string() },
            MessageKind::Response,
        ]
    );
    assert_eq!(engine.messages()[2].content, "It is sunny");
    assert!(!engine.state().tracker().is_pending(&rid));

    settle(&mut engine).await;
    assert_eq!(transport.status_messages().await.len(), 1);
    // The announcement's stream is released together with the answer's
    assert!(engine.state().accumulator().request_for("resp0").is_none());
    assert!(engine.state().accumulator().text("resp0").is_none());
    assert_eq!(engine.state().metrics().scheduled_count(), 0);
}

#[tokio::test]
async fn test_answer_reusing_tool_call_response_id() {
    let (mut engine, transport) = engine_with_agent("a1").await;
    let rid = engine.send_prompt("weather?", PromptOptions::default()).await.unwrap();

    let announcement = "```json\n{\"tool_call\": {\"name\": \"weather\"}}\n```";
    engine.receive(final_response("resp1", Some(&rid), announcement)).await;
    assert_eq!(
        engine.messages()[1].kind,
        MessageKind::ToolCall { name: "weather".to_string() }
    );

    engine.receive(chunk("resp1", "It is sunny")).await;
    assert_eq!(engine.messages().len(), 2);
    assert_eq!(engine.messages()[1].kind, MessageKind::Response);
    assert!(engine.messages()[1].is_streaming);

    engine.receive(final_response("resp1", None, "")).await;
    assert_eq!(engine.messages().len(), 2);
    assert_eq!(engine.messages()[1].content, "It is sunny");
    assert!(!engine.messages()[1].is_streaming);
    assert!(!engine.state().tracker().is_pending(&rid));

    // The agent accepts a new prompt once the answer is in
    engine.send_prompt("and tomorrow?", PromptOptions::default()).await.unwrap();

    settle(&mut engine).await;
    assert_eq!(transport.status_messages().await.len(), 1);
}
