//! Routing Integration Tests
//!
//! Multi-agent scenarios: responses for a background agent must be filed into
//! that agent's stored history and never touch the visible conversation.
//! Covers both the in-memory and the file-backed history store.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;

use agent_chat_core::{ClientEvent, Message, MessageKind, ServerEvent};
use agent_chat_desktop::models::settings::EngineConfig;
use agent_chat_desktop::services::chat::{ChatEngine, ChatTransport, PromptOptions, RouterState};
use agent_chat_desktop::storage::history::{FileHistoryStore, HistoryStore, MemoryHistoryStore};
use agent_chat_desktop::utils::error::AppResult;

// ============================================================================
// Helpers
// ============================================================================

#[derive(Default)]
struct RecordingTransport {
    sent: Mutex<Vec<ClientEvent>>,
}

#[async_trait]
impl ChatTransport for RecordingTransport {
    async fn send(&self, event: ClientEvent) -> AppResult<()> {
        self.sent.lock().await.push(event);
        Ok(())
    }
}

fn engine_with_store(store: Arc<dyn HistoryStore>) -> ChatEngine {
    ChatEngine::new(
        EngineConfig::default().with_grace_window_ms(0),
        Arc::new(RecordingTransport::default()),
        store,
    )
    .unwrap()
}

async fn select(engine: &mut ChatEngine, agent: &str, session: &str, messages: Vec<Message>) {
    engine.select_agent(agent).await.unwrap();
    engine
        .receive(ServerEvent::SessionHistory {
            agent_id: agent.to_string(),
            session_id: session.to_string(),
            messages,
        })
        .await;
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

// ============================================================================
// Cross-agent isolation
// ============================================================================

#[tokio::test]
async fn test_background_response_is_filed_for_its_agent() {
    let store = Arc::new(MemoryHistoryStore::new());
    let mut engine = engine_with_store(store.clone());

    select(&mut engine, "agent-b", "sb", Vec::new()).await;
    let rid_b = engine.send_prompt("summarize the logs", PromptOptions::default()).await.unwrap();

    let earlier = Message::response("old-a", "hello from A", Utc::now()).with_agent("agent-a");
    select(&mut engine, "agent-a", "sa", vec![earlier.clone()]).await;
    let visible_before = engine.messages().to_vec();
    assert_eq!(visible_before, vec![earlier]);

    engine
        .receive(ServerEvent::FirstChunkTime {
            request_id: rid_b.clone(),
            response_id: "resp-b".to_string(),
            timestamp: Utc::now(),
        })
        .await;
    engine.receive(chunk("resp-b", "thinking\n--\n")).await;
    engine.receive(chunk("resp-b", "All good")).await;
    assert_eq!(engine.messages(), &visible_before[..]);

    engine.receive(final_response("resp-b", Some(&rid_b), "")).await;
    assert_eq!(engine.messages(), &visible_before[..]);

    let sessions = store.list_sessions("agent-b").await.unwrap();
    assert_eq!(sessions.len(), 1);
    let stored = store.load_session("agent-b", "sb").await.unwrap().unwrap();
    assert_eq!(stored.messages.len(), 2);
    assert_eq!(stored.messages[0].kind, MessageKind::Prompt);
    assert_eq!(stored.messages[0].content, "summarize the logs");
    assert_eq!(stored.messages[1].content, "All good");
    assert!(stored
        .messages
        .iter()
        .all(|m| m.agent_ref.as_deref() == Some("agent-b")));

    // Nothing was filed under the visible agent
    assert!(store.load_session("agent-a", "sb").await.unwrap().is_none());
}

#[tokio::test]
async fn test_concurrent_agents_keep_their_own_responses() {
    let store = Arc::new(MemoryHistoryStore::new());
    let mut engine = engine_with_store(store.clone());

    select(&mut engine, "agent-b", "sb", Vec::new()).await;
    let rid_b = engine.send_prompt("question for B", PromptOptions::default()).await.unwrap();
    select(&mut engine, "agent-a", "sa", Vec::new()).await;
    let rid_a = engine.send_prompt("question for A", PromptOptions::default()).await.unwrap();

    // B's stream is announced explicitly, A's is matched to the visible request
    engine
        .receive(ServerEvent::FirstChunkTime {
            request_id: rid_b.clone(),
            response_id: "resp-b".to_string(),
            timestamp: Utc::now(),
        })
        .await;
    engine.receive(chunk("resp-b", "for B")).await;
    engine.receive(chunk("resp-a", "for A")).await;
    engine.receive(final_response("resp-a", None, "")).await;
    engine.receive(final_response("resp-b", None, "")).await;

    let visible: Vec<&str> = engine.messages().iter().map(|m| m.content.as_str()).collect();
    assert_eq!(visible, vec!["question for A", "for A"]);
    assert_eq!(engine.messages()[1].request_id.as_deref(), Some(rid_a.as_str()));

    let stored_b = store.load_session("agent-b", "sb").await.unwrap().unwrap();
    let contents: Vec<&str> = stored_b.messages.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(contents, vec!["question for B", "for B"]);

    let stored_a = store.load_session("agent-a", "sa").await.unwrap().unwrap();
    assert_eq!(stored_a.messages.len(), 2);
    assert_eq!(engine.state().tracker().pending_count(), 0);
}

#[tokio::test]
async fn test_unannounced_background_stream_is_moved_to_its_agent() {
    let store = Arc::new(MemoryHistoryStore::new());
    let mut engine = engine_with_store(store.clone());

    select(&mut engine, "agent-b", "sb", Vec::new()).await;
    let rid_b = engine.send_prompt("question for B", PromptOptions::default()).await.unwrap();
    select(&mut engine, "agent-a", "sa", Vec::new()).await;
    let rid_a = engine.send_prompt("question for A", PromptOptions::default()).await.unwrap();
    let visible_before = engine.messages().to_vec();

    // No firstChunkTime: the stream can only be told apart by its final frame
    engine.receive(chunk("resp-b", "secret for B")).await;
    engine.receive(final_response("resp-b", Some(&rid_b), "")).await;

    assert_eq!(engine.messages(), &visible_before[..]);
    assert!(engine.messages()[1].is_placeholder());
    let record_a = engine.state().tracker().record(&rid_a).unwrap();
    assert!(record_a.first_chunk_time.is_none());
    assert_eq!(record_a.bytes_received, 0);

    let stored_b = store.load_session("agent-b", "sb").await.unwrap().unwrap();
    let contents: Vec<&str> = stored_b.messages.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(contents, vec!["question for B", "secret for B"]);

    // A's own answer still lands on its placeholder
    engine.receive(chunk("resp-a", "for A")).await;
    engine.receive(final_response("resp-a", None, "")).await;
    let visible: Vec<&str> = engine.messages().iter().map(|m| m.content.as_str()).collect();
    assert_eq!(visible, vec!["question for A", "for A"]);
    assert_eq!(engine.messages()[1].request_id.as_deref(), Some(rid_a.as_str()));
    assert_eq!(engine.state().tracker().pending_count(), 0);
}

#[tokio::test]
async fn test_error_for_background_request_is_filed_with_its_prompt() {
    let store = Arc::new(MemoryHistoryStore::new());
    let mut engine = engine_with_store(store.clone());

    select(&mut engine, "agent-b", "sb", Vec::new()).await;
    engine.send_prompt("question for B", PromptOptions::default()).await.unwrap();
    select(&mut engine, "agent-a", "sa", Vec::new()).await;

    engine
        .receive(ServerEvent::ChatError("model unavailable".to_string()))
        .await;

    assert!(engine.messages().is_empty());
    assert_eq!(engine.state().tracker().pending_count(), 0);
    let stored_b = store.load_session("agent-b", "sb").await.unwrap().unwrap();
    let contents: Vec<&str> = stored_b.messages.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(contents, vec!["question for B", "Error: model unavailable"]);
}

#[tokio::test]
async fn test_returning_agent_sees_in_flight_request() {
    let store = Arc::new(MemoryHistoryStore::new());
    let mut engine = engine_with_store(store.clone());

    select(&mut engine, "agent-a", "sa", Vec::new()).await;
    let rid = engine.send_prompt("slow question", PromptOptions::default()).await.unwrap();
    engine.receive(chunk("resp-a", "par")).await;

    select(&mut engine, "agent-b", "sb", Vec::new()).await;
    assert!(engine.messages().is_empty());
    engine.receive(chunk("resp-a", "tial")).await;
    assert!(engine.messages().is_empty());

    select(&mut engine, "agent-a", "sa", Vec::new()).await;
    let contents: Vec<&str> = engine.messages().iter().map(|m| m.content.as_str()).collect();
    assert_eq!(contents, vec!["slow question", "partial"]);
    assert_eq!(engine.state().router().state(), &RouterState::Active("agent-a".to_string()));

    engine.receive(final_response("resp-a", Some(&rid), "")).await;
    let stored = store.load_session("agent-a", "sa").await.unwrap().unwrap();
    let contents: Vec<&str> = stored.messages.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(contents, vec!["slow question", "partial"]);
}

// ============================================================================
// Session management
// ============================================================================

#[tokio::test]
async fn test_switching_persists_settled_messages_to_disk() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FileHistoryStore::new(dir.path()));
    let mut engine = engine_with_store(store.clone());

    select(&mut engine, "agent-a", "sa", Vec::new()).await;
    engine.send_prompt("first", PromptOptions::default()).await.unwrap();
    engine.receive(final_response("resp1", None, "one")).await;
    engine.send_prompt("second", PromptOptions::default()).await.unwrap();

    // The second exchange is still pending; only the settled pair is saved
    select(&mut engine, "agent-b", "sb", Vec::new()).await;

    let stored = store.load_session("agent-a", "sa").await.unwrap().unwrap();
    let contents: Vec<&str> = stored.messages.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(contents, vec!["first", "one"]);
    assert!(stored.messages.iter().all(|m| m.is_settled()));

    let listed = store.list_sessions("agent-a").await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].title.as_deref(), Some("first"));
}

#[tokio::test]
async fn test_history_for_stale_switch_is_ignored() {
    let store = Arc::new(MemoryHistoryStore::new());
    let mut engine = engine_with_store(store);

    engine.select_agent("agent-a").await.unwrap();
    engine.select_agent("agent-b").await.unwrap();

    // A's history arrives after the user already moved on to B
    engine
        .receive(ServerEvent::SessionHistory {
            agent_id: "agent-a".to_string(),
            session_id: "sa".to_string(),
            messages: vec![Message::prompt("m1", "stale", Utc::now())],
        })
        .await;

    assert!(engine.messages().is_empty());
    assert!(engine.state().router().is_switching_to("agent-b"));
}

#[tokio::test]
async fn test_new_session_starts_empty() {
    let store = Arc::new(MemoryHistoryStore::new());
    let mut engine = engine_with_store(store.clone());

    select(&mut engine, "agent-a", "sa", Vec::new()).await;
    engine.send_prompt("hi", PromptOptions::default()).await.unwrap();
    engine.receive(final_response("resp1", None, "hello")).await;

    let session_id = engine.create_session().await.unwrap();
    assert!(engine.messages().is_empty());
    assert_eq!(engine.state().current_session(), Some(&session_id));
    assert!(engine
        .state()
        .sessions("agent-a")
        .iter()
        .any(|s| s.id == session_id));

    engine
        .receive(ServerEvent::NewSessionCreated {
            agent_id: "agent-a".to_string(),
            session_id: "server-side-id".to_string(),
        })
        .await;
    assert_eq!(
        engine.state().current_session().map(String::as_str),
        Some("server-side-id")
    );

    assert_eq!(store.list_sessions("agent-a").await.unwrap().len(), 1);
}
