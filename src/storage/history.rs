//! Conversation History Store
//!
//! Per-agent, per-session persistence of message lists, keyed by
//! `(agent_id, session_id)`. The engine only talks to the [`HistoryStore`]
//! trait; two implementations are provided: an in-memory map and one pretty
//! JSON file per session under `<root>/<agent>/<session>.json`.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use agent_chat_core::{Message, Session, SessionSummary};

use crate::utils::error::{AppError, AppResult};
use crate::utils::paths::encode_component;

/// Storage backend for agent session histories.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Write a session wholesale, replacing any stored copy
    async fn save_session(&self, session: &Session) -> AppResult<()>;

    /// Load one session, `None` when it was never saved
    async fn load_session(&self, agent_id: &str, session_id: &str) -> AppResult<Option<Session>>;

    /// List an agent's sessions, most recently updated first
    async fn list_sessions(&self, agent_id: &str) -> AppResult<Vec<SessionSummary>>;

    /// Append messages to a session, creating it when missing
    async fn append_messages(
        &self,
        agent_id: &str,
        session_id: &str,
        messages: &[Message],
    ) -> AppResult<()> {
        let mut session = match self.load_session(agent_id, session_id).await? {
            Some(session) => session,
            None => Session::new(session_id, agent_id, Utc::now()),
        };
        session.messages.extend_from_slice(messages);
        session.last_updated = messages
            .iter()
            .map(|m| m.timestamp)
            .max()
            .unwrap_or_else(Utc::now)
            .max(session.last_updated);
        self.save_session(&session).await
    }
}

fn sort_summaries(mut summaries: Vec<SessionSummary>) -> Vec<SessionSummary> {
    summaries.sort_by(|a, b| b.last_updated.cmp(&a.last_updated));
    summaries
}

/// Process-local history store
#[derive(Debug, Default)]
pub struct MemoryHistoryStore {
    sessions: RwLock<HashMap<(String, String), Session>>,
}

impl MemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of stored sessions across all agents
    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}

#[async_trait]
impl HistoryStore for MemoryHistoryStore {
    async fn save_session(&self, session: &Session) -> AppResult<()> {
        let key = (session.agent_id.clone(), session.id.clone());
        self.sessions.write().await.insert(key, session.clone());
        Ok(())
    }

    async fn load_session(&self, agent_id: &str, session_id: &str) -> AppResult<Option<Session>> {
        let key = (agent_id.to_string(), session_id.to_string());
        Ok(self.sessions.read().await.get(&key).cloned())
    }

    async fn list_sessions(&self, agent_id: &str) -> AppResult<Vec<SessionSummary>> {
        let sessions = self.sessions.read().await;
        let summaries = sessions
            .values()
            .filter(|s| s.agent_id == agent_id)
            .map(Session::summary)
            .collect();
        Ok(sort_summaries(summaries))
    }
}

/// One JSON file per session on disk
#[derive(Debug, Clone)]
pub struct FileHistoryStore {
    root: PathBuf,
}

impl FileHistoryStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn agent_dir(&self, agent_id: &str) -> PathBuf {
        self.root.join(encode_component(agent_id))
    }

    fn session_path(&self, agent_id: &str, session_id: &str) -> PathBuf {
        self.agent_dir(agent_id)
            .join(format!("{}.json", encode_component(session_id)))
    }
}

#[async_trait]
impl HistoryStore for FileHistoryStore {
    async fn save_session(&self, session: &Session) -> AppResult<()> {
        let dir = self.agent_dir(&session.agent_id);
        tokio::fs::create_dir_all(&dir).await?;

        let path = self.session_path(&session.agent_id, &session.id);
        let content = serde_json::to_string_pretty(session)?;
        // Write-then-rename so a crash never leaves a half-written session
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, content).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn load_session(&self, agent_id: &str, session_id: &str) -> AppResult<Option<Session>> {
        let path = self.session_path(agent_id, session_id);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let session: Session = serde_json::from_str(&content).map_err(|e| {
            AppError::storage(format!("corrupt session file {}: {}", path.display(), e))
        })?;
        Ok(Some(session))
    }

    async fn list_sessions(&self, agent_id: &str) -> AppResult<Vec<SessionSummary>> {
        let dir = self.agent_dir(agent_id);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut summaries = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let content = tokio::fs::read_to_string(&path).await?;
            match serde_json::from_str::<Session>(&content) {
                Ok(session) => summaries.push(session.summary()),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable session file");
                }
            }
        }
        Ok(sort_summaries(summaries))
    }
}
