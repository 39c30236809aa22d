//! Session Router
//!
//! Knows which agent's conversation is on screen, which session each agent
//! is currently in, and the session listings received from the backend.
//! Events for an agent other than the active one are routed to that agent's
//! stored history instead of the visible list.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use agent_chat_core::{AgentId, Message, Session, SessionId, SessionSummary};

/// Which conversation the visible message list belongs to
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum RouterState {
    /// No agent selected yet
    #[default]
    Idle,
    Active(AgentId),
    /// History of `to` has been requested but not received
    Switching { from: Option<AgentId>, to: AgentId },
}

/// Destination of an event resolved to an agent
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// Update the visible list
    Local,
    /// Update the stored history of a background agent
    Foreign(AgentId),
}

#[derive(Debug, Default)]
pub struct SessionRouter {
    state: RouterState,
    scope: Option<String>,
    current_sessions: HashMap<AgentId, SessionId>,
    listings: HashMap<AgentId, Vec<SessionSummary>>,
}

impl SessionRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> &RouterState {
        &self.state
    }

    /// Agent whose conversation is (or is about to be) on screen
    pub fn active_agent(&self) -> Option<&AgentId> {
        match &self.state {
            RouterState::Idle => None,
            RouterState::Active(agent) => Some(agent),
            RouterState::Switching { to, .. } => Some(to),
        }
    }

    pub fn is_switching_to(&self, agent_id: &str) -> bool {
        matches!(&self.state, RouterState::Switching { to, .. } if to == agent_id)
    }

    /// Route an event owned by `agent`. Unresolved events go to the visible
    /// list.
    pub fn route(&self, agent: Option<&AgentId>) -> Route {
        match (agent, self.active_agent()) {
            (Some(owner), Some(active)) if owner != active => Route::Foreign(owner.clone()),
            (Some(owner), None) => Route::Foreign(owner.clone()),
            _ => Route::Local,
        }
    }

    /// Start a switch; returns the agent being left
    pub fn begin_switch(&mut self, to: impl Into<AgentId>) -> Option<AgentId> {
        let from = match std::mem::take(&mut self.state) {
            RouterState::Idle => None,
            RouterState::Active(agent) => Some(agent),
            RouterState::Switching { from, .. } => from,
        };
        self.state = RouterState::Switching {
            from: from.clone(),
            to: to.into(),
        };
        from
    }

    /// Finish a switch once the target's history has arrived
    pub fn complete_switch(&mut self, agent_id: impl Into<AgentId>) {
        self.state = RouterState::Active(agent_id.into());
    }

    pub fn scope(&self) -> Option<&str> {
        self.scope.as_deref()
    }

    /// Change the external scope. Session bookkeeping is scope-relative, so
    /// it is forgotten. Returns `false` when the scope is unchanged.
    pub fn set_scope(&mut self, scope: Option<String>) -> bool {
        if self.scope == scope {
            return false;
        }
        self.scope = scope;
        self.current_sessions.clear();
        self.listings.clear();
        true
    }

    pub fn current_session(&self, agent_id: &str) -> Option<&SessionId> {
        self.current_sessions.get(agent_id)
    }

    pub fn set_current_session(&mut self, agent_id: impl Into<AgentId>, session_id: impl Into<SessionId>) {
        self.current_sessions.insert(agent_id.into(), session_id.into());
    }

    /// Current session of an agent, assigning `fallback` when there is none
    pub fn ensure_current_session(
        &mut self,
        agent_id: &str,
        fallback: impl FnOnce() -> SessionId,
    ) -> SessionId {
        self.current_sessions
            .entry(agent_id.to_string())
            .or_insert_with(fallback)
            .clone()
    }

    pub fn sessions(&self, agent_id: &str) -> &[SessionSummary] {
        self.listings.get(agent_id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn set_sessions(&mut self, agent_id: impl Into<AgentId>, sessions: Vec<SessionSummary>) {
        self.listings.insert(agent_id.into(), sessions);
    }

    /// Add a freshly created session to an agent's listing
    pub fn note_session(&mut self, agent_id: &str, session_id: &str, at: DateTime<Utc>) {
        let listing = self.listings.entry(agent_id.to_string()).or_default();
        if listing.iter().any(|s| s.id == session_id) {
            return;
        }
        listing.insert(
            0,
            SessionSummary {
                id: session_id.to_string(),
                agent_id: agent_id.to_string(),
                title: None,
                message_count: 0,
                last_updated: at,
            },
        );
    }

    /// Session snapshot of an agent's settled messages, `None` when there is
    /// nothing worth saving.
    pub fn snapshot(
        &mut self,
        agent_id: &str,
        messages: Vec<Message>,
        now: DateTime<Utc>,
    ) -> Option<Session> {
        if messages.is_empty() {
            return None;
        }
        let session_id =
            self.ensure_current_session(agent_id, || format!("session-{}", now.timestamp_millis()));
        let mut session = Session::new(session_id, agent_id, now);
        session.scope = self.scope.clone();
        session.messages = messages;
        Some(session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(ms: i64) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(1_760_000_000_000 + ms).unwrap()
    }

    #[test]
    fn test_switch_lifecycle() {
        let mut router = SessionRouter::new();
        assert_eq!(router.begin_switch("a1"), None);
        assert!(router.is_switching_to("a1"));
        assert_eq!(router.active_agent().map(String::as_str), Some("a1"));

        router.complete_switch("a1");
        assert_eq!(router.state(), &RouterState::Active("a1".to_string()));

        assert_eq!(router.begin_switch("a2").as_deref(), Some("a1"));
        // Re-targeting mid-switch keeps the original origin
        assert_eq!(router.begin_switch("a3").as_deref(), Some("a1"));
    }

    #[test]
    fn test_route() {
        let mut router = SessionRouter::new();
        let a1 = "a1".to_string();
        let a2 = "a2".to_string();
        assert_eq!(router.route(None), Route::Local);
        assert_eq!(router.route(Some(&a1)), Route::Foreign(a1.clone()));

        router.complete_switch("a1");
        assert_eq!(router.route(Some(&a1)), Route::Local);
        assert_eq!(router.route(Some(&a2)), Route::Foreign(a2.clone()));
        assert_eq!(router.route(None), Route::Local);
    }

    #[test]
    fn test_scope_change_forgets_sessions() {
        let mut router = SessionRouter::new();
        router.set_current_session("a1", "s1");
        assert!(!router.set_scope(None));
        assert!(router.set_scope(Some("project-x".to_string())));
        assert!(router.current_session("a1").is_none());
    }

    #[test]
    fn test_snapshot() {
        let mut router = SessionRouter::new();
        assert!(router.snapshot("a1", Vec::new(), t(0)).is_none());

        router.set_current_session("a1", "s1");
        let session = router
            .snapshot("a1", vec![Message::response("m1", "x", t(0))], t(5))
            .unwrap();
        assert_eq!(session.id, "s1");
        assert_eq!(session.messages.len(), 1);
        assert_eq!(session.last_updated, t(5));
    }

    #[test]
    fn test_note_session_is_idempotent() {
        let mut router = SessionRouter::new();
        router.note_session("a1", "s1", t(0));
        router.note_session("a1", "s1", t(1));
        assert_eq!(router.sessions("a1").len(), 1);
    }
}
