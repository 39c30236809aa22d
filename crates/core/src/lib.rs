//! Agent Chat Core
//!
//! Wire protocol, conversation data model and error types for the Agent Chat
//! desktop engine. This crate has zero dependencies on application-level code
//! (transport, storage, runtime).
//!
//! ## Module Organization
//!
//! - `error` - Core error types (`CoreError`, `CoreResult`)
//! - `message` - Messages, sessions and identifier aliases
//! - `protocol` - Client/server event frames and JSON line codec

pub mod error;
pub mod message;
pub mod protocol;

// ── Error Types ────────────────────────────────────────────────────────
pub use error::{CoreError, CoreResult};

// ── Data Model ─────────────────────────────────────────────────────────
pub use message::{
    AgentId, ContextUsage, Message, MessageKind, RequestId, ResponseId, Session, SessionId,
    SessionSummary,
};

// ── Wire Protocol ──────────────────────────────────────────────────────
pub use protocol::{
    decode_server_event, encode_client_event, ClientEvent, ServerEvent, Timings, TokenUsage,
};
