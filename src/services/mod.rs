//! Services
//!
//! Business logic services for the application.

pub mod chat;

pub use chat::{ChatEngine, ChatTransport, ConversationState, Effect, EngineEvent, PromptOptions};
