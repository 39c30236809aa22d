//! Agent Chat Desktop - Rust Backend Library
//!
//! This library provides the multi-agent chat backend used by the desktop client.
//! It includes:
//! - The streaming correlation engine (request tracking, chunk accumulation,
//!   session routing, metrics)
//! - Storage layer (history store, config)
//! - Data models and utilities

pub mod models;
pub mod services;
pub mod storage;
pub mod utils;

pub use models::{EngineConfig, MetricsReport, RequestRecord};
pub use services::chat::{
    ChannelTransport, ChatEngine, ChatTransport, ConversationState, Effect, EngineEvent, PromptOptions,
};
pub use storage::{ConfigService, FileHistoryStore, HistoryStore, MemoryHistoryStore};
pub use utils::error::{AppError, AppResult};
