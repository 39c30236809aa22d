//! Storage Layer
//!
//! Handles all data persistence: JSON engine config and conversation history.

pub mod config;
pub mod history;

pub use config::*;
pub use history::*;
