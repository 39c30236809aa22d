//! Multi-Agent Chat Correlation
//!
//! Correlates streamed backend events with the requests and agents they
//! belong to:
//! - `tracker`: pending requests, ownership and lifecycle records
//! - `accumulator`: per-response chunk buffers and visible-stream updates
//! - `metrics`: deferred per-response performance and confidence reports
//! - `router`: active agent, per-agent sessions and cross-agent routing
//! - `reducer`: the single state object and its transition function
//! - `engine`: async shell that executes effects

pub mod accumulator;
pub mod engine;
pub mod metrics;
pub mod reducer;
pub mod router;
pub mod tracker;
pub mod transport;

pub use accumulator::{ChunkPlacement, StreamAccumulator, StreamStats};
pub use engine::{ChatEngine, PromptOptions};
pub use metrics::MetricsCalculator;
pub use reducer::{reduce, ConversationState, Effect, EngineEvent, PromptSubmission};
pub use router::{Route, RouterState, SessionRouter};
pub use tracker::RequestTracker;
pub use transport::{ChannelTransport, ChatTransport};
