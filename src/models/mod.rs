//! Data Models
//!
//! Engine-side models. Wire and conversation types live in `agent-chat-core`.

pub mod metrics;
pub mod request;
pub mod settings;

pub use metrics::MetricsReport;
pub use request::RequestRecord;
pub use settings::{ConfidenceParams, EngineConfig, MetricsConfig};
