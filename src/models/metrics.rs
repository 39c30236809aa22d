//! Metrics Models

use std::fmt;

use serde::{Deserialize, Serialize};

use agent_chat_core::{AgentId, RequestId, ResponseId};

/// Per-response performance and quality report
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MetricsReport {
    pub response_id: ResponseId,
    pub request_id: RequestId,
    pub agent_id: AgentId,
    /// Submission to first chunk; `None` when nothing was streamed
    pub latency_ms: Option<i64>,
    /// First to last chunk, or submission to completion without chunks
    pub answering_ms: i64,
    /// Submission to completion
    pub total_ms: i64,
    pub thinking_bytes: usize,
    pub answer_bytes: usize,
    pub total_bytes: usize,
    /// UTF-8 bytes that arrived as chunks; 0 when only a final payload came
    pub streamed_bytes: usize,
    /// Heuristic answer confidence in [0, 100]
    pub confidence: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completion_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage_percent: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens_per_second: Option<f64>,
}

impl fmt::Display for MetricsReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.latency_ms {
            Some(ms) => write!(f, "latency {}ms", ms)?,
            None => write!(f, "latency n/a")?,
        }
        write!(
            f,
            " | answering {}ms | total {}ms | {}B ({}B thinking, {}B answer) | confidence {}%",
            self.answering_ms,
            self.total_ms,
            self.total_bytes,
            self.thinking_bytes,
            self.answer_bytes,
            self.confidence
        )?;
        if let Some(tps) = self.tokens_per_second {
            write!(f, " | {:.1} tok/s", tps)?;
        }
        if let Some(usage) = self.usage_percent {
            write!(f, " | context {:.0}%", usage)?;
        }
        Ok(())
    }
}
