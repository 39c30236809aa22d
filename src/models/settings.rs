//! Settings Models
//!
//! Engine configuration stored in config.json. Every tunable constant of the
//! correlation engine lives here, including the confidence heuristic weights.

use serde::{Deserialize, Serialize};

/// Engine configuration stored in config.json
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// Metrics computation settings
    pub metrics: MetricsConfig,
    /// How long ids of aborted/failed requests keep swallowing late events
    pub tombstone_ttl_secs: u64,
    /// Content of the provisional message shown after submission
    pub placeholder_text: String,
    /// Content of the message appended when a request is aborted
    pub abort_sentinel: String,
    /// Directory for the file history store (defaults to ~/.agent-chat/history)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub history_dir: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            metrics: MetricsConfig::default(),
            tombstone_ttl_secs: 120,
            placeholder_text: "Thinking…".to_string(),
            abort_sentinel: "(Request aborted)".to_string(),
            history_dir: None,
        }
    }
}

/// Metrics grace window and scoring weights
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MetricsConfig {
    /// Delay between completion and computation, so late token usage can land
    pub grace_window_ms: u64,
    /// Extra windows granted when token usage is still missing
    pub max_retries: u32,
    /// Confidence heuristic weights
    pub confidence: ConfidenceParams,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            grace_window_ms: 1500,
            max_retries: 1,
            confidence: ConfidenceParams::default(),
        }
    }
}

/// Confidence score heuristic. Length and usage adjustments are applied to
/// `base`, then each uncertainty term occurrence subtracts
/// `uncertainty_penalty`; the result is clamped to [0, 100].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ConfidenceParams {
    pub base: i32,
    pub long_threshold: usize,
    pub long_bonus: i32,
    pub medium_threshold: usize,
    pub medium_bonus: i32,
    pub short_threshold: usize,
    pub short_penalty: i32,
    pub healthy_usage_max: f64,
    pub healthy_usage_bonus: i32,
    pub saturated_usage_min: f64,
    pub saturated_usage_penalty: i32,
    pub uncertainty_penalty: i32,
    pub uncertainty_terms: Vec<String>,
}

impl Default for ConfidenceParams {
    fn default() -> Self {
        Self {
            base: 50,
            long_threshold: 500,
            long_bonus: 15,
            medium_threshold: 200,
            medium_bonus: 10,
            short_threshold: 50,
            short_penalty: 10,
            healthy_usage_max: 80.0,
            healthy_usage_bonus: 10,
            saturated_usage_min: 90.0,
            saturated_usage_penalty: 5,
            uncertainty_penalty: 3,
            uncertainty_terms: [
                "maybe",
                "perhaps",
                "might",
                "could",
                "possibly",
                "uncertain",
                "not sure",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        }
    }
}

impl EngineConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.metrics.grace_window_ms > 60_000 {
            return Err("metrics.grace_window_ms cannot exceed 60000".to_string());
        }

        if self.metrics.max_retries > 10 {
            return Err("metrics.max_retries cannot exceed 10".to_string());
        }

        let c = &self.metrics.confidence;
        if c.medium_threshold > c.long_threshold {
            return Err(format!(
                "confidence.medium_threshold ({}) must not exceed long_threshold ({})",
                c.medium_threshold, c.long_threshold
            ));
        }
        if c.short_threshold > c.medium_threshold {
            return Err(format!(
                "confidence.short_threshold ({}) must not exceed medium_threshold ({})",
                c.short_threshold, c.medium_threshold
            ));
        }
        if !(0.0..=100.0).contains(&c.healthy_usage_max)
            || !(0.0..=100.0).contains(&c.saturated_usage_min)
        {
            return Err("confidence usage bounds must be percentages in [0, 100]".to_string());
        }
        if c.uncertainty_terms.iter().any(|t| t.trim().is_empty()) {
            return Err("confidence.uncertainty_terms cannot contain empty terms".to_string());
        }

        if self.placeholder_text.trim().is_empty() {
            return Err("placeholder_text cannot be empty".to_string());
        }

        Ok(())
    }

    /// Builder: override the metrics grace window
    pub fn with_grace_window_ms(mut self, ms: u64) -> Self {
        self.metrics.grace_window_ms = ms;
        self
    }
}
