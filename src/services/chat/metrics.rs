//! Metrics Calculator
//!
//! Turns a finished request record plus its accumulated content into a
//! [`MetricsReport`]. Computation is deferred by a grace window so token usage
//! that arrives after the final response can still be folded in; a guard set
//! makes sure each response id is scheduled at most once.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use regex::Regex;

use agent_chat_core::{ResponseId, TokenUsage};
use agent_chat_tools::content_parser::{parse_final_answer, separate_thinking_and_answer};

use crate::models::metrics::MetricsReport;
use crate::models::request::RequestRecord;
use crate::models::settings::{ConfidenceParams, MetricsConfig};
use crate::utils::error::{AppError, AppResult};

#[derive(Debug)]
pub struct MetricsCalculator {
    params: ConfidenceParams,
    /// Word-bounded, case-insensitive alternation of the uncertainty lexicon
    uncertainty: Option<Regex>,
    grace_window_ms: u64,
    max_retries: u32,
    scheduled: HashSet<ResponseId>,
}

impl MetricsCalculator {
    pub fn new(config: &MetricsConfig) -> AppResult<Self> {
        let uncertainty = if config.confidence.uncertainty_terms.is_empty() {
            None
        } else {
            let alternation = config
                .confidence
                .uncertainty_terms
                .iter()
                .map(|term| regex::escape(term.trim()))
                .collect::<Vec<_>>()
                .join("|");
            let pattern = format!(r"(?i)\b(?:{})\b", alternation);
            Some(Regex::new(&pattern).map_err(|e| {
                AppError::config(format!("invalid uncertainty lexicon: {}", e))
            })?)
        };

        Ok(Self {
            params: config.confidence.clone(),
            uncertainty,
            grace_window_ms: config.grace_window_ms,
            max_retries: config.max_retries,
            scheduled: HashSet::new(),
        })
    }

    pub fn grace_window_ms(&self) -> u64 {
        self.grace_window_ms
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Claim the single metrics slot of a response. Returns `false` when it
    /// was already claimed.
    pub fn try_schedule(&mut self, response_id: &str) -> bool {
        self.scheduled.insert(response_id.to_string())
    }

    /// Free the slot of a response whose report was emitted or abandoned
    pub fn release(&mut self, response_id: &str) -> bool {
        self.scheduled.remove(response_id)
    }

    /// Responses with a metrics window still outstanding
    pub fn scheduled_count(&self) -> usize {
        self.scheduled.len()
    }

    /// Number of occurrences of uncertainty terms in `text`
    pub fn uncertainty_hits(&self, text: &str) -> usize {
        self.uncertainty
            .as_ref()
            .map(|re| re.find_iter(text).count())
            .unwrap_or(0)
    }

    /// Heuristic confidence of a final answer, clamped to [0, 100]
    pub fn confidence_score(&self, answer: &str, usage: Option<&TokenUsage>) -> u8 {
        let p = &self.params;
        let len = answer.chars().count();
        let mut score = p.base;

        if len > p.long_threshold {
            score += p.long_bonus;
        } else if len > p.medium_threshold {
            score += p.medium_bonus;
        } else if len < p.short_threshold {
            score -= p.short_penalty;
        }

        if let Some(usage) = usage {
            let percent = usage.usage_percent;
            if (0.0..=p.healthy_usage_max).contains(&percent) {
                score += p.healthy_usage_bonus;
            } else if percent >= p.saturated_usage_min {
                score -= p.saturated_usage_penalty;
            }
        }

        let hits = i32::try_from(self.uncertainty_hits(answer)).unwrap_or(i32::MAX);
        score = score.saturating_sub(p.uncertainty_penalty.saturating_mul(hits));

        score.clamp(0, 100) as u8
    }

    /// Build the report for a finished request.
    ///
    /// `content` is the raw response text, thinking included.
    pub fn compute(
        &self,
        response_id: &str,
        record: &RequestRecord,
        content: &str,
        now: DateTime<Utc>,
    ) -> MetricsReport {
        let completed_at = record.completed_at.unwrap_or(now);
        let total_ms = (completed_at - record.start_time).num_milliseconds().max(0);

        let latency_ms = record
            .first_chunk_time
            .map(|first| (first - record.start_time).num_milliseconds().max(0));

        let answering_ms = match (record.first_chunk_time, record.last_chunk_time) {
            (Some(first), Some(last)) => (last - first).num_milliseconds().max(0),
            _ => total_ms,
        };

        let split = separate_thinking_and_answer(content);
        let answer = parse_final_answer(content);
        let usage = record.token_usage.as_ref();

        let completion_tokens = usage.and_then(|u| u.completion_tokens);
        let tokens_per_second = match completion_tokens {
            Some(tokens) if answering_ms > 0 => Some(tokens as f64 * 1000.0 / answering_ms as f64),
            _ => usage
                .and_then(|u| u.timings)
                .and_then(|t| t.predicted_per_second),
        };

        MetricsReport {
            response_id: response_id.to_string(),
            request_id: record.request_id.clone(),
            agent_id: record.agent_id.clone(),
            latency_ms,
            answering_ms,
            total_ms,
            thinking_bytes: split.thinking.len(),
            answer_bytes: split.answer.len(),
            total_bytes: content.len(),
            streamed_bytes: record.bytes_received,
            confidence: self.confidence_score(&answer, usage),
            prompt_tokens: usage.map(|u| u.prompt_tokens),
            completion_tokens,
            usage_percent: usage.map(|u| u.usage_percent),
            tokens_per_second,
        }
    }
}
