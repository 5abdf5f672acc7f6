//! Per-job diagnostics: stage timings, token usage, batch summaries.

use crate::provider::TokenUsage;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const PIPELINE_VARIANT_CHUNKED: &str = "chunked";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageTiming {
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
}

impl StageTiming {
    pub fn duration_ms(&self) -> Option<i64> {
        self.ended_at
            .map(|ended| (ended - self.started_at).num_milliseconds())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenCounters {
    pub calls: u32,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl TokenCounters {
    pub fn add(&mut self, usage: Option<TokenUsage>) {
        self.calls += 1;
        if let Some(usage) = usage {
            self.prompt_tokens += u64::from(usage.prompt_tokens);
            self.completion_tokens += u64::from(usage.completion_tokens);
            self.total_tokens += u64::from(usage.total_tokens);
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub index: usize,
    pub batch_type: String,
    pub planned: usize,
    pub generated: usize,
    pub failed: usize,
    pub retried: usize,
    pub recovered: usize,
    pub models: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DroppedFile {
    pub path: String,
    pub error: String,
}

/// One drift finding from the consistency review. Advisory only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsistencyIssue {
    pub file: String,
    pub issue: String,
    #[serde(default)]
    pub fix: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobDiagnostics {
    pub pipeline_variant: String,
    #[serde(default)]
    pub stages: BTreeMap<String, StageTiming>,
    #[serde(default)]
    pub premium_usage: TokenCounters,
    #[serde(default)]
    pub fallback_usage: TokenCounters,
    #[serde(default)]
    pub usage_by_model: BTreeMap<String, TokenCounters>,
    #[serde(default)]
    pub batches: Vec<BatchSummary>,
    #[serde(default)]
    pub dropped_files: Vec<DroppedFile>,
    #[serde(default)]
    pub consistency_issues: Vec<ConsistencyIssue>,
    /// blake3 hex digest of each generated file, keyed by path
    #[serde(default)]
    pub file_hashes: BTreeMap<String, String>,
    #[serde(default)]
    pub premium_budget_remaining: Option<u32>,
}

impl Default for JobDiagnostics {
    fn default() -> Self {
        Self {
            pipeline_variant: PIPELINE_VARIANT_CHUNKED.to_string(),
            stages: BTreeMap::new(),
            premium_usage: TokenCounters::default(),
            fallback_usage: TokenCounters::default(),
            usage_by_model: BTreeMap::new(),
            batches: Vec::new(),
            dropped_files: Vec::new(),
            consistency_issues: Vec::new(),
            file_hashes: BTreeMap::new(),
            premium_budget_remaining: None,
        }
    }
}

impl JobDiagnostics {
    pub fn start_stage(&mut self, stage: &str) {
        self.stages.insert(
            stage.to_string(),
            StageTiming {
                started_at: Utc::now(),
                ended_at: None,
            },
        );
    }

    /// Ends a stage; a stage that was never started gets a zero-length timing.
    pub fn end_stage(&mut self, stage: &str) {
        let now = Utc::now();
        self.stages
            .entry(stage.to_string())
            .or_insert(StageTiming {
                started_at: now,
                ended_at: None,
            })
            .ended_at = Some(now);
    }

    pub fn record_usage(&mut self, model: &str, premium: bool, usage: Option<TokenUsage>) {
        if premium {
            self.premium_usage.add(usage);
        } else {
            self.fallback_usage.add(usage);
        }
        self.usage_by_model
            .entry(model.to_string())
            .or_default()
            .add(usage);
    }

    pub fn record_file_hash(&mut self, path: &str, content: &str) {
        let digest = blake3::hash(content.as_bytes());
        self.file_hashes
            .insert(path.to_string(), hex::encode(digest.as_bytes()));
    }
}
