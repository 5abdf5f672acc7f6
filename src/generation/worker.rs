//! Batch execution
//!
//! The foundation batch is one combined call and is never retried. Every other batch fans out
//! one call per file, awaits them all, then gives the failures exactly one more attempt after
//! a fixed delay, with everything generated so far (this batch included) as context. Files
//! that fail their retry are dropped; the batch still returns what succeeded.

use super::budget::{choose_for_file, choose_for_foundation, estimate_file_tokens, TokenBudget};
use super::parse::{parse_file_array, parse_file_response};
use super::prompt;
use crate::config::{ModelTier, ModelsConfig, SitesmithConfig};
use crate::error::{CompletionError, GenerationError};
use crate::job::{
    BatchSummary, DroppedFile, FilePlanEntry, GeneratedFile, ImprovedSpec, JobDiagnostics,
};
use crate::planner::{Batch, BatchType};
use crate::provider::{CompletionClient, CompletionOptions, CompletionResponse};
use crate::workspace::normalize_path;
use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Job-scoped state threaded through each batch.
pub struct BatchContext<'a> {
    pub spec: &'a ImprovedSpec,
    /// Every file produced by earlier batches, in generation order
    pub generated: &'a [GeneratedFile],
    pub budget: &'a mut TokenBudget,
    pub diagnostics: &'a mut JobDiagnostics,
}

#[derive(Debug)]
pub struct FileFailure {
    pub path: String,
    pub error: GenerationError,
}

impl From<&FileFailure> for DroppedFile {
    fn from(failure: &FileFailure) -> Self {
        DroppedFile {
            path: failure.path.clone(),
            error: failure.error.to_string(),
        }
    }
}

#[derive(Debug)]
pub struct BatchOutcome {
    pub batch_type: BatchType,
    pub files: Vec<GeneratedFile>,
    pub dropped: Vec<FileFailure>,
    /// `Free` when any call in the batch went to a free-tier model
    pub tier: ModelTier,
    pub summary: BatchSummary,
}

impl BatchOutcome {
    fn new(batch: &Batch, index: usize) -> Self {
        Self {
            batch_type: batch.batch_type,
            files: Vec::new(),
            dropped: Vec::new(),
            tier: ModelTier::Paid,
            summary: BatchSummary {
                index,
                batch_type: batch.batch_type.to_string(),
                planned: batch.len(),
                ..BatchSummary::default()
            },
        }
    }

    fn note_model(&mut self, model_id: &str, tier: ModelTier) {
        if tier == ModelTier::Free {
            self.tier = ModelTier::Free;
        }
        if !self.summary.models.iter().any(|m| m == model_id) {
            self.summary.models.push(model_id.to_string());
        }
    }

    /// Every failure in this batch was a timeout, connection reset or rate limit.
    pub fn all_failures_transient(&self) -> bool {
        !self.dropped.is_empty() && self.dropped.iter().all(|f| f.error.is_transient())
    }
}

pub struct GenerationWorker {
    pub(super) client: Arc<dyn CompletionClient>,
    pub(super) models: ModelsConfig,
    pub(super) options: CompletionOptions,
    retry_delay: Duration,
}

impl GenerationWorker {
    pub fn new(
        client: Arc<dyn CompletionClient>,
        models: ModelsConfig,
        options: CompletionOptions,
        retry_delay: Duration,
    ) -> Self {
        Self {
            client,
            models,
            options,
            retry_delay,
        }
    }

    pub fn from_config(client: Arc<dyn CompletionClient>, config: &SitesmithConfig) -> Self {
        Self::new(
            client,
            config.models.clone(),
            CompletionOptions::from_settings(&config.provider),
            config.pipeline.retry_delay(),
        )
    }

    pub fn models(&self) -> &ModelsConfig {
        &self.models
    }

    pub async fn run_batch(
        &self,
        batch: &Batch,
        index: usize,
        ctx: BatchContext<'_>,
    ) -> BatchOutcome {
        info!(
            batch = index,
            batch_type = %batch.batch_type,
            files = batch.len(),
            "Batch started"
        );
        let outcome = if batch.batch_type.is_combined() {
            self.run_combined(batch, index, ctx).await
        } else {
            self.run_fan_out(batch, index, ctx).await
        };
        info!(
            batch = index,
            batch_type = %batch.batch_type,
            generated = outcome.summary.generated,
            failed = outcome.summary.failed,
            recovered = outcome.summary.recovered,
            dropped = outcome.dropped.len(),
            "Batch completed"
        );
        outcome
    }

    async fn run_combined(
        &self,
        batch: &Batch,
        index: usize,
        ctx: BatchContext<'_>,
    ) -> BatchOutcome {
        let mut outcome = BatchOutcome::new(batch, index);
        let messages = prompt::foundation_messages(ctx.spec, &batch.entries, ctx.generated);
        let choice = choose_for_foundation(ctx.budget, &self.models);
        outcome.note_model(&choice.model.id, choice.model.tier);
        debug!(
            model = %choice.model.id,
            premium = choice.is_premium(),
            files = batch.len(),
            "Requesting combined generation"
        );

        let result = self
            .client
            .complete(messages, &choice.model.id, self.options.clone())
            .await;

        let parsed = match result {
            Ok(response) => {
                ctx.diagnostics
                    .record_usage(&choice.model.id, choice.is_premium(), response.usage);
                choice.settle(ctx.budget, response.usage, true);
                parse_file_array(&response.content).map_err(GenerationError::from)
            }
            Err(err) => {
                choice.settle(ctx.budget, None, false);
                Err(GenerationError::from(err))
            }
        };

        match parsed {
            Ok(files) => {
                let mut by_path: HashMap<String, GeneratedFile> = files
                    .into_iter()
                    .map(|file| (file.path.clone(), file))
                    .collect();
                for entry in &batch.entries {
                    match take_planned(&mut by_path, &entry.path) {
                        Some(content) => outcome.files.push(GeneratedFile {
                            path: entry.path.clone(),
                            content,
                        }),
                        None => outcome.dropped.push(FileFailure {
                            path: entry.path.clone(),
                            error: GenerationError::MissingFromResponse(entry.path.clone()),
                        }),
                    }
                }
                for path in by_path.keys() {
                    debug!(path = %path, "Ignoring unplanned file in combined response");
                }
            }
            Err(error) => {
                warn!(batch = index, error = %error, "Combined generation failed");
                outcome.dropped = batch
                    .entries
                    .iter()
                    .map(|entry| FileFailure {
                        path: entry.path.clone(),
                        error: error.clone(),
                    })
                    .collect();
            }
        }

        for failure in &outcome.dropped {
            warn!(path = %failure.path, error = %failure.error, "Dropping file");
        }
        outcome.summary.generated = outcome.files.len();
        outcome.summary.failed = outcome.dropped.len();
        outcome
    }

    async fn run_fan_out(
        &self,
        batch: &Batch,
        index: usize,
        ctx: BatchContext<'_>,
    ) -> BatchOutcome {
        let mut outcome = BatchOutcome::new(batch, index);
        let entries: Vec<&FilePlanEntry> = batch.entries.iter().collect();

        let first_pass = self
            .generate_files(
                &entries,
                ctx.spec,
                ctx.generated,
                false,
                ctx.budget,
                ctx.diagnostics,
                &mut outcome,
            )
            .await;

        let mut failed = Vec::new();
        for (entry, result) in first_pass {
            match result {
                Ok(file) => outcome.files.push(file),
                Err(error) => {
                    warn!(
                        path = %entry.path,
                        error = %error,
                        "File generation failed; will retry"
                    );
                    failed.push(entry);
                }
            }
        }
        outcome.summary.failed = failed.len();

        if !failed.is_empty() {
            if !self.retry_delay.is_zero() {
                tokio::time::sleep(self.retry_delay).await;
            }
            let mut context = ctx.generated.to_vec();
            context.extend(outcome.files.iter().cloned());
            outcome.summary.retried = failed.len();

            let retry_pass = self
                .generate_files(
                    &failed,
                    ctx.spec,
                    &context,
                    true,
                    ctx.budget,
                    ctx.diagnostics,
                    &mut outcome,
                )
                .await;
            for (entry, result) in retry_pass {
                match result {
                    Ok(file) => {
                        outcome.summary.recovered += 1;
                        outcome.files.push(file);
                    }
                    Err(error) => {
                        warn!(path = %entry.path, error = %error, "Retry failed; dropping file");
                        outcome.dropped.push(FileFailure {
                            path: entry.path.clone(),
                            error,
                        });
                    }
                }
            }
        }

        outcome.summary.generated = outcome.files.len();
        outcome
    }

    /// One concurrent call per entry. Models are chosen, and premium tokens reserved, before any
    /// call starts; results come back in entry order.
    #[allow(clippy::too_many_arguments)]
    async fn generate_files<'e>(
        &self,
        entries: &[&'e FilePlanEntry],
        spec: &ImprovedSpec,
        context: &[GeneratedFile],
        retry: bool,
        budget: &mut TokenBudget,
        diagnostics: &mut JobDiagnostics,
        outcome: &mut BatchOutcome,
    ) -> Vec<(&'e FilePlanEntry, Result<GeneratedFile, GenerationError>)> {
        let mut choices = Vec::with_capacity(entries.len());
        let mut calls = FuturesUnordered::new();
        for (slot, entry) in entries.iter().enumerate() {
            let messages = prompt::file_messages(spec, entry, context, retry);
            let estimate = estimate_file_tokens(prompt::prompt_chars(&messages));
            let choice = choose_for_file(budget, &self.models, entry, estimate);
            outcome.note_model(&choice.model.id, choice.model.tier);
            debug!(
                path = %entry.path,
                model = %choice.model.id,
                premium = choice.is_premium(),
                estimate,
                retry,
                "Requesting file generation"
            );

            let model_id = choice.model.id.clone();
            let options = self.options.clone();
            let client = &self.client;
            calls.push(async move {
                let result = client.complete(messages, &model_id, options).await;
                (slot, result)
            });
            choices.push(choice);
        }

        let mut responses: Vec<Option<Result<CompletionResponse, CompletionError>>> =
            entries.iter().map(|_| None).collect();
        while let Some((slot, result)) = calls.next().await {
            responses[slot] = Some(result);
        }

        let mut results = Vec::with_capacity(entries.len());
        for ((entry, choice), response) in entries.iter().zip(choices).zip(responses) {
            let result = match response {
                Some(Ok(response)) => {
                    diagnostics.record_usage(
                        &choice.model.id,
                        choice.is_premium(),
                        response.usage,
                    );
                    choice.settle(budget, response.usage, true);
                    parse_file_response(&response.content, &entry.path)
                        .map_err(GenerationError::from)
                }
                Some(Err(err)) => {
                    choice.settle(budget, None, false);
                    Err(GenerationError::from(err))
                }
                None => {
                    choice.settle(budget, None, false);
                    Err(GenerationError::MissingFromResponse(entry.path.clone()))
                }
            };
            results.push((*entry, result));
        }
        results
    }
}

/// Exact path first, then a unique file-name match (`css/site.css` for `site.css`).
fn take_planned(by_path: &mut HashMap<String, GeneratedFile>, planned: &str) -> Option<String> {
    let planned = normalize_path(planned);
    if let Some(file) = by_path.remove(&planned) {
        return Some(file.content);
    }
    let file_name = planned.rsplit('/').next().unwrap_or(&planned).to_string();
    let candidates: Vec<String> = by_path
        .keys()
        .filter(|path| path.rsplit('/').next() == Some(file_name.as_str()))
        .cloned()
        .collect();
    match candidates.as_slice() {
        [only] => by_path.remove(only).map(|file| file.content),
        _ => None,
    }
}
