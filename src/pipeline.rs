//! Pipeline orchestration
//!
//! [`PipelineOrchestrator::run`] takes a planned job through every batch in order, the
//! consistency review, the workspace write, the output mirror and the archive. It fails only
//! when no file at all was generated, or when the generated files cannot be published.

use crate::config::{BudgetConfig, ModelTier, PipelineConfig, SitesmithConfig};
use crate::error::{JobError, PipelineError, StorageError};
use crate::generation::{BatchContext, FileFailure, GenerationWorker, TokenBudget};
use crate::job::{CodegenResult, DroppedFile, GeneratedFile, Job, JobStatus, JobStore};
use crate::notify::Notifier;
use crate::planner::BatchPlanner;
use crate::provider::CompletionClient;
use crate::workspace::{self, ArchiveWriter, ZipArchiveWriter};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

pub const STAGE_BATCH_PLANNING: &str = "batch_planning";
pub const STAGE_GENERATION: &str = "generation";
pub const STAGE_CONSISTENCY: &str = "consistency";
pub const STAGE_PUBLISH: &str = "publish";

/// What a successful run produced. Fewer generated than planned files is a partial success.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineReport {
    pub job_id: String,
    pub planned: usize,
    pub generated: usize,
    pub dropped: Vec<String>,
    pub consistency_issues: usize,
    pub output_dir: PathBuf,
    pub zip_path: PathBuf,
}

impl PipelineReport {
    pub fn is_partial(&self) -> bool {
        self.generated < self.planned
    }
}

pub struct PipelineOrchestrator {
    store: Arc<JobStore>,
    worker: GenerationWorker,
    planner: BatchPlanner,
    archiver: Arc<dyn ArchiveWriter>,
    budget: BudgetConfig,
    pacing: PipelineConfig,
    notifier: Notifier,
}

impl PipelineOrchestrator {
    pub fn new(
        store: Arc<JobStore>,
        worker: GenerationWorker,
        budget: BudgetConfig,
        pacing: PipelineConfig,
    ) -> Self {
        Self {
            store,
            worker,
            planner: BatchPlanner::default(),
            archiver: Arc::new(ZipArchiveWriter),
            budget,
            pacing,
            notifier: Notifier::disabled(),
        }
    }

    pub fn from_config(
        store: Arc<JobStore>,
        client: Arc<dyn CompletionClient>,
        config: &SitesmithConfig,
    ) -> Self {
        Self::new(
            store,
            GenerationWorker::from_config(client, config),
            config.budget,
            config.pipeline.clone(),
        )
    }

    pub fn with_notifier(mut self, notifier: Notifier) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_planner(mut self, planner: BatchPlanner) -> Self {
        self.planner = planner;
        self
    }

    pub fn with_archiver(mut self, archiver: Arc<dyn ArchiveWriter>) -> Self {
        self.archiver = archiver;
        self
    }

    pub fn store(&self) -> &JobStore {
        &self.store
    }

    pub async fn run(&self, job: &mut Job) -> Result<PipelineReport, PipelineError> {
        if job.status() != JobStatus::Planned {
            return Err(JobError::InvalidTransition {
                job_id: job.job_id.clone(),
                from: job.status(),
                to: JobStatus::Generated,
            }
            .into());
        }
        let spec = job
            .spec
            .clone()
            .ok_or_else(|| PipelineError::Planning(format!("job {} has no spec", job.job_id)))?;

        job.diagnostics.start_stage(STAGE_BATCH_PLANNING);
        let plan = self.planner.plan(&job.plan.file_plan);
        job.diagnostics.end_stage(STAGE_BATCH_PLANNING);
        let planned = plan.total_files() + plan.rejected.len();
        let rejected: Vec<String> = plan.rejected.iter().map(|entry| entry.path.clone()).collect();
        job.diagnostics
            .dropped_files
            .extend(plan.rejected.iter().map(|entry| DroppedFile {
                path: entry.path.clone(),
                error: entry.reason.clone(),
            }));
        info!(job_id = %job.job_id, planned, rejected = rejected.len(), "Pipeline started");
        self.log_event(
            job,
            &format!(
                "pipeline started: {} planned files in {} batches",
                planned,
                plan.batches.iter().filter(|batch| !batch.is_empty()).count()
            ),
        );
        for entry in &plan.rejected {
            self.log_event(job, &format!("rejected {}: {}", entry.path, entry.reason));
        }
        self.notifier.emit(
            "pipeline_started",
            json!({
                "job_id": job.job_id,
                "planned": planned,
                "batch_types": plan.batch_types(),
            }),
        );

        job.diagnostics.start_stage(STAGE_GENERATION);
        let mut budget = TokenBudget::new(self.budget);
        let mut generated: Vec<GeneratedFile> = Vec::new();
        let mut dropped: Vec<FileFailure> = Vec::new();
        let mut previous_tier: Option<ModelTier> = None;

        for (index, batch) in plan.batches.iter().enumerate() {
            if batch.is_empty() {
                continue;
            }
            if let Some(tier) = previous_tier {
                let delay = self.pacing.inter_batch_delay(tier);
                if !delay.is_zero() {
                    debug!(delay_ms = delay.as_millis() as u64, "Pausing between batches");
                    tokio::time::sleep(delay).await;
                }
            }

            let outcome = self
                .worker
                .run_batch(
                    batch,
                    index,
                    BatchContext {
                        spec: &spec,
                        generated: &generated,
                        budget: &mut budget,
                        diagnostics: &mut job.diagnostics,
                    },
                )
                .await;

            previous_tier = Some(outcome.tier);
            self.log_event(
                job,
                &format!(
                    "batch {} ({}) generated {}, dropped {}",
                    index + 1,
                    outcome.batch_type,
                    outcome.files.len(),
                    outcome.dropped.len()
                ),
            );
            for failure in &outcome.dropped {
                self.log_event(job, &format!("dropped {}: {}", failure.path, failure.error));
            }
            self.notifier.emit(
                "batch_completed",
                json!({
                    "job_id": job.job_id,
                    "batch": index,
                    "batch_type": outcome.batch_type,
                    "generated": outcome.files.len(),
                    "dropped": outcome.dropped.len(),
                }),
            );
            job.diagnostics.batches.push(outcome.summary);
            job.diagnostics
                .dropped_files
                .extend(outcome.dropped.iter().map(DroppedFile::from));
            merge_files(&mut generated, outcome.files);
            dropped.extend(outcome.dropped);
        }
        job.diagnostics.end_stage(STAGE_GENERATION);
        job.diagnostics.premium_budget_remaining = Some(budget.remaining());

        if generated.is_empty() {
            return Err(self.fail_without_files(job, &dropped, rejected.len()));
        }

        job.diagnostics.start_stage(STAGE_CONSISTENCY);
        let issues = self
            .worker
            .review_consistency(&generated, &mut budget, &mut job.diagnostics)
            .await;
        job.diagnostics.end_stage(STAGE_CONSISTENCY);
        job.diagnostics.consistency_issues = issues;
        job.diagnostics.premium_budget_remaining = Some(budget.remaining());
        for file in &generated {
            job.diagnostics.record_file_hash(&file.path, &file.content);
        }

        let dropped_paths: Vec<String> = rejected
            .into_iter()
            .chain(dropped.iter().map(|failure| failure.path.clone()))
            .collect();
        let notes = if dropped_paths.is_empty() {
            format!("{} of {} planned files generated", generated.len(), planned)
        } else {
            format!(
                "{} of {} planned files generated; dropped: {}",
                generated.len(),
                planned,
                dropped_paths.join(", ")
            )
        };
        job.record_generated(CodegenResult {
            files: generated,
            notes,
        })?;
        self.store.save(job)?;

        job.diagnostics.start_stage(STAGE_PUBLISH);
        let zip_path = match self.publish(job) {
            Ok(zip_path) => zip_path,
            Err(err) => {
                error!(job_id = %job.job_id, error = %err, "Publishing generated files failed");
                self.log_event(job, &format!("publish failed: {}", err));
                job.fail(err.to_string())?;
                self.store.save(job)?;
                return Err(err.into());
            }
        };
        job.diagnostics.end_stage(STAGE_PUBLISH);
        job.record_archive(zip_path.clone())?;
        self.store.save(job)?;
        self.log_event(
            job,
            &format!(
                "finished: {} of {} planned files, archive {}",
                job.generated_file_count(),
                planned,
                zip_path.display()
            ),
        );

        let report = PipelineReport {
            job_id: job.job_id.clone(),
            planned,
            generated: job.generated_file_count(),
            dropped: dropped_paths,
            consistency_issues: job.diagnostics.consistency_issues.len(),
            output_dir: job.paths.output_dir.clone(),
            zip_path,
        };
        if report.is_partial() {
            warn!(
                job_id = %job.job_id,
                generated = report.generated,
                planned,
                "Pipeline finished with a partial result"
            );
        } else {
            info!(job_id = %job.job_id, generated = report.generated, "Pipeline finished");
        }
        self.notifier.emit(
            "pipeline_completed",
            json!({
                "job_id": report.job_id,
                "planned": report.planned,
                "generated": report.generated,
                "partial": report.is_partial(),
            }),
        );
        Ok(report)
    }

    /// Workspace write, output mirror, archive.
    fn publish(&self, job: &Job) -> Result<PathBuf, StorageError> {
        let files = job
            .codegen_result
            .as_ref()
            .map(|result| result.files.as_slice())
            .unwrap_or_default();
        workspace::write_files(&job.paths.generated_dir, files)?;
        workspace::copy_tree(&job.paths.generated_dir, &job.paths.output_dir)?;
        self.archiver
            .create_zip(&job.paths.output_dir, &job.paths.zip_path)
    }

    /// Job log lines are diagnostics only; a failed write never changes the outcome.
    fn log_event(&self, job: &Job, message: &str) {
        if let Err(err) = self.store.append_log(job, message) {
            warn!(job_id = %job.job_id, error = %err, "Failed to write job log");
        }
    }

    fn fail_without_files(
        &self,
        job: &mut Job,
        dropped: &[FileFailure],
        rejected: usize,
    ) -> PipelineError {
        let transient = !dropped.is_empty() && dropped.iter().all(|f| f.error.is_transient());
        let failed = dropped.len() + rejected;
        let reason = format!("no files generated ({} planned files failed)", failed);
        error!(job_id = %job.job_id, failed, transient, "Pipeline produced no files");

        self.log_event(job, &format!("failed: {}", reason));
        if let Err(err) = job.fail(reason) {
            return err.into();
        }
        if let Err(err) = self.store.save(job) {
            return err.into();
        }
        self.notifier.emit(
            "pipeline_failed",
            json!({
                "job_id": job.job_id,
                "failed": failed,
                "transient": transient,
            }),
        );
        PipelineError::NoFilesGenerated {
            job_id: job.job_id.clone(),
            failed,
            transient,
        }
    }
}

/// Later results replace earlier ones with the same path, so no path appears twice.
fn merge_files(generated: &mut Vec<GeneratedFile>, incoming: Vec<GeneratedFile>) {
    for file in incoming {
        match generated.iter_mut().find(|existing| existing.path == file.path) {
            Some(existing) => {
                warn!(path = %file.path, "File generated twice; keeping the later version");
                *existing = file;
            }
            None => generated.push(file),
        }
    }
}
