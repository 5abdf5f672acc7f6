//! Operator CLI: clap definitions, dispatch and text presentation.

use crate::config::{ConfigLoader, SitesmithConfig, StorageConfig};
use crate::error::ConfigError;
use crate::job::{FilePlanEntry, ImprovedSpec, Job, JobStore};
use crate::pipeline::{PipelineOrchestrator, PipelineReport};
use crate::planner::{BatchPlan, BatchPlanner};
use crate::provider::HttpCompletionClient;
use anyhow::Context;
use clap::{Parser, Subcommand};
use comfy_table::presets::UTF8_BORDERS_ONLY;
use comfy_table::Table;
use owo_colors::OwoColorize;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub const LOG_TAIL_LINES: usize = 20;

/// Sitesmith - chunked, budget-aware site generation
#[derive(Parser)]
#[command(name = "sitesmith")]
#[command(about = "Run and inspect chunked site generation jobs")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Workspace root directory
    #[arg(long, default_value = ".")]
    pub workspace: PathBuf,

    /// Configuration file path (overrides default config loading)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Enable verbose logging (default: off)
    #[arg(long, default_value = "false")]
    pub verbose: bool,

    /// Log level (trace, debug, info, warn, error, off)
    #[arg(long)]
    pub log_level: Option<String>,

    /// Log format (json, text)
    #[arg(long)]
    pub log_format: Option<String>,

    /// Log output (stdout, stderr, file)
    #[arg(long)]
    pub log_output: Option<String>,

    /// Log file path (if output is "file")
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Show how a file plan splits into batches
    Plan {
        /// JSON file plan: an array of {path, purpose, notes} or {"file_plan": [...]}
        plan: PathBuf,
        /// Output format (text or json)
        #[arg(long, default_value = "text")]
        format: String,
    },
    /// Run a job end to end against the configured provider
    Generate {
        /// Improved spec JSON
        #[arg(long)]
        spec: PathBuf,
        /// File plan JSON
        #[arg(long)]
        plan: PathBuf,
    },
    /// Show a persisted job, or list jobs when no id is given
    Status {
        job_id: Option<String>,
        /// Output format (text or json)
        #[arg(long, default_value = "text")]
        format: String,
    },
    /// Print the effective configuration as TOML
    Config,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum PlanFile {
    Entries(Vec<FilePlanEntry>),
    Wrapped { file_plan: Vec<FilePlanEntry> },
}

impl PlanFile {
    fn into_entries(self) -> Vec<FilePlanEntry> {
        match self {
            PlanFile::Entries(entries) => entries,
            PlanFile::Wrapped { file_plan } => file_plan,
        }
    }
}

pub fn read_plan_file(path: &Path) -> anyhow::Result<Vec<FilePlanEntry>> {
    let bytes = std::fs::read(path)
        .with_context(|| format!("Failed to read file plan {}", path.display()))?;
    let plan: PlanFile = serde_json::from_slice(&bytes)
        .with_context(|| format!("Invalid file plan {}", path.display()))?;
    Ok(plan.into_entries())
}

pub fn read_spec_file(path: &Path) -> anyhow::Result<ImprovedSpec> {
    let bytes =
        std::fs::read(path).with_context(|| format!("Failed to read spec {}", path.display()))?;
    serde_json::from_slice(&bytes).with_context(|| format!("Invalid spec {}", path.display()))
}

/// Runtime context for CLI execution: workspace root and validated configuration.
pub struct RunContext {
    workspace_root: PathBuf,
    config: SitesmithConfig,
}

impl RunContext {
    /// Create run context from workspace root and optional config path. Uses ConfigLoader only.
    pub fn new(workspace_root: PathBuf, config_path: Option<PathBuf>) -> Result<Self, ConfigError> {
        let config = match config_path {
            Some(path) => ConfigLoader::load_from_file(&path)?,
            None => ConfigLoader::load(&workspace_root)?,
        };
        Ok(Self {
            workspace_root,
            config,
        })
    }

    pub fn config(&self) -> &SitesmithConfig {
        &self.config
    }

    /// Storage roots resolved against the workspace root.
    fn storage(&self) -> StorageConfig {
        StorageConfig {
            workspace_root: self.workspace_root.join(&self.config.storage.workspace_root),
            output_root: self.workspace_root.join(&self.config.storage.output_root),
        }
    }

    pub async fn execute(&self, command: &Commands) -> anyhow::Result<String> {
        match command {
            Commands::Plan { plan, format } => {
                let entries = read_plan_file(plan)?;
                let batch_plan = BatchPlanner::default().plan(&entries);
                if format == "json" {
                    Ok(serde_json::to_string_pretty(&batch_plan)?)
                } else {
                    Ok(format_batch_plan_text(&batch_plan))
                }
            }
            Commands::Generate { spec, plan } => {
                let spec = read_spec_file(spec)?;
                let entries = read_plan_file(plan)?;
                let report = self.generate(spec, entries).await?;
                Ok(format_report_text(&report))
            }
            Commands::Status { job_id, format } => {
                let store = JobStore::from_config(&self.storage())?;
                match job_id {
                    Some(job_id) => {
                        let job = store.load(job_id)?;
                        if format == "json" {
                            Ok(serde_json::to_string_pretty(&job)?)
                        } else {
                            let mut out = format_job_status_text(&job);
                            out.push_str(&format_job_log_text(&store.read_log(&job)?));
                            Ok(out)
                        }
                    }
                    None => Ok(format_job_list_text(&store, &store.list()?)),
                }
            }
            Commands::Config => {
                toml::to_string_pretty(&self.config).context("Failed to render configuration")
            }
        }
    }

    async fn generate(
        &self,
        spec: ImprovedSpec,
        entries: Vec<FilePlanEntry>,
    ) -> anyhow::Result<PipelineReport> {
        let store = Arc::new(JobStore::from_config(&self.storage())?);
        let client = Arc::new(HttpCompletionClient::new(&self.config.provider)?);
        let orchestrator = PipelineOrchestrator::from_config(store.clone(), client, &self.config);

        let mut job = store.create(spec.project_type)?;
        job.record_spec(spec)?;
        job.record_plan(entries)?;
        store.save(&job)?;

        let report = orchestrator
            .run(&mut job)
            .await
            .with_context(|| format!("Job {} failed", job.job_id))?;
        Ok(report)
    }
}

pub fn format_section_heading(title: &str) -> String {
    format!("{}", title.bold().underline())
}

pub fn format_batch_plan_text(plan: &BatchPlan) -> String {
    let mut out = format!("{}\n\n", format_section_heading("Batch plan"));
    let mut table = Table::new();
    table.load_preset(UTF8_BORDERS_ONLY);
    table.set_header(vec!["#", "Batch", "Mode", "Files"]);
    for (index, batch) in plan.batches.iter().enumerate() {
        let mode = if batch.batch_type.is_combined() {
            "combined"
        } else {
            "per-file"
        };
        let files = if batch.is_empty() {
            "-".to_string()
        } else {
            batch.paths().join(", ")
        };
        table.add_row(vec![
            (index + 1).to_string(),
            batch.batch_type.to_string(),
            mode.to_string(),
            files,
        ]);
    }
    out.push_str(&format!("{}\n", table));
    out.push_str(&format!("Total files: {}\n", plan.total_files()));
    for entry in &plan.rejected {
        out.push_str(&format!("Rejected {}: {}\n", entry.path, entry.reason));
    }
    out
}

pub fn format_report_text(report: &PipelineReport) -> String {
    let mut out = String::new();
    let heading = if report.is_partial() {
        "Job finished with a partial result"
    } else {
        "Job finished"
    };
    out.push_str(&format!("{}\n\n", format_section_heading(heading)));
    out.push_str(&format!("  Job: {}\n", report.job_id));
    out.push_str(&format!(
        "  Files: {} of {} planned\n",
        report.generated, report.planned
    ));
    if !report.dropped.is_empty() {
        out.push_str(&format!("  Dropped: {}\n", report.dropped.join(", ")));
    }
    out.push_str(&format!(
        "  Consistency issues: {}\n",
        report.consistency_issues
    ));
    out.push_str(&format!("  Output: {}\n", report.output_dir.display()));
    out.push_str(&format!("  Archive: {}\n", report.zip_path.display()));
    out
}

/// Most recent job log lines, at most [`LOG_TAIL_LINES`].
pub fn format_job_log_text(lines: &[String]) -> String {
    if lines.is_empty() {
        return String::new();
    }
    let mut out = format!("{}\n\n", format_section_heading("Log"));
    for line in &lines[lines.len().saturating_sub(LOG_TAIL_LINES)..] {
        out.push_str(&format!("  {}\n", line));
    }
    out
}

pub fn format_job_status_text(job: &Job) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "{}\n\n",
        format_section_heading(&format!("Job {}", job.job_id))
    ));
    out.push_str(&format!("  Status: {}\n", job.status()));
    out.push_str(&format!("  Project type: {}\n", job.project_type));
    out.push_str(&format!("  Created: {}\n", job.created_at.to_rfc3339()));
    out.push_str(&format!(
        "  Files: {} of {} planned\n",
        job.generated_file_count(),
        job.planned_file_count()
    ));
    if let Some(error) = &job.error {
        out.push_str(&format!("  Error: {}\n", error));
    }
    if let Some(zip) = &job.zip_path {
        out.push_str(&format!("  Archive: {}\n", zip.display()));
    }
    out.push('\n');

    let diagnostics = &job.diagnostics;
    if !diagnostics.stages.is_empty() {
        out.push_str(&format!("{}\n\n", format_section_heading("Stages")));
        let mut table = Table::new();
        table.load_preset(UTF8_BORDERS_ONLY);
        table.set_header(vec!["Stage", "Started", "Duration"]);
        for (stage, timing) in &diagnostics.stages {
            let duration = timing
                .duration_ms()
                .map(|ms| format!("{} ms", ms))
                .unwrap_or_else(|| "running".to_string());
            table.add_row(vec![
                stage.clone(),
                timing.started_at.to_rfc3339(),
                duration,
            ]);
        }
        out.push_str(&format!("{}\n\n", table));
    }

    if !diagnostics.batches.is_empty() {
        out.push_str(&format!("{}\n\n", format_section_heading("Batches")));
        let mut table = Table::new();
        table.load_preset(UTF8_BORDERS_ONLY);
        table.set_header(vec![
            "#", "Batch", "Planned", "Generated", "Retried", "Recovered", "Models",
        ]);
        for batch in &diagnostics.batches {
            table.add_row(vec![
                (batch.index + 1).to_string(),
                batch.batch_type.clone(),
                batch.planned.to_string(),
                batch.generated.to_string(),
                batch.retried.to_string(),
                batch.recovered.to_string(),
                batch.models.join(", "),
            ]);
        }
        out.push_str(&format!("{}\n\n", table));
    }

    out.push_str(&format!("{}\n\n", format_section_heading("Token usage")));
    let mut table = Table::new();
    table.load_preset(UTF8_BORDERS_ONLY);
    table.set_header(vec!["Model", "Calls", "Prompt", "Completion", "Total"]);
    for (model, counters) in &diagnostics.usage_by_model {
        table.add_row(vec![
            model.clone(),
            counters.calls.to_string(),
            counters.prompt_tokens.to_string(),
            counters.completion_tokens.to_string(),
            counters.total_tokens.to_string(),
        ]);
    }
    out.push_str(&format!("{}\n", table));
    if let Some(remaining) = diagnostics.premium_budget_remaining {
        out.push_str(&format!("  Premium budget remaining: {}\n", remaining));
    }

    if !diagnostics.dropped_files.is_empty() {
        out.push_str(&format!("\n{}\n\n", format_section_heading("Dropped files")));
        for dropped in &diagnostics.dropped_files {
            out.push_str(&format!("  {}: {}\n", dropped.path, dropped.error));
        }
    }
    if !diagnostics.consistency_issues.is_empty() {
        out.push_str(&format!(
            "\n{}\n\n",
            format_section_heading("Consistency issues")
        ));
        for issue in &diagnostics.consistency_issues {
            out.push_str(&format!("  {}: {}\n", issue.file, issue.issue));
        }
    }
    out
}

fn format_job_list_text(store: &JobStore, job_ids: &[String]) -> String {
    let mut out = format!("{}\n\n", format_section_heading("Jobs"));
    if job_ids.is_empty() {
        out.push_str("No jobs found.\n");
        return out;
    }
    let mut table = Table::new();
    table.load_preset(UTF8_BORDERS_ONLY);
    table.set_header(vec!["Job", "Status", "Type", "Files"]);
    for job_id in job_ids {
        match store.load(job_id) {
            Ok(job) => table.add_row(vec![
                job.job_id.clone(),
                job.status().to_string(),
                job.project_type.to_string(),
                format!("{}/{}", job.generated_file_count(), job.planned_file_count()),
            ]),
            Err(err) => table.add_row(vec![
                job_id.clone(),
                "unreadable".to_string(),
                "-".to_string(),
                err.to_string(),
            ]),
        };
    }
    out.push_str(&format!("{}\n", table));
    out
}
