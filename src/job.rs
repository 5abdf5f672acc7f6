//! Job records
//!
//! A [`Job`] is owned by one pipeline run for its whole lifetime. Its status only moves forward
//! through `created → spec_generated → planned → generated → done`; `failed` is reachable from
//! every non-terminal state. Jobs are persisted under their workspace directory and are never
//! deleted by this crate.

pub mod diagnostics;
pub mod store;

pub use diagnostics::{
    BatchSummary, ConsistencyIssue, DroppedFile, JobDiagnostics, StageTiming, TokenCounters,
};
pub use store::JobStore;

use crate::error::JobError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProjectType {
    StaticSite,
    BackendService,
    ChatBot,
}

impl ProjectType {
    pub fn as_str(self) -> &'static str {
        match self {
            ProjectType::StaticSite => "static-site",
            ProjectType::BackendService => "backend-service",
            ProjectType::ChatBot => "chat-bot",
        }
    }
}

impl fmt::Display for ProjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ProjectType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "static-site" => Ok(ProjectType::StaticSite),
            "backend-service" => Ok(ProjectType::BackendService),
            "chat-bot" => Ok(ProjectType::ChatBot),
            other => Err(format!(
                "unknown project type '{}' (expected static-site, backend-service or chat-bot)",
                other
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Created,
    SpecGenerated,
    Planned,
    Generated,
    Done,
    Failed,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Created => "created",
            JobStatus::SpecGenerated => "spec_generated",
            JobStatus::Planned => "planned",
            JobStatus::Generated => "generated",
            JobStatus::Done => "done",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Failed)
    }

    pub fn can_transition_to(self, next: JobStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        match next {
            JobStatus::Failed => true,
            JobStatus::SpecGenerated => self == JobStatus::Created,
            JobStatus::Planned => self == JobStatus::SpecGenerated,
            JobStatus::Generated => self == JobStatus::Planned,
            JobStatus::Done => self == JobStatus::Generated,
            JobStatus::Created => false,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Filesystem locations owned by one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobPaths {
    pub workspace_dir: PathBuf,
    pub generated_dir: PathBuf,
    pub output_dir: PathBuf,
    pub zip_path: PathBuf,
    pub logs_path: PathBuf,
    pub spec_path: PathBuf,
    pub record_path: PathBuf,
}

/// Refined specification produced by the external spec generator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImprovedSpec {
    pub title: String,
    pub project_type: ProjectType,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub acceptance_checklist: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilePlanEntry {
    pub path: String,
    #[serde(default)]
    pub purpose: String,
    #[serde(default)]
    pub notes: String,
}

impl FilePlanEntry {
    pub fn new(path: impl Into<String>, purpose: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            purpose: purpose.into(),
            notes: String::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobPlan {
    pub file_plan: Vec<FilePlanEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedFile {
    pub path: String,
    pub content: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodegenResult {
    pub files: Vec<GeneratedFile>,
    #[serde(default)]
    pub notes: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub job_id: String,
    pub project_type: ProjectType,
    status: JobStatus,
    pub paths: JobPaths,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub spec: Option<ImprovedSpec>,
    #[serde(default)]
    pub plan: JobPlan,
    #[serde(default)]
    pub codegen_result: Option<CodegenResult>,
    #[serde(default)]
    pub zip_path: Option<PathBuf>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub diagnostics: JobDiagnostics,
}

impl Job {
    pub fn new(job_id: impl Into<String>, project_type: ProjectType, paths: JobPaths) -> Self {
        Self {
            job_id: job_id.into(),
            project_type,
            status: JobStatus::Created,
            paths,
            created_at: Utc::now(),
            spec: None,
            plan: JobPlan::default(),
            codegen_result: None,
            zip_path: None,
            error: None,
            diagnostics: JobDiagnostics::default(),
        }
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    fn transition(&mut self, next: JobStatus) -> Result<(), JobError> {
        if !self.status.can_transition_to(next) {
            return Err(JobError::InvalidTransition {
                job_id: self.job_id.clone(),
                from: self.status,
                to: next,
            });
        }
        info!(job_id = %self.job_id, from = %self.status, to = %next, "Job status changed");
        self.status = next;
        Ok(())
    }

    /// `created → spec_generated`
    pub fn record_spec(&mut self, spec: ImprovedSpec) -> Result<(), JobError> {
        self.transition(JobStatus::SpecGenerated)?;
        self.spec = Some(spec);
        Ok(())
    }

    /// `spec_generated → planned`
    pub fn record_plan(&mut self, file_plan: Vec<FilePlanEntry>) -> Result<(), JobError> {
        if file_plan.is_empty() {
            return Err(JobError::MissingPlan(self.job_id.clone()));
        }
        self.transition(JobStatus::Planned)?;
        self.plan = JobPlan { file_plan };
        Ok(())
    }

    /// `planned → generated`. Requires at least one file.
    pub fn record_generated(&mut self, result: CodegenResult) -> Result<(), JobError> {
        if result.files.is_empty() {
            return Err(JobError::InvalidTransition {
                job_id: self.job_id.clone(),
                from: self.status,
                to: JobStatus::Generated,
            });
        }
        self.transition(JobStatus::Generated)?;
        self.codegen_result = Some(result);
        Ok(())
    }

    /// `generated → done`, after the output copy and archive exist.
    pub fn record_archive(&mut self, zip_path: PathBuf) -> Result<(), JobError> {
        self.transition(JobStatus::Done)?;
        self.zip_path = Some(zip_path);
        Ok(())
    }

    /// Any non-terminal state `→ failed`.
    pub fn fail(&mut self, reason: impl Into<String>) -> Result<(), JobError> {
        self.transition(JobStatus::Failed)?;
        self.error = Some(reason.into());
        Ok(())
    }

    pub fn planned_file_count(&self) -> usize {
        self.plan.file_plan.len()
    }

    pub fn generated_file_count(&self) -> usize {
        self.codegen_result
            .as_ref()
            .map(|result| result.files.len())
            .unwrap_or(0)
    }

    /// Some files were generated but fewer than planned.
    pub fn is_partial(&self) -> bool {
        let generated = self.generated_file_count();
        generated > 0 && generated < self.planned_file_count()
    }
}
