//! Job persistence under the workspace root.
//!
//! Layout per job: `{workspace}/{job_id}/job.json`, `spec.json`, `generated/**`, `job.log`;
//! `{output}/{job_id}/**` and `{output}/{job_id}.zip`.

use super::{Job, JobPaths, ProjectType};
use crate::config::StorageConfig;
use crate::error::StorageError;
use chrono::Utc;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

static JOB_COUNTER: AtomicU64 = AtomicU64::new(0);

const RECORD_FILE: &str = "job.json";
const SPEC_FILE: &str = "spec.json";

pub struct JobStore {
    workspace_root: PathBuf,
    output_root: PathBuf,
}

impl JobStore {
    /// Create both roots if needed.
    pub fn new(
        workspace_root: impl AsRef<Path>,
        output_root: impl AsRef<Path>,
    ) -> Result<Self, StorageError> {
        fs::create_dir_all(workspace_root.as_ref())?;
        fs::create_dir_all(output_root.as_ref())?;
        Ok(Self {
            workspace_root: dunce::canonicalize(workspace_root.as_ref())?,
            output_root: dunce::canonicalize(output_root.as_ref())?,
        })
    }

    pub fn from_config(storage: &StorageConfig) -> Result<Self, StorageError> {
        Self::new(&storage.workspace_root, &storage.output_root)
    }

    pub fn workspace_root(&self) -> &Path {
        &self.workspace_root
    }

    pub fn output_root(&self) -> &Path {
        &self.output_root
    }

    pub fn paths_for(&self, job_id: &str) -> Result<JobPaths, StorageError> {
        validate_job_id(job_id)?;
        let workspace_dir = self.workspace_root.join(job_id);
        Ok(JobPaths {
            generated_dir: workspace_dir.join("generated"),
            logs_path: workspace_dir.join("job.log"),
            spec_path: workspace_dir.join(SPEC_FILE),
            record_path: workspace_dir.join(RECORD_FILE),
            workspace_dir,
            output_dir: self.output_root.join(job_id),
            zip_path: self.output_root.join(format!("{}.zip", job_id)),
        })
    }

    /// Create and persist a fresh job with a generated id.
    pub fn create(&self, project_type: ProjectType) -> Result<Job, StorageError> {
        self.create_with_id(&new_job_id(), project_type)
    }

    pub fn create_with_id(
        &self,
        job_id: &str,
        project_type: ProjectType,
    ) -> Result<Job, StorageError> {
        let paths = self.paths_for(job_id)?;
        if paths.record_path.exists() {
            return Err(StorageError::InvalidPath(format!(
                "job {} already exists",
                job_id
            )));
        }
        fs::create_dir_all(&paths.generated_dir)?;
        let job = Job::new(job_id, project_type, paths);
        self.save(&job)?;
        debug!(job_id, project_type = %project_type, "Created job");
        Ok(job)
    }

    /// Persist the job record and, once known, its spec.
    pub fn save(&self, job: &Job) -> Result<(), StorageError> {
        fs::create_dir_all(&job.paths.workspace_dir)?;
        write_json_atomic(&job.paths.record_path, job)?;
        if let Some(spec) = &job.spec {
            write_json_atomic(&job.paths.spec_path, spec)?;
        }
        Ok(())
    }

    pub fn load(&self, job_id: &str) -> Result<Job, StorageError> {
        let paths = self.paths_for(job_id)?;
        if !paths.record_path.exists() {
            return Err(StorageError::JobNotFound(job_id.to_string()));
        }
        let bytes = fs::read(&paths.record_path)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Append one timestamped line to the job's log file.
    pub fn append_log(&self, job: &Job, message: &str) -> Result<(), StorageError> {
        fs::create_dir_all(&job.paths.workspace_dir)?;
        let line = format!("{} {}\n", Utc::now().to_rfc3339(), message);
        fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&job.paths.logs_path)
            .and_then(|mut file| file.write_all(line.as_bytes()))?;
        Ok(())
    }

    /// Log lines of a job, oldest first. Empty when nothing was logged yet.
    pub fn read_log(&self, job: &Job) -> Result<Vec<String>, StorageError> {
        match fs::read_to_string(&job.paths.logs_path) {
            Ok(text) => Ok(text.lines().map(str::to_string).collect()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(err) => Err(err.into()),
        }
    }

    /// Ids of every persisted job, sorted.
    pub fn list(&self) -> Result<Vec<String>, StorageError> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.workspace_root)? {
            let entry = entry?;
            if entry.path().join(RECORD_FILE).is_file() {
                if let Some(name) = entry.file_name().to_str() {
                    ids.push(name.to_string());
                }
            }
        }
        ids.sort();
        Ok(ids)
    }
}

/// `job-{utc timestamp}-{short hash}`, unique within and across processes.
pub fn new_job_id() -> String {
    let now = Utc::now();
    let seq = JOB_COUNTER.fetch_add(1, Ordering::Relaxed);
    let seed = format!(
        "{}:{}:{}",
        now.timestamp_nanos_opt().unwrap_or_default(),
        std::process::id(),
        seq
    );
    let digest = blake3::hash(seed.as_bytes());
    format!(
        "job-{}-{}",
        now.format("%Y%m%d%H%M%S"),
        &hex::encode(digest.as_bytes())[..8]
    )
}

fn validate_job_id(job_id: &str) -> Result<(), StorageError> {
    let valid = !job_id.is_empty()
        && job_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(StorageError::InvalidPath(format!(
            "invalid job id '{}'",
            job_id
        )))
    }
}

fn write_json_atomic<T: serde::Serialize>(path: &Path, value: &T) -> Result<(), StorageError> {
    let bytes = serde_json::to_vec_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)?;
    Ok(())
}
