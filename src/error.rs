//! Error types for the sitesmith orchestration core.
//!
//! Duplicate requests and lease contention are control-flow signals, not errors; they are
//! expressed as `Option`/outcome values by the registry, the lease lock and the handler.

use crate::job::JobStatus;
use thiserror::Error;

/// Failure of a single model-completion call.
#[derive(Debug, Clone, Error)]
pub enum CompletionError {
    #[error("Completion request failed: {0}")]
    RequestFailed(String),

    #[error("Completion request timed out: {0}")]
    Timeout(String),

    #[error("Connection to completion provider failed: {0}")]
    Connection(String),

    #[error("Completion provider authentication failed: {0}")]
    AuthFailed(String),

    #[error("Completion provider rate limit exceeded: {0}")]
    RateLimit(String),

    #[error("Model not found: {0}")]
    ModelNotFound(String),

    #[error("Completion provider error: {0}")]
    Provider(String),
}

impl CompletionError {
    /// Timeouts, connection resets and rate limiting are worth waiting out; everything else
    /// will fail the same way on the next attempt.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CompletionError::Timeout(_)
                | CompletionError::Connection(_)
                | CompletionError::RateLimit(_)
        )
    }
}

/// A completion response that matched none of the accepted JSON shapes.
#[derive(Debug, Clone, Error)]
pub enum ParseError {
    #[error("No JSON payload found in response ({len} bytes)")]
    NoJson { len: usize },

    #[error("Unexpected JSON shape: {0}")]
    Shape(String),

    #[error("Generated file {0} has empty content")]
    EmptyContent(String),
}

/// Why one planned file did not make it into the result set.
#[derive(Debug, Clone, Error)]
pub enum GenerationError {
    #[error(transparent)]
    Completion(#[from] CompletionError),

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error("File {0} missing from combined response")]
    MissingFromResponse(String),
}

impl GenerationError {
    pub fn is_transient(&self) -> bool {
        match self {
            GenerationError::Completion(err) => err.is_transient(),
            _ => false,
        }
    }
}

/// Failure to deliver a message through the chat transport.
#[derive(Debug, Clone, Error)]
#[error("Delivery failed: {0}")]
pub struct DeliveryError(pub String);

/// Shared lease-store failure. Never escapes `LeaseLock`: it triggers the local fallback.
#[derive(Debug, Error)]
pub enum LeaseError {
    #[error("Lease store unavailable: {0}")]
    Unavailable(String),

    #[error("Lease store error: {0}")]
    Store(String),

    #[error("Corrupt lease record for key {key}: {message}")]
    Corrupt { key: String, message: String },
}

impl From<sled::Error> for LeaseError {
    fn from(err: sled::Error) -> Self {
        LeaseError::Store(err.to_string())
    }
}

/// Storage-related errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Archive error: {0}")]
    Archive(String),

    #[error("Storage I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

impl From<walkdir::Error> for StorageError {
    fn from(err: walkdir::Error) -> Self {
        StorageError::IoError(err.into())
    }
}

impl From<zip::result::ZipError> for StorageError {
    fn from(err: zip::result::ZipError) -> Self {
        StorageError::Archive(err.to_string())
    }
}

/// Job state machine violations.
#[derive(Debug, Clone, Error)]
pub enum JobError {
    #[error("Illegal job status transition for {job_id}: {from} -> {to}")]
    InvalidTransition {
        job_id: String,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("Job {0} has no file plan")]
    MissingPlan(String),
}

/// Errors surfaced by a pipeline run.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Zero files survived every batch and the retry pass. Fatal for the job.
    #[error("Pipeline produced no files for job {job_id} ({failed} planned files failed)")]
    NoFilesGenerated {
        job_id: String,
        failed: usize,
        transient: bool,
    },

    #[error("Job error: {0}")]
    Job(#[from] JobError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Spec planning failed: {0}")]
    Planning(String),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl PipelineError {
    /// Whether the request that triggered this run should stay open rather than be finalized
    /// with a user-visible error.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            PipelineError::NoFilesGenerated {
                transient: true,
                ..
            }
        )
    }
}

/// Configuration and logging setup errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Logging setup failed: {0}")]
    Logging(String),
}

impl From<config::ConfigError> for ConfigError {
    fn from(err: config::ConfigError) -> Self {
        ConfigError::Load(err.to_string())
    }
}
