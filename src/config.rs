//! Configuration System
//!
//! Layered configuration: built-in defaults, the user-level config file, workspace config
//! files and `SITESMITH__SECTION__KEY` environment variables, in increasing precedence.

use crate::logging::LoggingConfig;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

mod facade;
mod merge;
mod sources;

pub use facade::ConfigLoader;
pub use sources::global_file::global_config_path;

/// Root configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SitesmithConfig {
    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub models: ModelsConfig,

    #[serde(default)]
    pub provider: ProviderSettings,

    #[serde(default)]
    pub budget: BudgetConfig,

    #[serde(default)]
    pub pipeline: PipelineConfig,

    #[serde(default)]
    pub lease: LeaseConfig,

    #[serde(default)]
    pub registry: RegistryConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Where job workspaces, output mirrors and archives live.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_workspace_root")]
    pub workspace_root: PathBuf,

    #[serde(default = "default_output_root")]
    pub output_root: PathBuf,
}

fn default_workspace_root() -> PathBuf {
    PathBuf::from("workspace")
}

fn default_output_root() -> PathBuf {
    PathBuf::from("output")
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            workspace_root: default_workspace_root(),
            output_root: default_output_root(),
        }
    }
}

/// Billing tier of a model; decides the inter-batch rate-limit delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelTier {
    Paid,
    Free,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelSpec {
    pub id: String,
    pub tier: ModelTier,
}

/// The two-tier model setup: a budgeted premium model and an unlimited fallback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelsConfig {
    #[serde(default = "default_premium_model")]
    pub premium: ModelSpec,

    #[serde(default = "default_fallback_model")]
    pub fallback: ModelSpec,
}

fn default_premium_model() -> ModelSpec {
    ModelSpec {
        id: "anthropic/claude-3.5-sonnet".to_string(),
        tier: ModelTier::Paid,
    }
}

fn default_fallback_model() -> ModelSpec {
    ModelSpec {
        id: "meta-llama/llama-3.3-70b-instruct:free".to_string(),
        tier: ModelTier::Free,
    }
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            premium: default_premium_model(),
            fallback: default_fallback_model(),
        }
    }
}

/// Connection settings for the OpenAI-compatible completion endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderSettings {
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    /// Inline API key. Prefer `api_key_env`.
    #[serde(default)]
    pub api_key: Option<String>,

    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    #[serde(default = "default_temperature")]
    pub temperature: f32,
}

fn default_endpoint() -> String {
    "https://openrouter.ai/api/v1".to_string()
}

fn default_api_key_env() -> String {
    "SITESMITH_API_KEY".to_string()
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_request_timeout_secs() -> u64 {
    180
}

fn default_max_tokens() -> u32 {
    8192
}

fn default_temperature() -> f32 {
    0.4
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            api_key: None,
            api_key_env: default_api_key_env(),
            connect_timeout_secs: default_connect_timeout_secs(),
            request_timeout_secs: default_request_timeout_secs(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
        }
    }
}

impl ProviderSettings {
    /// Inline key first, then the configured environment variable.
    pub fn resolve_api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .filter(|key| !key.trim().is_empty())
            .or_else(|| std::env::var(&self.api_key_env).ok())
            .filter(|key| !key.trim().is_empty())
    }
}

/// Premium-model token budget, per job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetConfig {
    #[serde(default = "default_budget_total")]
    pub total: u32,

    #[serde(default = "default_consistency_reserve")]
    pub consistency_reserve: u32,

    #[serde(default = "default_foundation_allowance")]
    pub foundation_allowance: u32,
}

fn default_budget_total() -> u32 {
    64_000
}

fn default_consistency_reserve() -> u32 {
    10_000
}

fn default_foundation_allowance() -> u32 {
    28_000
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            total: default_budget_total(),
            consistency_reserve: default_consistency_reserve(),
            foundation_allowance: default_foundation_allowance(),
        }
    }
}

/// Pacing of the batch pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Delay before the one-shot retry pass of a batch (milliseconds)
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// Delay between batches when only paid-tier models were used (milliseconds)
    #[serde(default = "default_inter_batch_delay_paid_ms")]
    pub inter_batch_delay_paid_ms: u64,

    /// Delay between batches when a free-tier model was used (milliseconds)
    #[serde(default = "default_inter_batch_delay_free_ms")]
    pub inter_batch_delay_free_ms: u64,
}

fn default_retry_delay_ms() -> u64 {
    2_000
}

fn default_inter_batch_delay_paid_ms() -> u64 {
    1_000
}

fn default_inter_batch_delay_free_ms() -> u64 {
    5_000
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            retry_delay_ms: default_retry_delay_ms(),
            inter_batch_delay_paid_ms: default_inter_batch_delay_paid_ms(),
            inter_batch_delay_free_ms: default_inter_batch_delay_free_ms(),
        }
    }
}

impl PipelineConfig {
    /// No waiting at all; used by tests and dry runs.
    pub fn immediate() -> Self {
        Self {
            retry_delay_ms: 0,
            inter_batch_delay_paid_ms: 0,
            inter_batch_delay_free_ms: 0,
        }
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn inter_batch_delay(&self, tier: ModelTier) -> Duration {
        match tier {
            ModelTier::Paid => Duration::from_millis(self.inter_batch_delay_paid_ms),
            ModelTier::Free => Duration::from_millis(self.inter_batch_delay_free_ms),
        }
    }
}

/// Backend behind `lease.store_path`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LeaseStoreKind {
    /// Lease directory shared by every replica that can reach it
    #[default]
    File,
    /// sled database; one process only
    Sled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseConfig {
    #[serde(default = "default_lease_ttl_secs")]
    pub ttl_secs: u64,

    #[serde(default)]
    pub store: LeaseStoreKind,

    /// Location of the lease store. Unset means local in-memory leases only.
    #[serde(default)]
    pub store_path: Option<PathBuf>,

    /// Identifier of this replica in lease owners. Defaults to a host/pid derived id.
    #[serde(default)]
    pub instance_id: Option<String>,
}

fn default_lease_ttl_secs() -> u64 {
    180
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_lease_ttl_secs(),
            store: LeaseStoreKind::default(),
            store_path: None,
            instance_id: None,
        }
    }
}

impl LeaseConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Retention of request entries (seconds)
    #[serde(default = "default_request_ttl_secs")]
    pub request_ttl_secs: u64,

    /// Retention of seen inbound event keys (seconds)
    #[serde(default = "default_event_ttl_secs")]
    pub event_ttl_secs: u64,
}

fn default_request_ttl_secs() -> u64 {
    30 * 60
}

fn default_event_ttl_secs() -> u64 {
    5 * 60
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            request_ttl_secs: default_request_ttl_secs(),
            event_ttl_secs: default_event_ttl_secs(),
        }
    }
}

impl RegistryConfig {
    pub fn request_ttl(&self) -> Duration {
        Duration::from_secs(self.request_ttl_secs)
    }

    pub fn event_ttl(&self) -> Duration {
        Duration::from_secs(self.event_ttl_secs)
    }
}

/// Configuration validation errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    Models(String),
    Budget(String),
    Lease(String),
    Registry(String),
    Storage(String),
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationError::Models(msg) => write!(f, "Models: {}", msg),
            ValidationError::Budget(msg) => write!(f, "Budget: {}", msg),
            ValidationError::Lease(msg) => write!(f, "Lease: {}", msg),
            ValidationError::Registry(msg) => write!(f, "Registry: {}", msg),
            ValidationError::Storage(msg) => write!(f, "Storage: {}", msg),
        }
    }
}

impl std::error::Error for ValidationError {}

impl SitesmithConfig {
    /// Validate the entire configuration, collecting every problem.
    pub fn validate(&self) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();

        if self.models.premium.id.trim().is_empty() {
            errors.push(ValidationError::Models(
                "premium model id cannot be empty".to_string(),
            ));
        }
        if self.models.fallback.id.trim().is_empty() {
            errors.push(ValidationError::Models(
                "fallback model id cannot be empty".to_string(),
            ));
        }

        let reserved =
            u64::from(self.budget.consistency_reserve) + u64::from(self.budget.foundation_allowance);
        if reserved > u64::from(self.budget.total) {
            errors.push(ValidationError::Budget(format!(
                "consistency_reserve + foundation_allowance ({}) exceeds total ({})",
                reserved, self.budget.total
            )));
        }

        if self.lease.ttl_secs == 0 {
            errors.push(ValidationError::Lease("ttl_secs must be positive".to_string()));
        }

        if self.registry.request_ttl_secs == 0 {
            errors.push(ValidationError::Registry(
                "request_ttl_secs must be positive".to_string(),
            ));
        }
        if self.registry.event_ttl_secs == 0 {
            errors.push(ValidationError::Registry(
                "event_ttl_secs must be positive".to_string(),
            ));
        }

        if self.storage.workspace_root.as_os_str().is_empty() {
            errors.push(ValidationError::Storage(
                "workspace_root cannot be empty".to_string(),
            ));
        }
        if self.storage.output_root.as_os_str().is_empty() {
            errors.push(ValidationError::Storage(
                "output_root cannot be empty".to_string(),
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
