//! Configuration loading entry points.

use super::merge::merge_policy;
use super::sources::{global_file, workspace_file};
use super::SitesmithConfig;
use crate::error::ConfigError;
use config::{Environment, File};
use std::path::Path;

/// Loads [`SitesmithConfig`] from its layered sources.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Defaults, then the user-level file, then workspace files, then environment variables
    /// of the form `SITESMITH__LEASE__TTL_SECS=240`.
    pub fn load(workspace_root: &Path) -> Result<SitesmithConfig, ConfigError> {
        let builder = merge_policy::builder_with_defaults()?;
        let builder = global_file::add_to_builder(builder)?;
        let builder = workspace_file::add_to_builder(builder, workspace_root)?;
        let builder = builder.add_source(
            Environment::with_prefix("SITESMITH")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: SitesmithConfig = builder.build()?.try_deserialize()?;
        Self::validated(config)
    }

    /// Defaults overlaid with exactly one file; no user-level or environment sources.
    pub fn load_from_file(path: &Path) -> Result<SitesmithConfig, ConfigError> {
        let config: SitesmithConfig = merge_policy::builder_with_defaults()?
            .add_source(File::from(path))
            .build()?
            .try_deserialize()?;
        Self::validated(config)
    }

    fn validated(config: SitesmithConfig) -> Result<SitesmithConfig, ConfigError> {
        config.validate().map_err(|errors| {
            let messages: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
            ConfigError::Invalid(messages.join("; "))
        })?;
        Ok(config)
    }
}
