//! Per-workspace settings under `config/`: `config.toml` for every environment, then
//! `{SITESMITH_ENV}.toml` for the selected one.

use config::builder::DefaultState;
use config::{ConfigBuilder, ConfigError, File, FileFormat};
use std::path::{Path, PathBuf};
use tracing::debug;

pub const ENV_VAR: &str = "SITESMITH_ENV";
pub const DEFAULT_ENVIRONMENT: &str = "development";
const BASE_FILE: &str = "config.toml";

/// Environment selected through `SITESMITH_ENV`, `development` when unset or empty.
pub fn environment_name() -> Result<String, ConfigError> {
    let name = std::env::var(ENV_VAR).unwrap_or_default();
    if name.is_empty() {
        return Ok(DEFAULT_ENVIRONMENT.to_string());
    }
    validate_environment(&name)?;
    Ok(name)
}

/// Environment names become file names, so only `[A-Za-z0-9_-]` is accepted.
fn validate_environment(name: &str) -> Result<(), ConfigError> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(ConfigError::Message(format!(
            "{} must only contain letters, digits, '-' and '_', got '{}'",
            ENV_VAR, name
        )))
    }
}

/// Workspace files that exist for `environment`, lowest precedence first.
pub fn layered_files(
    workspace_root: &Path,
    environment: &str,
) -> Result<Vec<PathBuf>, ConfigError> {
    validate_environment(environment)?;
    let config_dir = workspace_root.join("config");
    let candidates = [
        config_dir.join(BASE_FILE),
        config_dir.join(format!("{}.toml", environment)),
    ];
    Ok(candidates
        .into_iter()
        .filter(|path| {
            let present = path.is_file();
            if !present {
                debug!(config_path = %path.display(), "No workspace configuration file");
            }
            present
        })
        .collect())
}

/// Layer the workspace files for the current environment onto `builder`.
pub fn add_to_builder(
    builder: ConfigBuilder<DefaultState>,
    workspace_root: &Path,
) -> Result<ConfigBuilder<DefaultState>, ConfigError> {
    let environment = environment_name()?;
    add_environment_to_builder(builder, workspace_root, &environment)
}

pub fn add_environment_to_builder(
    mut builder: ConfigBuilder<DefaultState>,
    workspace_root: &Path,
    environment: &str,
) -> Result<ConfigBuilder<DefaultState>, ConfigError> {
    for path in layered_files(workspace_root, environment)? {
        debug!(config_path = %path.display(), environment, "Loading workspace configuration");
        builder = builder.add_source(File::from(path.as_path()).format(FileFormat::Toml));
    }
    Ok(builder)
}
