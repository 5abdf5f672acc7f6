//! Merge rules: defaults, override order, conflict handling.

use config::builder::DefaultState;
use config::Config;
use config::ConfigBuilder;
use config::ConfigError;

/// Create a Config builder with merge policy defaults applied.
///
/// Only keys that every deployment depends on are pinned here; the remaining defaults come
/// from the serde defaults on the config structs.
pub fn builder_with_defaults() -> Result<ConfigBuilder<DefaultState>, ConfigError> {
    Config::builder()
        .set_default("storage.workspace_root", "workspace")?
        .set_default("storage.output_root", "output")?
        .set_default("lease.ttl_secs", 180)?
        .set_default("registry.request_ttl_secs", 30 * 60)?
        .set_default("registry.event_ttl_secs", 5 * 60)
}
