//! Integration tests for layered configuration loading

use crate::integration::test_utils::{with_env_overrides, with_xdg_env};
use sitesmith::config::{ConfigLoader, LeaseStoreKind, ModelTier};
use sitesmith::error::ConfigError;
use std::path::Path;
use tempfile::TempDir;

fn write_user_config(test_dir: &TempDir, contents: &str) {
    let dir = test_dir.path().join("sitesmith");
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("config.toml"), contents).unwrap();
}

fn write_workspace_config(workspace: &Path, name: &str, contents: &str) {
    let dir = workspace.join("config");
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join(name), contents).unwrap();
}

#[test]
fn test_defaults_without_any_file() {
    let test_dir = TempDir::new().unwrap();
    let workspace = TempDir::new().unwrap();

    let config = with_xdg_env(&test_dir, || ConfigLoader::load(workspace.path())).unwrap();

    assert_eq!(config.budget.total, 64_000);
    assert_eq!(config.lease.ttl_secs, 180);
    assert!(config.lease.store_path.is_none());
    assert_eq!(config.lease.store, LeaseStoreKind::File);
    assert_eq!(config.registry.request_ttl_secs, 30 * 60);
    assert_eq!(config.models.fallback.tier, ModelTier::Free);
    assert!(config.validate().is_ok());
}

#[test]
fn test_workspace_file_overrides_user_file() {
    let test_dir = TempDir::new().unwrap();
    let workspace = TempDir::new().unwrap();
    write_user_config(
        &test_dir,
        r#"
[lease]
ttl_secs = 240

[budget]
total = 80000
"#,
    );
    write_workspace_config(workspace.path(), "config.toml", "[lease]\nttl_secs = 300\n");

    let config = with_xdg_env(&test_dir, || ConfigLoader::load(workspace.path())).unwrap();

    assert_eq!(config.lease.ttl_secs, 300);
    assert_eq!(config.budget.total, 80_000);
}

#[test]
fn test_environment_file_selected_by_sitesmith_env() {
    let test_dir = TempDir::new().unwrap();
    let workspace = TempDir::new().unwrap();
    write_workspace_config(
        workspace.path(),
        "config.toml",
        "[pipeline]\ninter_batch_delay_free_ms = 5000\n",
    );
    write_workspace_config(
        workspace.path(),
        "production.toml",
        "[pipeline]\ninter_batch_delay_free_ms = 8000\n",
    );

    let config = with_env_overrides(&test_dir, &[("SITESMITH_ENV", "production")], || {
        ConfigLoader::load(workspace.path())
    })
    .unwrap();

    assert_eq!(config.pipeline.inter_batch_delay_free_ms, 8_000);
}

#[test]
fn test_unsafe_environment_name_is_rejected() {
    let test_dir = TempDir::new().unwrap();
    let workspace = TempDir::new().unwrap();
    write_workspace_config(workspace.path(), "config.toml", "");

    let result = with_env_overrides(&test_dir, &[("SITESMITH_ENV", "../../etc/app")], || {
        ConfigLoader::load(workspace.path())
    });

    assert!(result.is_err());
}

#[test]
fn test_environment_variables_win() {
    let test_dir = TempDir::new().unwrap();
    let workspace = TempDir::new().unwrap();
    write_workspace_config(workspace.path(), "config.toml", "[lease]\nttl_secs = 300\n");

    let config = with_env_overrides(
        &test_dir,
        &[
            ("SITESMITH__LEASE__TTL_SECS", "45"),
            ("SITESMITH__MODELS__PREMIUM__ID", "openai/gpt-4o"),
            ("SITESMITH__MODELS__PREMIUM__TIER", "paid"),
        ],
        || ConfigLoader::load(workspace.path()),
    )
    .unwrap();

    assert_eq!(config.lease.ttl_secs, 45);
    assert_eq!(config.models.premium.id, "openai/gpt-4o");
    assert_eq!(config.models.premium.tier, ModelTier::Paid);
}

#[test]
fn test_invalid_budget_split_is_rejected() {
    let test_dir = TempDir::new().unwrap();
    let workspace = TempDir::new().unwrap();
    write_workspace_config(
        workspace.path(),
        "config.toml",
        r#"
[budget]
total = 20000
consistency_reserve = 10000
foundation_allowance = 28000
"#,
    );

    let err = with_xdg_env(&test_dir, || ConfigLoader::load(workspace.path())).unwrap_err();

    match err {
        ConfigError::Invalid(message) => assert!(message.contains("Budget")),
        other => panic!("unexpected error: {}", other),
    }
}

#[test]
fn test_load_from_file_ignores_other_sources() {
    let test_dir = TempDir::new().unwrap();
    let file_dir = TempDir::new().unwrap();
    let config_file = file_dir.path().join("sitesmith.toml");
    std::fs::write(
        &config_file,
        r#"
[models.premium]
id = "anthropic/claude-3.5-haiku"
tier = "paid"

[lease]
ttl_secs = 90
store = "sled"
store_path = "leases.sled"
instance_id = "replica-a"
"#,
    )
    .unwrap();

    let config = with_env_overrides(&test_dir, &[("SITESMITH__LEASE__TTL_SECS", "45")], || {
        ConfigLoader::load_from_file(&config_file)
    })
    .unwrap();

    assert_eq!(config.lease.ttl_secs, 90);
    assert_eq!(config.lease.instance_id.as_deref(), Some("replica-a"));
    assert_eq!(config.lease.store, LeaseStoreKind::Sled);
    assert_eq!(config.models.premium.id, "anthropic/claude-3.5-haiku");
    assert_eq!(config.budget.total, 64_000);
}
