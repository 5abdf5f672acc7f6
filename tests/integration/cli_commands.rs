//! CLI command execution against a temporary workspace

use crate::integration::test_utils::{bakery_spec, with_xdg_env};
use sitesmith::cli::{Commands, RunContext};
use sitesmith::job::{JobStore, ProjectType};
use tempfile::TempDir;

fn context(test_dir: &TempDir, workspace: &TempDir) -> RunContext {
    with_xdg_env(test_dir, || {
        RunContext::new(workspace.path().to_path_buf(), None).unwrap()
    })
}

#[tokio::test]
async fn plan_command_renders_all_batches() {
    let test_dir = TempDir::new().unwrap();
    let workspace = TempDir::new().unwrap();
    let plan_path = workspace.path().join("plan.json");
    std::fs::write(
        &plan_path,
        r#"{"file_plan": [
            {"path": "index.html", "purpose": "Home"},
            {"path": "styles.css"},
            {"path": "login.html", "purpose": "Sign in"},
            {"path": "README.md"}
        ]}"#,
    )
    .unwrap();
    let ctx = context(&test_dir, &workspace);

    let text = ctx
        .execute(&Commands::Plan {
            plan: plan_path.clone(),
            format: "text".to_string(),
        })
        .await
        .unwrap();
    assert!(text.contains("foundation"));
    assert!(text.contains("index.html, styles.css"));
    assert!(text.contains("login.html"));
    assert!(text.contains("Total files: 4"));

    let json = ctx
        .execute(&Commands::Plan {
            plan: plan_path,
            format: "json".to_string(),
        })
        .await
        .unwrap();
    let value: serde_json::Value = serde_json::from_str(&json).unwrap();
    assert_eq!(value["batches"].as_array().unwrap().len(), 5);
}

#[tokio::test]
async fn status_lists_and_shows_jobs() {
    let test_dir = TempDir::new().unwrap();
    let workspace = TempDir::new().unwrap();
    let ctx = context(&test_dir, &workspace);

    let empty = ctx
        .execute(&Commands::Status {
            job_id: None,
            format: "text".to_string(),
        })
        .await
        .unwrap();
    assert!(empty.contains("No jobs found."));

    let store = JobStore::new(
        workspace.path().join("workspace"),
        workspace.path().join("output"),
    )
    .unwrap();
    let mut job = store.create(ProjectType::StaticSite).unwrap();
    job.record_spec(bakery_spec()).unwrap();
    store.save(&job).unwrap();

    let listing = ctx
        .execute(&Commands::Status {
            job_id: None,
            format: "text".to_string(),
        })
        .await
        .unwrap();
    assert!(listing.contains(&job.job_id));

    let detail = ctx
        .execute(&Commands::Status {
            job_id: Some(job.job_id.clone()),
            format: "json".to_string(),
        })
        .await
        .unwrap();
    let value: serde_json::Value = serde_json::from_str(&detail).unwrap();
    assert_eq!(value["job_id"], job.job_id.as_str());
    assert_eq!(value["spec"]["title"], "Corner Bakery");
}

#[tokio::test]
async fn status_of_unknown_job_is_an_error() {
    let test_dir = TempDir::new().unwrap();
    let workspace = TempDir::new().unwrap();
    let ctx = context(&test_dir, &workspace);

    let result = ctx
        .execute(&Commands::Status {
            job_id: Some("job-missing".to_string()),
            format: "text".to_string(),
        })
        .await;

    assert!(result.is_err());
}

#[tokio::test]
async fn config_command_prints_effective_toml() {
    let test_dir = TempDir::new().unwrap();
    let workspace = TempDir::new().unwrap();
    let ctx = context(&test_dir, &workspace);

    let rendered = ctx.execute(&Commands::Config).await.unwrap();

    assert!(rendered.contains("[budget]"));
    assert!(rendered.contains("total = 64000"));
}
