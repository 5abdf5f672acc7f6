//! End-to-end pipeline runs against a scripted completion client

use crate::integration::test_utils::{
    bakery_plan, bakery_spec, orchestrator, paced_orchestrator, store_in, test_models,
    ScriptedCompletionClient, FALLBACK_MODEL, PREMIUM_MODEL, REVIEW,
};
use sitesmith::config::{BudgetConfig, ModelTier, PipelineConfig};
use sitesmith::error::{CompletionError, JobError, PipelineError};
use sitesmith::job::{FilePlanEntry, Job, JobStatus, JobStore, ProjectType};
use sitesmith::notify::{self, Notifier};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn planned_job(store: &JobStore, plan: Vec<FilePlanEntry>) -> Job {
    let mut job = store.create(ProjectType::StaticSite).unwrap();
    job.record_spec(bakery_spec()).unwrap();
    job.record_plan(plan).unwrap();
    store.save(&job).unwrap();
    job
}

fn exhausted_budget() -> BudgetConfig {
    BudgetConfig {
        total: 0,
        consistency_reserve: 0,
        foundation_allowance: 0,
    }
}

#[tokio::test]
async fn full_site_is_generated_published_and_archived() {
    let temp_dir = TempDir::new().unwrap();
    let store = store_in(&temp_dir);
    let client = Arc::new(ScriptedCompletionClient::new());
    let pipeline = orchestrator(store.clone(), client.clone(), BudgetConfig::default());
    let mut job = planned_job(&store, bakery_plan());

    let report = pipeline.run(&mut job).await.unwrap();

    assert_eq!(report.planned, 5);
    assert_eq!(report.generated, 5);
    assert!(!report.is_partial());
    assert!(report.dropped.is_empty());
    assert!(report.zip_path.exists());
    assert_eq!(job.status(), JobStatus::Done);

    for path in ["index.html", "styles.css", "app.js", "about.html", "README.md"] {
        let generated = job.paths.generated_dir.join(path);
        let published = report.output_dir.join(path);
        assert!(generated.exists(), "{} missing from workspace", path);
        assert_eq!(
            std::fs::read_to_string(published).unwrap(),
            format!("generated {}", path)
        );
    }

    let reloaded = store.load(&job.job_id).unwrap();
    assert_eq!(reloaded.status(), JobStatus::Done);
    assert_eq!(reloaded.zip_path.as_deref(), Some(report.zip_path.as_path()));
    assert_eq!(reloaded.diagnostics.file_hashes.len(), 5);
    assert_eq!(reloaded.diagnostics.batches.len(), 3);
    assert!(job.paths.spec_path.exists());
}

#[tokio::test]
async fn batches_run_in_order_and_share_context() {
    let temp_dir = TempDir::new().unwrap();
    let store = store_in(&temp_dir);
    let client = Arc::new(ScriptedCompletionClient::new());
    let pipeline = orchestrator(store.clone(), client.clone(), BudgetConfig::default());
    let mut job = planned_job(&store, bakery_plan());

    pipeline.run(&mut job).await.unwrap();

    let calls = client.calls();
    assert_eq!(calls.len(), 4);

    let foundation = &calls[0];
    assert!(foundation.is_foundation());
    assert!(foundation.mentions("index.html"));
    assert!(foundation.mentions("styles.css"));
    assert!(foundation.mentions("app.js"));
    assert_eq!(foundation.model, PREMIUM_MODEL);

    let about = &calls[1];
    assert!(about.mentions("about.html"));
    assert!(about.prompt.contains("=== styles.css ==="));
    assert!(!about.prompt.contains("=== about.html ==="));

    let readme = &calls[2];
    assert!(readme.mentions("README.md"));
    assert!(readme.prompt.contains("=== about.html ==="));

    assert!(calls[3].is_review());
}

#[tokio::test]
async fn file_failing_twice_is_dropped_and_run_is_partial() {
    let temp_dir = TempDir::new().unwrap();
    let store = store_in(&temp_dir);
    let client = Arc::new(ScriptedCompletionClient::new());
    client
        .fail("about.html", CompletionError::Provider("bad gateway".into()))
        .fail("about.html", CompletionError::Provider("bad gateway".into()));
    let pipeline = orchestrator(store.clone(), client.clone(), BudgetConfig::default());
    let mut job = planned_job(&store, bakery_plan());

    let report = pipeline.run(&mut job).await.unwrap();

    assert!(report.is_partial());
    assert_eq!(report.generated, 4);
    assert_eq!(report.dropped, vec!["about.html".to_string()]);
    assert_eq!(client.calls_mentioning("about.html"), 2);
    assert_eq!(job.status(), JobStatus::Done);
    assert!(job.is_partial());
    assert!(report.zip_path.exists());
    assert!(!report.output_dir.join("about.html").exists());

    let reloaded = store.load(&job.job_id).unwrap();
    assert_eq!(reloaded.diagnostics.dropped_files.len(), 1);
    assert_eq!(reloaded.diagnostics.dropped_files[0].path, "about.html");

    // A single surviving page skips the cross-page review.
    assert!(!client.calls().iter().any(|call| call.is_review()));
}

#[tokio::test]
async fn retried_file_appears_once() {
    let temp_dir = TempDir::new().unwrap();
    let store = store_in(&temp_dir);
    let client = Arc::new(ScriptedCompletionClient::new());
    client.reply("about.html", "this is not json");
    let pipeline = orchestrator(store.clone(), client.clone(), BudgetConfig::default());
    let mut job = planned_job(&store, bakery_plan());

    let report = pipeline.run(&mut job).await.unwrap();

    assert!(!report.is_partial());
    let files = &job.codegen_result.as_ref().unwrap().files;
    let paths: HashSet<&str> = files.iter().map(|file| file.path.as_str()).collect();
    assert_eq!(paths.len(), files.len());
    assert_eq!(
        files.iter().filter(|file| file.path == "about.html").count(),
        1
    );

    let retry_call = client
        .calls()
        .into_iter()
        .filter(|call| call.mentions("about.html"))
        .nth(1)
        .unwrap();
    assert!(retry_call.prompt.contains("previous attempt"));

    let priority = job
        .diagnostics
        .batches
        .iter()
        .find(|batch| batch.batch_type == "priority")
        .unwrap();
    assert_eq!(priority.retried, 1);
    assert_eq!(priority.recovered, 1);
}

#[tokio::test]
async fn file_missing_from_foundation_response_is_dropped_without_retry() {
    let temp_dir = TempDir::new().unwrap();
    let store = store_in(&temp_dir);
    let client = Arc::new(ScriptedCompletionClient::new());
    client.reply(
        "index.html",
        r#"Here you go:
```json
[{"path": "index.html", "content": "<main></main>"},
 {"path": "css/styles.css", "content": "main { margin: 0; }"}]
```"#,
    );
    let pipeline = orchestrator(store.clone(), client.clone(), BudgetConfig::default());
    let mut job = planned_job(&store, bakery_plan());

    let report = pipeline.run(&mut job).await.unwrap();

    assert_eq!(report.dropped, vec!["app.js".to_string()]);
    assert_eq!(client.calls_mentioning("app.js"), 1);
    assert_eq!(
        std::fs::read_to_string(report.output_dir.join("styles.css")).unwrap(),
        "main { margin: 0; }"
    );
}

#[tokio::test]
async fn zero_files_fails_the_job_without_archive() {
    let temp_dir = TempDir::new().unwrap();
    let store = store_in(&temp_dir);
    let client = Arc::new(ScriptedCompletionClient::new());
    client.reply("index.html", "I cannot help with that.");
    let pipeline = orchestrator(store.clone(), client.clone(), BudgetConfig::default());
    let plan = vec![
        FilePlanEntry::new("index.html", "Home page"),
        FilePlanEntry::new("styles.css", "Stylesheet"),
    ];
    let mut job = planned_job(&store, plan);

    let err = pipeline.run(&mut job).await.unwrap_err();

    match &err {
        PipelineError::NoFilesGenerated {
            failed, transient, ..
        } => {
            assert_eq!(*failed, 2);
            assert!(!transient);
        }
        other => panic!("unexpected error: {}", other),
    }
    assert!(!err.is_transient());
    assert_eq!(job.status(), JobStatus::Failed);
    assert!(!job.paths.zip_path.exists());
    assert_eq!(
        store.load(&job.job_id).unwrap().status(),
        JobStatus::Failed
    );

    let log = store.read_log(&job).unwrap();
    assert!(log.iter().any(|line| line.contains("dropped index.html")));
    assert!(log
        .last()
        .unwrap()
        .ends_with("failed: no files generated (2 planned files failed)"));
}

#[tokio::test]
async fn all_transient_failures_are_reported_as_transient() {
    let temp_dir = TempDir::new().unwrap();
    let store = store_in(&temp_dir);
    let client = Arc::new(ScriptedCompletionClient::new());
    client.fail("index.html", CompletionError::Timeout("60s".into()));
    let pipeline = orchestrator(store.clone(), client, BudgetConfig::default());
    let plan = vec![
        FilePlanEntry::new("index.html", "Home page"),
        FilePlanEntry::new("app.js", "Script"),
    ];
    let mut job = planned_job(&store, plan);

    let err = pipeline.run(&mut job).await.unwrap_err();

    assert!(err.is_transient());
    assert!(job.codegen_result.is_none());
}

#[tokio::test]
async fn exhausted_budget_routes_everything_to_fallback() {
    let temp_dir = TempDir::new().unwrap();
    let store = store_in(&temp_dir);
    let client = Arc::new(ScriptedCompletionClient::new());
    let pipeline = orchestrator(store.clone(), client.clone(), exhausted_budget());
    let mut plan = bakery_plan();
    plan.push(FilePlanEntry::new("dashboard.html", "Customer dashboard"));
    let mut job = planned_job(&store, plan);

    let report = pipeline.run(&mut job).await.unwrap();

    assert_eq!(report.generated, 6);
    assert!(client
        .calls()
        .iter()
        .all(|call| call.model == FALLBACK_MODEL));
    assert_eq!(job.diagnostics.premium_usage.calls, 0);
    assert!(job.diagnostics.fallback_usage.calls > 0);
    assert_eq!(job.diagnostics.premium_budget_remaining, Some(0));
}

#[tokio::test]
async fn priority_page_uses_premium_model_while_budget_lasts() {
    let temp_dir = TempDir::new().unwrap();
    let store = store_in(&temp_dir);
    let client = Arc::new(ScriptedCompletionClient::new());
    let pipeline = orchestrator(store.clone(), client.clone(), BudgetConfig::default());
    let mut plan = bakery_plan();
    plan.push(FilePlanEntry::new("dashboard.html", "Customer dashboard"));
    let mut job = planned_job(&store, plan);

    pipeline.run(&mut job).await.unwrap();

    let calls = client.calls();
    let dashboard = calls
        .iter()
        .find(|call| call.mentions("dashboard.html"))
        .unwrap();
    let about = calls.iter().find(|call| call.mentions("about.html")).unwrap();
    assert_eq!(dashboard.model, PREMIUM_MODEL);
    assert_eq!(about.model, FALLBACK_MODEL);
    assert!(job.diagnostics.usage_by_model.contains_key(PREMIUM_MODEL));
}

#[tokio::test]
async fn consistency_issues_are_recorded_but_not_applied() {
    let temp_dir = TempDir::new().unwrap();
    let store = store_in(&temp_dir);
    let client = Arc::new(ScriptedCompletionClient::new());
    client.reply(
        REVIEW,
        r#"[{"file": "about.html", "issue": "Footer differs from home page", "fix": "Reuse the home footer"}]"#,
    );
    let pipeline = orchestrator(store.clone(), client, BudgetConfig::default());
    let mut job = planned_job(&store, bakery_plan());

    let report = pipeline.run(&mut job).await.unwrap();

    assert_eq!(report.consistency_issues, 1);
    assert_eq!(job.diagnostics.consistency_issues[0].file, "about.html");
    assert_eq!(
        std::fs::read_to_string(report.output_dir.join("about.html")).unwrap(),
        "generated about.html"
    );
}

#[tokio::test]
async fn run_requires_a_planned_job() {
    let temp_dir = TempDir::new().unwrap();
    let store = store_in(&temp_dir);
    let client = Arc::new(ScriptedCompletionClient::new());
    let pipeline = orchestrator(store.clone(), client.clone(), BudgetConfig::default());
    let mut job = store.create(ProjectType::StaticSite).unwrap();

    let err = pipeline.run(&mut job).await.unwrap_err();

    assert!(matches!(
        err,
        PipelineError::Job(JobError::InvalidTransition { .. })
    ));
    assert!(client.calls().is_empty());
}

#[tokio::test]
async fn pipeline_emits_lifecycle_notifications() {
    let temp_dir = TempDir::new().unwrap();
    let store = store_in(&temp_dir);
    let client = Arc::new(ScriptedCompletionClient::new());
    let (notifier, receiver) = Notifier::new_pair();
    let pipeline =
        orchestrator(store.clone(), client, BudgetConfig::default()).with_notifier(notifier);
    let mut job = planned_job(&store, bakery_plan());

    pipeline.run(&mut job).await.unwrap();

    let kinds: Vec<String> = notify::drain(&receiver)
        .into_iter()
        .map(|notification| notification.kind)
        .collect();
    assert_eq!(kinds.first().map(String::as_str), Some("pipeline_started"));
    assert_eq!(kinds.last().map(String::as_str), Some("pipeline_completed"));
    assert_eq!(
        kinds.iter().filter(|kind| *kind == "batch_completed").count(),
        3
    );
}

#[tokio::test]
async fn planned_paths_are_canonicalized_and_unsafe_ones_dropped() {
    let temp_dir = TempDir::new().unwrap();
    let store = store_in(&temp_dir);
    let client = Arc::new(ScriptedCompletionClient::new());
    let pipeline = orchestrator(store.clone(), client.clone(), BudgetConfig::default());
    let plan = vec![
        FilePlanEntry::new("index.html", "Home page"),
        FilePlanEntry::new("styles.css", "Site stylesheet"),
        FilePlanEntry::new("/about.html", "About the bakers"),
        FilePlanEntry::new("./about.html", "About the bakers, again"),
        FilePlanEntry::new("./README.md", "How to deploy"),
        FilePlanEntry::new("../escape.html", "Outside the workspace"),
    ];
    let mut job = planned_job(&store, plan);

    let report = pipeline.run(&mut job).await.unwrap();

    assert_eq!(job.status(), JobStatus::Done);
    assert!(report.zip_path.exists());
    assert_eq!(report.planned, 5);
    assert_eq!(report.generated, 4);
    assert_eq!(report.dropped, vec!["../escape.html".to_string()]);
    assert!(report.is_partial());
    for path in ["index.html", "styles.css", "about.html", "README.md"] {
        assert!(report.output_dir.join(path).exists(), "{} not published", path);
    }
    assert_eq!(client.calls_mentioning("about.html"), 1);
    assert_eq!(client.calls_mentioning("escape.html"), 0);

    let reloaded = store.load(&job.job_id).unwrap();
    let dropped: Vec<&str> = reloaded
        .diagnostics
        .dropped_files
        .iter()
        .map(|d| d.path.as_str())
        .collect();
    assert_eq!(dropped, vec!["../escape.html"]);

    let log = store.read_log(&job).unwrap();
    assert!(log[0].contains("pipeline started: 5 planned files"));
    assert!(log.iter().any(|line| line.contains("rejected ../escape.html")));
    assert!(log.last().unwrap().contains("finished: 4 of 5 planned files"));
}

fn pacing(paid_ms: u64, free_ms: u64) -> PipelineConfig {
    PipelineConfig {
        retry_delay_ms: 0,
        inter_batch_delay_paid_ms: paid_ms,
        inter_batch_delay_free_ms: free_ms,
    }
}

async fn elapsed_run(models: sitesmith::config::ModelsConfig, plan: Vec<FilePlanEntry>) -> Duration {
    let temp_dir = TempDir::new().unwrap();
    let store = store_in(&temp_dir);
    let client = Arc::new(ScriptedCompletionClient::new());
    let pipeline = paced_orchestrator(store.clone(), client, models, pacing(1_000, 5_000));
    let mut job = planned_job(&store, plan);

    let started = tokio::time::Instant::now();
    pipeline.run(&mut job).await.unwrap();
    started.elapsed()
}

fn assert_close(elapsed: Duration, expected: Duration) {
    assert!(
        elapsed >= expected && elapsed < expected + Duration::from_millis(50),
        "elapsed {:?}, expected {:?}",
        elapsed,
        expected
    );
}

#[tokio::test(start_paused = true)]
async fn paid_batches_are_paced_by_the_paid_delay() {
    let mut models = test_models();
    models.fallback.tier = ModelTier::Paid;

    // Three non-empty batches: two pauses, none before the first.
    let elapsed = elapsed_run(models, bakery_plan()).await;

    assert_close(elapsed, Duration::from_millis(2_000));
}

#[tokio::test(start_paused = true)]
async fn batch_using_a_free_model_is_followed_by_the_free_delay() {
    // Foundation runs on the paid premium model, about.html on the free fallback.
    let elapsed = elapsed_run(test_models(), bakery_plan()).await;

    assert_close(elapsed, Duration::from_millis(1_000 + 5_000));
}

#[tokio::test(start_paused = true)]
async fn single_batch_run_is_never_paused() {
    let plan = vec![
        FilePlanEntry::new("index.html", "Home page"),
        FilePlanEntry::new("styles.css", "Site stylesheet"),
    ];

    let elapsed = elapsed_run(test_models(), plan).await;

    assert!(elapsed < Duration::from_millis(1_000), "elapsed {:?}", elapsed);
}
