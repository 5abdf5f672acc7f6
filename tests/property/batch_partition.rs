//! Property-based tests for batch planning

use proptest::prelude::*;
use sitesmith::job::FilePlanEntry;
use sitesmith::planner::{BatchPlanner, BatchType, FileKind};
use std::collections::HashSet;

fn path_strategy() -> impl Strategy<Value = String> {
    let stems = prop::sample::select(vec![
        "index", "about", "contact", "login", "dashboard", "menu", "styles", "app", "logo",
        "README", "config", "landing", "blog",
    ]);
    let extensions = prop::sample::select(vec![
        "html", "css", "js", "json", "png", "md", "toml", "txt", "svg",
    ]);
    let dirs = prop::sample::select(vec!["", "pages/", "assets/", "css/"]);
    (dirs, stems, extensions).prop_map(|(dir, stem, ext)| format!("{}{}.{}", dir, stem, ext))
}

fn plan_strategy() -> impl Strategy<Value = Vec<FilePlanEntry>> {
    prop::collection::vec(path_strategy(), 0..24).prop_map(|paths| {
        paths
            .into_iter()
            .map(|path| FilePlanEntry::new(path, ""))
            .collect()
    })
}

/// Every distinct planned path lands in exactly one batch
#[test]
fn test_every_path_planned_exactly_once() {
    let mut runner = proptest::test_runner::TestRunner::default();
    let planner = BatchPlanner::default();

    runner
        .run(&plan_strategy(), |entries| {
            let plan = planner.plan(&entries);
            let distinct: HashSet<&str> = entries.iter().map(|e| e.path.as_str()).collect();

            let planned: Vec<String> = plan
                .batches
                .iter()
                .flat_map(|batch| batch.paths())
                .map(|path| path.to_string())
                .collect();
            let planned_set: HashSet<&str> = planned.iter().map(String::as_str).collect();

            prop_assert_eq!(planned.len(), planned_set.len());
            prop_assert_eq!(planned_set, distinct);
            prop_assert_eq!(plan.total_files(), planned.len());
            Ok(())
        })
        .unwrap();
}

/// Batch order is fixed and stylesheets and scripts always ride with the foundation
#[test]
fn test_batch_order_and_foundation_membership() {
    let mut runner = proptest::test_runner::TestRunner::default();
    let planner = BatchPlanner::default();

    runner
        .run(&plan_strategy(), |entries| {
            let plan = planner.plan(&entries);
            prop_assert_eq!(plan.batch_types(), BatchType::ORDER.to_vec());

            let foundation: HashSet<String> = plan
                .batch(BatchType::Foundation)
                .map(|batch| batch.paths().iter().map(|p| p.to_string()).collect())
                .unwrap_or_default();
            for entry in &entries {
                match FileKind::classify(&entry.path) {
                    FileKind::Css | FileKind::Javascript => {
                        prop_assert!(foundation.contains(&entry.path));
                    }
                    FileKind::Readme => {
                        let readme = plan.batch(BatchType::Readme).unwrap();
                        prop_assert!(readme.paths().contains(&entry.path.as_str()));
                    }
                    _ => {}
                }
            }

            let has_page = entries
                .iter()
                .any(|e| FileKind::classify(&e.path) == FileKind::HtmlPage);
            let foundation_has_page = foundation
                .iter()
                .any(|path| FileKind::classify(path) == FileKind::HtmlPage);
            prop_assert_eq!(has_page, foundation_has_page);
            Ok(())
        })
        .unwrap();
}
