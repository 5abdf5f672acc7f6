//! Property-based tests for request and event deduplication

use proptest::prelude::*;
use sitesmith::registry::{EventKey, InboundEventRegistry, RequestRegistry};
use std::collections::HashSet;

/// The first registration of an id wins, every later one is rejected
#[test]
fn test_register_admits_each_id_once() {
    let mut runner = proptest::test_runner::TestRunner::default();

    runner
        .run(
            &prop::collection::vec("[a-d]{1,2}", 0..40),
            |request_ids| {
                let registry = RequestRegistry::new();
                let mut seen = HashSet::new();
                for id in &request_ids {
                    let admitted = registry.register(id).is_some();
                    prop_assert_eq!(admitted, seen.insert(id.clone()));
                }
                prop_assert_eq!(registry.len(), seen.len());
                Ok(())
            },
        )
        .unwrap();
}

/// Finalizing any number of times leaves the same state as finalizing once
#[test]
fn test_finalize_is_idempotent() {
    let mut runner = proptest::test_runner::TestRunner::default();

    runner
        .run(&(1usize..6, any::<bool>()), |(repeats, with_progress)| {
            let registry = RequestRegistry::new();
            registry.register("r1").unwrap();
            if with_progress {
                registry.set_progress_message_id("r1", "msg-1".to_string(), Some("job-1"));
            }
            registry.finalize("r1");
            let once = registry.get("r1").unwrap();
            for _ in 0..repeats {
                registry.finalize("r1");
            }
            let many = registry.get("r1").unwrap();

            prop_assert!(many.finalized);
            prop_assert_eq!(once.finalized, many.finalized);
            prop_assert_eq!(once.progress_message_id, many.progress_message_id);
            prop_assert_eq!(once.job_id, many.job_id);
            prop_assert!(registry.register("r1").is_none());
            Ok(())
        })
        .unwrap();
}

/// An event key is admitted exactly once within the dedup window
#[test]
fn test_event_keys_admitted_once() {
    let mut runner = proptest::test_runner::TestRunner::default();

    runner
        .run(
            &prop::collection::vec(("[ab]", "[xy]", "[0-3]"), 0..30),
            |keys| {
                let registry = InboundEventRegistry::new();
                let mut seen = HashSet::new();
                for (context, channel, event) in keys {
                    let key = EventKey::new(context, channel, event);
                    let first = registry.check_and_mark(&key);
                    prop_assert_eq!(first, seen.insert(key.to_string()));
                    prop_assert!(registry.is_seen(&key));
                }
                Ok(())
            },
        )
        .unwrap();
}
