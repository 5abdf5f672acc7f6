//! Property-based tests for planning and deduplication guarantees

mod batch_partition;
mod registry_idempotence;
