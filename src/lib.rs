//! Sitesmith: exactly-once orchestration of chunked site generation jobs
//!
//! Inbound chat events pass three admission filters ([`registry::InboundEventRegistry`],
//! [`lease::LeaseLock`], [`registry::RequestRegistry`]) before a [`job::Job`] is created. The
//! job's file plan is split into ordered batches by [`planner::BatchPlanner`], generated by
//! [`generation::GenerationWorker`] under a per-job premium token budget, and published by
//! [`pipeline::PipelineOrchestrator`].

pub mod cli;
pub mod config;
pub mod error;
pub mod generation;
pub mod handler;
pub mod job;
pub mod lease;
pub mod logging;
pub mod notify;
pub mod pipeline;
pub mod planner;
pub mod provider;
pub mod registry;
pub mod workspace;
