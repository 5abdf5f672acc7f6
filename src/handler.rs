//! Request handling
//!
//! Admission runs three independent filters in order: the inbound event registry (duplicate
//! deliveries), the lease lock (another replica already owns the event), and the request
//! registry (delayed retries of a request that was already handled). Only a request that passes
//! all three creates a job. Whatever happens afterwards, the handler releases its own lease (a
//! replica that took over an expired lease keeps it) and the request receives at most one
//! progress message and at most one terminal message.

use crate::config::RegistryConfig;
use crate::error::{DeliveryError, PipelineError};
use crate::job::{FilePlanEntry, ImprovedSpec, Job, ProjectType};
use crate::lease::LeaseLock;
use crate::notify::Notifier;
use crate::pipeline::{PipelineOrchestrator, PipelineReport};
use crate::registry::{EventKey, InboundEventRegistry, RequestRegistry};
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

pub const STAGE_SPEC: &str = "spec";
pub const STAGE_PLAN: &str = "plan";

/// One inbound chat request, already stripped of transport formatting.
#[derive(Debug, Clone)]
pub struct InboundRequest {
    pub request_id: String,
    pub event: EventKey,
    pub project_type: ProjectType,
    pub prompt: String,
}

/// Produces the refined spec and the file plan before any batch runs.
#[async_trait]
pub trait SpecPlanner: Send + Sync {
    async fn improve_spec(&self, request: &InboundRequest) -> Result<ImprovedSpec, PipelineError>;

    async fn plan_files(&self, spec: &ImprovedSpec) -> Result<Vec<FilePlanEntry>, PipelineError>;
}

/// Seam to the chat transport.
#[async_trait]
pub trait ResponseSink: Send + Sync {
    /// Post the progress message for a job and return its handle.
    async fn post_progress(
        &self,
        request: &InboundRequest,
        job_id: &str,
    ) -> Result<String, DeliveryError>;

    async fn post_result(
        &self,
        request: &InboundRequest,
        report: &PipelineReport,
    ) -> Result<(), DeliveryError>;

    async fn post_error(&self, request: &InboundRequest, message: &str)
        -> Result<(), DeliveryError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandleOutcome {
    /// The same event was delivered again within the dedup window.
    DuplicateEvent,
    /// Another owner holds the event lease.
    LockContention { holder: Option<String> },
    /// The request id was already registered within the retention window.
    DuplicateRequest,
    /// Files were published; check `report.is_partial()`.
    Completed(PipelineReport),
    /// Every file failed transiently; the request stays open and unfinalized.
    Deferred { job_id: String, reason: String },
    Failed {
        job_id: Option<String>,
        reason: String,
    },
}

pub struct RequestHandler {
    events: InboundEventRegistry,
    requests: RequestRegistry,
    lease: LeaseLock,
    orchestrator: PipelineOrchestrator,
    planner: Arc<dyn SpecPlanner>,
    sink: Arc<dyn ResponseSink>,
    notifier: Notifier,
}

impl RequestHandler {
    pub fn new(
        orchestrator: PipelineOrchestrator,
        planner: Arc<dyn SpecPlanner>,
        sink: Arc<dyn ResponseSink>,
        lease: LeaseLock,
        registry: &RegistryConfig,
    ) -> Self {
        Self {
            events: InboundEventRegistry::with_ttl(registry.event_ttl()),
            requests: RequestRegistry::with_ttl(registry.request_ttl()),
            lease,
            orchestrator,
            planner,
            sink,
            notifier: Notifier::disabled(),
        }
    }

    pub fn with_notifier(mut self, notifier: Notifier) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn requests(&self) -> &RequestRegistry {
        &self.requests
    }

    pub fn events(&self) -> &InboundEventRegistry {
        &self.events
    }

    pub fn lease(&self) -> &LeaseLock {
        &self.lease
    }

    pub fn lease_key(event: &EventKey) -> String {
        format!("event:{}", event)
    }

    pub async fn handle(&self, request: &InboundRequest) -> HandleOutcome {
        if !self.events.check_and_mark(&request.event) {
            debug!(event = %request.event, "Duplicate event delivery ignored");
            self.notifier
                .emit("duplicate_event", json!({ "event": request.event.to_string() }));
            return HandleOutcome::DuplicateEvent;
        }

        let lease_key = Self::lease_key(&request.event);
        let lease = self.lease.acquire_default(&lease_key).await;
        if !lease.acquired {
            let holder = self.lease.holder(&lease_key).await.map(|record| record.owner);
            info!(
                key = %lease_key,
                attempt = %lease.owner,
                holder = holder.as_deref().unwrap_or("unknown"),
                "Event lease held elsewhere"
            );
            self.notifier.emit(
                "lock_contention",
                json!({ "key": lease_key, "holder": holder }),
            );
            return HandleOutcome::LockContention { holder };
        }

        let outcome = match self.requests.register(&request.request_id) {
            None => {
                info!(request_id = %request.request_id, "Duplicate request ignored");
                self.notifier.emit(
                    "duplicate_request",
                    json!({ "request_id": request.request_id }),
                );
                HandleOutcome::DuplicateRequest
            }
            Some(_) => {
                info!(
                    request_id = %request.request_id,
                    lease_owner = %lease.owner,
                    backend = ?lease.backend,
                    "Request admitted"
                );
                self.process(request).await
            }
        };

        self.lease.release_owned(&lease_key, &lease.owner).await;
        outcome
    }

    async fn process(&self, request: &InboundRequest) -> HandleOutcome {
        let store = self.orchestrator.store();
        let mut job = match store.create(request.project_type) {
            Ok(job) => job,
            Err(err) => return self.fail(request, None, err.into()).await,
        };
        self.notifier.emit(
            "job_created",
            json!({ "request_id": request.request_id, "job_id": job.job_id }),
        );
        self.post_progress(request, &job.job_id).await;

        if let Err(err) = self.prepare(request, &mut job).await {
            if !job.status().is_terminal() {
                if let Err(fail_err) = job.fail(err.to_string()) {
                    warn!(job_id = %job.job_id, error = %fail_err, "Could not mark job failed");
                }
                if let Err(save_err) = store.save(&job) {
                    warn!(job_id = %job.job_id, error = %save_err, "Could not persist failed job");
                }
            }
            return self.fail(request, Some(job.job_id.clone()), err).await;
        }

        match self.orchestrator.run(&mut job).await {
            Ok(report) => self.complete(request, report).await,
            Err(err) if err.is_transient() => {
                warn!(
                    request_id = %request.request_id,
                    job_id = %job.job_id,
                    error = %err,
                    "Transient generation failure; leaving request open"
                );
                self.notifier.emit(
                    "request_deferred",
                    json!({ "request_id": request.request_id, "job_id": job.job_id }),
                );
                HandleOutcome::Deferred {
                    job_id: job.job_id.clone(),
                    reason: err.to_string(),
                }
            }
            Err(err) => self.fail(request, Some(job.job_id.clone()), err).await,
        }
    }

    /// `created → spec_generated → planned` through the external planner.
    async fn prepare(&self, request: &InboundRequest, job: &mut Job) -> Result<(), PipelineError> {
        let store = self.orchestrator.store();

        job.diagnostics.start_stage(STAGE_SPEC);
        let spec = self.planner.improve_spec(request).await?;
        job.record_spec(spec.clone())?;
        job.diagnostics.end_stage(STAGE_SPEC);
        store.save(job)?;

        job.diagnostics.start_stage(STAGE_PLAN);
        let file_plan = self.planner.plan_files(&spec).await?;
        job.record_plan(file_plan)?;
        job.diagnostics.end_stage(STAGE_PLAN);
        store.save(job)?;
        Ok(())
    }

    /// At most one progress message per job, however many requests reference it.
    async fn post_progress(&self, request: &InboundRequest, job_id: &str) {
        if let Some(existing) = self.requests.progress_message_for_job(job_id) {
            debug!(job_id, handle = %existing, "Progress message already posted for job");
            self.requests.set_job_id(&request.request_id, job_id);
            return;
        }
        match self.sink.post_progress(request, job_id).await {
            Ok(handle) => {
                self.requests
                    .set_progress_message_id(&request.request_id, handle, Some(job_id));
            }
            Err(err) => {
                warn!(job_id, error = %err, "Could not post progress message");
                self.requests.set_job_id(&request.request_id, job_id);
            }
        }
    }

    async fn complete(
        &self,
        request: &InboundRequest,
        report: PipelineReport,
    ) -> HandleOutcome {
        match self.sink.post_result(request, &report).await {
            Ok(()) => self.requests.set_final_response_sent(&request.request_id),
            Err(err) => warn!(
                request_id = %request.request_id,
                error = %err,
                "Could not post result"
            ),
        }
        self.requests.finalize(&request.request_id);
        self.notifier.emit(
            "request_completed",
            json!({
                "request_id": request.request_id,
                "job_id": report.job_id,
                "partial": report.is_partial(),
            }),
        );
        HandleOutcome::Completed(report)
    }

    /// Fatal path: one error message unless a final response already went out, then finalize.
    async fn fail(
        &self,
        request: &InboundRequest,
        job_id: Option<String>,
        err: PipelineError,
    ) -> HandleOutcome {
        error!(
            request_id = %request.request_id,
            job_id = job_id.as_deref().unwrap_or("-"),
            error = %err,
            "Request failed"
        );
        if self.requests.has_final_response(&request.request_id) {
            debug!(
                request_id = %request.request_id,
                "Final response already sent; no error posted"
            );
        } else {
            match self.sink.post_error(request, &user_message(&err)).await {
                Ok(()) => self.requests.set_final_response_sent(&request.request_id),
                Err(delivery) => warn!(
                    request_id = %request.request_id,
                    error = %delivery,
                    "Could not post error"
                ),
            }
        }
        self.requests.finalize(&request.request_id);
        self.notifier.emit(
            "request_failed",
            json!({ "request_id": request.request_id, "job_id": job_id }),
        );
        HandleOutcome::Failed {
            job_id,
            reason: err.to_string(),
        }
    }
}

fn user_message(err: &PipelineError) -> String {
    match err {
        PipelineError::NoFilesGenerated { .. } => {
            "Nothing could be generated for this request. Please try again.".to_string()
        }
        other => format!("Generation failed: {}", other),
    }
}
