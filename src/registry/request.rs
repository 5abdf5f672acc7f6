//! Per-request idempotency state machine.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Unfinalized entries outlive finalized ones by this factor before they are treated as abandoned.
const ABANDONED_TTL_FACTOR: u32 = 4;

/// State of one inbound request.
///
/// `finalized` only ever moves from `false` to `true`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InFlightRequest {
    pub request_id: String,
    pub progress_message_id: Option<String>,
    pub started_at: Instant,
    pub finalized: bool,
    pub has_final_response: bool,
    pub job_id: Option<String>,
}

impl InFlightRequest {
    fn new(request_id: &str, now: Instant) -> Self {
        Self {
            request_id: request_id.to_string(),
            progress_message_id: None,
            started_at: now,
            finalized: false,
            has_final_response: false,
            job_id: None,
        }
    }

    fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.started_at)
    }
}

/// Registry of in-flight and recently finalized requests.
///
/// Every operation is total: unknown ids are no-ops or `false`, nothing returns an error.
pub struct RequestRegistry {
    entries: Mutex<HashMap<String, InFlightRequest>>,
    ttl: Duration,
}

impl RequestRegistry {
    pub const DEFAULT_TTL: Duration = Duration::from_secs(30 * 60);

    pub fn new() -> Self {
        Self::with_ttl(Self::DEFAULT_TTL)
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Register a new request.
    ///
    /// Returns `None` when an entry for `request_id` is younger than the retention TTL,
    /// finalized or not: a retry that arrives after a fast success is still a duplicate.
    /// Purges finalized entries older than the TTL, and unfinalized ones left behind for
    /// [`ABANDONED_TTL_FACTOR`] times the TTL, first.
    pub fn register(&self, request_id: &str) -> Option<InFlightRequest> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        Self::sweep(&mut entries, now, self.ttl);

        if let Some(existing) = entries.get(request_id) {
            if existing.age(now) < self.ttl {
                debug!(
                    request_id,
                    finalized = existing.finalized,
                    "Rejecting duplicate request"
                );
                return None;
            }
        }

        let request = InFlightRequest::new(request_id, now);
        entries.insert(request_id.to_string(), request.clone());
        Some(request)
    }

    /// Record the progress message handle and, when known, the job it reports on.
    ///
    /// Later calls overwrite the handle; a `None` job id keeps the previously recorded one.
    pub fn set_progress_message_id(
        &self,
        request_id: &str,
        handle: impl Into<String>,
        job_id: Option<&str>,
    ) {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get_mut(request_id) {
            entry.progress_message_id = Some(handle.into());
            if let Some(job_id) = job_id {
                entry.job_id = Some(job_id.to_string());
            }
        }
    }

    /// Link a job to the request without touching the progress handle.
    pub fn set_job_id(&self, request_id: &str, job_id: &str) {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get_mut(request_id) {
            entry.job_id = Some(job_id.to_string());
        }
    }

    pub fn finalize(&self, request_id: &str) {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get_mut(request_id) {
            entry.finalized = true;
        }
    }

    pub fn is_finalized(&self, request_id: &str) -> bool {
        self.entries
            .lock()
            .get(request_id)
            .map(|entry| entry.finalized)
            .unwrap_or(false)
    }

    pub fn has_final_response(&self, request_id: &str) -> bool {
        self.entries
            .lock()
            .get(request_id)
            .map(|entry| entry.has_final_response)
            .unwrap_or(false)
    }

    pub fn set_final_response_sent(&self, request_id: &str) {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get_mut(request_id) {
            entry.has_final_response = true;
        }
    }

    /// Progress message already posted for `job_id` by any request, if one exists.
    pub fn progress_message_for_job(&self, job_id: &str) -> Option<String> {
        self.entries
            .lock()
            .values()
            .filter(|entry| entry.job_id.as_deref() == Some(job_id))
            .find_map(|entry| entry.progress_message_id.clone())
    }

    pub fn get(&self, request_id: &str) -> Option<InFlightRequest> {
        self.entries.lock().get(request_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn sweep(entries: &mut HashMap<String, InFlightRequest>, now: Instant, ttl: Duration) {
        let abandoned_after = ttl.saturating_mul(ABANDONED_TTL_FACTOR);
        let mut purged = 0usize;
        let mut abandoned = 0usize;
        entries.retain(|_, entry| {
            let age = entry.age(now);
            if entry.finalized && age > ttl {
                purged += 1;
                false
            } else if !entry.finalized && age > abandoned_after {
                abandoned += 1;
                false
            } else {
                true
            }
        });
        if purged > 0 {
            debug!(purged, "Swept finalized requests");
        }
        if abandoned > 0 {
            warn!(abandoned, "Swept requests that were never finalized");
        }
    }
}

impl Default for RequestRegistry {
    fn default() -> Self {
        Self::new()
    }
}
