//! Short-lived set of seen inbound event keys.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};

/// Identity of one delivery from the chat transport.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EventKey {
    pub source_context: String,
    pub channel_id: String,
    pub event_id: String,
}

impl EventKey {
    pub fn new(
        source_context: impl Into<String>,
        channel_id: impl Into<String>,
        event_id: impl Into<String>,
    ) -> Self {
        Self {
            source_context: source_context.into(),
            channel_id: channel_id.into(),
            event_id: event_id.into(),
        }
    }
}

impl fmt::Display for EventKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.source_context, self.channel_id, self.event_id
        )
    }
}

/// Existence-only duplicate-delivery filter with a fixed retention window.
pub struct InboundEventRegistry {
    seen: Mutex<HashMap<EventKey, Instant>>,
    ttl: Duration,
}

impl InboundEventRegistry {
    pub const DEFAULT_TTL: Duration = Duration::from_secs(5 * 60);

    pub fn new() -> Self {
        Self::with_ttl(Self::DEFAULT_TTL)
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            seen: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// Mark `key` as seen. Returns `true` on the first sighting within the window.
    pub fn check_and_mark(&self, key: &EventKey) -> bool {
        let now = Instant::now();
        let mut seen = self.seen.lock();
        seen.retain(|_, at| now.saturating_duration_since(*at) <= self.ttl);
        if seen.contains_key(key) {
            return false;
        }
        seen.insert(key.clone(), now);
        true
    }

    pub fn is_seen(&self, key: &EventKey) -> bool {
        let now = Instant::now();
        self.seen
            .lock()
            .get(key)
            .map(|at| now.saturating_duration_since(*at) <= self.ttl)
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.seen.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InboundEventRegistry {
    fn default() -> Self {
        Self::new()
    }
}
