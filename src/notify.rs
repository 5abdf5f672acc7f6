//! Fire-and-forget notifications.
//!
//! [`Notifier::emit`] must never affect control flow: send failures (a dropped receiver, a
//! disabled notifier) are swallowed and logged at trace level.

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::mpsc::{channel, Receiver, Sender};
use tracing::trace;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub ts: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub data: Value,
}

impl Notification {
    pub fn with_now(kind: impl Into<String>, data: Value) -> Self {
        Self {
            ts: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            kind: kind.into(),
            data,
        }
    }
}

#[derive(Clone, Default)]
pub struct Notifier {
    sender: Option<Sender<Notification>>,
}

impl Notifier {
    pub fn new_pair() -> (Self, Receiver<Notification>) {
        let (sender, receiver) = channel();
        (
            Self {
                sender: Some(sender),
            },
            receiver,
        )
    }

    /// A notifier with no consumer; every emit is a no-op.
    pub fn disabled() -> Self {
        Self { sender: None }
    }

    pub fn emit(&self, kind: &str, data: Value) {
        let Some(sender) = &self.sender else {
            return;
        };
        if let Err(err) = sender.send(Notification::with_now(kind, data)) {
            trace!(kind, error = %err, "Notification dropped");
        }
    }
}

impl std::fmt::Debug for Notifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Notifier")
            .field("enabled", &self.sender.is_some())
            .finish()
    }
}

/// Everything currently queued on `receiver`, without blocking.
pub fn drain(receiver: &Receiver<Notification>) -> Vec<Notification> {
    receiver.try_iter().collect()
}
