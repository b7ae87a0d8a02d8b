use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::Serialize;
use tracing::warn;

use crate::supervisor::JobState;

/// Notifications emitted by the supervisor and synthesizer for any watcher
/// (dashboard, webhook relay). Delivery is best effort.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    JobTransition {
        job_id: String,
        account_id: String,
        state: JobState,
    },
    TreeUpdated {
        account_id: String,
        tree_id: String,
        version: i64,
    },
}

#[async_trait]
pub trait EventSink: Send + Sync {
    /// Publish one event. Implementations should not block for long; the
    /// caller already swallows failures.
    async fn publish(&self, event: Event);
}

pub struct NoopEventSink;

#[async_trait]
impl EventSink for NoopEventSink {
    async fn publish(&self, _event: Event) {}
}

/// Collects events in memory; used by tests to assert on the stream.
#[derive(Default, Clone)]
pub struct RecordingEventSink {
    events: Arc<Mutex<Vec<Event>>>,
}

impl RecordingEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().expect("lock events").clone()
    }
}

#[async_trait]
impl EventSink for RecordingEventSink {
    async fn publish(&self, event: Event) {
        match self.events.lock() {
            Ok(mut events) => events.push(event),
            Err(err) => warn!(error = %err, "event sink poisoned, dropping event"),
        }
    }
}
