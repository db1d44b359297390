//! Job lifecycle event broadcaster.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::broadcast;

use crate::queue::JobRecord;

/// Lifecycle event, carrying a full read-only snapshot of the job.
///
/// `Completed` means the job reached a terminal state; the snapshot's
/// status distinguishes `complete` from `error`. For a given job id,
/// events are delivered in the order the transitions were committed.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "job", rename_all = "camelCase")]
pub enum JobEvent {
    Added(JobRecord),
    Updated(JobRecord),
    Completed(JobRecord),
    Removed(JobRecord),
}

impl JobEvent {
    /// The snapshot carried by this event.
    pub fn job(&self) -> &JobRecord {
        match self {
            JobEvent::Added(job)
            | JobEvent::Updated(job)
            | JobEvent::Completed(job)
            | JobEvent::Removed(job) => job,
        }
    }
}

/// Broadcasts job lifecycle events to any number of subscribers.
#[derive(Clone)]
pub struct JobEventBroadcaster {
    sender: Arc<broadcast::Sender<JobEvent>>,
}

impl JobEventBroadcaster {
    /// Creates a new broadcaster with the specified channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Sends an event to all subscribers.
    pub fn send(&self, event: JobEvent) {
        // Ignore errors - no active receivers is fine
        let _ = self.sender.send(event);
    }

    /// Creates a new subscriber for lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.sender.subscribe()
    }
}

impl Default for JobEventBroadcaster {
    fn default() -> Self {
        Self::new(100)
    }
}
