//! Session event notifications
//!
//! Presentation code registers as an observer by subscribing to the bus and
//! handles events on its own thread. Decode threads only ever publish.

use std::path::PathBuf;

use serde::Serialize;
use tokio::sync::broadcast;

use crate::stream::SessionState;

/// Event channel capacity (ring buffer size)
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Something that happened to a camera session
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum SessionEvent {
    /// Controller state transition
    StateChanged { camera: String, state: SessionState },
    /// A decode attempt ended with an error; the next one runs after `retry_in_ms`
    AttemptFailed {
        camera: String,
        error: String,
        retry_in_ms: u64,
    },
    RecordingStarted { camera: String, path: PathBuf },
    RecordingStopped { camera: String, path: PathBuf },
    /// Session closed for good
    Closed { camera: String },
}

impl SessionEvent {
    /// Key of the camera the event belongs to
    pub fn camera(&self) -> &str {
        match self {
            SessionEvent::StateChanged { camera, .. }
            | SessionEvent::AttemptFailed { camera, .. }
            | SessionEvent::RecordingStarted { camera, .. }
            | SessionEvent::RecordingStopped { camera, .. }
            | SessionEvent::Closed { camera } => camera,
        }
    }
}

/// Broadcast bus for session events
pub struct EventBus {
    tx: broadcast::Sender<SessionEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Publish an event to all subscribers
    ///
    /// With no subscribers the event is dropped.
    pub fn publish(&self, event: SessionEvent) {
        let _ = self.tx.send(event);
    }

    /// Subscribe to events
    ///
    /// A subscriber that falls too far behind receives `Lagged` and misses events.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
