//! Pipeline event system.
//!
//! [`EventBus`] wraps a `tokio::sync::broadcast` channel with a bounded
//! ring-buffer of recent events so that the admin API can show what happened
//! lately without having been subscribed at the time.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::error::ProcessFault;

/// Maximum number of events retained in the ring buffer.
const MAX_RECENT_EVENTS: usize = 200;

// ---------------------------------------------------------------------------
// PipelineEvent
// ---------------------------------------------------------------------------

/// What happened.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineEvent {
    // -- Stage lifecycle -----------------------------------------------------
    StageStarted {
        stage: String,
    },
    StageStopped {
        stage: String,
    },
    StageFailed {
        stage: String,
        error: String,
    },
    StageCrashed {
        stage: String,
        fault: ProcessFault,
    },
    StageRestarted {
        stage: String,
    },

    // -- Feed ----------------------------------------------------------------
    FeedAuthenticated {
        stage: String,
        peer: String,
    },
    FeedRejected {
        stage: String,
        peer: String,
        reason: String,
    },
    FeedDisconnected {
        stage: String,
        peer: String,
        bytes: u64,
    },

    // -- Segments ------------------------------------------------------------
    SegmentPublished {
        stream: String,
        quality: String,
        index: u64,
        duration: f64,
    },

    // -- Recording -----------------------------------------------------------
    RecordingStarted {
        channel: String,
        episode: String,
    },
    RecordingStopped {
        channel: String,
        episode: String,
    },
}

// ---------------------------------------------------------------------------
// Event
// ---------------------------------------------------------------------------

/// A timestamped event ready for broadcast.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub payload: PipelineEvent,
}

impl Event {
    /// Create a new event with a fresh UUID and the current timestamp.
    pub fn new(payload: PipelineEvent) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            payload,
        }
    }
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

/// Broadcast channel with a bounded ring buffer of recent events.
pub struct EventBus {
    tx: broadcast::Sender<Event>,
    recent: RwLock<VecDeque<Event>>,
}

impl EventBus {
    /// Create a new event bus.
    ///
    /// `capacity` controls the broadcast channel buffer size (not the ring
    /// buffer, which is always [`MAX_RECENT_EVENTS`]).
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx,
            recent: RwLock::new(VecDeque::with_capacity(MAX_RECENT_EVENTS)),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// Broadcast an event to all current subscribers and store it in the
    /// ring buffer.
    pub fn publish(&self, payload: PipelineEvent) {
        let event = Event::new(payload);

        {
            let mut recent = self.recent.write();
            if recent.len() >= MAX_RECENT_EVENTS {
                recent.pop_back();
            }
            recent.push_front(event.clone());
        }

        // No subscribers is fine.
        let _ = self.tx.send(event);
    }

    /// Return the `n` most recent events (newest first).
    pub fn recent_events(&self, n: usize) -> Vec<Event> {
        let recent = self.recent.read();
        recent.iter().take(n).cloned().collect()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("recent", &self.recent.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_and_receive() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();

        bus.publish(PipelineEvent::StageStarted {
            stage: "feed".into(),
        });

        let event = rx.try_recv().unwrap();
        match &event.payload {
            PipelineEvent::StageStarted { stage } => assert_eq!(stage, "feed"),
            other => panic!("unexpected payload: {:?}", other),
        }
    }

    #[test]
    fn recent_events_capped() {
        let bus = EventBus::new(256);
        for i in 0..(MAX_RECENT_EVENTS + 50) {
            bus.publish(PipelineEvent::SegmentPublished {
                stream: "live".into(),
                quality: "wifi".into(),
                index: i as u64,
                duration: 10.0,
            });
        }
        assert_eq!(bus.recent_events(1000).len(), MAX_RECENT_EVENTS);
    }

    #[test]
    fn recent_events_newest_first() {
        let bus = EventBus::new(16);
        bus.publish(PipelineEvent::StageStarted {
            stage: "a".into(),
        });
        bus.publish(PipelineEvent::StageStopped {
            stage: "b".into(),
        });

        let recent = bus.recent_events(1);
        assert_eq!(recent.len(), 1);
        assert!(matches!(recent[0].payload, PipelineEvent::StageStopped { .. }));
    }

    #[test]
    fn crash_event_serializes_fault() {
        let event = Event::new(PipelineEvent::StageCrashed {
            stage: "encoder".into(),
            fault: ProcessFault {
                command_line: "ffmpeg -y -i - -".into(),
                exit_code: Some(1),
                last_line: Some("boom".into()),
            },
        });
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["payload"]["type"], "stage_crashed");
        assert_eq!(json["payload"]["fault"]["exit_code"], 1);
        assert_eq!(json["payload"]["fault"]["last_line"], "boom");
    }

    #[test]
    fn no_subscribers_does_not_panic() {
        let bus = EventBus::new(4);
        bus.publish(PipelineEvent::RecordingStarted {
            channel: "bus".into(),
            episode: "2024-01-01_00-00-00".into(),
        });
        assert_eq!(bus.recent_events(10).len(), 1);
    }
}
