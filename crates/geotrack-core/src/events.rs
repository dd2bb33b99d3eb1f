//! Tracker event system.
//!
//! Every component receives an [`EventDispatcher`] at construction and
//! publishes [`TrackerEvent`]s on it. Consumers (UI bridges, loggers, tests)
//! subscribe to a broadcast receiver.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use geotrack_types::{Coords, LocationRecord, TrackingMode};

/// Events emitted by the tracker.
///
/// All events are serializable for logging and IPC.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new event types
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[non_exhaustive]
pub enum TrackerEvent {
    /// A fix was accepted and queued.
    Location { record: LocationRecord },
    /// The motion state changed.
    MotionChange {
        is_moving: bool,
        location: Option<Coords>,
    },
    /// An upload attempt finished.
    SyncResponse {
        /// HTTP status, or 0 when no response was received.
        status: u16,
        success: bool,
        body: String,
    },
    /// The schedule switched tracking on or off.
    ScheduleTransition {
        enabled: bool,
        tracking_mode: TrackingMode,
    },
    /// Tracking was enabled or disabled outside the schedule.
    EnabledChange { enabled: bool },
    /// The effective distance filter for the position source changed.
    DistanceFilterChange { distance_filter: f64 },
    /// A fix was dropped without being queued.
    Discarded { reason: DiscardReason },
}

/// Why a fix did not reach the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum DiscardReason {
    /// Same position as the previous accepted fix.
    Identical,
    /// Tracking is disabled.
    Disabled,
}

/// Sender for tracker events.
pub type EventSender = broadcast::Sender<TrackerEvent>;

/// Receiver for tracker events.
pub type EventReceiver = broadcast::Receiver<TrackerEvent>;

/// Event dispatcher for sending events to multiple receivers.
#[derive(Debug, Clone)]
pub struct EventDispatcher {
    sender: EventSender,
}

impl EventDispatcher {
    /// Create a new event dispatcher.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Subscribe to events.
    pub fn subscribe(&self) -> EventReceiver {
        self.sender.subscribe()
    }

    /// Send an event.
    pub fn send(&self, event: TrackerEvent) {
        // Ignore error if no receivers
        let _ = self.sender.send(event);
    }

    /// Get the number of active receivers.
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_without_receivers() {
        let dispatcher = EventDispatcher::new(4);
        dispatcher.send(TrackerEvent::EnabledChange { enabled: true });
        assert_eq!(dispatcher.receiver_count(), 0);
    }

    #[tokio::test]
    async fn test_subscribe_receives_events() {
        let dispatcher = EventDispatcher::default();
        let mut rx = dispatcher.subscribe();
        let mut rx2 = dispatcher.subscribe();
        assert_eq!(dispatcher.receiver_count(), 2);

        dispatcher.send(TrackerEvent::SyncResponse {
            status: 200,
            success: true,
            body: "ok".into(),
        });

        for rx in [&mut rx, &mut rx2] {
            match rx.recv().await.unwrap() {
                TrackerEvent::SyncResponse { status, success, .. } => {
                    assert_eq!(status, 200);
                    assert!(success);
                }
                other => panic!("unexpected event {other:?}"),
            }
        }
    }

    #[test]
    fn test_event_serialization() {
        let event = TrackerEvent::ScheduleTransition {
            enabled: true,
            tracking_mode: TrackingMode::Geofence,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "schedule_transition");
        assert_eq!(json["enabled"], true);
        assert_eq!(json["tracking_mode"], "geofence");

        let event = TrackerEvent::Discarded {
            reason: DiscardReason::Identical,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert_eq!(json, r#"{"type":"discarded","reason":"identical"}"#);
    }

    #[test]
    fn test_motion_change_round_trip() {
        let event = TrackerEvent::MotionChange {
            is_moving: false,
            location: None,
        };
        let json = serde_json::to_string(&event).unwrap();
        let back: TrackerEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
    }
}
