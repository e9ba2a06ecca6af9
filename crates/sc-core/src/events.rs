//! Events published by a sample-changer controller.
//!
//! Events are fanned out over a `tokio::sync::broadcast` channel. Slow
//! subscribers lag and lose events instead of blocking the controller.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::capabilities::SignalEmitter;
use crate::state::SampleChangerState;

/// Something observable changed.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ChangerEvent {
    /// Effective state moved from `previous` to `current`.
    StateChanged {
        /// State before the change.
        previous: SampleChangerState,
        /// State after the change.
        current: SampleChangerState,
    },
    /// The sample on the goniometer changed.
    LoadedSampleChanged {
        /// Address of the sample now mounted, `None` after an unload.
        address: Option<String>,
    },
    /// A holder appeared in or disappeared from the dewar.
    PresenceChanged {
        /// Holder address.
        address: String,
        /// Whether the holder is now present.
        present: bool,
    },
    /// Selection changed.
    SelectionChanged {
        /// Selected basket, if any.
        basket: Option<String>,
        /// Selected sample, if any.
        sample: Option<String>,
    },
    /// Barcode/scan info of a component changed.
    InfoChanged {
        /// Component address.
        address: String,
    },
    /// Robot trajectory started or stopped.
    RunningStateChanged {
        /// Whether a trajectory is running.
        running: bool,
    },
    /// Arm power switched.
    PowerStateChanged {
        /// Whether the arm is powered.
        powered: bool,
    },
    /// Controller message changed.
    MessageChanged {
        /// New message, empty when cleared.
        message: String,
    },
    /// LN2 regulation switched.
    RegulationStateChanged {
        /// Whether regulation is on.
        regulating: bool,
    },
    /// A dewar lid opened or closed.
    LidStateChanged {
        /// Lid number, 1-based.
        lid: u8,
        /// Whether the lid is open.
        open: bool,
    },
}

/// Default capacity of the event channel.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Broadcast fan-out of [`ChangerEvent`]s.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ChangerEvent>,
}

impl EventBus {
    /// Bus buffering up to `capacity` events per slow subscriber.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Receive every event emitted from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ChangerEvent> {
        self.tx.subscribe()
    }

    /// Number of live receivers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

impl SignalEmitter for EventBus {
    fn emit(&self, event: ChangerEvent) {
        tracing::trace!(?event, "emit");
        // No subscribers is not an error.
        let _ = self.tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_events_reach_every_subscriber() {
        let bus = EventBus::new(8);
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        bus.emit(ChangerEvent::PowerStateChanged { powered: true });

        assert_eq!(
            a.recv().await.unwrap(),
            ChangerEvent::PowerStateChanged { powered: true }
        );
        assert_eq!(
            b.recv().await.unwrap(),
            ChangerEvent::PowerStateChanged { powered: true }
        );
    }

    #[test]
    fn test_emit_without_subscribers() {
        let bus = EventBus::default();
        bus.emit(ChangerEvent::MessageChanged {
            message: "idle".into(),
        });
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_event_json_shape() {
        let json = serde_json::to_value(ChangerEvent::StateChanged {
            previous: SampleChangerState::Ready,
            current: SampleChangerState::Loading,
        })
        .unwrap();
        assert_eq!(json["event"], "state_changed");
        assert_eq!(json["current"], "loading");
    }
}
