//! Engine event bus
//!
//! Observable notifications for consumers outside the core: management
//! layers, monitoring, test harnesses. Publishing never blocks and never
//! fails; events to a bus nobody listens to are dropped.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::dtl::DtlState;
use crate::types::{NodeId, OwnerTag, SnapshotName, VolumeId};

/// Default buffered events per subscriber
const DEFAULT_CAPACITY: usize = 256;

/// Engine-level notifications
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EngineEvent {
    /// A volume finished starting and serves I/O
    VolumeUpAndRunning {
        /// The volume
        id: VolumeId,
    },
    /// A snapshot's TLogs and persistor are durably on the backend
    SnapshotOnBackend {
        /// The volume
        id: VolumeId,
        /// The snapshot
        name: SnapshotName,
    },
    /// A volume entered the terminal halted state
    VolumeHalted {
        /// The volume
        id: VolumeId,
        /// Why it halted
        reason: String,
    },
    /// Ownership of a volume moved
    OwnerChanged {
        /// The volume
        id: VolumeId,
        /// Previous owner
        from: NodeId,
        /// New owner
        to: NodeId,
        /// Tag of the new ownership generation
        tag: OwnerTag,
    },
    /// A volume's DTL state changed
    DtlStateChanged {
        /// The volume
        id: VolumeId,
        /// The new state
        state: DtlState,
    },
}

/// Broadcast bus of [`EngineEvent`]s
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    /// Create a bus with the default subscriber buffer
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Create a bus with a custom subscriber buffer
    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish an event to all current subscribers
    pub fn publish(&self, event: EngineEvent) {
        log::debug!("event: {event:?}");
        self.tx.send(event).ok();
    }

    /// Subscribe to future events
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_see_events_in_order() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.publish(EngineEvent::VolumeUpAndRunning {
            id: VolumeId::new("v"),
        });
        bus.publish(EngineEvent::VolumeHalted {
            id: VolumeId::new("v"),
            reason: "test".to_string(),
        });

        assert_eq!(
            rx.recv().await.unwrap(),
            EngineEvent::VolumeUpAndRunning {
                id: VolumeId::new("v")
            }
        );
        assert!(matches!(
            rx.recv().await.unwrap(),
            EngineEvent::VolumeHalted { .. }
        ));
    }

    #[test]
    fn publish_without_subscribers_is_fine() {
        let bus = EventBus::new();
        bus.publish(EngineEvent::VolumeUpAndRunning {
            id: VolumeId::new("v"),
        });
    }
}
