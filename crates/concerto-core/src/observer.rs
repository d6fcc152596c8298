//! Server state change notifications.
//!
//! Interested parties subscribe to a registry and receive tagged events over
//! a channel; there is no global observer state. The engine never touches
//! the registry directly: it reports through its own event channel and the
//! control thread forwards.

use crossbeam_channel::{unbounded, Receiver, Sender, TrySendError};
use parking_lot::Mutex;

use concerto_proto::{Direction, NodeId, StreamId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObserverEvent {
    OutputVolumeChanged { volume: u32 },
    OutputMuteChanged { muted: bool },
    CaptureGainChanged { gain: i32 },
    NodesChanged,
    ActiveNodeChanged { direction: Direction, node_id: NodeId },
    NodeVolumeChanged { node_id: NodeId, volume: u8 },
    NodeLeftRightSwapped { node_id: NodeId, swapped: bool },
    NumActiveStreamsChanged { direction: Direction, count: u32 },
    StreamRemoved { stream_id: StreamId },
    Underrun { dev_index: u32 },
    SevereUnderrun { dev_index: u32 },
    DeviceRemoved { dev_index: u32 },
    SuspendChanged { suspended: bool },
}

/// Fan-out registry. Subscribers that fall away are dropped on the next
/// notify.
#[derive(Default)]
pub struct ObserverRegistry {
    subscribers: Mutex<Vec<Sender<ObserverEvent>>>,
}

impl ObserverRegistry {
    pub fn new() -> ObserverRegistry {
        ObserverRegistry::default()
    }

    pub fn subscribe(&self) -> Receiver<ObserverEvent> {
        let (tx, rx) = unbounded();
        self.subscribers.lock().push(tx);
        rx
    }

    pub fn notify(&self, event: ObserverEvent) {
        self.subscribers.lock().retain(|tx| {
            !matches!(tx.try_send(event.clone()), Err(TrySendError::Disconnected(_)))
        });
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscribers_receive_events() {
        let registry = ObserverRegistry::new();
        let rx_a = registry.subscribe();
        let rx_b = registry.subscribe();
        registry.notify(ObserverEvent::NodesChanged);
        assert_eq!(rx_a.try_recv().unwrap(), ObserverEvent::NodesChanged);
        assert_eq!(rx_b.try_recv().unwrap(), ObserverEvent::NodesChanged);
    }

    #[test]
    fn test_dropped_subscriber_pruned() {
        let registry = ObserverRegistry::new();
        let rx = registry.subscribe();
        drop(rx);
        registry.notify(ObserverEvent::NodesChanged);
        assert_eq!(registry.subscriber_count(), 0);
    }
}
