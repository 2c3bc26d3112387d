// Tunnel Bridge - Event Sink
// Fire-and-forget fan-out of bridge events to every subscriber

use tokio::sync::broadcast;
use tracing::debug;

use tunnel_bridge_common::{BridgeEvent, EventPayload, ResourceKind};

const EVENT_CAPACITY: usize = 256;

/// Cloneable publisher; `publish` never blocks the ingress path
#[derive(Clone)]
pub struct EventSink {
    tx: broadcast::Sender<BridgeEvent>,
}

impl EventSink {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BridgeEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: BridgeEvent) {
        if let Err(e) = self.tx.send(event) {
            debug!("No subscribers for bridge event: {:?}", e.0);
        }
    }

    pub fn data(&self, source: ResourceKind, payload: EventPayload) {
        self.publish(BridgeEvent::Data { source, payload });
    }

    pub fn error(&self, source: ResourceKind, message: impl Into<String>) {
        self.publish(BridgeEvent::Error {
            source,
            message: message.into(),
        });
    }

    pub fn closed(&self, source: ResourceKind) {
        self.publish(BridgeEvent::Closed { source });
    }
}

impl Default for EventSink {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fifo_per_subscriber() {
        let sink = EventSink::new();
        let mut rx = sink.subscribe();

        sink.data(ResourceKind::Serial, EventPayload::Bytes(vec![1]));
        sink.data(ResourceKind::Serial, EventPayload::Bytes(vec![2]));
        sink.closed(ResourceKind::Serial);

        assert_eq!(
            rx.recv().await.unwrap(),
            BridgeEvent::Data {
                source: ResourceKind::Serial,
                payload: EventPayload::Bytes(vec![1])
            }
        );
        assert_eq!(
            rx.recv().await.unwrap(),
            BridgeEvent::Data {
                source: ResourceKind::Serial,
                payload: EventPayload::Bytes(vec![2])
            }
        );
        assert_eq!(
            rx.recv().await.unwrap(),
            BridgeEvent::Closed {
                source: ResourceKind::Serial
            }
        );
    }

    #[test]
    fn test_publish_without_subscribers_is_harmless() {
        let sink = EventSink::new();
        sink.error(ResourceKind::Tunnel, "nobody listening");
    }
}
