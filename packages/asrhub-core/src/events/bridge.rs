//! Sink abstraction and the broadcast bridge.

use tokio::sync::broadcast;

use super::OutboundEvent;

/// Trait for emitting outbound events without knowledge of transport.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: OutboundEvent);
}

/// Sink that silently discards events (embedders without clients, tests).
pub struct NoopEventSink;

impl EventSink for NoopEventSink {
    fn emit(&self, _event: OutboundEvent) {}
}

/// Sink that logs every event at debug level.
pub struct LoggingEventSink;

impl EventSink for LoggingEventSink {
    fn emit(&self, event: OutboundEvent) {
        tracing::debug!(?event, "outbound_event");
    }
}

/// Bridges domain events to the transport broadcast channel.
///
/// Transports subscribe and filter by `session_id`; a send with no live
/// receivers is not an error (nobody connected yet).
#[derive(Clone)]
pub struct EventBridge {
    tx: broadcast::Sender<OutboundEvent>,
}

impl EventBridge {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Returns a new receiver for the broadcast channel.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<OutboundEvent> {
        self.tx.subscribe()
    }

    /// Returns a reference to the broadcast sender.
    #[must_use]
    pub fn sender(&self) -> &broadcast::Sender<OutboundEvent> {
        &self.tx
    }
}

impl EventSink for EventBridge {
    fn emit(&self, event: OutboundEvent) {
        if let Err(err) = self.tx.send(event) {
            log::trace!("[EventBridge] no receivers: {}", err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::iso_timestamp;

    #[tokio::test]
    async fn bridge_fans_out_to_subscribers() {
        let bridge = EventBridge::new(8);
        let mut rx_a = bridge.subscribe();
        let mut rx_b = bridge.subscribe();
        bridge.emit(OutboundEvent::Heartbeat {
            timestamp: iso_timestamp(),
        });
        assert!(matches!(
            rx_a.recv().await.unwrap(),
            OutboundEvent::Heartbeat { .. }
        ));
        assert!(matches!(
            rx_b.recv().await.unwrap(),
            OutboundEvent::Heartbeat { .. }
        ));
    }

    #[test]
    fn emit_without_receivers_is_silent() {
        let bridge = EventBridge::new(8);
        bridge.emit(OutboundEvent::Heartbeat {
            timestamp: iso_timestamp(),
        });
    }
}
