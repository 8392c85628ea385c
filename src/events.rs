//! Event Bus (spec.md §4.6): typed notifications to the surrounding
//! application. Cloud-event prefix-matched dispatch to user subscriptions
//! lives on `registry::SubscriptionRegistry` and is driven from the
//! dispatcher; this module only carries the signal to the embedder.

use bytes::Bytes;
use tokio::sync::mpsc;

/// Every signal the engine can emit to the embedding application
/// (spec.md §4.6's list).
#[derive(Debug, Clone)]
pub enum ClientEvent {
    Connect,
    Connected,
    Disconnect,
    Reconnect,
    ConnectionError { reason: String },
    Error { message: String },
    Publish { name: String, data: Bytes },
    PublishCompleted { success: bool },
    Subscribe { name: String },
    Time { epoch_seconds: u32 },
    Signal(bool),
    Dfu,
    Safemode,
    Reboot,
    FirmwareUpdateForced(bool),
    FirmwareUpdatePending(bool),
    FileReceived { name: String, buffer: Bytes },
    FileSent { name: String },
    OtaReceived(Bytes),
}

/// A cheaply cloneable handle that sends `ClientEvent`s to whichever
/// receiver the `Client` keeps; every engine component that needs to
/// emit holds its own clone.
#[derive(Clone)]
pub struct EventBus {
    sender: mpsc::UnboundedSender<ClientEvent>,
}

impl EventBus {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ClientEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }

    pub fn emit(&self, event: ClientEvent) {
        let _ = self.sender.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn emitted_events_are_received_in_order() {
        let (bus, mut rx) = EventBus::new();
        bus.emit(ClientEvent::Connect);
        bus.emit(ClientEvent::Connected);
        assert!(matches!(rx.recv().await, Some(ClientEvent::Connect)));
        assert!(matches!(rx.recv().await, Some(ClientEvent::Connected)));
    }
}
