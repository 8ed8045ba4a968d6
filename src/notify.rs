use dashmap::DashMap;
use tokio::sync::broadcast;

use crate::model::Event;

const CHANNEL_CAPACITY: usize = 256;

/// Per-provider broadcast of committed ledger events.
pub struct NotifyHub {
    channels: DashMap<String, broadcast::Sender<Event>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to a provider's booking feed. Creates the channel if needed.
    pub fn subscribe(&self, provider_id: &str) -> broadcast::Receiver<Event> {
        let sender = self
            .channels
            .entry(provider_id.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Publish to the event's provider feed. No-op if nobody is listening.
    pub fn send(&self, event: &Event) {
        if let Some(sender) = self.channels.get(event.provider_id()) {
            let _ = sender.send(event.clone());
        }
    }

    /// Drop channels whose last subscriber has gone away.
    pub fn prune(&self) {
        self.channels.retain(|_, sender| sender.receiver_count() > 0);
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    fn deleted(provider_id: &str) -> Event {
        Event::BookingDeleted {
            id: Ulid::new(),
            provider_id: provider_id.into(),
        }
    }

    #[tokio::test]
    async fn subscribe_and_receive() {
        let hub = NotifyHub::new();
        let mut rx = hub.subscribe("prov-1");

        let event = deleted("prov-1");
        hub.send(&event);

        assert_eq!(rx.recv().await.unwrap(), event);
    }

    #[tokio::test]
    async fn feeds_are_isolated_per_provider() {
        let hub = NotifyHub::new();
        let mut rx = hub.subscribe("prov-1");
        hub.send(&deleted("prov-2"));
        assert!(matches!(
            rx.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }

    #[test]
    fn send_without_subscribers_is_noop() {
        let hub = NotifyHub::new();
        hub.send(&deleted("prov-1"));
        assert_eq!(hub.channel_count(), 0);
    }

    #[test]
    fn prune_drops_abandoned_channels() {
        let hub = NotifyHub::new();
        let rx = hub.subscribe("prov-1");
        let _kept = hub.subscribe("prov-2");
        drop(rx);
        hub.prune();
        assert_eq!(hub.channel_count(), 1);
    }
}
