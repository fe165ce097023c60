use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::SpotChange;

const CHANNEL_CAPACITY: usize = 256;

/// Outbound side of the change feed. Implementations must never block or fail the caller.
pub trait ChangePublisher: Send + Sync {
    fn publish(&self, change: &SpotChange);
}

/// Broadcast hub with one channel per facility.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<SpotChange>>,
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

    /// Subscribe to a facility's changes. Creates the channel if needed.
    pub fn subscribe(&self, facility_id: Ulid) -> broadcast::Receiver<SpotChange> {
        let sender = self
            .channels
            .entry(facility_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Drop channels nobody listens to any more.
    pub fn prune(&self) {
        self.channels.retain(|_, tx| tx.receiver_count() > 0);
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}

impl ChangePublisher for NotifyHub {
    /// No-op if nobody is listening on the facility.
    fn publish(&self, change: &SpotChange) {
        if let Some(sender) = self.channels.get(&change.facility_id) {
            let _ = sender.send(change.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ChangeReason, Occupancy};

    fn change(facility_id: Ulid) -> SpotChange {
        SpotChange {
            facility_id,
            spot_id: Ulid::new(),
            state: Occupancy::Reserved,
            reason: ChangeReason::ReservationCreated,
            reference: Some(Ulid::new()),
        }
    }

    #[tokio::test]
    async fn subscribe_and_receive() {
        let hub = NotifyHub::new();
        let fid = Ulid::new();
        let mut rx = hub.subscribe(fid);

        let c = change(fid);
        hub.publish(&c);

        assert_eq!(rx.recv().await.unwrap(), c);
    }

    #[tokio::test]
    async fn facilities_are_isolated() {
        let hub = NotifyHub::new();
        let a = Ulid::new();
        let b = Ulid::new();
        let mut rx_a = hub.subscribe(a);

        hub.publish(&change(b));
        assert!(rx_a.try_recv().is_err());
    }

    #[test]
    fn publish_without_subscribers_is_noop() {
        let hub = NotifyHub::new();
        hub.publish(&change(Ulid::new()));
        assert_eq!(hub.channel_count(), 0);
    }

    #[test]
    fn prune_drops_dead_channels() {
        let hub = NotifyHub::new();
        let rx = hub.subscribe(Ulid::new());
        let _kept = hub.subscribe(Ulid::new());
        assert_eq!(hub.channel_count(), 2);
        drop(rx);
        hub.prune();
        assert_eq!(hub.channel_count(), 1);
    }
}
