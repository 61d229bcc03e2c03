use dashmap::DashMap;
use tokio::sync::broadcast;

use crate::model::SlotEvent;

const CHANNEL_CAPACITY: usize = 256;

/// Broadcast hub fanning slot-state transitions out to every live
/// subscriber of a room (one room per resource/day).
///
/// Publish never blocks on delivery and nothing is persisted: a receiver
/// that lags or disconnects simply misses events and reconciles via the
/// slot status query. Ordering per slot follows commit order because events
/// are published by the committing task, after the store transition.
pub struct RoomHub {
    channels: DashMap<String, broadcast::Sender<SlotEvent>>,
}

impl RoomHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to a room. Creates the channel if needed.
    pub fn subscribe(&self, room: &str) -> broadcast::Receiver<SlotEvent> {
        let sender = self
            .channels
            .entry(room.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Fan an event out to the room. No-op if nobody is listening.
    pub fn publish(&self, room: &str, event: &SlotEvent) {
        metrics::counter!(crate::observability::ROOM_EVENTS_PUBLISHED_TOTAL).increment(1);
        if let Some(sender) = self.channels.get(room) {
            if sender.send(event.clone()).is_err() {
                tracing::debug!(room, "publish with no live subscribers");
            }
        }
    }

    /// Drop a room's channel once its last observer is gone.
    pub fn remove(&self, room: &str) {
        self.channels.remove(room);
    }
}

impl Default for RoomHub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SlotKey;

    #[tokio::test]
    async fn fan_out_preserves_transition_order() {
        let hub = RoomHub::new();
        let key = SlotKey::new("D1", "2024-05-01", "09:00");
        let room = key.room();

        let mut rx1 = hub.subscribe(&room);
        let mut rx2 = hub.subscribe(&room);

        hub.publish(&room, &SlotEvent::locked(&key, "alice"));
        hub.publish(&room, &SlotEvent::booked(&key, "alice"));

        for rx in [&mut rx1, &mut rx2] {
            assert_eq!(rx.recv().await.unwrap(), SlotEvent::locked(&key, "alice"));
            assert_eq!(rx.recv().await.unwrap(), SlotEvent::booked(&key, "alice"));
        }
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_noop() {
        let hub = RoomHub::new();
        let key = SlotKey::new("D9", "2024-06-01", "11:00");
        // No subscriber — must not panic or block
        hub.publish(&key.room(), &SlotEvent::unlocked(&key));
    }

    #[tokio::test]
    async fn rooms_are_isolated() {
        let hub = RoomHub::new();
        let key_a = SlotKey::new("D1", "2024-05-01", "09:00");
        let key_b = SlotKey::new("D2", "2024-05-01", "09:00");

        let mut rx_b = hub.subscribe(&key_b.room());
        hub.publish(&key_a.room(), &SlotEvent::locked(&key_a, "alice"));

        assert!(matches!(
            rx_b.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }
}
