//! Event Bus (C8): per-user authenticated push channel for FSM transitions
//! (§4.8). A single `tokio::sync::broadcast` channel carries every
//! transition in commit order; subscribers filter for their own `user_id`,
//! which makes "subscribe to instance X" structurally unrepresentable —
//! a socket only ever sees events for the user it authenticated as.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::domain::{InstanceStatus, RelayStatus};

const CHANNEL_CAPACITY: usize = 1024;
const ADMIN_CHANNEL_CAPACITY: usize = 256;

/// Published by the FSM (C4, the sole publisher — §9) on every committed
/// transition.
#[derive(Debug, Clone, Serialize)]
pub struct InstanceEvent {
    pub user_id: Uuid,
    pub instance_id: Uuid,
    pub status: InstanceStatus,
    pub reason: String,
    pub ts: DateTime<Utc>,
}

/// Published by the relay prober (C9) on a relay health transition (§4.9:
/// "On open circuit, mark unhealthy and publish on C8 to any admin
/// subscribers"). Unlike [`InstanceEvent`] this has no owning `user_id` —
/// it is routed to every subscriber whose account is `is_admin`, not
/// filtered per-user.
#[derive(Debug, Clone, Serialize)]
pub struct RelayHealthEvent {
    pub relay_id: String,
    pub status: RelayStatus,
    pub reason: String,
    pub ts: DateTime<Utc>,
}

pub struct EventBus {
    tx: broadcast::Sender<InstanceEvent>,
    admin_tx: broadcast::Sender<RelayHealthEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(CHANNEL_CAPACITY);
        let (admin_tx, _admin_rx) = broadcast::channel(ADMIN_CHANNEL_CAPACITY);
        Self { tx, admin_tx }
    }

    /// Best-effort, at-most-once delivery (§4.8): a full or subscriber-less
    /// channel is not an error, it just means nobody was listening.
    pub fn publish(&self, event: InstanceEvent) {
        match self.tx.send(event) {
            Ok(receivers) => debug!(receivers, "event_bus: published"),
            Err(_) => debug!("event_bus: published with no subscribers"),
        }
    }

    /// Fans a relay health transition out to every admin subscriber (§4.9).
    /// Best-effort like [`Self::publish`] — a relay flapping with nobody
    /// watching the ops dashboard is not an error.
    pub fn publish_relay_health(&self, event: RelayHealthEvent) {
        match self.admin_tx.send(event) {
            Ok(receivers) => debug!(receivers, "event_bus: published relay health"),
            Err(_) => debug!("event_bus: published relay health with no admin subscribers"),
        }
    }

    pub fn subscribe(&self) -> UserSubscription {
        UserSubscription { rx: self.tx.subscribe() }
    }

    /// Admin-only relay health stream; callers are responsible for checking
    /// `User.is_admin` before handing this out (websocket transport does so
    /// at handshake time).
    pub fn subscribe_admin(&self) -> AdminSubscription {
        AdminSubscription { rx: self.admin_tx.subscribe() }
    }

    /// Shutdown phase 2 (§5): marks intent to stop; subscribers themselves
    /// unwind as their WebSocket connections close during the drain phase
    /// that follows.
    pub fn close(&self) {
        debug!(receiver_count = self.tx.receiver_count(), "event_bus: closing for shutdown");
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// A single socket's view of the bus, already scoped to one `user_id`.
pub struct UserSubscription {
    rx: broadcast::Receiver<InstanceEvent>,
}

impl UserSubscription {
    /// Waits for the next event addressed to `user_id`, silently skipping
    /// events for other users and lagged gaps (best-effort delivery — §4.8).
    pub async fn recv_for(&mut self, user_id: Uuid) -> Option<InstanceEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) if event.user_id == user_id => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "event_bus: subscriber lagged, dropping events");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// An admin socket's view of the relay health stream — unfiltered, since
/// every subscriber here has already been authorized as `is_admin`.
pub struct AdminSubscription {
    rx: broadcast::Receiver<RelayHealthEvent>,
}

impl AdminSubscription {
    pub async fn recv(&mut self) -> Option<RelayHealthEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "event_bus: admin subscriber lagged, dropping events");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(user_id: Uuid) -> InstanceEvent {
        InstanceEvent {
            user_id,
            instance_id: Uuid::new_v4(),
            status: InstanceStatus::Online,
            reason: "all systems operational".into(),
            ts: Utc::now(),
        }
    }

    #[tokio::test]
    async fn subscriber_only_receives_own_user_events() {
        let bus = EventBus::new();
        let user_a = Uuid::new_v4();
        let user_b = Uuid::new_v4();
        let mut sub_a = bus.subscribe();

        bus.publish(event(user_b));
        bus.publish(event(user_a));

        let received = tokio::time::timeout(std::time::Duration::from_secs(1), sub_a.recv_for(user_a))
            .await
            .expect("should not time out")
            .expect("channel open");
        assert_eq!(received.user_id, user_a);
    }

    #[tokio::test]
    async fn publish_with_no_subscribers_does_not_panic() {
        let bus = EventBus::new();
        bus.publish(event(Uuid::new_v4()));
    }

    #[tokio::test]
    async fn admin_subscriber_receives_relay_health_events() {
        let bus = EventBus::new();
        let mut admin_sub = bus.subscribe_admin();

        bus.publish_relay_health(RelayHealthEvent {
            relay_id: "relay-1".into(),
            status: RelayStatus::Unhealthy,
            reason: "circuit breaker open".into(),
            ts: Utc::now(),
        });

        let received = tokio::time::timeout(std::time::Duration::from_secs(1), admin_sub.recv())
            .await
            .expect("should not time out")
            .expect("channel open");
        assert_eq!(received.relay_id, "relay-1");
        assert_eq!(received.status, RelayStatus::Unhealthy);
    }

    #[tokio::test]
    async fn publish_relay_health_with_no_subscribers_does_not_panic() {
        let bus = EventBus::new();
        bus.publish_relay_health(RelayHealthEvent {
            relay_id: "relay-1".into(),
            status: RelayStatus::Active,
            reason: "probe ok".into(),
            ts: Utc::now(),
        });
    }
}
