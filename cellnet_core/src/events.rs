//! Live event fan-out for viewers.
//!
//! Entities publish `SimEvent`s on a shared `EventBus`; subscribers pick the
//! kinds they care about. A subscriber that falls behind loses the oldest
//! events rather than slowing the simulation down.

use crate::cdr::{CdrRecord, CdrState};
use cellnet_env::EntityId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tokio::sync::broadcast;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Move,
    SignalReport,
    Connect,
    Disconnect,
    Cdr,
}

impl EventKind {
    pub fn all() -> Vec<EventKind> {
        vec![
            EventKind::Move,
            EventKind::SignalReport,
            EventKind::Connect,
            EventKind::Disconnect,
            EventKind::Cdr,
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SimEvent {
    Move {
        caller_id: EntityId,
        x: f64,
        y: f64,
    },
    SignalReport {
        caller_id: EntityId,
        tower_id: EntityId,
        distance: f64,
        power: f64,
    },
    Connect {
        caller_id: EntityId,
        tower_id: EntityId,
        handoff: bool,
    },
    Disconnect {
        caller_id: EntityId,
        tower_id: EntityId,
        /// `None` when the tower is released by a handoff
        state: Option<CdrState>,
    },
    Cdr {
        record: CdrRecord,
    },
}

impl SimEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            SimEvent::Move { .. } => EventKind::Move,
            SimEvent::SignalReport { .. } => EventKind::SignalReport,
            SimEvent::Connect { .. } => EventKind::Connect,
            SimEvent::Disconnect { .. } => EventKind::Disconnect,
            SimEvent::Cdr { .. } => EventKind::Cdr,
        }
    }
}

/// Broadcast channel for `SimEvent`s.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<SimEvent>,
}

impl EventBus {
    /// Creates a bus retaining up to `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publishes an event. Returns the number of subscribers it reached;
    /// publishing with no subscribers is not an error.
    pub fn publish(&self, event: SimEvent) -> usize {
        self.sender.send(event).unwrap_or(0)
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Subscribes to the given kinds. An empty slice subscribes to everything.
    pub fn subscribe(&self, kinds: &[EventKind]) -> EventSubscription {
        EventSubscription {
            receiver: self.sender.subscribe(),
            kinds: kinds.iter().copied().collect(),
            lagged: 0,
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

/// A filtered view of the bus.
pub struct EventSubscription {
    receiver: broadcast::Receiver<SimEvent>,
    kinds: BTreeSet<EventKind>,
    lagged: u64,
}

impl EventSubscription {
    fn wants(&self, event: &SimEvent) -> bool {
        self.kinds.is_empty() || self.kinds.contains(&event.kind())
    }

    /// Waits for the next matching event. Returns `None` once every bus
    /// handle is gone and the backlog is drained.
    pub async fn recv(&mut self) -> Option<SimEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) if self.wants(&event) => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    self.lagged += skipped;
                    warn!("Event subscriber lagged, skipped {} events", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Returns the next matching event already queued, if any.
    pub fn try_recv(&mut self) -> Option<SimEvent> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) if self.wants(&event) => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    self.lagged += skipped;
                }
                Err(_) => return None,
            }
        }
    }

    /// Total events this subscriber missed by falling behind.
    pub fn lagged(&self) -> u64 {
        self.lagged
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn moved(x: f64) -> SimEvent {
        SimEvent::Move {
            caller_id: EntityId::from("caller-1"),
            x,
            y: 0.0,
        }
    }

    fn connected() -> SimEvent {
        SimEvent::Connect {
            caller_id: EntityId::from("caller-1"),
            tower_id: EntityId::from("tower-a"),
            handoff: false,
        }
    }

    #[tokio::test]
    async fn test_subscription_filters_by_kind() {
        let bus = EventBus::new(16);
        let mut moves = bus.subscribe(&[EventKind::Move]);
        let mut everything = bus.subscribe(&[]);

        bus.publish(connected());
        bus.publish(moved(1.0));

        assert_eq!(moves.recv().await, Some(moved(1.0)));
        assert_eq!(everything.recv().await, Some(connected()));
        assert_eq!(everything.recv().await, Some(moved(1.0)));
    }

    #[tokio::test]
    async fn test_closed_bus_ends_subscription() {
        let bus = EventBus::new(4);
        let mut sub = bus.subscribe(&[]);
        bus.publish(moved(2.0));
        drop(bus);

        assert_eq!(sub.recv().await, Some(moved(2.0)));
        assert_eq!(sub.recv().await, None);
    }

    #[test]
    fn test_lagging_subscriber_loses_oldest() {
        let bus = EventBus::new(2);
        let mut sub = bus.subscribe(&[]);
        for x in 0..5 {
            bus.publish(moved(x as f64));
        }

        assert_eq!(sub.try_recv(), Some(moved(3.0)));
        assert_eq!(sub.try_recv(), Some(moved(4.0)));
        assert_eq!(sub.try_recv(), None);
        assert_eq!(sub.lagged(), 3);
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::default();
        assert_eq!(bus.publish(moved(0.0)), 0);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_event_json_is_tagged() {
        let json = serde_json::to_string(&connected()).unwrap();
        assert!(json.contains(r#""kind":"connect""#));
    }
}
