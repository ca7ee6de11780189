//! Room-scoped event fan-out
//!
//! Keeps the subscription table from stage id to the connections currently
//! in that room and dispatches stage events into each connection's bounded
//! send queue. Dispatch never blocks the triggering operation: a queue that
//! is full means the client is too slow and the event is dropped for that
//! connection only.

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::models::{ConnectionId, StageId};
use crate::{Error, Result};

/// What changed in the room.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageAction {
    ParticipantAdded,
    ParticipantRemoved,
    ProducerAdded,
    ProducerRemoved,
    ProducersState,
    PeerAdded,
    PeerOfferReceived,
    PeerAnswerReceived,
    PeerCandidateReceived,
}

impl StageAction {
    /// Wire event name.
    #[must_use]
    pub const fn event_name(self) -> &'static str {
        match self {
            Self::ParticipantAdded => "participant/added",
            Self::ParticipantRemoved => "participant/removed",
            Self::ProducerAdded => "producer/added",
            Self::ProducerRemoved => "producer/removed",
            Self::ProducersState => "producers/state",
            Self::PeerAdded => "peer/added",
            Self::PeerOfferReceived => "peer/offer-received",
            Self::PeerAnswerReceived => "peer/answer-received",
            Self::PeerCandidateReceived => "peer/candidate-received",
        }
    }
}

/// One room-state change, fanned out to every subscribed connection.
#[derive(Debug, Clone)]
pub struct StageEvent {
    pub action: StageAction,
    pub stage_id: StageId,
    /// Connection that triggered the change; excluded from delivery.
    pub origin: Option<ConnectionId>,
    pub payload: serde_json::Value,
}

struct Subscriber {
    stage_id: StageId,
    tx: mpsc::Sender<StageEvent>,
}

/// Fan-out of stage events to the connections in a room.
#[derive(Default)]
pub struct EventBroadcaster {
    connections: DashMap<ConnectionId, Subscriber>,
    rooms: DashMap<StageId, Vec<ConnectionId>>,
}

impl EventBroadcaster {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection's send queue for a room. Join order is
    /// delivery order.
    pub fn subscribe(
        &self,
        stage_id: StageId,
        connection_id: ConnectionId,
        tx: mpsc::Sender<StageEvent>,
    ) {
        self.connections.insert(
            connection_id.clone(),
            Subscriber {
                stage_id: stage_id.clone(),
                tx,
            },
        );
        self.rooms
            .entry(stage_id)
            .or_default()
            .push(connection_id);
    }

    /// Drop a connection's subscription. Safe to call repeatedly or for a
    /// connection that never subscribed.
    pub fn unsubscribe(&self, connection_id: &ConnectionId) {
        let Some((_, subscriber)) = self.connections.remove(connection_id) else {
            return;
        };
        if let Some(mut room) = self.rooms.get_mut(&subscriber.stage_id) {
            room.retain(|id| id != connection_id);
        }
    }

    /// Fan an event out to every connection in its room, except the origin.
    /// Fire-and-forget: delivery never blocks the caller.
    pub fn publish(&self, event: &StageEvent) {
        let recipients = self
            .rooms
            .get(&event.stage_id)
            .map(|room| room.value().clone())
            .unwrap_or_default();

        for connection_id in &recipients {
            if event.origin.as_ref() == Some(connection_id) {
                continue;
            }
            self.deliver(connection_id, event);
        }
    }

    /// Deliver an event to a single connection in the same room.
    /// `Error::UnknownPeer` when the target is absent or in another room.
    pub fn send_to(&self, target: &ConnectionId, event: &StageEvent) -> Result<()> {
        let known = self
            .connections
            .get(target)
            .is_some_and(|subscriber| subscriber.stage_id == event.stage_id);
        if !known {
            return Err(Error::UnknownPeer(target.clone()));
        }
        self.deliver(target, event);
        Ok(())
    }

    fn deliver(&self, connection_id: &ConnectionId, event: &StageEvent) {
        let Some(subscriber) = self.connections.get(connection_id) else {
            return;
        };
        match subscriber.tx.try_send(event.clone()) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(
                    connection_id = %connection_id,
                    stage_id = %event.stage_id,
                    event = event.action.event_name(),
                    "send queue full, dropping event for slow client"
                );
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(
                    connection_id = %connection_id,
                    "send queue closed, connection is going away"
                );
            }
        }
    }

    #[must_use]
    pub fn room_size(&self, stage_id: &StageId) -> usize {
        self.rooms.get(stage_id).map_or(0, |room| room.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(stage: &str, origin: Option<&str>) -> StageEvent {
        StageEvent {
            action: StageAction::ParticipantAdded,
            stage_id: StageId::from(stage),
            origin: origin.map(ConnectionId::from),
            payload: json!({"userId": "u1"}),
        }
    }

    #[tokio::test]
    async fn test_publish_excludes_origin() {
        let broadcaster = EventBroadcaster::new();
        let (tx_a, mut rx_a) = mpsc::channel(8);
        let (tx_b, mut rx_b) = mpsc::channel(8);
        broadcaster.subscribe(StageId::from("s1"), ConnectionId::from("a"), tx_a);
        broadcaster.subscribe(StageId::from("s1"), ConnectionId::from("b"), tx_b);

        broadcaster.publish(&event("s1", Some("a")));

        assert!(rx_a.try_recv().is_err());
        let delivered = rx_b.try_recv().unwrap();
        assert_eq!(delivered.action, StageAction::ParticipantAdded);
    }

    #[tokio::test]
    async fn test_publish_is_room_scoped() {
        let broadcaster = EventBroadcaster::new();
        let (tx, mut rx) = mpsc::channel(8);
        broadcaster.subscribe(StageId::from("other"), ConnectionId::from("a"), tx);

        broadcaster.publish(&event("s1", None));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery_and_is_idempotent() {
        let broadcaster = EventBroadcaster::new();
        let (tx, mut rx) = mpsc::channel(8);
        broadcaster.subscribe(StageId::from("s1"), ConnectionId::from("a"), tx);

        broadcaster.unsubscribe(&ConnectionId::from("a"));
        broadcaster.unsubscribe(&ConnectionId::from("a"));

        broadcaster.publish(&event("s1", None));
        assert!(rx.try_recv().is_err());
        assert_eq!(broadcaster.room_size(&StageId::from("s1")), 0);
    }

    #[tokio::test]
    async fn test_send_to_unknown_peer_fails() {
        let broadcaster = EventBroadcaster::new();
        let err = broadcaster
            .send_to(&ConnectionId::from("ghost"), &event("s1", None))
            .unwrap_err();
        assert!(matches!(err, Error::UnknownPeer(_)));
    }

    #[tokio::test]
    async fn test_send_to_peer_in_other_room_fails() {
        let broadcaster = EventBroadcaster::new();
        let (tx, _rx) = mpsc::channel(8);
        broadcaster.subscribe(StageId::from("other"), ConnectionId::from("a"), tx);

        let err = broadcaster
            .send_to(&ConnectionId::from("a"), &event("s1", None))
            .unwrap_err();
        assert!(matches!(err, Error::UnknownPeer(_)));
    }

    #[tokio::test]
    async fn test_full_queue_drops_instead_of_blocking() {
        let broadcaster = EventBroadcaster::new();
        let (tx, mut rx) = mpsc::channel(1);
        broadcaster.subscribe(StageId::from("s1"), ConnectionId::from("a"), tx);

        broadcaster.publish(&event("s1", None));
        broadcaster.publish(&event("s1", None));

        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }
}
