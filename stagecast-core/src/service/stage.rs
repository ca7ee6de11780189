//! Stage membership
//!
//! The authoritative in-memory view of one room: who is present, what they
//! are producing, and the routing context they all share. Membership
//! mutations are serialized per stage; SFU work never happens under that
//! lock.

use std::sync::Arc;

use serde_json::json;
use tokio::sync::{OnceCell, RwLock};
use tracing::{info, warn};

use crate::models::{ConnectionId, ParticipantAnnouncement, ProducerState, StageId};
use crate::service::broadcast::{EventBroadcaster, StageAction, StageEvent};
use crate::service::participant::ParticipantSession;
use crate::sfu::{RouterHandle, SfuEngine};
use crate::{Error, Result};

/// One stage: ordered participant roster plus a lazily-created router.
pub struct Stage {
    id: StageId,
    participants: RwLock<Vec<Arc<ParticipantSession>>>,
    router: OnceCell<Arc<dyn RouterHandle>>,
    engine: Arc<dyn SfuEngine>,
    broadcaster: Arc<EventBroadcaster>,
}

impl std::fmt::Debug for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stage").field("id", &self.id).finish_non_exhaustive()
    }
}

impl Stage {
    #[must_use]
    pub fn new(
        id: StageId,
        engine: Arc<dyn SfuEngine>,
        broadcaster: Arc<EventBroadcaster>,
    ) -> Self {
        Self {
            id,
            participants: RwLock::new(Vec::new()),
            router: OnceCell::new(),
            engine,
            broadcaster,
        }
    }

    #[must_use]
    pub const fn id(&self) -> &StageId {
        &self.id
    }

    /// The stage's routing context, created through the engine on first
    /// call. Concurrent first callers observe exactly one creation.
    pub async fn router(&self) -> Result<Arc<dyn RouterHandle>> {
        self.router
            .get_or_try_init(|| self.engine.get_or_create_router(&self.id))
            .await
            .cloned()
    }

    /// Add a participant to the roster and announce it to the room.
    ///
    /// `Error::DuplicateParticipant` when the connection is already present
    /// (guards against a double join on one connection).
    pub async fn add_participant(&self, session: Arc<ParticipantSession>) -> Result<()> {
        let announcement = session.announcement();
        let participant_count = {
            let mut participants = self.participants.write().await;
            if participants
                .iter()
                .any(|existing| existing.connection_id() == session.connection_id())
            {
                warn!(
                    stage_id = %self.id,
                    connection_id = %session.connection_id(),
                    "rejecting duplicate join"
                );
                return Err(Error::DuplicateParticipant {
                    stage_id: self.id.clone(),
                    connection_id: session.connection_id().clone(),
                });
            }
            participants.push(Arc::clone(&session));
            participants.len()
        };

        info!(
            stage_id = %self.id,
            connection_id = %announcement.connection_id,
            user_id = %announcement.user_id,
            participant_count,
            "participant joined"
        );
        self.broadcaster.publish(&StageEvent {
            action: StageAction::ParticipantAdded,
            stage_id: self.id.clone(),
            origin: Some(announcement.connection_id.clone()),
            payload: json!(announcement),
        });
        Ok(())
    }

    /// Remove a participant and release its resources. A connection id that
    /// is not on the roster is a no-op, not an error; disconnect and
    /// explicit leave are expected to race.
    pub async fn remove_participant(&self, connection_id: &ConnectionId) -> bool {
        let removed = {
            let mut participants = self.participants.write().await;
            participants
                .iter()
                .position(|session| session.connection_id() == connection_id)
                .map(|index| participants.remove(index))
        };

        let Some(session) = removed else {
            return false;
        };

        session.release().await;

        info!(
            stage_id = %self.id,
            connection_id = %connection_id,
            user_id = %session.identity().user_id,
            "participant left"
        );
        self.broadcaster.publish(&StageEvent {
            action: StageAction::ParticipantRemoved,
            stage_id: self.id.clone(),
            origin: Some(connection_id.clone()),
            payload: json!(session.announcement()),
        });
        true
    }

    /// Point-in-time roster snapshot, optionally excluding one connection.
    pub async fn list_participants(
        &self,
        exclude: Option<&ConnectionId>,
    ) -> Vec<ParticipantAnnouncement> {
        self.participants
            .read()
            .await
            .iter()
            .filter(|session| Some(session.connection_id()) != exclude)
            .map(|session| session.announcement())
            .collect()
    }

    /// Point-in-time producer roster, one entry per participant. A
    /// participant with nothing producing contributes an empty sequence.
    pub async fn list_producers(&self, exclude: Option<&ConnectionId>) -> Vec<ProducerState> {
        self.participants
            .read()
            .await
            .iter()
            .filter(|session| Some(session.connection_id()) != exclude)
            .map(|session| session.producer_state())
            .collect()
    }

    /// Look up a participant by connection id.
    pub async fn participant(
        &self,
        connection_id: &ConnectionId,
    ) -> Option<Arc<ParticipantSession>> {
        self.participants
            .read()
            .await
            .iter()
            .find(|session| session.connection_id() == connection_id)
            .map(Arc::clone)
    }

    pub async fn participant_count(&self) -> usize {
        self.participants.read().await.len()
    }
}
