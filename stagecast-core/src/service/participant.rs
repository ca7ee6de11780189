//! Participant bookkeeping
//!
//! One `ParticipantSession` per live connection in a stage: the verified
//! identity, the participant's SFU resource handles, and the producer list
//! that is the only producer data peers ever see.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::RwLock;
use serde_json::json;
use tracing::{info, warn};

use crate::models::{
    ConnectionId, ConsumerId, Identity, ParticipantAnnouncement, ProducerId, ProducerState,
    StageId, TransportId,
};
use crate::service::broadcast::{EventBroadcaster, StageAction, StageEvent};
use crate::sfu::{
    with_engine_timeout, ConsumerHandle, ConsumerParams, MediaParams, ProducerHandle,
    RouterHandle, TransportConnectParams, TransportDirection, TransportHandle,
};
use crate::{Error, Result};

/// Ownership container for one participant's SFU handles.
///
/// Every handle in here was created on this participant's router; handle ids
/// from other participants never resolve. Released as a unit when the
/// participant goes away.
#[derive(Default)]
pub struct ResourceSet {
    transports: DashMap<TransportId, Arc<dyn TransportHandle>>,
    producers: DashMap<ProducerId, Arc<dyn ProducerHandle>>,
    consumers: DashMap<ConsumerId, Arc<dyn ConsumerHandle>>,
}

impl ResourceSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn insert_transport(&self, transport: Arc<dyn TransportHandle>) {
        self.transports.insert(transport.id().clone(), transport);
    }

    fn transport(&self, id: &TransportId) -> Option<Arc<dyn TransportHandle>> {
        self.transports.get(id).map(|entry| Arc::clone(entry.value()))
    }

    fn insert_producer(&self, producer: Arc<dyn ProducerHandle>) {
        self.producers.insert(producer.id().clone(), producer);
    }

    fn remove_producer(&self, id: &ProducerId) -> Option<Arc<dyn ProducerHandle>> {
        self.producers.remove(id).map(|(_, producer)| producer)
    }

    fn insert_consumer(&self, consumer: Arc<dyn ConsumerHandle>) {
        self.consumers.insert(consumer.id().clone(), consumer);
    }

    fn consumer(&self, id: &ConsumerId) -> Option<Arc<dyn ConsumerHandle>> {
        self.consumers.get(id).map(|entry| Arc::clone(entry.value()))
    }

    #[must_use]
    pub fn transport_count(&self) -> usize {
        self.transports.len()
    }

    #[must_use]
    pub fn producer_count(&self) -> usize {
        self.producers.len()
    }

    #[must_use]
    pub fn consumer_count(&self) -> usize {
        self.consumers.len()
    }

    /// Close every handle, consumers before producers before transports.
    /// Best-effort: failures are logged and never abort the release.
    pub async fn release_all(&self, connection_id: &ConnectionId) {
        let consumers: Vec<_> = self
            .consumers
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        self.consumers.clear();
        for consumer in consumers {
            if let Err(e) = consumer.close().await {
                warn!(connection_id = %connection_id, consumer_id = %consumer.id(), error = %e, "failed to close consumer");
            }
        }

        let producers: Vec<_> = self
            .producers
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        self.producers.clear();
        for producer in producers {
            if let Err(e) = producer.close().await {
                warn!(connection_id = %connection_id, producer_id = %producer.id(), error = %e, "failed to close producer");
            }
        }

        let transports: Vec<_> = self
            .transports
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        self.transports.clear();
        for transport in transports {
            if let Err(e) = transport.close().await {
                warn!(connection_id = %connection_id, transport_id = %transport.id(), error = %e, "failed to close transport");
            }
        }
    }
}

/// One authenticated user's live presence in a stage.
pub struct ParticipantSession {
    identity: Identity,
    connection_id: ConnectionId,
    stage_id: StageId,
    router: Arc<dyn RouterHandle>,
    resources: ResourceSet,
    producer_order: RwLock<Vec<ProducerId>>,
    broadcaster: Arc<EventBroadcaster>,
    sfu_timeout: Duration,
}

impl ParticipantSession {
    #[must_use]
    pub fn new(
        identity: Identity,
        connection_id: ConnectionId,
        stage_id: StageId,
        router: Arc<dyn RouterHandle>,
        broadcaster: Arc<EventBroadcaster>,
        sfu_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            identity,
            connection_id,
            stage_id,
            router,
            resources: ResourceSet::new(),
            producer_order: RwLock::new(Vec::new()),
            broadcaster,
            sfu_timeout,
        })
    }

    #[must_use]
    pub const fn identity(&self) -> &Identity {
        &self.identity
    }

    #[must_use]
    pub const fn connection_id(&self) -> &ConnectionId {
        &self.connection_id
    }

    #[must_use]
    pub const fn stage_id(&self) -> &StageId {
        &self.stage_id
    }

    #[must_use]
    pub const fn resources(&self) -> &ResourceSet {
        &self.resources
    }

    #[must_use]
    pub fn announcement(&self) -> ParticipantAnnouncement {
        ParticipantAnnouncement {
            user_id: self.identity.user_id.clone(),
            display_name: self.identity.display_name.clone(),
            connection_id: self.connection_id.clone(),
        }
    }

    #[must_use]
    pub fn producer_state(&self) -> ProducerState {
        ProducerState {
            user_id: self.identity.user_id.clone(),
            producer_ids: self.producer_order.read().clone(),
        }
    }

    /// Router capability descriptor for this participant's stage.
    #[must_use]
    pub fn router_capabilities(&self) -> serde_json::Value {
        self.router.capabilities()
    }

    /// Create a transport on the stage router and take ownership of it.
    pub async fn acquire_transport(
        &self,
        direction: TransportDirection,
    ) -> Result<TransportConnectParams> {
        let transport = with_engine_timeout(
            self.sfu_timeout,
            self.router.create_transport(direction),
        )
        .await
        .map_err(|e| Error::TransportCreationFailed(e.to_string()))?;

        let params = transport.connect_params();
        info!(
            connection_id = %self.connection_id,
            transport_id = %params.id,
            direction = ?direction,
            "transport created"
        );
        self.resources.insert_transport(transport);
        Ok(params)
    }

    /// Finish DTLS negotiation on one of this participant's transports.
    pub async fn connect_transport(
        &self,
        transport_id: &TransportId,
        dtls_parameters: serde_json::Value,
    ) -> Result<()> {
        let transport = self
            .resources
            .transport(transport_id)
            .ok_or_else(|| Error::UnknownTransport(transport_id.clone()))?;
        with_engine_timeout(self.sfu_timeout, transport.connect(dtls_parameters)).await
    }

    /// Start sending a media stream into the stage.
    ///
    /// Announces the new producer twice: the full producer state for this
    /// participant and a discrete `producer/added` event. A watcher on the
    /// transport-close notification retracts the producer if the transport
    /// dies underneath it.
    pub async fn produce(
        self: &Arc<Self>,
        transport_id: &TransportId,
        params: MediaParams,
    ) -> Result<ProducerId> {
        let transport = self
            .resources
            .transport(transport_id)
            .ok_or_else(|| Error::UnknownTransport(transport_id.clone()))?;

        let producer = with_engine_timeout(self.sfu_timeout, transport.produce(params)).await?;
        let producer_id = producer.id().clone();

        self.resources.insert_producer(producer);
        self.producer_order.write().push(producer_id.clone());
        self.watch_transport_close(&transport, producer_id.clone());

        info!(
            connection_id = %self.connection_id,
            stage_id = %self.stage_id,
            producer_id = %producer_id,
            "producer added"
        );

        self.broadcaster.publish(&StageEvent {
            action: StageAction::ProducersState,
            stage_id: self.stage_id.clone(),
            origin: Some(self.connection_id.clone()),
            payload: json!(self.producer_state()),
        });
        self.broadcaster.publish(&StageEvent {
            action: StageAction::ProducerAdded,
            stage_id: self.stage_id.clone(),
            origin: Some(self.connection_id.clone()),
            payload: json!({
                "userId": self.identity.user_id,
                "producerId": producer_id,
            }),
        });

        Ok(producer_id)
    }

    /// Start receiving another participant's producer. The consumer comes
    /// back paused; the client resumes it with `finish_consume` once its
    /// own pipeline is ready.
    pub async fn consume(
        &self,
        transport_id: &TransportId,
        producer_id: &ProducerId,
        rtp_capabilities: serde_json::Value,
    ) -> Result<ConsumerParams> {
        let transport = self
            .resources
            .transport(transport_id)
            .ok_or_else(|| Error::UnknownTransport(transport_id.clone()))?;

        let consumer = with_engine_timeout(
            self.sfu_timeout,
            transport.consume(producer_id, rtp_capabilities),
        )
        .await?;

        let params = consumer.params();
        self.resources.insert_consumer(consumer);
        Ok(params)
    }

    /// Resume a paused consumer. Idempotent while the consumer is alive;
    /// `Error::UnknownConsumer` once the handle has been released.
    pub async fn finish_consume(&self, consumer_id: &ConsumerId) -> Result<()> {
        let consumer = self
            .resources
            .consumer(consumer_id)
            .ok_or_else(|| Error::UnknownConsumer(consumer_id.clone()))?;
        with_engine_timeout(self.sfu_timeout, consumer.resume()).await
    }

    /// Release every SFU handle this participant owns.
    pub async fn release(&self) {
        self.producer_order.write().clear();
        self.resources.release_all(&self.connection_id).await;
    }

    fn watch_transport_close(
        self: &Arc<Self>,
        transport: &Arc<dyn TransportHandle>,
        producer_id: ProducerId,
    ) {
        let mut closed = transport.subscribe_close();
        let session = Arc::downgrade(self);
        tokio::spawn(async move {
            // Any outcome means the transport is gone: a close notification,
            // a lagged receiver, or the handle being dropped entirely.
            let _ = closed.recv().await;
            if let Some(session) = session.upgrade() {
                session.handle_producer_closed(&producer_id);
            }
        });
    }

    fn handle_producer_closed(&self, producer_id: &ProducerId) {
        if self.resources.remove_producer(producer_id).is_none() {
            return;
        }
        self.producer_order.write().retain(|id| id != producer_id);

        info!(
            connection_id = %self.connection_id,
            stage_id = %self.stage_id,
            producer_id = %producer_id,
            "producer's transport closed, retracting producer"
        );
        self.broadcaster.publish(&StageEvent {
            action: StageAction::ProducerRemoved,
            stage_id: self.stage_id.clone(),
            origin: None,
            payload: json!({
                "userId": self.identity.user_id,
                "producerId": producer_id,
            }),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::UserId;
    use crate::sfu::{InProcessSfuEngine, MediaKind, SfuEngine};
    use async_trait::async_trait;
    use tokio::sync::mpsc;

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn identity(user: &str) -> Identity {
        Identity {
            user_id: UserId::from(user),
            display_name: format!("{user}-name"),
        }
    }

    fn audio_params() -> MediaParams {
        MediaParams {
            kind: MediaKind::Audio,
            rtp_parameters: serde_json::json!({"codecs": []}),
        }
    }

    struct Fixture {
        engine: Arc<InProcessSfuEngine>,
        broadcaster: Arc<EventBroadcaster>,
        stage_id: StageId,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                engine: Arc::new(InProcessSfuEngine::new()),
                broadcaster: Arc::new(EventBroadcaster::new()),
                stage_id: StageId::from("stage-test01"),
            }
        }

        async fn session(&self, user: &str, conn: &str) -> Arc<ParticipantSession> {
            let router = self
                .engine
                .get_or_create_router(&self.stage_id)
                .await
                .unwrap();
            ParticipantSession::new(
                identity(user),
                ConnectionId::from(conn),
                self.stage_id.clone(),
                router,
                Arc::clone(&self.broadcaster),
                TIMEOUT,
            )
        }

        /// Subscribe a passive observer connection to the stage.
        fn observer(&self, conn: &str) -> mpsc::Receiver<StageEvent> {
            let (tx, rx) = mpsc::channel(32);
            self.broadcaster
                .subscribe(self.stage_id.clone(), ConnectionId::from(conn), tx);
            rx
        }
    }

    async fn connected_send_transport(session: &Arc<ParticipantSession>) -> TransportId {
        let params = session
            .acquire_transport(TransportDirection::Send)
            .await
            .unwrap();
        session
            .connect_transport(&params.id, serde_json::json!({}))
            .await
            .unwrap();
        params.id
    }

    #[tokio::test]
    async fn test_produce_announces_state_and_discrete_event() {
        let fixture = Fixture::new();
        let session = fixture.session("alice", "conn-alice").await;
        let mut observer = fixture.observer("conn-bob");

        let transport_id = connected_send_transport(&session).await;
        let producer_id = session.produce(&transport_id, audio_params()).await.unwrap();

        let state = observer.recv().await.unwrap();
        assert_eq!(state.action, StageAction::ProducersState);
        assert_eq!(
            state.payload["producerIds"][0],
            serde_json::json!(producer_id)
        );

        let added = observer.recv().await.unwrap();
        assert_eq!(added.action, StageAction::ProducerAdded);
        assert_eq!(added.payload["userId"], serde_json::json!("alice"));

        assert_eq!(session.producer_state().producer_ids.len(), 1);
    }

    #[tokio::test]
    async fn test_foreign_transport_id_is_rejected() {
        let fixture = Fixture::new();
        let alice = fixture.session("alice", "conn-alice").await;
        let mallory = fixture.session("mallory", "conn-mallory").await;

        let alice_transport = connected_send_transport(&alice).await;

        let err = mallory
            .produce(&alice_transport, audio_params())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnknownTransport(_)));

        let err = mallory
            .connect_transport(&alice_transport, serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnknownTransport(_)));
    }

    #[tokio::test]
    async fn test_consume_and_finish_consume_policy() {
        let fixture = Fixture::new();
        let alice = fixture.session("alice", "conn-alice").await;
        let bob = fixture.session("bob", "conn-bob").await;

        let alice_send = connected_send_transport(&alice).await;
        let producer_id = alice.produce(&alice_send, audio_params()).await.unwrap();

        let recv_params = bob
            .acquire_transport(TransportDirection::Receive)
            .await
            .unwrap();
        bob.connect_transport(&recv_params.id, serde_json::json!({}))
            .await
            .unwrap();

        let consumer = bob
            .consume(&recv_params.id, &producer_id, serde_json::json!({}))
            .await
            .unwrap();
        assert_eq!(consumer.producer_id, producer_id);

        // Resume is idempotent while the handle is alive.
        bob.finish_consume(&consumer.id).await.unwrap();
        bob.finish_consume(&consumer.id).await.unwrap();

        // Once released, the id no longer resolves.
        bob.release().await;
        let err = bob.finish_consume(&consumer.id).await.unwrap_err();
        assert!(matches!(err, Error::UnknownConsumer(_)));
    }

    #[tokio::test]
    async fn test_unknown_consumer_is_rejected() {
        let fixture = Fixture::new();
        let session = fixture.session("alice", "conn-alice").await;

        let err = session
            .finish_consume(&ConsumerId::from("bogus"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnknownConsumer(_)));
    }

    #[tokio::test]
    async fn test_transport_close_retracts_producer() {
        let fixture = Fixture::new();
        let session = fixture.session("alice", "conn-alice").await;
        let mut observer = fixture.observer("conn-bob");

        let transport_id = connected_send_transport(&session).await;
        let producer_id = session.produce(&transport_id, audio_params()).await.unwrap();

        // Drain the two produce announcements.
        observer.recv().await.unwrap();
        observer.recv().await.unwrap();

        assert!(fixture.engine.close_transport(&transport_id).await);

        let removed = observer.recv().await.unwrap();
        assert_eq!(removed.action, StageAction::ProducerRemoved);
        assert_eq!(
            removed.payload["producerId"],
            serde_json::json!(producer_id)
        );
        assert!(session.producer_state().producer_ids.is_empty());
    }

    #[tokio::test]
    async fn test_release_clears_resources_and_is_repeatable() {
        let fixture = Fixture::new();
        let session = fixture.session("alice", "conn-alice").await;

        let transport_id = connected_send_transport(&session).await;
        session.produce(&transport_id, audio_params()).await.unwrap();

        session.release().await;
        assert_eq!(session.resources().transport_count(), 0);
        assert_eq!(session.resources().producer_count(), 0);
        assert!(session.producer_state().producer_ids.is_empty());

        // Releasing again is a no-op.
        session.release().await;
    }

    struct FailingRouter;

    #[async_trait]
    impl RouterHandle for FailingRouter {
        fn capabilities(&self) -> serde_json::Value {
            serde_json::json!({})
        }

        async fn create_transport(
            &self,
            _direction: TransportDirection,
        ) -> Result<Arc<dyn TransportHandle>> {
            Err(Error::Sfu("worker died".to_string()))
        }
    }

    #[tokio::test]
    async fn test_engine_failure_surfaces_as_transport_creation_failed() {
        let broadcaster = Arc::new(EventBroadcaster::new());
        let session = ParticipantSession::new(
            identity("alice"),
            ConnectionId::from("conn-alice"),
            StageId::from("stage-test01"),
            Arc::new(FailingRouter),
            broadcaster,
            TIMEOUT,
        );

        let err = session
            .acquire_transport(TransportDirection::Send)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TransportCreationFailed(_)));
    }
}
