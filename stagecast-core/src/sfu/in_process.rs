//! In-process SFU engine
//!
//! A bookkeeping implementation of the engine traits: it mints handle ids,
//! tracks connect/pause/close state and fires transport-close notifications,
//! but moves no media. It stands in for the external engine in development
//! and carries the test suite.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::broadcast;
use tracing::debug;

use crate::models::{generate_id, ConsumerId, ProducerId, StageId, TransportId};
use crate::sfu::{
    ConsumerHandle, ConsumerParams, MediaParams, ProducerHandle, RouterHandle, SfuEngine,
    TransportConnectParams, TransportDirection, TransportHandle,
};
use crate::{Error, Result};

type TransportIndex = Arc<DashMap<TransportId, Weak<InProcessTransport>>>;
type ProducerIndex = Arc<DashMap<ProducerId, Arc<InProcessProducer>>>;

/// In-process engine: one router per stage, all handles tracked in memory.
#[derive(Default)]
pub struct InProcessSfuEngine {
    routers: DashMap<StageId, Arc<InProcessRouter>>,
    transports: TransportIndex,
}

impl InProcessSfuEngine {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn router_count(&self) -> usize {
        self.routers.len()
    }

    /// Force-close a transport, as if its underlying connection died.
    /// Fault-injection lever for tests and debugging.
    pub async fn close_transport(&self, transport_id: &TransportId) -> bool {
        let transport = self
            .transports
            .get(transport_id)
            .and_then(|weak| weak.upgrade());
        match transport {
            Some(transport) => transport.close().await.is_ok(),
            None => false,
        }
    }
}

#[async_trait]
impl SfuEngine for InProcessSfuEngine {
    async fn get_or_create_router(&self, stage_id: &StageId) -> Result<Arc<dyn RouterHandle>> {
        let router = self
            .routers
            .entry(stage_id.clone())
            .or_insert_with(|| {
                debug!(stage_id = %stage_id, "creating in-process router");
                Arc::new(InProcessRouter::new(
                    stage_id.clone(),
                    Arc::clone(&self.transports),
                ))
            })
            .clone();

        Ok(router)
    }
}

struct InProcessRouter {
    stage_id: StageId,
    capabilities: serde_json::Value,
    producers: ProducerIndex,
    transport_index: TransportIndex,
}

impl InProcessRouter {
    fn new(stage_id: StageId, transport_index: TransportIndex) -> Self {
        Self {
            stage_id,
            capabilities: json!({
                "codecs": [
                    {
                        "kind": "audio",
                        "mimeType": "audio/opus",
                        "clockRate": 48_000,
                        "channels": 2,
                    },
                    {
                        "kind": "video",
                        "mimeType": "video/VP8",
                        "clockRate": 90_000,
                    },
                ],
                "headerExtensions": [],
            }),
            producers: Arc::new(DashMap::new()),
            transport_index,
        }
    }
}

#[async_trait]
impl RouterHandle for InProcessRouter {
    fn capabilities(&self) -> serde_json::Value {
        self.capabilities.clone()
    }

    async fn create_transport(
        &self,
        direction: TransportDirection,
    ) -> Result<Arc<dyn TransportHandle>> {
        let transport = Arc::new(InProcessTransport::new(
            direction,
            Arc::clone(&self.producers),
        ));
        self.transport_index
            .insert(transport.id.clone(), Arc::downgrade(&transport));

        debug!(
            stage_id = %self.stage_id,
            transport_id = %transport.id,
            direction = ?direction,
            "created in-process transport"
        );
        Ok(transport)
    }
}

#[derive(Default)]
struct TransportState {
    connected: bool,
    closed: bool,
}

struct InProcessTransport {
    id: TransportId,
    direction: TransportDirection,
    state: Mutex<TransportState>,
    owned_producers: Mutex<Vec<Arc<InProcessProducer>>>,
    router_producers: ProducerIndex,
    close_tx: broadcast::Sender<()>,
}

impl InProcessTransport {
    fn new(direction: TransportDirection, router_producers: ProducerIndex) -> Self {
        let (close_tx, _) = broadcast::channel(4);
        Self {
            id: TransportId::new(),
            direction,
            state: Mutex::new(TransportState::default()),
            owned_producers: Mutex::new(Vec::new()),
            router_producers,
            close_tx,
        }
    }
}

#[async_trait]
impl TransportHandle for InProcessTransport {
    fn id(&self) -> &TransportId {
        &self.id
    }

    fn direction(&self) -> TransportDirection {
        self.direction
    }

    fn connect_params(&self) -> TransportConnectParams {
        TransportConnectParams {
            id: self.id.clone(),
            ice_parameters: json!({
                "usernameFragment": generate_id(),
                "password": generate_id(),
                "iceLite": true,
            }),
            ice_candidates: json!([]),
            dtls_parameters: json!({
                "role": "auto",
                "fingerprints": [],
            }),
        }
    }

    fn subscribe_close(&self) -> broadcast::Receiver<()> {
        self.close_tx.subscribe()
    }

    async fn connect(&self, _dtls_parameters: serde_json::Value) -> Result<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(Error::Sfu("transport is closed".to_string()));
        }
        state.connected = true;
        Ok(())
    }

    async fn produce(&self, params: MediaParams) -> Result<Arc<dyn ProducerHandle>> {
        {
            let state = self.state.lock();
            if state.closed {
                return Err(Error::Sfu("transport is closed".to_string()));
            }
            if !state.connected {
                return Err(Error::Sfu("transport is not connected".to_string()));
            }
        }

        let producer = Arc::new(InProcessProducer {
            id: ProducerId::new(),
            params,
            closed: AtomicBool::new(false),
        });
        self.router_producers
            .insert(producer.id.clone(), Arc::clone(&producer));
        self.owned_producers.lock().push(Arc::clone(&producer));

        Ok(producer)
    }

    async fn consume(
        &self,
        producer_id: &ProducerId,
        _rtp_capabilities: serde_json::Value,
    ) -> Result<Arc<dyn ConsumerHandle>> {
        {
            let state = self.state.lock();
            if state.closed {
                return Err(Error::Sfu("transport is closed".to_string()));
            }
            if !state.connected {
                return Err(Error::Sfu("transport is not connected".to_string()));
            }
        }

        let producer = self
            .router_producers
            .get(producer_id)
            .map(|entry| Arc::clone(entry.value()))
            .filter(|producer| !producer.closed.load(Ordering::Acquire))
            .ok_or_else(|| Error::Sfu(format!("unknown producer {producer_id}")))?;

        Ok(Arc::new(InProcessConsumer {
            id: ConsumerId::new(),
            producer_id: producer.id.clone(),
            params: producer.params.clone(),
            paused: AtomicBool::new(true),
            closed: AtomicBool::new(false),
        }))
    }

    async fn close(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            if state.closed {
                return Ok(());
            }
            state.closed = true;
        }

        for producer in self.owned_producers.lock().drain(..) {
            producer.closed.store(true, Ordering::Release);
            self.router_producers.remove(&producer.id);
        }

        // No receivers is fine; nobody produced on this transport yet.
        let _ = self.close_tx.send(());
        Ok(())
    }
}

struct InProcessProducer {
    id: ProducerId,
    params: MediaParams,
    closed: AtomicBool,
}

#[async_trait]
impl ProducerHandle for InProcessProducer {
    fn id(&self) -> &ProducerId {
        &self.id
    }

    fn kind(&self) -> crate::sfu::MediaKind {
        self.params.kind
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

struct InProcessConsumer {
    id: ConsumerId,
    producer_id: ProducerId,
    params: MediaParams,
    paused: AtomicBool,
    closed: AtomicBool,
}

#[async_trait]
impl ConsumerHandle for InProcessConsumer {
    fn id(&self) -> &ConsumerId {
        &self.id
    }

    fn params(&self) -> ConsumerParams {
        ConsumerParams {
            id: self.id.clone(),
            producer_id: self.producer_id.clone(),
            kind: self.params.kind,
            rtp_parameters: self.params.rtp_parameters.clone(),
            producer_paused: false,
            consumer_type: "simple".to_string(),
        }
    }

    async fn resume(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Sfu("consumer is closed".to_string()));
        }
        self.paused.store(false, Ordering::Release);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sfu::MediaKind;

    fn audio_params() -> MediaParams {
        MediaParams {
            kind: MediaKind::Audio,
            rtp_parameters: json!({"codecs": [{"mimeType": "audio/opus"}]}),
        }
    }

    async fn connected_transport(
        router: &Arc<dyn RouterHandle>,
        direction: TransportDirection,
    ) -> Arc<dyn TransportHandle> {
        let transport = router.create_transport(direction).await.unwrap();
        transport.connect(json!({})).await.unwrap();
        transport
    }

    #[tokio::test]
    async fn test_router_is_created_once_per_stage() {
        let engine = InProcessSfuEngine::new();
        let stage_id = StageId::from("stage-a");

        engine.get_or_create_router(&stage_id).await.unwrap();
        engine.get_or_create_router(&stage_id).await.unwrap();

        assert_eq!(engine.router_count(), 1);
    }

    #[tokio::test]
    async fn test_produce_requires_connected_transport() {
        let engine = InProcessSfuEngine::new();
        let router = engine
            .get_or_create_router(&StageId::from("stage-a"))
            .await
            .unwrap();
        let transport = router
            .create_transport(TransportDirection::Send)
            .await
            .unwrap();

        let err = transport.produce(audio_params()).await.unwrap_err();
        assert!(matches!(err, Error::Sfu(_)));
    }

    #[tokio::test]
    async fn test_produce_then_consume_roundtrip() {
        let engine = InProcessSfuEngine::new();
        let router = engine
            .get_or_create_router(&StageId::from("stage-a"))
            .await
            .unwrap();
        let send = connected_transport(&router, TransportDirection::Send).await;
        let recv = connected_transport(&router, TransportDirection::Receive).await;

        let producer = send.produce(audio_params()).await.unwrap();
        let consumer = recv.consume(producer.id(), json!({})).await.unwrap();

        let params = consumer.params();
        assert_eq!(&params.producer_id, producer.id());
        assert_eq!(params.kind, MediaKind::Audio);
        assert_eq!(params.consumer_type, "simple");

        consumer.resume().await.unwrap();
        // Resuming twice is a no-op.
        consumer.resume().await.unwrap();
    }

    #[tokio::test]
    async fn test_consume_unknown_producer_fails() {
        let engine = InProcessSfuEngine::new();
        let router = engine
            .get_or_create_router(&StageId::from("stage-a"))
            .await
            .unwrap();
        let recv = connected_transport(&router, TransportDirection::Receive).await;

        let err = recv
            .consume(&ProducerId::from("nope"), json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Sfu(_)));
    }

    #[tokio::test]
    async fn test_transport_close_notifies_and_drops_producers() {
        let engine = InProcessSfuEngine::new();
        let router = engine
            .get_or_create_router(&StageId::from("stage-a"))
            .await
            .unwrap();
        let send = connected_transport(&router, TransportDirection::Send).await;
        let recv = connected_transport(&router, TransportDirection::Receive).await;

        let producer = send.produce(audio_params()).await.unwrap();
        let mut closed = send.subscribe_close();

        assert!(engine.close_transport(send.id()).await);
        closed.recv().await.unwrap();

        // The producer is gone for new consumers.
        let err = recv.consume(producer.id(), json!({})).await.unwrap_err();
        assert!(matches!(err, Error::Sfu(_)));

        // Closing again is idempotent, but the engine no longer knows a
        // transport whose handle was dropped.
        assert!(engine.close_transport(send.id()).await);
    }
}
