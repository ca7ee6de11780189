//! Per-connection signaling gateway
//!
//! One `SignalingGateway` per inbound connection, driving the state machine
//! `Unauthenticated -> Joined -> Closed`. Create and join resolve identity
//! and stage access; everything after delegates to the participant's own
//! session, so stale or forged handle ids from other participants never
//! resolve.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{info, warn};

use stagecast_core::models::{ConnectionId, Identity, NewStageRecord, StageRecord};
use stagecast_core::service::auth::{secret_matches, IdentityVerifier};
use stagecast_core::service::broadcast::{EventBroadcaster, StageAction, StageEvent};
use stagecast_core::service::participant::ParticipantSession;
use stagecast_core::service::registry::StageRegistry;
use stagecast_core::service::stage::Stage;
use stagecast_core::service::store::StageStore;
use stagecast_core::sfu::{MediaParams, TransportDirection};
use stagecast_core::{Error, Result};

use crate::protocol::{
    ClientRequest, ConnectTransportResponse, PeerRelayRequest, SendTrackResponse,
    StageCreateRequest, StageJoinRequest, StageJoinResponse,
};

/// Shared services every gateway instance is wired to at bootstrap.
pub struct GatewayServices {
    pub registry: Arc<StageRegistry>,
    pub store: Arc<dyn StageStore>,
    pub verifier: Arc<dyn IdentityVerifier>,
    pub broadcaster: Arc<EventBroadcaster>,
    pub sfu_timeout: Duration,
    pub event_queue_capacity: usize,
}

enum ConnectionState {
    Unauthenticated,
    Joined {
        stage: Arc<Stage>,
        session: Arc<ParticipantSession>,
    },
    Closed,
}

/// Binds one inbound connection to the stage orchestrator.
pub struct SignalingGateway {
    services: Arc<GatewayServices>,
    connection_id: ConnectionId,
    event_tx: mpsc::Sender<StageEvent>,
    state: ConnectionState,
}

impl SignalingGateway {
    #[must_use]
    pub const fn new(
        services: Arc<GatewayServices>,
        connection_id: ConnectionId,
        event_tx: mpsc::Sender<StageEvent>,
    ) -> Self {
        Self {
            services,
            connection_id,
            event_tx,
            state: ConnectionState::Unauthenticated,
        }
    }

    #[must_use]
    pub const fn connection_id(&self) -> &ConnectionId {
        &self.connection_id
    }

    /// Dispatch one request. Errors map to per-request error payloads at
    /// the transport layer; they never tear the connection down.
    pub async fn handle(&mut self, request: ClientRequest) -> Result<Value> {
        match request {
            ClientRequest::StageCreate(req) => self.handle_create(req).await,
            ClientRequest::StageJoin(req) => self.handle_join(req).await,
            ClientRequest::ParticipantsState => {
                let (stage, _) = self.joined()?;
                let roster = stage.list_participants(Some(&self.connection_id)).await;
                Ok(json!(roster))
            }
            ClientRequest::ProducersState => {
                let (stage, _) = self.joined()?;
                let producers = stage.list_producers(None).await;
                Ok(json!(producers))
            }
            ClientRequest::GetCapabilities => {
                let (_, session) = self.joined()?;
                Ok(session.router_capabilities())
            }
            ClientRequest::CreateSendTransport => {
                let (_, session) = self.joined()?;
                let params = session.acquire_transport(TransportDirection::Send).await?;
                Ok(json!(params))
            }
            ClientRequest::CreateReceiveTransport(_req) => {
                let (_, session) = self.joined()?;
                let params = session
                    .acquire_transport(TransportDirection::Receive)
                    .await?;
                Ok(json!(params))
            }
            ClientRequest::ConnectTransport(req) => {
                let (_, session) = self.joined()?;
                session
                    .connect_transport(&req.transport_id, req.dtls_parameters)
                    .await?;
                Ok(json!(ConnectTransportResponse { connected: true }))
            }
            ClientRequest::SendTrack(req) => {
                let (_, session) = self.joined()?;
                let session = Arc::clone(session);
                let producer_id = session
                    .produce(
                        &req.transport_id,
                        MediaParams {
                            kind: req.kind,
                            rtp_parameters: req.rtp_parameters,
                        },
                    )
                    .await?;
                Ok(json!(SendTrackResponse { id: producer_id }))
            }
            ClientRequest::Consume(req) => {
                let (_, session) = self.joined()?;
                let params = session
                    .consume(&req.transport_id, &req.producer_id, req.capabilities)
                    .await?;
                Ok(json!(params))
            }
            ClientRequest::FinishConsume(req) => {
                let (_, session) = self.joined()?;
                session.finish_consume(&req.consumer_id).await?;
                Ok(json!({}))
            }
            ClientRequest::PeerOffer(req) => self.relay(StageAction::PeerOfferReceived, req),
            ClientRequest::PeerAnswer(req) => self.relay(StageAction::PeerAnswerReceived, req),
            ClientRequest::PeerCandidate(req) => {
                self.relay(StageAction::PeerCandidateReceived, req)
            }
        }
    }

    /// Tear down this connection's presence. Safe to call repeatedly;
    /// close events and explicit leave are expected to race.
    pub async fn on_close(&mut self) {
        let state = std::mem::replace(&mut self.state, ConnectionState::Closed);
        if let ConnectionState::Joined { stage, .. } = state {
            stage.remove_participant(&self.connection_id).await;
        }
        self.services.broadcaster.unsubscribe(&self.connection_id);
    }

    async fn handle_create(&mut self, req: StageCreateRequest) -> Result<Value> {
        self.ensure_not_joined()?;
        let identity = self.services.verifier.verify_token(&req.token).await?;

        info!(
            connection_id = %self.connection_id,
            user_id = %identity.user_id,
            kind = %req.kind,
            "create stage"
        );
        let record = self
            .services
            .store
            .create_stage_record(NewStageRecord {
                name: req.stage_name,
                kind: req.kind,
                access_secret: req.password,
                owner: identity.user_id.clone(),
            })
            .await?;

        self.join_stage(identity, record).await
    }

    async fn handle_join(&mut self, req: StageJoinRequest) -> Result<Value> {
        self.ensure_not_joined()?;
        let identity = self.services.verifier.verify_token(&req.token).await?;

        let record = self.services.store.get_stage_record(&req.stage_id).await?;
        if !secret_matches(&req.password, &record.access_secret) {
            warn!(
                connection_id = %self.connection_id,
                stage_id = %req.stage_id,
                user_id = %identity.user_id,
                "join rejected: wrong password"
            );
            return Err(Error::WrongSecret);
        }

        self.join_stage(identity, record).await
    }

    async fn join_stage(&mut self, identity: Identity, record: StageRecord) -> Result<Value> {
        let stage = self.services.registry.get_or_create(&record.id);
        let router = stage.router().await?;

        let session = ParticipantSession::new(
            identity,
            self.connection_id.clone(),
            record.id.clone(),
            router,
            Arc::clone(&self.services.broadcaster),
            self.services.sfu_timeout,
        );

        // Subscribe before joining so no event between the two is missed;
        // the join announcement itself excludes its origin.
        self.services.broadcaster.subscribe(
            record.id.clone(),
            self.connection_id.clone(),
            self.event_tx.clone(),
        );
        if let Err(e) = stage.add_participant(Arc::clone(&session)).await {
            self.services.broadcaster.unsubscribe(&self.connection_id);
            return Err(e);
        }

        // Direct-link peers also learn about the newcomer.
        self.services.broadcaster.publish(&StageEvent {
            action: StageAction::PeerAdded,
            stage_id: record.id.clone(),
            origin: Some(self.connection_id.clone()),
            payload: json!({
                "userId": session.identity().user_id,
                "connectionId": self.connection_id,
            }),
        });

        info!(
            connection_id = %self.connection_id,
            stage_id = %record.id,
            user_id = %session.identity().user_id,
            "joined stage"
        );

        let participants = stage.list_participants(None).await;
        let producers = stage.list_producers(None).await;
        let response = StageJoinResponse {
            stage: record,
            participants,
            producers,
        };

        self.state = ConnectionState::Joined { stage, session };
        Ok(json!(response))
    }

    fn relay(&self, action: StageAction, req: PeerRelayRequest) -> Result<Value> {
        let (stage, session) = self.joined()?;
        self.services.broadcaster.send_to(
            &req.target_connection_id,
            &StageEvent {
                action,
                stage_id: stage.id().clone(),
                origin: Some(self.connection_id.clone()),
                payload: json!({
                    "userId": session.identity().user_id,
                    "connectionId": self.connection_id,
                    "payload": req.payload,
                }),
            },
        )?;
        Ok(json!({}))
    }

    fn joined(&self) -> Result<(&Arc<Stage>, &Arc<ParticipantSession>)> {
        match &self.state {
            ConnectionState::Joined { stage, session } => Ok((stage, session)),
            _ => Err(Error::InvalidRequest("Join a stage first".to_string())),
        }
    }

    fn ensure_not_joined(&self) -> Result<()> {
        match self.state {
            ConnectionState::Unauthenticated => Ok(()),
            ConnectionState::Joined { .. } => Err(Error::InvalidRequest(
                "Already joined a stage".to_string(),
            )),
            ConnectionState::Closed => {
                Err(Error::InvalidRequest("Connection is closed".to_string()))
            }
        }
    }
}
