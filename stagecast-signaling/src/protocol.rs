//! Wire protocol
//!
//! Every inbound frame is a request envelope `{id, event, data}`; every
//! request gets exactly one response envelope `{id, data}` or `{id, error}`.
//! Server-initiated events arrive as `{event, data}` with no id. Payloads
//! are explicit tagged structs, validated here before anything reaches the
//! core.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use stagecast_core::models::{
    ConnectionId, ConsumerId, ParticipantAnnouncement, ProducerId, ProducerState, StageId,
    StageKind, StageRecord, TransportId,
};
use stagecast_core::service::broadcast::StageEvent;
use stagecast_core::sfu::MediaKind;

/// Inbound request frame.
#[derive(Debug, Deserialize)]
pub struct RequestEnvelope {
    /// Client-chosen correlation id, echoed in the response.
    pub id: u64,
    #[serde(flatten)]
    pub request: ClientRequest,
}

/// Every request a client can make, keyed by event name.
#[derive(Debug, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ClientRequest {
    #[serde(rename = "stage/create")]
    StageCreate(StageCreateRequest),
    #[serde(rename = "stage/join")]
    StageJoin(StageJoinRequest),
    #[serde(rename = "participants/state")]
    ParticipantsState,
    #[serde(rename = "producers/state")]
    ProducersState,
    #[serde(rename = "sfu/get-capabilities")]
    GetCapabilities,
    #[serde(rename = "sfu/create-send-transport")]
    CreateSendTransport,
    #[serde(rename = "sfu/create-receive-transport")]
    CreateReceiveTransport(CreateReceiveTransportRequest),
    #[serde(rename = "sfu/connect-transport")]
    ConnectTransport(ConnectTransportRequest),
    #[serde(rename = "sfu/send-track")]
    SendTrack(SendTrackRequest),
    #[serde(rename = "sfu/consume")]
    Consume(ConsumeRequest),
    #[serde(rename = "sfu/finish-consume")]
    FinishConsume(FinishConsumeRequest),
    #[serde(rename = "peer/offer")]
    PeerOffer(PeerRelayRequest),
    #[serde(rename = "peer/answer")]
    PeerAnswer(PeerRelayRequest),
    #[serde(rename = "peer/candidate")]
    PeerCandidate(PeerRelayRequest),
}

impl ClientRequest {
    /// Wire event name, for logging.
    #[must_use]
    pub const fn event_name(&self) -> &'static str {
        match self {
            Self::StageCreate(_) => "stage/create",
            Self::StageJoin(_) => "stage/join",
            Self::ParticipantsState => "participants/state",
            Self::ProducersState => "producers/state",
            Self::GetCapabilities => "sfu/get-capabilities",
            Self::CreateSendTransport => "sfu/create-send-transport",
            Self::CreateReceiveTransport(_) => "sfu/create-receive-transport",
            Self::ConnectTransport(_) => "sfu/connect-transport",
            Self::SendTrack(_) => "sfu/send-track",
            Self::Consume(_) => "sfu/consume",
            Self::FinishConsume(_) => "sfu/finish-consume",
            Self::PeerOffer(_) => "peer/offer",
            Self::PeerAnswer(_) => "peer/answer",
            Self::PeerCandidate(_) => "peer/candidate",
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageCreateRequest {
    pub token: String,
    pub stage_name: String,
    #[serde(rename = "type")]
    pub kind: StageKind,
    pub password: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageJoinRequest {
    pub token: String,
    pub stage_id: StageId,
    pub password: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateReceiveTransportRequest {
    /// Client RTP capabilities; relayed to the engine untouched.
    pub capabilities: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectTransportRequest {
    pub transport_id: TransportId,
    pub dtls_parameters: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendTrackRequest {
    pub transport_id: TransportId,
    pub kind: MediaKind,
    pub rtp_parameters: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumeRequest {
    pub transport_id: TransportId,
    pub producer_id: ProducerId,
    pub capabilities: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinishConsumeRequest {
    pub consumer_id: ConsumerId,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerRelayRequest {
    pub target_connection_id: ConnectionId,
    /// Offer/answer/candidate body, relayed verbatim.
    pub payload: Value,
}

/// Outbound response frame.
#[derive(Debug, Serialize)]
pub struct ResponseEnvelope {
    pub id: u64,
    #[serde(flatten)]
    pub outcome: ResponseOutcome,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum ResponseOutcome {
    Data { data: Value },
    Error { error: String },
}

impl ResponseEnvelope {
    #[must_use]
    pub const fn data(id: u64, data: Value) -> Self {
        Self {
            id,
            outcome: ResponseOutcome::Data { data },
        }
    }

    #[must_use]
    pub const fn error(id: u64, error: String) -> Self {
        Self {
            id,
            outcome: ResponseOutcome::Error { error },
        }
    }
}

/// Successful response to `stage/create` and `stage/join`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StageJoinResponse {
    pub stage: StageRecord,
    pub participants: Vec<ParticipantAnnouncement>,
    pub producers: Vec<ProducerState>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectTransportResponse {
    pub connected: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SendTrackResponse {
    pub id: ProducerId,
}

/// Server-initiated event frame.
#[derive(Debug, Serialize)]
pub struct EventEnvelope {
    pub event: &'static str,
    pub data: Value,
}

impl From<StageEvent> for EventEnvelope {
    fn from(event: StageEvent) -> Self {
        Self {
            event: event.action.event_name(),
            data: event.payload,
        }
    }
}
