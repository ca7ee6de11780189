use thiserror::Error;

use crate::models::{ConnectionId, ConsumerId, StageId, TransportId};

/// Errors surfaced by the stage orchestrator.
///
/// Every variant maps to a per-request error payload at the signaling
/// boundary; none of them terminate a connection or the process. The
/// `Display` strings for `StageNotFound` and `WrongSecret` are part of the
/// wire protocol.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Could not find stage")]
    StageNotFound(StageId),

    #[error("Wrong password")]
    WrongSecret,

    #[error("Connection {connection_id} already joined stage {stage_id}")]
    DuplicateParticipant {
        stage_id: StageId,
        connection_id: ConnectionId,
    },

    #[error("Could not find transport {0}")]
    UnknownTransport(TransportId),

    #[error("Could not find consumer {0}")]
    UnknownConsumer(ConsumerId),

    #[error("Could not find peer {0}")]
    UnknownPeer(ConnectionId),

    #[error("Failed to create transport: {0}")]
    TransportCreationFailed(String),

    #[error("SFU engine error: {0}")]
    Sfu(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether the error is a client protocol mistake (stale or forged
    /// handle, out-of-state request) rather than a server-side failure.
    #[must_use]
    pub const fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::Authentication(_)
                | Self::StageNotFound(_)
                | Self::WrongSecret
                | Self::UnknownTransport(_)
                | Self::UnknownConsumer(_)
                | Self::UnknownPeer(_)
                | Self::InvalidRequest(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
