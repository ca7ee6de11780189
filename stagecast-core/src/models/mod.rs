pub mod id;
pub mod stage;

pub use id::{
    generate_id, ConnectionId, ConsumerId, ProducerId, StageId, TransportId, UserId,
};
pub use stage::{
    Identity, NewStageRecord, ParticipantAnnouncement, ProducerState, StageKind, StageRecord,
};
