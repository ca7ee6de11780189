use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{ConnectionId, ProducerId, StageId, UserId};

/// What kind of collaboration a stage hosts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageKind {
    Theater,
    Music,
    Conference,
}

impl std::fmt::Display for StageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Theater => write!(f, "theater"),
            Self::Music => write!(f, "music"),
            Self::Conference => write!(f, "conference"),
        }
    }
}

/// Stage metadata as stored by the persistence collaborator.
///
/// Created once on a stage-create request and read-only to the orchestrator
/// afterwards. The access secret never leaves the process.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageRecord {
    pub id: StageId,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: StageKind,
    #[serde(skip_serializing, default)]
    pub access_secret: String,
    pub owner: UserId,
    pub created_at: DateTime<Utc>,
}

/// Fields for creating a new stage record.
#[derive(Debug, Clone)]
pub struct NewStageRecord {
    pub name: String,
    pub kind: StageKind,
    pub access_secret: String,
    pub owner: UserId,
}

/// A verified user identity, as resolved from a bearer token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub user_id: UserId,
    pub display_name: String,
}

/// Minimal participant announcement shared with peers.
///
/// This is the only participant data that crosses the wire; transports and
/// consumers stay private to their owner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantAnnouncement {
    pub user_id: UserId,
    pub display_name: String,
    pub connection_id: ConnectionId,
}

/// Per-participant producer roster entry, recomputed on demand.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerState {
    pub user_id: UserId,
    pub producer_ids: Vec<ProducerId>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_kind_serde() {
        assert_eq!(
            serde_json::to_string(&StageKind::Music).unwrap(),
            "\"music\""
        );
        let kind: StageKind = serde_json::from_str("\"theater\"").unwrap();
        assert_eq!(kind, StageKind::Theater);
    }

    #[test]
    fn test_stage_record_never_serializes_secret() {
        let record = StageRecord {
            id: StageId::from("stage1234567"),
            name: "demo".to_string(),
            kind: StageKind::Conference,
            access_secret: "hunter2".to_string(),
            owner: UserId::from("user12345678"),
            created_at: Utc::now(),
        };
        let json = serde_json::to_string(&record).unwrap();
        assert!(!json.contains("hunter2"));
        assert!(json.contains("\"type\":\"conference\""));
    }
}
