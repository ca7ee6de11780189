//! Stage record persistence seam
//!
//! Stage metadata lives in an external persistence service. The orchestrator
//! only ever creates a record and reads it back by id; records are immutable
//! to it afterwards.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use tracing::info;

use crate::models::{NewStageRecord, StageId, StageRecord};
use crate::{Error, Result};

const MAX_STAGE_NAME_LEN: usize = 255;

#[async_trait]
pub trait StageStore: Send + Sync {
    /// Create and persist a stage record, assigning its id.
    async fn create_stage_record(&self, fields: NewStageRecord) -> Result<StageRecord>;

    /// Fetch a stage record. `Error::StageNotFound` when absent.
    async fn get_stage_record(&self, id: &StageId) -> Result<StageRecord>;
}

/// In-memory store standing in for the external persistence service.
#[derive(Default)]
pub struct InMemoryStageStore {
    records: DashMap<StageId, StageRecord>,
}

impl InMemoryStageStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn record_count(&self) -> usize {
        self.records.len()
    }
}

#[async_trait]
impl StageStore for InMemoryStageStore {
    async fn create_stage_record(&self, fields: NewStageRecord) -> Result<StageRecord> {
        if fields.name.is_empty() {
            return Err(Error::InvalidRequest(
                "Stage name cannot be empty".to_string(),
            ));
        }
        if fields.name.len() > MAX_STAGE_NAME_LEN {
            return Err(Error::InvalidRequest("Stage name too long".to_string()));
        }

        let record = StageRecord {
            id: StageId::new(),
            name: fields.name,
            kind: fields.kind,
            access_secret: fields.access_secret,
            owner: fields.owner,
            created_at: Utc::now(),
        };

        info!(
            stage_id = %record.id,
            kind = %record.kind,
            owner = %record.owner,
            "created stage record"
        );
        self.records.insert(record.id.clone(), record.clone());
        Ok(record)
    }

    async fn get_stage_record(&self, id: &StageId) -> Result<StageRecord> {
        self.records
            .get(id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::StageNotFound(id.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{StageKind, UserId};

    fn fields(name: &str) -> NewStageRecord {
        NewStageRecord {
            name: name.to_string(),
            kind: StageKind::Music,
            access_secret: "x".to_string(),
            owner: UserId::from("owner1234567"),
        }
    }

    #[tokio::test]
    async fn test_create_and_get_roundtrip() {
        let store = InMemoryStageStore::new();
        let record = store.create_stage_record(fields("demo")).await.unwrap();

        let fetched = store.get_stage_record(&record.id).await.unwrap();
        assert_eq!(fetched.name, "demo");
        assert_eq!(fetched.access_secret, "x");
        assert_eq!(store.record_count(), 1);
    }

    #[tokio::test]
    async fn test_get_missing_record_fails() {
        let store = InMemoryStageStore::new();
        let err = store
            .get_stage_record(&StageId::from("missing12345"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::StageNotFound(_)));
    }

    #[tokio::test]
    async fn test_create_validates_name() {
        let store = InMemoryStageStore::new();
        assert!(store.create_stage_record(fields("")).await.is_err());
        assert!(store
            .create_stage_record(fields(&"x".repeat(256)))
            .await
            .is_err());
    }
}
