//! Stage registry
//!
//! Single source of truth for which stages exist in this process. Owned by
//! the bootstrap wiring and handed to every gateway; there is no global
//! state. Stages live from first use until process shutdown.

use std::sync::Arc;

use dashmap::DashMap;

use crate::models::StageId;
use crate::service::broadcast::EventBroadcaster;
use crate::service::stage::Stage;
use crate::sfu::SfuEngine;
use crate::{Error, Result};

pub struct StageRegistry {
    stages: DashMap<StageId, Arc<Stage>>,
    engine: Arc<dyn SfuEngine>,
    broadcaster: Arc<EventBroadcaster>,
}

impl StageRegistry {
    #[must_use]
    pub fn new(engine: Arc<dyn SfuEngine>, broadcaster: Arc<EventBroadcaster>) -> Self {
        Self {
            stages: DashMap::new(),
            engine,
            broadcaster,
        }
    }

    /// Return the stage for an id, creating and registering it on first
    /// use. The entry lock makes concurrent first access yield exactly one
    /// `Stage` instance.
    #[must_use]
    pub fn get_or_create(&self, stage_id: &StageId) -> Arc<Stage> {
        self.stages
            .entry(stage_id.clone())
            .or_insert_with(|| {
                Arc::new(Stage::new(
                    stage_id.clone(),
                    Arc::clone(&self.engine),
                    Arc::clone(&self.broadcaster),
                ))
            })
            .clone()
    }

    /// Look up an existing stage.
    pub fn get(&self, stage_id: &StageId) -> Result<Arc<Stage>> {
        self.stages
            .get(stage_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| Error::StageNotFound(stage_id.clone()))
    }

    #[must_use]
    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sfu::InProcessSfuEngine;

    fn registry_with_engine() -> (Arc<StageRegistry>, Arc<InProcessSfuEngine>) {
        let engine = Arc::new(InProcessSfuEngine::new());
        let registry = Arc::new(StageRegistry::new(
            Arc::clone(&engine) as Arc<dyn SfuEngine>,
            Arc::new(EventBroadcaster::new()),
        ));
        (registry, engine)
    }

    #[tokio::test]
    async fn test_get_or_create_returns_same_stage() {
        let (registry, _engine) = registry_with_engine();
        let id = StageId::from("stage-a");

        let first = registry.get_or_create(&id);
        let second = registry.get_or_create(&id);

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.stage_count(), 1);
    }

    #[tokio::test]
    async fn test_get_unknown_stage_fails() {
        let (registry, _engine) = registry_with_engine();
        let err = registry.get(&StageId::from("missing")).unwrap_err();
        assert!(matches!(err, Error::StageNotFound(_)));
    }

    #[tokio::test]
    async fn test_concurrent_first_access_creates_one_stage_and_one_router() {
        let (registry, engine) = registry_with_engine();
        let id = StageId::from("stage-a");

        let handles: Vec<_> = (0..32)
            .map(|_| {
                let registry = Arc::clone(&registry);
                let id = id.clone();
                tokio::spawn(async move {
                    let stage = registry.get_or_create(&id);
                    stage.router().await.map(|_| Arc::as_ptr(&stage) as usize)
                })
            })
            .collect();

        let mut pointers = Vec::new();
        for handle in handles {
            pointers.push(handle.await.unwrap().unwrap());
        }

        pointers.sort_unstable();
        pointers.dedup();
        assert_eq!(pointers.len(), 1);
        assert_eq!(registry.stage_count(), 1);
        assert_eq!(engine.router_count(), 1);
    }
}
