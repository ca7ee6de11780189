//! SFU engine collaborator seam
//!
//! The orchestrator never negotiates media itself. It asks an opaque engine
//! for a routing context per stage, for bidirectional transports on that
//! context, and for producer/consumer handles on a transport. ICE, DTLS and
//! codec matching all happen behind these traits.
//!
//! Negotiation payloads (DTLS parameters, RTP parameters, capability
//! descriptors) are carried as opaque JSON and relayed verbatim between the
//! engine and the client.

pub mod in_process;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::models::{ConsumerId, ProducerId, StageId, TransportId};
use crate::{Error, Result};

pub use in_process::InProcessSfuEngine;

/// Direction of a media transport, from the participant's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportDirection {
    Send,
    Receive,
}

/// Kind of media stream carried by a producer or consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

/// Client-supplied parameters for producing a media stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaParams {
    pub kind: MediaKind,
    pub rtp_parameters: serde_json::Value,
}

/// Connection parameters handed back to the client after transport creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportConnectParams {
    pub id: TransportId,
    pub ice_parameters: serde_json::Value,
    pub ice_candidates: serde_json::Value,
    pub dtls_parameters: serde_json::Value,
}

/// Parameters handed back to the client after a consume request.
///
/// The consumer starts paused and is resumed once the client acknowledges.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerParams {
    pub id: ConsumerId,
    pub producer_id: ProducerId,
    pub kind: MediaKind,
    pub rtp_parameters: serde_json::Value,
    pub producer_paused: bool,
    #[serde(rename = "type")]
    pub consumer_type: String,
}

/// The external media-routing engine.
#[async_trait]
pub trait SfuEngine: Send + Sync {
    /// Yield the routing context for a stage, creating it on first use.
    /// Idempotent per stage id.
    async fn get_or_create_router(&self, stage_id: &StageId) -> Result<Arc<dyn RouterHandle>>;
}

/// A routing context scoped to one stage.
#[async_trait]
pub trait RouterHandle: Send + Sync {
    /// Capability descriptor clients need before negotiating.
    fn capabilities(&self) -> serde_json::Value;

    async fn create_transport(
        &self,
        direction: TransportDirection,
    ) -> Result<Arc<dyn TransportHandle>>;
}

/// A negotiated media-transport endpoint between one participant and the SFU.
#[async_trait]
pub trait TransportHandle: Send + Sync {
    fn id(&self) -> &TransportId;

    fn direction(&self) -> TransportDirection;

    fn connect_params(&self) -> TransportConnectParams;

    /// Notifies when the transport closes, expectedly or not. Producers on a
    /// closed transport are gone and must be announced as removed.
    fn subscribe_close(&self) -> broadcast::Receiver<()>;

    async fn connect(&self, dtls_parameters: serde_json::Value) -> Result<()>;

    async fn produce(&self, params: MediaParams) -> Result<Arc<dyn ProducerHandle>>;

    async fn consume(
        &self,
        producer_id: &ProducerId,
        rtp_capabilities: serde_json::Value,
    ) -> Result<Arc<dyn ConsumerHandle>>;

    async fn close(&self) -> Result<()>;
}

/// An inbound media stream a participant is sending into the stage.
#[async_trait]
pub trait ProducerHandle: Send + Sync {
    fn id(&self) -> &ProducerId;

    fn kind(&self) -> MediaKind;

    async fn close(&self) -> Result<()>;
}

/// An outbound media stream a participant receives from another's producer.
#[async_trait]
pub trait ConsumerHandle: Send + Sync {
    fn id(&self) -> &ConsumerId;

    fn params(&self) -> ConsumerParams;

    /// Resume a paused consumer. Resuming an already-resumed consumer is a
    /// no-op.
    async fn resume(&self) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

impl std::fmt::Debug for dyn ProducerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProducerHandle").field("id", self.id()).finish_non_exhaustive()
    }
}

impl std::fmt::Debug for dyn ConsumerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsumerHandle").field("id", self.id()).finish_non_exhaustive()
    }
}

/// Bound an engine call so a stalled SFU cannot wedge a request handler.
pub async fn with_engine_timeout<T, F>(limit: Duration, fut: F) -> Result<T>
where
    F: std::future::Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(Error::Sfu(format!(
            "SFU request timed out after {}s",
            limit.as_secs()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_engine_timeout_expires() {
        let result: Result<()> = with_engine_timeout(Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;

        assert!(matches!(result, Err(Error::Sfu(_))));
    }

    #[tokio::test]
    async fn test_engine_timeout_passes_result_through() {
        let result = with_engine_timeout(Duration::from_secs(1), async { Ok(7usize) }).await;
        assert_eq!(result.unwrap(), 7);
    }
}
