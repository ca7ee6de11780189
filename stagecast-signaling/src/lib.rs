//! Stagecast signaling
//!
//! Binds inbound connections to the orchestrator core: the typed wire
//! protocol, the per-connection gateway state machine, and the axum
//! WebSocket adapter that carries both.

pub mod gateway;
pub mod protocol;
pub mod websocket;

pub use gateway::{GatewayServices, SignalingGateway};
pub use websocket::{ws_handler, SignalingState};
