//! WebSocket transport adapter
//!
//! One socket per participant. Inbound frames are request envelopes handled
//! by the connection's gateway; outbound traffic merges the gateway's
//! responses with the broadcaster's stage events into a single pump task
//! that owns the sink.

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use stagecast_core::models::ConnectionId;
use stagecast_core::service::broadcast::StageEvent;

use crate::gateway::{GatewayServices, SignalingGateway};
use crate::protocol::{EventEnvelope, RequestEnvelope, ResponseEnvelope};

/// Correlation id used when a frame is too malformed to extract one.
const UNPARSEABLE_REQUEST_ID: u64 = 0;

/// Shared state for the signaling route.
#[derive(Clone)]
pub struct SignalingState {
    pub services: Arc<GatewayServices>,
    pub max_message_bytes: usize,
}

/// WebSocket handler for the signaling endpoint.
pub async fn ws_handler(
    State(state): State<SignalingState>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.max_message_size(state.max_message_bytes)
        .on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: SignalingState) {
    let connection_id = ConnectionId::new();
    info!(connection_id = %connection_id, "signaling connection established");

    let (event_tx, mut event_rx) =
        mpsc::channel::<StageEvent>(state.services.event_queue_capacity);
    let mut gateway = SignalingGateway::new(
        Arc::clone(&state.services),
        connection_id.clone(),
        event_tx,
    );

    let (mut sink, mut stream) = socket.split();
    let (frame_tx, mut frame_rx) = mpsc::channel::<String>(64);

    // Single writer for the sink: responses and stage events interleave here.
    let pump_connection_id = connection_id.clone();
    let pump = tokio::spawn(async move {
        loop {
            let frame = tokio::select! {
                Some(frame) = frame_rx.recv() => frame,
                Some(event) = event_rx.recv() => {
                    match serde_json::to_string(&EventEnvelope::from(event)) {
                        Ok(frame) => frame,
                        Err(e) => {
                            warn!(connection_id = %pump_connection_id, error = %e, "failed to encode event");
                            continue;
                        }
                    }
                }
                else => break,
            };
            if sink.send(Message::Text(frame.into())).await.is_err() {
                debug!(connection_id = %pump_connection_id, "socket send failed, stopping pump");
                break;
            }
        }
    });

    while let Some(message) = stream.next().await {
        let message = match message {
            Ok(message) => message,
            Err(e) => {
                debug!(connection_id = %connection_id, error = %e, "websocket error");
                break;
            }
        };

        match message {
            Message::Text(text) => {
                let response = match serde_json::from_str::<RequestEnvelope>(&text) {
                    Ok(envelope) => {
                        let request_id = envelope.id;
                        let event = envelope.request.event_name();
                        match gateway.handle(envelope.request).await {
                            Ok(data) => ResponseEnvelope::data(request_id, data),
                            Err(e) => {
                                if e.is_client_error() {
                                    debug!(
                                        connection_id = %connection_id,
                                        event,
                                        error = %e,
                                        "request rejected"
                                    );
                                } else {
                                    warn!(
                                        connection_id = %connection_id,
                                        event,
                                        error = %e,
                                        "request failed"
                                    );
                                }
                                ResponseEnvelope::error(request_id, e.to_string())
                            }
                        }
                    }
                    Err(e) => ResponseEnvelope::error(
                        UNPARSEABLE_REQUEST_ID,
                        format!("Malformed request: {e}"),
                    ),
                };

                match serde_json::to_string(&response) {
                    Ok(frame) => {
                        if frame_tx.send(frame).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(connection_id = %connection_id, error = %e, "failed to encode response");
                    }
                }
            }
            Message::Close(_) => break,
            // Binary frames are not part of the protocol; ping/pong is
            // handled underneath.
            _ => {}
        }
    }

    gateway.on_close().await;
    pump.abort();
    info!(connection_id = %connection_id, "signaling connection closed");
}
