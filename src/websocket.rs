//! # WebSocket Peer Transport
//!
//! Clients connect to `/ws/audio` and exchange raw PCM with the AI pipeline. Each socket is an
//! actix actor that plays the part of the peer connection's transport handle.
//!
//! ## WebSocket Protocol:
//! 1. **Connection**: the upgrade admits the peer to the connection registry; the server replies
//!    with a `connected` message carrying the connection id
//! 2. **Audio in**: binary messages carry 16-bit little-endian PCM (16 kHz mono by default)
//! 3. **Audio out**: binary messages carry paced playback frames (24 kHz mono by default)
//! 4. **Control**: JSON text messages (`ping`, `pong`, `status`, `error`, `fallback`)
//!
//! ## Liveness:
//! The actor pings on a fixed interval. A peer silent for longer than the heartbeat timeout
//! reports one ICE-layer failure; enough of them and the registry drops the connection.

use crate::connection::{ConnectionEvent, ConnectionMetadata, ConnectionState, TransportHandle};
use crate::state::AppState;
use crate::stream::{InboundTrack, StreamSession};

use actix::prelude::*;
use actix_web::http::header;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, error, info, warn};

/// Control messages exchanged as JSON text frames.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WebSocketMessage {
    /// Sent once the peer has been admitted
    Connected { connection_id: String },

    Status {
        connection_id: String,
        state: String,
        message: Option<String>,
    },

    /// The apology sent while the AI pipeline is degraded
    Fallback { message: String },

    Error { code: String, message: String },

    /// Heartbeat/ping message
    Ping { timestamp: u64 },

    /// Heartbeat/pong response
    Pong { timestamp: u64 },
}

impl WebSocketMessage {
    pub fn to_json(&self) -> Option<String> {
        serde_json::to_string(self).ok()
    }
}

/// Message for sending an audio frame to the client.
#[derive(Message)]
#[rtype(result = "()")]
struct SendBinary(Vec<u8>);

/// Message for sending text to the client.
#[derive(Message)]
#[rtype(result = "()")]
struct SendText(String);

/// Message asking the actor to close the socket.
#[derive(Message)]
#[rtype(result = "()")]
struct CloseSocket;

/// Transport handle backed by the socket actor's mailbox.
struct WsTransport {
    addr: Addr<AudioWebSocket>,
    peer: Option<String>,
}

impl TransportHandle for WsTransport {
    fn send_frame(&self, frame: Vec<u8>) -> bool {
        if !self.addr.connected() {
            return false;
        }
        self.addr.do_send(SendBinary(frame));
        true
    }

    fn send_text(&self, text: String) -> bool {
        if !self.addr.connected() {
            return false;
        }
        self.addr.do_send(SendText(text));
        true
    }

    fn close(&self) {
        if self.addr.connected() {
            self.addr.do_send(CloseSocket);
        }
    }

    fn peer(&self) -> Option<String> {
        self.peer.clone()
    }
}

/// One peer connection over WebSocket.
pub struct AudioWebSocket {
    state: AppState,
    metadata: ConnectionMetadata,
    connection_id: Option<String>,
    inbound: Option<mpsc::Sender<Vec<u8>>>,
    session: Option<Arc<StreamSession>>,
    events: mpsc::Sender<ConnectionEvent>,
    last_heartbeat: Instant,
    heartbeat_interval: Duration,
    heartbeat_timeout: Duration,
    dropped_chunks: u64,
}

impl AudioWebSocket {
    pub fn new(state: AppState, metadata: ConnectionMetadata) -> Self {
        let config = state.get_config();
        let events = state.registry.events();
        Self {
            state,
            metadata,
            connection_id: None,
            inbound: None,
            session: None,
            events,
            last_heartbeat: Instant::now(),
            heartbeat_interval: Duration::from_secs(config.connections.heartbeat_interval_seconds),
            heartbeat_timeout: Duration::from_secs(config.connections.heartbeat_timeout_seconds),
            dropped_chunks: 0,
        }
    }

    /// Report an event to the registry without blocking the actor.
    fn emit(&self, event: ConnectionEvent) {
        if let Err(err) = self.events.try_send(event) {
            warn!("Dropping connection event: {}", err);
        }
    }

    fn emit_state(&self, state: ConnectionState) {
        if let Some(id) = &self.connection_id {
            self.emit(ConnectionEvent::StateChanged {
                id: id.clone(),
                state,
            });
        }
    }

    fn send_message(&self, ctx: &mut ws::WebsocketContext<Self>, message: &WebSocketMessage) {
        if let Some(json) = message.to_json() {
            ctx.text(json);
        }
    }

    fn send_error(&self, ctx: &mut ws::WebsocketContext<Self>, code: &str, message: &str) {
        self.send_message(
            ctx,
            &WebSocketMessage::Error {
                code: code.to_string(),
                message: message.to_string(),
            },
        );
        warn!(connection_id = ?self.connection_id, "WebSocket error {}: {}", code, message);
    }

    fn handle_audio_data(&mut self, data: Vec<u8>, ctx: &mut ws::WebsocketContext<Self>) {
        let Some(inbound) = &self.inbound else {
            return;
        };
        match inbound.try_send(data) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                self.dropped_chunks += 1;
                if self.dropped_chunks % 50 == 1 {
                    warn!(
                        connection_id = ?self.connection_id,
                        dropped_chunks = self.dropped_chunks,
                        "Inbound audio channel full, dropping chunk"
                    );
                }
            }
            Err(TrySendError::Closed(_)) => {
                debug!(connection_id = ?self.connection_id, "Inbound track closed");
                ctx.stop();
            }
        }
    }

    fn start_heartbeat(&self, ctx: &mut ws::WebsocketContext<Self>) {
        ctx.run_interval(self.heartbeat_interval, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > act.heartbeat_timeout {
                warn!(connection_id = ?act.connection_id, "WebSocket heartbeat missed");
                if let Some(id) = &act.connection_id {
                    act.emit(ConnectionEvent::IceFailed { id: id.clone() });
                }
                // one failure per missed window
                act.last_heartbeat = Instant::now();
            }
            let timestamp = chrono::Utc::now().timestamp_millis().max(0) as u64;
            ctx.ping(&timestamp.to_be_bytes());
        });
    }
}

impl Actor for AudioWebSocket {
    type Context = ws::WebsocketContext<Self>;

    /// Admit the peer and start its stream session.
    fn started(&mut self, ctx: &mut Self::Context) {
        let config = self.state.get_config();
        let transport: Arc<dyn TransportHandle> = Arc::new(WsTransport {
            addr: ctx.address(),
            peer: self.metadata.peer_addr.clone(),
        });

        let connection_id = self
            .state
            .registry
            .admit(Arc::clone(&transport), self.metadata.clone());
        let (inbound_tx, inbound) = InboundTrack::channel(config.audio.inbound_channel_capacity);
        let session = StreamSession::start(
            connection_id.clone(),
            transport,
            inbound,
            self.state.stream_services(),
            &config,
        );

        self.connection_id = Some(connection_id.clone());
        self.inbound = Some(inbound_tx);
        self.session = Some(session);
        self.emit_state(ConnectionState::Connected);

        self.send_message(ctx, &WebSocketMessage::Connected { connection_id: connection_id.clone() });
        info!(connection_id = %connection_id, "WebSocket connection started");

        self.start_heartbeat(ctx);
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        self.inbound = None;
        // read before the session removes the record
        let record = self
            .connection_id
            .as_deref()
            .and_then(|id| self.state.registry.get(id));
        if let Some(session) = self.session.take() {
            session.stop();
        }
        info!(
            connection_id = ?self.connection_id,
            ice_failures = record.map(|info| info.error_count),
            "WebSocket connection stopped"
        );
    }
}

/// Handle incoming WebSocket messages.
impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for AudioWebSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        if msg.is_ok() {
            self.last_heartbeat = Instant::now();
        }

        match msg {
            Ok(ws::Message::Binary(data)) => {
                self.handle_audio_data(data.to_vec(), ctx);
            }
            Ok(ws::Message::Text(text)) => match serde_json::from_str::<WebSocketMessage>(&text) {
                Ok(WebSocketMessage::Ping { timestamp }) => {
                    self.send_message(ctx, &WebSocketMessage::Pong { timestamp });
                }
                Ok(WebSocketMessage::Pong { .. }) => {}
                Ok(WebSocketMessage::Status { .. }) => {
                    if let Some(id) = &self.connection_id {
                        let state = self
                            .state
                            .registry
                            .get(id)
                            .map(|info| info.state.as_str().to_string())
                            .unwrap_or_else(|| "unknown".to_string());
                        self.send_message(
                            ctx,
                            &WebSocketMessage::Status {
                                connection_id: id.clone(),
                                state,
                                message: None,
                            },
                        );
                    }
                }
                Ok(_) => {
                    warn!("Received unexpected message type from client");
                }
                Err(err) => {
                    self.send_error(ctx, "invalid_json", &format!("Invalid JSON: {}", err));
                }
            },
            Ok(ws::Message::Ping(data)) => {
                ctx.pong(&data);
            }
            Ok(ws::Message::Pong(_)) => {}
            Ok(ws::Message::Close(reason)) => {
                info!(connection_id = ?self.connection_id, "WebSocket closed: {:?}", reason);
                self.emit_state(ConnectionState::Disconnected);
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!("Received unexpected continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                error!(connection_id = ?self.connection_id, "WebSocket protocol error: {}", err);
                self.emit_state(ConnectionState::Error);
                ctx.stop();
            }
        }
    }
}

impl Handler<SendBinary> for AudioWebSocket {
    type Result = ();

    fn handle(&mut self, msg: SendBinary, ctx: &mut Self::Context) {
        ctx.binary(msg.0);
    }
}

impl Handler<SendText> for AudioWebSocket {
    type Result = ();

    fn handle(&mut self, msg: SendText, ctx: &mut Self::Context) {
        ctx.text(msg.0);
    }
}

impl Handler<CloseSocket> for AudioWebSocket {
    type Result = ();

    fn handle(&mut self, _msg: CloseSocket, ctx: &mut Self::Context) {
        ctx.close(Some(ws::CloseReason {
            code: ws::CloseCode::Away,
            description: Some("Connection closed by server".to_string()),
        }));
        ctx.stop();
    }
}

/// WebSocket endpoint handler.
///
/// ## HTTP to WebSocket Upgrade:
/// Upgrades the request and hands the socket to an `AudioWebSocket` actor, which admits the
/// peer once it starts.
pub async fn audio_websocket(
    req: HttpRequest,
    stream: web::Payload,
    app_state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    let metadata = ConnectionMetadata {
        user_agent: req
            .headers()
            .get(header::USER_AGENT)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string),
        peer_addr: req.connection_info().peer_addr().map(str::to_string),
    };
    info!(peer = ?metadata.peer_addr, "New WebSocket connection request");

    ws::start(AudioWebSocket::new(app_state.get_ref().clone(), metadata), &req, stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fallback_message_format() {
        let json = WebSocketMessage::Fallback {
            message: "Please try again".to_string(),
        }
        .to_json()
        .unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["type"], "fallback");
        assert_eq!(value["message"], "Please try again");
    }

    #[test]
    fn test_client_ping_parses() {
        let msg: WebSocketMessage = serde_json::from_str(r#"{"type":"ping","timestamp":42}"#).unwrap();
        match msg {
            WebSocketMessage::Ping { timestamp } => assert_eq!(timestamp, 42),
            _ => panic!("Wrong message type"),
        }
    }

    #[test]
    fn test_error_message_creation() {
        let json = WebSocketMessage::Error {
            code: "invalid_json".to_string(),
            message: "Invalid JSON: expected value".to_string(),
        }
        .to_json()
        .unwrap();
        assert!(json.contains("\"type\":\"error\""));
        assert!(json.contains("invalid_json"));
    }

    #[test]
    fn test_connected_message_carries_id() {
        let json = WebSocketMessage::Connected {
            connection_id: "abc-123".to_string(),
        }
        .to_json()
        .unwrap();
        assert_eq!(json, r#"{"type":"connected","connection_id":"abc-123"}"#);
    }
}
