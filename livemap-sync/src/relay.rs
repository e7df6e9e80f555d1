//! Reference relay: accepts presence clients per room and fans their
//! reports out.
//!
//! Architecture:
//! ```text
//! Client A ──┐  ws://host/stream?room-id=R&uid=A
//!            ├── RoomManager ── BroadcastGroup(R) ── visitor table
//! Client B ──┘                        │
//!                          ┌──────────┼───────────┐
//!                          ▼          ▼           ▼
//!                       Client A   Client B    Client C
//! ```
//!
//! Per connection:
//! - on connect, the client receives every other visitor already in the room
//!   (inactive ones included) and displaces any older connection of its uid
//! - every `LocationReport` is rebroadcast as a `PeerEvent` to the whole room,
//!   sender included
//! - on disconnect the visitor is broadcast once more with `active: false`
//!
//! There is no authentication; the uid in the query is trusted.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::RwLock;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::{self, Message};

use crate::broadcast::RoomManager;
use crate::config::RelayConfig;
use crate::protocol::{EndpointParams, LocationReport, ProtocolError};

/// Relay failures. Per-connection errors are logged, never fatal to the relay.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("handshake rejected: {0}")]
    Rejected(String),
}

/// Relay statistics.
#[derive(Debug, Clone, Default)]
pub struct RelayStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_reports: u64,
    pub rejected_frames: u64,
    pub active_rooms: usize,
}

/// The presence relay.
pub struct Relay {
    config: RelayConfig,
    rooms: Arc<RoomManager>,
    stats: Arc<RwLock<RelayStats>>,
}

impl Relay {
    pub fn new(config: RelayConfig) -> Self {
        let rooms = Arc::new(RoomManager::new(config.broadcast_capacity));
        Self {
            config,
            rooms,
            stats: Arc::new(RwLock::new(RelayStats::default())),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(RelayConfig::default())
    }

    /// Bind `config.bind_addr` and serve until the listener fails.
    pub async fn run(&self) -> Result<(), RelayError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), RelayError> {
        log::info!(
            "Presence relay listening on {} (path {})",
            listener.local_addr()?,
            self.config.path
        );

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let rooms = self.rooms.clone();
            let stats = self.stats.clone();
            let path = self.config.path.clone();

            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, rooms, stats, path).await {
                    log::warn!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    pub async fn stats(&self) -> RelayStats {
        let mut stats = self.stats.read().await.clone();
        stats.active_rooms = self.rooms.room_count().await;
        stats
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        rooms: Arc<RoomManager>,
        stats: Arc<RwLock<RelayStats>>,
        path: String,
    ) -> Result<(), RelayError> {
        let mut params: Option<EndpointParams> = None;
        let mut rejection: Option<String> = None;

        let ws_stream = tokio_tungstenite::accept_hdr_async(
            stream,
            |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
                match check_request(request, &path) {
                    Ok(p) => {
                        params = Some(p);
                        Ok(response)
                    }
                    Err(reason) => {
                        let mut error = ErrorResponse::new(Some(reason.clone()));
                        *error.status_mut() = StatusCode::BAD_REQUEST;
                        rejection = Some(reason);
                        Err(error)
                    }
                }
            },
        )
        .await;

        let ws_stream = match ws_stream {
            Ok(ws) => ws,
            Err(e) => return Err(rejection.map_or_else(|| e.into(), RelayError::Rejected)),
        };
        let Some(EndpointParams { room, uid }) = params else {
            return Err(RelayError::Rejected("missing endpoint parameters".into()));
        };
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let group = rooms.get_or_create(&room).await;
        let mut membership = group.join(&uid).await;
        log::info!("Visitor {uid} joined room {room} from {addr}");

        let result = async {
            for event in &membership.existing {
                ws_sender.send(Message::text(event.encode()?)).await?;
            }

            loop {
                tokio::select! {
                    msg = ws_receiver.next() => match msg {
                        Some(Ok(Message::Text(text))) => match LocationReport::decode(text.as_str()) {
                            Ok(report) if report.uid == uid => {
                                group.update(&uid, membership.session, report).await?;
                                stats.write().await.total_reports += 1;
                            }
                            Ok(report) => {
                                log::warn!("Ignoring report for {} on connection of {uid}", report.uid);
                                stats.write().await.rejected_frames += 1;
                            }
                            Err(e) => {
                                log::warn!("Ignoring malformed frame from {uid}: {e}");
                                stats.write().await.rejected_frames += 1;
                            }
                        },
                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Err(e)) => {
                            log::debug!("Read error from {uid}: {e}");
                            break;
                        }
                        Some(Ok(_)) => {}
                    },

                    frame = membership.receiver.recv() => match frame {
                        Ok(frame) => ws_sender.send(Message::text(frame.to_string())).await?,
                        Err(RecvError::Lagged(n)) => {
                            log::warn!("Visitor {uid} lagged behind by {n} frames in room {room}");
                        }
                        Err(RecvError::Closed) => break,
                    },

                    _ = &mut membership.displaced => {
                        log::info!("Closing displaced connection of {uid} in room {room}");
                        let _ = ws_sender.close().await;
                        break;
                    }
                }
            }
            Ok::<(), RelayError>(())
        }
        .await;

        if let Err(e) = group.leave(&uid, membership.session).await {
            log::error!("Failed to broadcast departure of {uid}: {e}");
        }
        stats.write().await.active_connections -= 1;
        log::info!("Visitor {uid} left room {room}");

        result
    }
}

/// Validate the upgrade request path and extract room and uid.
fn check_request(request: &Request, path: &str) -> Result<EndpointParams, String> {
    let uri = request.uri();
    if uri.path() != path {
        return Err(format!("unknown path {}", uri.path()));
    }
    EndpointParams::from_query(uri.query().unwrap_or_default()).map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(uri: &str) -> Request {
        Request::builder().uri(uri).body(()).unwrap()
    }

    #[test]
    fn test_check_request_accepts_endpoint() {
        let params = check_request(&request("/stream?room-id=block-1&uid=a"), "/stream").unwrap();
        assert_eq!(params.room.as_str(), "block-1");
        assert_eq!(params.uid, "a");
    }

    #[test]
    fn test_check_request_rejects_wrong_path() {
        let err = check_request(&request("/other?room-id=r&uid=a"), "/stream").unwrap_err();
        assert!(err.contains("/other"));
    }

    #[test]
    fn test_check_request_rejects_missing_params() {
        assert!(check_request(&request("/stream"), "/stream").is_err());
        assert!(check_request(&request("/stream?room-id=r"), "/stream").is_err());
        assert!(check_request(&request("/stream?uid=a"), "/stream").is_err());
        assert!(check_request(&request("/stream?room-id=a%20b&uid=a"), "/stream").is_err());
    }

    #[tokio::test]
    async fn test_relay_initial_stats() {
        let relay = Relay::with_defaults();
        let stats = relay.stats().await;
        assert_eq!(stats.total_connections, 0);
        assert_eq!(stats.active_connections, 0);
        assert_eq!(stats.active_rooms, 0);
    }
}
