//! # Control connection (spec §4.1, §4.3, §5)
//!
//! `GET /connect` upgrades to a WebSocket that carries the tunnel's control
//! channel: HELLO → REGISTER_TUNNEL → REGISTERED, then inbound
//! `RESP_START`/`RESP_DATA`/`END` frames for every stream the public side
//! opened. One writer task per socket (spec §5) serializes outbound frames
//! so a `RESP_DATA` from one stream can never interleave with a partial
//! frame from another.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tunnel_protocol::{decode, encode, EndPhase, ErrorCode, Frame, PROTOCOL_VERSION};

use crate::error::ServerError;
use crate::tunnel::{RespHead, StreamFailure, Tunnel};
use crate::AppState;

/// Hop-by-hop headers stripped from `RESP_START` before they reach the
/// public response (spec §4.3 "Response handling").
const HOP_BY_HOP: &[&str] = &["transfer-encoding", "connection", "keep-alive"];

pub async fn connect_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut ws_sink, mut ws_stream) = socket.split();
    let (control_tx, mut control_rx) = mpsc::unbounded_channel::<Frame>();

    let writer = tokio::spawn(async move {
        while let Some(frame) = control_rx.recv().await {
            if ws_sink
                .send(Message::Binary(encode(&frame).into()))
                .await
                .is_err()
            {
                break;
            }
        }
    });

    let mut tunnel: Option<Arc<Tunnel>> = None;

    while let Some(Ok(msg)) = ws_stream.next().await {
        let bytes = match msg {
            Message::Binary(b) => b,
            Message::Close(_) => break,
            _ => continue,
        };
        // Malformed frames are logged and discarded, not fatal (spec §7.1).
        let frame = match decode(&bytes) {
            Ok(f) => f,
            Err(e) => {
                warn!(error = %e, "malformed frame from client, discarding");
                continue;
            }
        };

        match frame {
            Frame::Hello { v, .. } => {
                if v != PROTOCOL_VERSION {
                    warn!(client_version = v, server_version = PROTOCOL_VERSION, "protocol version mismatch");
                }
            }
            Frame::RegisterTunnel { subdomain } => {
                if tunnel.is_some() {
                    // Already registered on this connection; ignore a
                    // duplicate request rather than rebind.
                    continue;
                }
                match state.registry.register(subdomain, control_tx.clone()) {
                    Ok(t) => {
                        let _ = control_tx.send(Frame::Registered {
                            subdomain: t.subdomain.clone(),
                            tunnel_id: t.tunnel_id,
                        });
                        info!(subdomain = %t.subdomain, tunnel_id = t.tunnel_id.0, "tunnel registered");
                        tunnel = Some(t);
                    }
                    Err(taken) => {
                        let err = ServerError::from(taken);
                        warn!(error = %err, "registration failed");
                        let _ = control_tx.send(Frame::Error {
                            code: ErrorCode::SubdomainTaken,
                            message: Some(err.to_string()),
                        });
                    }
                }
            }
            Frame::RespStart {
                tunnel_id,
                stream_id,
                status_code,
                headers,
            } => {
                // Open Question (spec §9): validate tunnelId against this
                // connection's own registration rather than trusting it.
                if let Some(t) = tunnel.as_ref().filter(|t| t.tunnel_id == tunnel_id) {
                    if let Some(stream) = t.streams.get(&stream_id) {
                        let status = StatusCode::from_u16(status_code).unwrap_or(StatusCode::BAD_GATEWAY);
                        let header_map = strip_hop_by_hop(headers.unwrap_or_default());
                        stream.resolve_head(RespHead { status, headers: header_map });
                    }
                }
            }
            Frame::RespData {
                tunnel_id,
                stream_id,
                chunk,
            } => {
                if let Some(t) = tunnel.as_ref().filter(|t| t.tunnel_id == tunnel_id) {
                    if let Some(stream) = t.streams.get(&stream_id) {
                        stream.push_body(Bytes::from(chunk)).await;
                    }
                }
            }
            Frame::End {
                tunnel_id,
                stream_id,
                phase: EndPhase::Res,
                ..
            } => {
                if let Some(t) = tunnel.as_ref().filter(|t| t.tunnel_id == tunnel_id) {
                    if let Some((_, stream)) = t.streams.remove(&stream_id) {
                        stream.cancel_deadline();
                    }
                }
            }
            Frame::Ping => {
                let _ = control_tx.send(Frame::Pong);
            }
            // `OpenStream`/`ReqData`/request-phase `End` are server→client
            // only; `Pong`/`Error` from the client carry nothing to act on.
            _ => {}
        }
    }

    writer.abort();

    // Control-channel close: tear down the tunnel and fail any in-flight
    // streams (spec §4.3 "Tunnel teardown").
    if let Some(t) = tunnel {
        state.registry.remove(&t.subdomain);
        t.fail_all_streams(StreamFailure::TunnelClosed);
        info!(subdomain = %t.subdomain, "tunnel disconnected");
    }
}

fn strip_hop_by_hop(headers: Vec<(String, String)>) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        if HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h)) {
            continue;
        }
        let (Ok(name), Ok(value)) = (HeaderName::from_bytes(name.as_bytes()), HeaderValue::from_str(&value)) else {
            continue;
        };
        map.append(name, value);
    }
    map
}
