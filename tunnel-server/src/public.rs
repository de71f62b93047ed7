//! # Public HTTP traffic path (spec §4.3 "Public-request handling",
//! "Response handling", "Deadline")
//!
//! The fallback route for every host other than the control endpoint.
//! `axum` has no literal socket hijack; the equivalent here is handing back
//! a [`Body::from_stream`] fed by a channel nothing auto-terminates until
//! the channel closes (spec §9 "Hijacking") — the handler returns as soon
//! as it has a status line, and the body drains asynchronously as frames
//! arrive on the owning tunnel's control connection.

use std::time::Duration;

use axum::body::Body;
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures::StreamExt;
use http::{Request, StatusCode};
use serde_json::json;
use tokio::sync::oneshot;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{info, warn};
use tunnel_protocol::{EndPhase, Frame};

use crate::subdomain;
use crate::tunnel::{Stream, StreamFailure};
use crate::AppState;

/// Stream deadline (spec §4.3 "Deadline", §8 scenario 6).
const STREAM_DEADLINE: Duration = Duration::from_secs(30);

/// Logs one completed public request (spec §6 `LOG_ALL_REQUESTS`): every
/// request at `info` when the flag is set, otherwise only non-2xx outcomes,
/// at `warn`.
fn log_completion(log_all_requests: bool, method: &str, host: &str, path: &str, status: StatusCode) {
    if log_all_requests {
        info!(method, host, path, status = status.as_u16(), "request completed");
    } else if !status.is_success() {
        warn!(method, host, path, status = status.as_u16(), "request completed");
    }
}

pub async fn handle_public_request(State(state): State<AppState>, req: Request<Body>) -> Response {
    let log_all_requests = state.config.log_all_requests;
    let host = req
        .headers()
        .get(http::header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    let method = req.method().as_str().to_string();
    let path = req
        .uri()
        .path_and_query()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());

    let Some(label) = subdomain::extract(&host, &state.config.domain_base) else {
        log_completion(log_all_requests, &method, &host, &path, StatusCode::NOT_FOUND);
        return StatusCode::NOT_FOUND.into_response();
    };

    let Some(tunnel) = state.registry.get(&label) else {
        log_completion(log_all_requests, &method, &host, &path, StatusCode::BAD_GATEWAY);
        return json_error(StatusCode::BAD_GATEWAY, "Tunnel not connected");
    };

    let stream_id = tunnel.alloc_stream_id();
    let headers: Vec<(String, String)> = req
        .headers()
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect();

    let (stream_state, resp_head_rx, body_rx) = Stream::new();
    let stream_state = std::sync::Arc::new(stream_state);
    tunnel.streams.insert(stream_id, stream_state.clone());

    let (cancel_tx, cancel_rx) = oneshot::channel();
    stream_state.set_deadline_cancel(cancel_tx);

    let tunnel_id = tunnel.tunnel_id;
    let _ = tunnel.control_tx.send(Frame::OpenStream {
        tunnel_id,
        stream_id,
        method: method.clone(),
        path: path.clone(),
        headers,
    });

    // Request-body forwarding (spec §4.3): a chunk per `REQ_DATA`, then a
    // request-side `END`; bodyless methods end immediately.
    if matches!(method.as_str(), "GET" | "HEAD") {
        let _ = tunnel.control_tx.send(Frame::End {
            tunnel_id,
            stream_id,
            phase: EndPhase::Req,
            status_code: None,
        });
    } else {
        let control_tx = tunnel.control_tx.clone();
        let mut body_stream = req.into_body().into_data_stream();
        tokio::spawn(async move {
            while let Some(chunk) = body_stream.next().await {
                match chunk {
                    Ok(bytes) if !bytes.is_empty() => {
                        let _ = control_tx.send(Frame::ReqData {
                            tunnel_id,
                            stream_id,
                            chunk: bytes.to_vec(),
                        });
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "error reading public request body");
                        break;
                    }
                }
            }
            let _ = control_tx.send(Frame::End {
                tunnel_id,
                stream_id,
                phase: EndPhase::Req,
                status_code: None,
            });
        });
    }

    // Deadline task: abandons the stream if `RESP_START` never arrives
    // (spec §4.3 "Deadline").
    let deadline_tunnel = tunnel.clone();
    let deadline_stream = stream_state.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::time::sleep(STREAM_DEADLINE) => {
                if deadline_tunnel.streams.remove(&stream_id).is_some() {
                    deadline_stream.fail(StreamFailure::Timeout);
                }
            }
            _ = cancel_rx => {}
        }
    });

    let response = match resp_head_rx.await {
        Ok(Ok(head)) => {
            let mut builder = Response::builder().status(head.status);
            if let Some(builder_headers) = builder.headers_mut() {
                *builder_headers = head.headers;
            }
            let body = Body::from_stream(ReceiverStream::new(body_rx).map(Ok::<Bytes, std::io::Error>));
            builder.body(body).unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
        }
        // Deadline elapsed before `RESP_START`: 504 if headers were never
        // sent (always true here, since `resolve_head` is what would have
        // produced `Ok` above).
        Ok(Err(StreamFailure::Timeout)) => json_error(StatusCode::GATEWAY_TIMEOUT, "Stream timed out"),
        // Owning control connection closed before `RESP_START` arrived.
        Ok(Err(StreamFailure::TunnelClosed)) => json_error(StatusCode::BAD_GATEWAY, "Tunnel disconnected"),
        // The stream's `Stream` was dropped without a resolution (shouldn't
        // happen in practice, but fail safe rather than hang).
        Err(_) => json_error(StatusCode::BAD_GATEWAY, "Tunnel disconnected"),
    };
    log_completion(log_all_requests, &method, &host, &path, response.status());
    response
}

fn json_error(status: StatusCode, message: &str) -> Response {
    (status, axum::Json(json!({ "error": message }))).into_response()
}
