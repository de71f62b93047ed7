//! # Per-stream client-side state and origin bridge (spec §3, §4.2)
//!
//! One [`spawn`] call handles the full lifecycle of a single stream: it
//! accumulates (or pipes) the request body, issues the request against the
//! configured local origin with `reqwest`, and streams the response back as
//! `RESP_START` / `RESP_DATA` / `END` frames.

use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use futures::StreamExt;
use http::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT_ENCODING};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::warn;
use tunnel_protocol::{EndPhase, Frame, StreamId, TunnelId};

use crate::error::StreamError;

/// Capacity of the request-body pipe in `stream` mode. Bounding it gives the
/// public server's write side natural backpressure (spec §5).
const PIPE_CHANNEL_CAPACITY: usize = 32;

/// Events forwarded from the control read loop into a stream's task.
pub enum StreamEvent {
    Data(Bytes),
    End,
}

/// Which strategy a stream uses to hand the request body to `reqwest`
/// (spec §4.2 "Per-stream handling").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamMode {
    /// Accumulate the whole body, then issue the request with a fixed
    /// `content-length`. Used for non-GET/HEAD methods by default, since
    /// some origins mishandle chunked request bodies.
    Buffer,
    /// Issue the request immediately with a piped body.
    Stream,
}

/// Selects the buffer-vs-stream mode for an incoming request (spec §4.2).
pub fn select_mode(method: &str, force_stream: bool) -> StreamMode {
    if force_stream {
        return StreamMode::Stream;
    }
    match method.to_ascii_uppercase().as_str() {
        "GET" | "HEAD" => StreamMode::Stream,
        _ => StreamMode::Buffer,
    }
}

/// Builds the outbound request header map from the frame's header pairs,
/// rewriting `accept-encoding` per spec §4.2: removed by default (let the
/// origin compress freely), or replaced with `identity` when
/// `force_identity` is set.
pub fn build_header_map(headers: &[(String, String)], force_identity: bool) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        if name.eq_ignore_ascii_case("accept-encoding") {
            continue;
        }
        let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) else {
            continue;
        };
        map.append(name, value);
    }
    if force_identity {
        map.insert(ACCEPT_ENCODING, HeaderValue::from_static("identity"));
    }
    map
}

fn headers_to_pairs(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect()
}

/// Spawns the task that drives one stream end to end: collects the request
/// body per [`select_mode`], issues the request, and streams back the
/// response. Registers an event sender in `streams` so the control read
/// loop can forward `REQ_DATA`/`END` frames to it, and removes itself from
/// `streams` once the response phase terminates (spec §4.2 "Cleanup").
#[allow(clippy::too_many_arguments)]
pub fn spawn(
    tunnel_id: TunnelId,
    stream_id: StreamId,
    method: String,
    path: String,
    headers: Vec<(String, String)>,
    origin_base_url: String,
    http_client: reqwest::Client,
    control_tx: mpsc::UnboundedSender<Frame>,
    streams: Arc<DashMap<StreamId, mpsc::UnboundedSender<StreamEvent>>>,
    force_stream: bool,
    force_identity: bool,
) {
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    streams.insert(stream_id, event_tx);

    tokio::spawn(async move {
        run(
            tunnel_id,
            stream_id,
            method,
            path,
            headers,
            origin_base_url,
            http_client,
            control_tx,
            event_rx,
            force_stream,
            force_identity,
        )
        .await;
        streams.remove(&stream_id);
    });
}

#[allow(clippy::too_many_arguments)]
async fn run(
    tunnel_id: TunnelId,
    stream_id: StreamId,
    method: String,
    path: String,
    headers: Vec<(String, String)>,
    origin_base_url: String,
    http_client: reqwest::Client,
    control_tx: mpsc::UnboundedSender<Frame>,
    mut events: mpsc::UnboundedReceiver<StreamEvent>,
    force_stream: bool,
    force_identity: bool,
) {
    let http_method = match reqwest::Method::from_bytes(method.as_bytes()) {
        Ok(m) => m,
        Err(_) => {
            let err = StreamError::UnsupportedMethod(method.clone());
            warn!(tunnel_id = tunnel_id.0, stream_id = stream_id.0, error = %err, "rejecting stream");
            send_upstream_failure(&control_tx, tunnel_id, stream_id);
            return;
        }
    };
    let url = format!("{origin_base_url}{path}");
    let header_map = build_header_map(&headers, force_identity);
    let mode = select_mode(&method, force_stream);

    let response = match mode {
        StreamMode::Buffer => {
            let mut body = Vec::new();
            loop {
                match events.recv().await {
                    Some(StreamEvent::Data(chunk)) => body.extend_from_slice(&chunk),
                    Some(StreamEvent::End) | None => break,
                }
            }
            http_client
                .request(http_method, &url)
                .headers(header_map)
                .body(body)
                .send()
                .await
        }
        StreamMode::Stream => {
            let (body_tx, body_rx) = mpsc::channel::<Bytes>(PIPE_CHANNEL_CAPACITY);
            let body_stream = ReceiverStream::new(body_rx).map(Ok::<_, std::io::Error>);
            let request = http_client
                .request(http_method, &url)
                .headers(header_map)
                .body(reqwest::Body::wrap_stream(body_stream))
                .send();

            let forward = async move {
                while let Some(event) = events.recv().await {
                    match event {
                        StreamEvent::Data(chunk) => {
                            if body_tx.send(chunk).await.is_err() {
                                break;
                            }
                        }
                        StreamEvent::End => break,
                    }
                }
                // dropping body_tx here closes the request body stream.
            };
            let (response, _) = tokio::join!(request, forward);
            response
        }
    };

    let response = match response {
        Ok(response) => response,
        Err(e) => {
            warn!(tunnel_id = tunnel_id.0, stream_id = stream_id.0, error = %e, "origin request failed");
            send_upstream_failure(&control_tx, tunnel_id, stream_id);
            return;
        }
    };

    let status = response.status().as_u16();
    let response_headers = headers_to_pairs(response.headers());
    let _ = control_tx.send(Frame::RespStart {
        tunnel_id,
        stream_id,
        status_code: status,
        headers: Some(response_headers),
    });

    let mut body_stream = response.bytes_stream();
    while let Some(chunk) = body_stream.next().await {
        match chunk {
            Ok(bytes) => {
                if !bytes.is_empty() {
                    let _ = control_tx.send(Frame::RespData {
                        tunnel_id,
                        stream_id,
                        chunk: bytes.to_vec(),
                    });
                }
            }
            Err(e) => {
                warn!(tunnel_id = tunnel_id.0, stream_id = stream_id.0, error = %e, "origin response body read failed");
                break;
            }
        }
    }
    let _ = control_tx.send(Frame::End {
        tunnel_id,
        stream_id,
        phase: EndPhase::Res,
        status_code: Some(status),
    });
}

/// Upstream failure before or during the response (spec §4.2, §7.4):
/// `RESP_START statusCode=502` followed immediately by `END phase=res`,
/// never partial headers followed by a retroactive error.
fn send_upstream_failure(control_tx: &mpsc::UnboundedSender<Frame>, tunnel_id: TunnelId, stream_id: StreamId) {
    let _ = control_tx.send(Frame::RespStart {
        tunnel_id,
        stream_id,
        status_code: 502,
        headers: None,
    });
    let _ = control_tx.send(Frame::End {
        tunnel_id,
        stream_id,
        phase: EndPhase::Res,
        status_code: Some(502),
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_and_head_stream_by_default() {
        assert_eq!(select_mode("GET", false), StreamMode::Stream);
        assert_eq!(select_mode("get", false), StreamMode::Stream);
        assert_eq!(select_mode("HEAD", false), StreamMode::Stream);
    }

    #[test]
    fn other_methods_buffer_by_default() {
        assert_eq!(select_mode("POST", false), StreamMode::Buffer);
        assert_eq!(select_mode("PUT", false), StreamMode::Buffer);
        assert_eq!(select_mode("DELETE", false), StreamMode::Buffer);
    }

    #[test]
    fn force_stream_overrides_buffering() {
        assert_eq!(select_mode("POST", true), StreamMode::Stream);
    }

    #[test]
    fn accept_encoding_is_dropped_by_default() {
        let headers = vec![
            ("accept-encoding".to_string(), "gzip".to_string()),
            ("accept".to_string(), "*/*".to_string()),
        ];
        let map = build_header_map(&headers, false);
        assert!(!map.contains_key(ACCEPT_ENCODING));
        assert_eq!(map.get("accept").unwrap(), "*/*");
    }

    #[test]
    fn accept_encoding_becomes_identity_when_forced() {
        let headers = vec![("accept-encoding".to_string(), "gzip, br".to_string())];
        let map = build_header_map(&headers, true);
        assert_eq!(map.get(ACCEPT_ENCODING).unwrap(), "identity");
    }

    #[test]
    fn other_headers_pass_through_verbatim() {
        let headers = vec![("x-request-id".to_string(), "abc123".to_string())];
        let map = build_header_map(&headers, false);
        assert_eq!(map.get("x-request-id").unwrap(), "abc123");
    }

    /// Binds then immediately drops a listener, handing back a port with
    /// nothing behind it (a real, not mocked, connection refusal).
    fn refused_port() -> u16 {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    async fn spawn_echo_origin() -> (String, tokio::task::JoinHandle<()>) {
        let app = axum::Router::new()
            .route("/hello", axum::routing::get(|| async { "hello from origin" }))
            .route(
                "/echo",
                axum::routing::post(|body: axum::body::Bytes| async move { body }),
            );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}"), handle)
    }

    async fn drain_response(control_rx: &mut mpsc::UnboundedReceiver<Frame>) -> (u16, Vec<u8>) {
        let status = match control_rx.recv().await.expect("RESP_START frame") {
            Frame::RespStart { status_code, .. } => status_code,
            other => panic!("unexpected frame: {other:?}"),
        };
        let mut body = Vec::new();
        loop {
            match control_rx.recv().await.expect("RESP_DATA or END frame") {
                Frame::RespData { chunk, .. } => body.extend_from_slice(&chunk),
                Frame::End { phase: EndPhase::Res, status_code, .. } => {
                    assert_eq!(status_code, Some(status));
                    break;
                }
                other => panic!("unexpected frame: {other:?}"),
            }
        }
        (status, body)
    }

    #[tokio::test]
    async fn origin_down_yields_a_502_upstream_failure() {
        let port = refused_port();
        let (control_tx, mut control_rx) = mpsc::unbounded_channel();
        let streams = Arc::new(DashMap::new());

        spawn(
            TunnelId(1),
            StreamId(1),
            "GET".to_string(),
            "/".to_string(),
            vec![],
            format!("http://127.0.0.1:{port}"),
            reqwest::Client::new(),
            control_tx,
            streams,
            false,
            false,
        );

        match control_rx.recv().await.expect("RESP_START frame") {
            Frame::RespStart { status_code, headers, .. } => {
                assert_eq!(status_code, 502);
                assert!(headers.is_none());
            }
            other => panic!("unexpected frame: {other:?}"),
        }
        match control_rx.recv().await.expect("END frame") {
            Frame::End { phase: EndPhase::Res, status_code, .. } => assert_eq!(status_code, Some(502)),
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[tokio::test]
    async fn get_request_round_trips_the_origins_response_byte_for_byte() {
        let (origin_url, _origin) = spawn_echo_origin().await;
        let (control_tx, mut control_rx) = mpsc::unbounded_channel();
        let streams = Arc::new(DashMap::new());

        spawn(
            TunnelId(1),
            StreamId(1),
            "GET".to_string(),
            "/hello".to_string(),
            vec![],
            origin_url,
            reqwest::Client::new(),
            control_tx,
            streams.clone(),
            false,
            false,
        );

        // GET streams immediately; feed the request-phase END a real control
        // loop would have forwarded from the public server.
        let event_tx = streams.get(&StreamId(1)).expect("stream registered").value().clone();
        let _ = event_tx.send(StreamEvent::End);

        let (status, body) = drain_response(&mut control_rx).await;
        assert_eq!(status, 200);
        assert_eq!(body, b"hello from origin");
    }

    #[tokio::test]
    async fn post_body_round_trips_through_the_origin_echo() {
        let (origin_url, _origin) = spawn_echo_origin().await;
        let (control_tx, mut control_rx) = mpsc::unbounded_channel();
        let streams = Arc::new(DashMap::new());

        spawn(
            TunnelId(1),
            StreamId(1),
            "POST".to_string(),
            "/echo".to_string(),
            vec![],
            origin_url,
            reqwest::Client::new(),
            control_tx,
            streams.clone(),
            false,
            false,
        );

        let event_tx = streams.get(&StreamId(1)).expect("stream registered").value().clone();
        let _ = event_tx.send(StreamEvent::Data(Bytes::from_static(b"ping")));
        let _ = event_tx.send(StreamEvent::End);

        let (status, body) = drain_response(&mut control_rx).await;
        assert_eq!(status, 200);
        assert_eq!(body, b"ping");
    }
}
