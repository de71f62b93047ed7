//! # Tunnel and stream state (spec §3)
//!
//! A [`Tunnel`] is one registry entry: a subdomain bound to exactly one
//! control connection. Its [`Stream`] map holds the per-request state that
//! bridges a hijacked public response to frames arriving later on the
//! control channel.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use bytes::Bytes;
use dashmap::DashMap;
use http::{HeaderMap, StatusCode};
use tokio::sync::{mpsc, oneshot};
use tunnel_protocol::{Frame, StreamId, TunnelId};

/// Capacity of the per-stream response body channel. Bounding it gives the
/// public-client-facing write a natural backpressure signal into the
/// control connection's read loop (spec §5 "Backpressure").
const BODY_CHANNEL_CAPACITY: usize = 32;

/// Why a stream ended without ever producing a `RespHead`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamFailure {
    /// The stream's deadline elapsed before `RESP_START` arrived.
    Timeout,
    /// The owning control connection closed before `RESP_START` arrived.
    TunnelClosed,
}

/// Status + headers extracted from a `RESP_START` frame, with hop-by-hop
/// headers already stripped (spec §4.3 "Response handling").
pub struct RespHead {
    pub status: StatusCode,
    pub headers: HeaderMap,
}

/// Per-stream state (spec §3, server side).
pub struct Stream {
    headers_sent: AtomicBool,
    resp_head_tx: Mutex<Option<oneshot::Sender<Result<RespHead, StreamFailure>>>>,
    body_tx: mpsc::Sender<Bytes>,
    cancel_deadline: Mutex<Option<oneshot::Sender<()>>>,
}

impl Stream {
    /// Creates a new stream's state along with the two halves the public
    /// handler holds onto directly: the oneshot that resolves to the
    /// response head (or a failure reason), and the receiver for response
    /// body chunks.
    pub fn new() -> (
        Stream,
        oneshot::Receiver<Result<RespHead, StreamFailure>>,
        mpsc::Receiver<Bytes>,
    ) {
        let (resp_head_tx, resp_head_rx) = oneshot::channel();
        let (body_tx, body_rx) = mpsc::channel(BODY_CHANNEL_CAPACITY);
        let stream = Stream {
            headers_sent: AtomicBool::new(false),
            resp_head_tx: Mutex::new(Some(resp_head_tx)),
            body_tx,
            cancel_deadline: Mutex::new(None),
        };
        (stream, resp_head_rx, body_rx)
    }

    /// Installs the cancel handle for this stream's deadline task. Called
    /// once, right after the deadline task is spawned.
    pub fn set_deadline_cancel(&self, cancel_tx: oneshot::Sender<()>) {
        *self.cancel_deadline.lock().unwrap() = Some(cancel_tx);
    }

    /// `RESP_START`: idempotent — a second arrival for the same stream is
    /// silently ignored (spec §4.3 "idempotent guard on headersSent").
    pub fn resolve_head(&self, head: RespHead) {
        if !self.headers_sent.swap(true, Ordering::SeqCst) {
            if let Some(tx) = self.resp_head_tx.lock().unwrap().take() {
                let _ = tx.send(Ok(head));
            }
        }
    }

    /// `RESP_DATA`: forward a body chunk to the public response. Bounded
    /// and awaited inline by the control connection's read loop — a slow
    /// public client stalls ingestion of further frames on this tunnel,
    /// which is the "couple writes to the upstream via synchronous
    /// channels" backpressure spec §5 asks for.
    pub async fn push_body(&self, chunk: Bytes) {
        let _ = self.body_tx.send(chunk).await;
    }

    /// Ends the stream normally (`END phase=res`): cancels the deadline
    /// timer and lets the caller drop this `Stream` from the registry,
    /// which drops `body_tx` and closes the response body cleanly once
    /// any buffered chunks have drained.
    pub fn cancel_deadline(&self) {
        if let Some(tx) = self.cancel_deadline.lock().unwrap().take() {
            let _ = tx.send(());
        }
    }

    /// Fails the stream with a reason. If headers were already sent this
    /// is a no-op here — the caller is expected to have already removed
    /// the stream from the registry, which drops `body_tx` and ends the
    /// response body abruptly (spec: "close the body abruptly").
    pub fn fail(&self, reason: StreamFailure) {
        if let Some(tx) = self.resp_head_tx.lock().unwrap().take() {
            let _ = tx.send(Err(reason));
        }
    }

}

/// A registered tunnel: one subdomain, one control connection (spec §3).
pub struct Tunnel {
    pub subdomain: String,
    pub tunnel_id: TunnelId,
    pub control_tx: mpsc::UnboundedSender<Frame>,
    pub created_at: Instant,
    next_stream_id: AtomicU64,
    pub streams: DashMap<StreamId, std::sync::Arc<Stream>>,
}

impl Tunnel {
    pub fn new(subdomain: String, tunnel_id: TunnelId, control_tx: mpsc::UnboundedSender<Frame>) -> Self {
        Self {
            subdomain,
            tunnel_id,
            control_tx,
            created_at: Instant::now(),
            next_stream_id: AtomicU64::new(1),
            streams: DashMap::new(),
        }
    }

    /// Allocates the next `streamId`: strictly increasing, starting at 1
    /// (spec §3 invariant, §8 "Stream monotonicity").
    pub fn alloc_stream_id(&self) -> StreamId {
        StreamId(self.next_stream_id.fetch_add(1, Ordering::SeqCst))
    }

    /// Fails every in-flight stream belonging to this tunnel (spec §4.3
    /// "Tunnel teardown"). Drains the map so each `Stream` is dropped
    /// after failing it, closing any already-open response bodies.
    pub fn fail_all_streams(&self, reason: StreamFailure) {
        for (_, stream) in self.streams.clone().into_iter() {
            stream.fail(reason);
        }
        self.streams.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolve_head_is_idempotent() {
        let (stream, resp_head_rx, _body_rx) = Stream::new();
        stream.resolve_head(RespHead {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
        });
        stream.resolve_head(RespHead {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            headers: HeaderMap::new(),
        });
        let head = resp_head_rx.await.unwrap().unwrap();
        assert_eq!(head.status, StatusCode::OK);
    }

    #[tokio::test]
    async fn fail_before_headers_sent_delivers_failure() {
        let (stream, resp_head_rx, _body_rx) = Stream::new();
        stream.fail(StreamFailure::Timeout);
        let result = resp_head_rx.await.unwrap();
        assert_eq!(result.unwrap_err(), StreamFailure::Timeout);
    }

    #[tokio::test]
    async fn stream_ids_are_monotonic_from_one() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let tunnel = Tunnel::new("abc".into(), TunnelId(1), tx);
        assert_eq!(tunnel.alloc_stream_id(), StreamId(1));
        assert_eq!(tunnel.alloc_stream_id(), StreamId(2));
        assert_eq!(tunnel.alloc_stream_id(), StreamId(3));
    }
}
