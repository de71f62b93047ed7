use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Wire protocol version. Bumped on breaking frame-shape changes; a
/// mismatch is logged by the server and otherwise ignored (negotiation
/// semantics are undefined in v1 — see spec §4.1, §9).
pub const PROTOCOL_VERSION: u32 = 1;

/// Server-assigned identifier for a registered tunnel, unique for the
/// process lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TunnelId(pub u64);

/// Per-tunnel stream identifier. Allocated strictly increasingly by the
/// server, starting at 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamId(pub u64);

/// Which half of a request/response pair an `End` frame terminates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EndPhase {
    /// The request body is fully sent (server→client direction).
    Req,
    /// The response body is fully sent (client→server direction).
    Res,
}

/// Machine-readable error codes carried by [`Frame::Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    /// The requested (or synthesized) subdomain collided with an existing
    /// registration; the client should retry with a different name.
    SubdomainTaken,
    /// Catch-all for conditions not worth a dedicated variant.
    Other,
}

/// A single frame on the tunnel control channel (spec §4.1).
///
/// Each variant corresponds to one row of the frame table. Headers are
/// represented as an ordered `Vec<(String, String)>` rather than a map so
/// that repeated header names (`Set-Cookie`, ...) and original ordering
/// survive the round trip — see spec §9 "Header maps".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Frame {
    /// client→server: opens the control channel.
    Hello { v: u32, token: Option<String> },

    /// client→server: requests a subdomain (or asks the server to pick one).
    RegisterTunnel { subdomain: Option<String> },

    /// server→client: the subdomain actually bound to this connection.
    Registered {
        subdomain: String,
        tunnel_id: TunnelId,
    },

    /// server→client: a new public request arrived; start a stream.
    OpenStream {
        tunnel_id: TunnelId,
        stream_id: StreamId,
        method: String,
        path: String,
        headers: Vec<(String, String)>,
    },

    /// server→client: a chunk of the public request body.
    ReqData {
        tunnel_id: TunnelId,
        stream_id: StreamId,
        chunk: Vec<u8>,
    },

    /// client→server: the origin produced status + headers.
    RespStart {
        tunnel_id: TunnelId,
        stream_id: StreamId,
        status_code: u16,
        headers: Option<Vec<(String, String)>>,
    },

    /// client→server: a chunk of the origin response body.
    RespData {
        tunnel_id: TunnelId,
        stream_id: StreamId,
        chunk: Vec<u8>,
    },

    /// both directions: terminates one phase of a stream.
    End {
        tunnel_id: TunnelId,
        stream_id: StreamId,
        phase: EndPhase,
        status_code: Option<u16>,
    },

    /// both directions: an out-of-band error not tied to a stream body.
    Error {
        code: ErrorCode,
        message: Option<String>,
    },

    /// both directions: application-level keepalive.
    Ping,
    Pong,
}

/// Errors raised while decoding a frame off the wire.
#[derive(Debug, Error)]
pub enum FrameError {
    /// The buffer did not decode to a valid `Frame`. Per spec §7.1 this is
    /// a local, non-fatal condition: callers log and discard rather than
    /// tear down the control connection.
    #[error("malformed frame: {0}")]
    Malformed(String),
}
