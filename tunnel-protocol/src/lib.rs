//! # Tunnel wire protocol
//!
//! The binary frame codec shared by `tunnel-server` and `tunnel-client`.
//! A single control WebSocket connection carries many independently
//! framed HTTP request/response streams; every frame exchanged on that
//! connection is an [`Frame`], encoded with [`encode`] and decoded with
//! [`decode`]. Keeping this in its own crate (rather than duplicating the
//! enum on both ends, as is easy to get out of sync) means the server and
//! client can never disagree about what a tag means.

mod frame;

pub use frame::{EndPhase, ErrorCode, Frame, FrameError, StreamId, TunnelId, PROTOCOL_VERSION};

/// Encodes a [`Frame`] to its wire representation.
///
/// One encoded frame maps to exactly one WebSocket binary message — the
/// transport (not this codec) is responsible for preserving message
/// boundaries, so frames are not length-prefixed here.
pub fn encode(frame: &Frame) -> Vec<u8> {
    // `bincode::serialize` cannot fail for the types in `Frame` (no maps
    // with non-string keys, no untagged enums), so this is infallible in
    // practice; we still surface a Result from `decode` for the input we
    // don't control.
    bincode::serialize(frame).expect("Frame is always serializable")
}

/// Decodes a wire-format buffer into a [`Frame`].
///
/// Returns [`FrameError::Malformed`] for anything that doesn't parse.
/// Callers (per spec) should log and discard on error rather than tear
/// down the control connection — framing errors are not fatal.
pub fn decode(bytes: &[u8]) -> Result<Frame, FrameError> {
    bincode::deserialize(bytes).map_err(|e| FrameError::Malformed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn headers(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn roundtrip(frame: Frame) {
        let bytes = encode(&frame);
        let decoded = decode(&bytes).expect("decode must succeed for a frame we just encoded");
        assert_eq!(format!("{frame:?}"), format!("{decoded:?}"));
    }

    #[test]
    fn hello_roundtrips_with_and_without_token() {
        roundtrip(Frame::Hello {
            v: PROTOCOL_VERSION,
            token: Some("secret".into()),
        });
        roundtrip(Frame::Hello {
            v: PROTOCOL_VERSION,
            token: None,
        });
    }

    #[test]
    fn register_tunnel_roundtrips() {
        roundtrip(Frame::RegisterTunnel {
            subdomain: Some("my-app".into()),
        });
        roundtrip(Frame::RegisterTunnel { subdomain: None });
    }

    #[test]
    fn registered_roundtrips() {
        roundtrip(Frame::Registered {
            subdomain: "my-app".into(),
            tunnel_id: TunnelId(7),
        });
    }

    #[test]
    fn open_stream_roundtrips_with_repeated_headers() {
        roundtrip(Frame::OpenStream {
            tunnel_id: TunnelId(1),
            stream_id: StreamId(1),
            method: "GET".into(),
            path: "/ping".into(),
            headers: headers(&[("accept", "*/*"), ("cookie", "a=1"), ("cookie", "b=2")]),
        });
    }

    #[test]
    fn data_frames_roundtrip() {
        roundtrip(Frame::ReqData {
            tunnel_id: TunnelId(1),
            stream_id: StreamId(2),
            chunk: vec![1, 2, 3, 4, 5],
        });
        roundtrip(Frame::RespData {
            tunnel_id: TunnelId(1),
            stream_id: StreamId(2),
            chunk: vec![],
        });
    }

    #[test]
    fn resp_start_roundtrips() {
        roundtrip(Frame::RespStart {
            tunnel_id: TunnelId(1),
            stream_id: StreamId(2),
            status_code: 200,
            headers: Some(headers(&[("content-type", "application/json")])),
        });
    }

    #[test]
    fn end_roundtrips_both_phases() {
        roundtrip(Frame::End {
            tunnel_id: TunnelId(1),
            stream_id: StreamId(2),
            phase: EndPhase::Req,
            status_code: None,
        });
        roundtrip(Frame::End {
            tunnel_id: TunnelId(1),
            stream_id: StreamId(2),
            phase: EndPhase::Res,
            status_code: Some(200),
        });
    }

    #[test]
    fn error_and_keepalive_roundtrip() {
        roundtrip(Frame::Error {
            code: ErrorCode::SubdomainTaken,
            message: Some("taken".into()),
        });
        roundtrip(Frame::Ping);
        roundtrip(Frame::Pong);
    }

    #[test]
    fn headers_preserve_order_and_duplicates() {
        let original = headers(&[("x-a", "1"), ("x-b", "2"), ("x-a", "3")]);
        let frame = Frame::OpenStream {
            tunnel_id: TunnelId(1),
            stream_id: StreamId(1),
            method: "POST".into(),
            path: "/".into(),
            headers: original.clone(),
        };
        let bytes = encode(&frame);
        match decode(&bytes).unwrap() {
            Frame::OpenStream { headers, .. } => assert_eq!(headers, original),
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn decode_rejects_garbage() {
        let garbage = vec![0xff; 4];
        assert!(decode(&garbage).is_err());
    }

    #[test]
    fn header_vec_survives_as_map_when_needed() {
        // Consumers are free to fold the ordered Vec into a HashMap; make
        // sure nothing about the wire format prevents that.
        let pairs = headers(&[("a", "1"), ("b", "2")]);
        let map: HashMap<_, _> = pairs.iter().cloned().collect();
        assert_eq!(map.get("a").map(String::as_str), Some("1"));
    }
}
