//! # Control connection (spec §4.2)
//!
//! Dials the server's `/connect` WebSocket, performs the HELLO /
//! REGISTER_TUNNEL handshake, and runs the inbound frame dispatch loop for
//! the lifetime of the process. There is no reconnect loop here: per spec
//! §7.6 "the client terminates the process" on transport loss, unlike the
//! reference Tauri agent's auto-reconnect (a UX concern that doesn't apply
//! to a one-shot CLI process run under a supervisor).

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{info, warn};
use tunnel_protocol::{decode, encode, EndPhase, Frame, StreamId, PROTOCOL_VERSION};
use url::Url;

use crate::config::ClientConfig;
use crate::stream::{self, StreamEvent};

/// Connect timeout for dialing the control URL (spec §4.2 "≈8 s").
const CONNECT_TIMEOUT: Duration = Duration::from_secs(8);

/// Runs the control connection to completion: connect, register, dispatch
/// frames until the connection closes.
pub async fn run(config: ClientConfig) -> Result<()> {
    let (ws_stream, _) =
        tokio::time::timeout(CONNECT_TIMEOUT, connect_async(config.connect_url.as_str()))
            .await
            .map_err(|_| anyhow::anyhow!("timed out connecting to {}", config.connect_url))?
            .with_context(|| format!("failed to connect to {}", config.connect_url))?;

    info!(url = %config.connect_url, "connected to tunnel server");

    let (mut ws_sink, mut ws_source) = ws_stream.split();
    let (control_tx, mut control_rx) = mpsc::unbounded_channel::<Frame>();

    // One writer task per control connection (spec §5): every frame is
    // written as a single WebSocket binary message, so concurrent stream
    // tasks sending frames through `control_tx` can never interleave a
    // partial frame.
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

    let _ = control_tx.send(Frame::Hello {
        v: PROTOCOL_VERSION,
        token: config.token.clone(),
    });
    let _ = control_tx.send(Frame::RegisterTunnel {
        subdomain: config.subdomain.clone(),
    });

    let http_client = reqwest::Client::new();
    let origin_base_url = config.origin_base_url();
    let domain_base = config
        .domain_base_override
        .clone()
        .unwrap_or_else(|| host_of(&config.connect_url));
    let streams: Arc<DashMap<StreamId, mpsc::UnboundedSender<StreamEvent>>> = Arc::new(DashMap::new());
    let mut registered = false;

    while let Some(message) = ws_source.next().await {
        let message = match message {
            Ok(m) => m,
            Err(e) => {
                warn!(error = %e, "control socket error");
                break;
            }
        };
        let bytes = match message {
            Message::Binary(b) => b,
            Message::Close(_) => break,
            _ => continue,
        };
        // Framing errors are local and non-fatal (spec §7.1): log and
        // discard rather than tear down the control connection.
        let frame = match decode(&bytes) {
            Ok(f) => f,
            Err(e) => {
                warn!(error = %e, "malformed frame, discarding");
                continue;
            }
        };

        match frame {
            Frame::Registered { subdomain, tunnel_id } => {
                registered = true;
                println!("your url is: https://{subdomain}.{domain_base}");
                info!(subdomain = %subdomain, tunnel_id = tunnel_id.0, "tunnel registered");
            }
            Frame::OpenStream {
                tunnel_id,
                stream_id,
                method,
                path,
                headers,
            } => {
                stream::spawn(
                    tunnel_id,
                    stream_id,
                    method,
                    path,
                    headers,
                    origin_base_url.clone(),
                    http_client.clone(),
                    control_tx.clone(),
                    streams.clone(),
                    config.force_stream,
                    config.force_identity,
                );
            }
            Frame::ReqData { stream_id, chunk, .. } => {
                if let Some(tx) = streams.get(&stream_id) {
                    let _ = tx.send(StreamEvent::Data(chunk.into()));
                }
            }
            Frame::End {
                stream_id,
                phase: EndPhase::Req,
                ..
            } => {
                if let Some(tx) = streams.get(&stream_id) {
                    let _ = tx.send(StreamEvent::End);
                }
            }
            Frame::Error { code, message } => {
                warn!(?code, message = message.as_deref().unwrap_or(""), "server reported an error");
            }
            Frame::Ping => {
                let _ = control_tx.send(Frame::Pong);
            }
            // `RegisterTunnel`, `Hello`, response-phase `End`, and `Pong`
            // are never sent server→client; unknown/irrelevant frames are
            // ignored (spec §4.1 forward compatibility).
            _ => {}
        }
    }

    writer.abort();
    if !registered {
        anyhow::bail!("control connection closed before the tunnel was registered");
    }
    info!("control connection closed");
    Ok(())
}

fn host_of(connect_url: &str) -> String {
    Url::parse(connect_url)
        .ok()
        .and_then(|u| u.host_str().map(String::from))
        .unwrap_or_else(|| "localhost".to_string())
}
