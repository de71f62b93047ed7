//! Library-shaped errors for per-stream origin dispatch (spec §6 ambient
//! error handling). The process boundary (`main.rs`) deals in
//! `anyhow::Result`; this is for the smaller, typed failures raised while
//! preparing a stream's request.

use thiserror::Error;

/// Raised while translating an `OPEN_STREAM` frame into an outbound
/// request against the local origin.
#[derive(Debug, Error)]
pub enum StreamError {
    /// The frame's `method` isn't a valid HTTP method token.
    #[error("unsupported HTTP method: {0}")]
    UnsupportedMethod(String),
}
