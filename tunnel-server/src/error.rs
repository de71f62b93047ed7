//! Internal server errors (spec §6 ambient error handling). Never leaked
//! verbatim to a public caller — spec §7/§8 name the exact status codes
//! (404/502/504) that the public handler answers with instead.

use std::net::SocketAddr;

use thiserror::Error;

use crate::registry::SubdomainTaken;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("subdomain registration failed: {0}")]
    Registration(#[from] SubdomainTaken),
}
