//! # Tunnel registry (spec §4.4)
//!
//! The single process-wide mutable structure on the server: `subdomain ->
//! Tunnel`. Backed by `DashMap` for lock-free concurrent access, same as
//! the reference server's agent/connection registries.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tunnel_protocol::{Frame, TunnelId};

use crate::subdomain;
use crate::tunnel::Tunnel;

/// Registration failed because every candidate subdomain was taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("subdomain taken")]
pub struct SubdomainTaken;

/// How many times to retry with a freshly synthesized random label if a
/// collision is hit (spec §4.3: "If a collision still occurs (race),
/// respond with ERROR code=SUBDOMAIN_TAKEN").
const MAX_RANDOM_RETRIES: usize = 5;

pub struct Registry {
    tunnels: DashMap<String, Arc<Tunnel>>,
    next_tunnel_id: std::sync::atomic::AtomicU64,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            tunnels: DashMap::new(),
            next_tunnel_id: std::sync::atomic::AtomicU64::new(1),
        }
    }

    /// Accepts a `REGISTER_TUNNEL` request. Uses the requested subdomain
    /// if it's syntactically valid and free; otherwise synthesizes a
    /// random 7-char base-36 label. Retries a bounded number of times on
    /// collision before giving up with [`SubdomainTaken`] (spec §4.3).
    pub fn register(
        &self,
        requested: Option<String>,
        control_tx: mpsc::UnboundedSender<Frame>,
    ) -> Result<Arc<Tunnel>, SubdomainTaken> {
        if let Some(label) = requested.filter(|s| subdomain::is_valid_label(s)) {
            if let Some(tunnel) = self.try_insert(label, control_tx.clone()) {
                return Ok(tunnel);
            }
            // requested label was taken; fall through to a random one.
        }

        for _ in 0..MAX_RANDOM_RETRIES {
            let label = subdomain::random_label();
            if let Some(tunnel) = self.try_insert(label, control_tx.clone()) {
                return Ok(tunnel);
            }
        }
        Err(SubdomainTaken)
    }

    fn try_insert(&self, label: String, control_tx: mpsc::UnboundedSender<Frame>) -> Option<Arc<Tunnel>> {
        use dashmap::mapref::entry::Entry;
        match self.tunnels.entry(label.clone()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                let tunnel_id = TunnelId(self.next_tunnel_id.fetch_add(1, std::sync::atomic::Ordering::SeqCst));
                let tunnel = Arc::new(Tunnel::new(label, tunnel_id, control_tx));
                slot.insert(tunnel.clone());
                Some(tunnel)
            }
        }
    }

    pub fn get(&self, subdomain: &str) -> Option<Arc<Tunnel>> {
        self.tunnels.get(subdomain).map(|r| r.clone())
    }

    pub fn remove(&self, subdomain: &str) {
        self.tunnels.remove(subdomain);
    }
}
