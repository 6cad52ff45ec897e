use std::collections::BTreeMap;
use std::net::TcpListener;
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PortError {
    #[error("port {port} is already claimed by instance '{holder}'")]
    Claimed { port: u16, holder: String },
    #[error("{}", unavailable_message(.port, .owner))]
    Unavailable { port: u16, owner: Option<String> },
}

fn unavailable_message(port: &u16, owner: &Option<String>) -> String {
    match owner {
        Some(owner) => format!("port {} is already in use by {}", port, owner),
        None => format!("port {} is already in use", port),
    }
}

pub fn check_port_available(port: u16) -> bool {
    TcpListener::bind(("0.0.0.0", port)).is_ok()
}

/// Identify which process owns a given port.
pub fn identify_port_owner(port: u16) -> Option<String> {
    crate::platform::identify_port_owner(port)
}

/// Serializes port claims across every instance's sessions.
///
/// Claims are held by [`PortLease`] values and released when the lease is
/// dropped. The lock is only held for the claim/release bookkeeping.
#[derive(Debug, Clone)]
pub struct PortAllocator {
    claimed: Arc<Mutex<BTreeMap<u16, String>>>,
    verify_free: bool,
}

impl Default for PortAllocator {
    fn default() -> Self {
        Self::new(true)
    }
}

impl PortAllocator {
    /// With `verify_free`, a claim also checks that nothing outside this
    /// process is bound to the port.
    pub fn new(verify_free: bool) -> Self {
        Self {
            claimed: Arc::new(Mutex::new(BTreeMap::new())),
            verify_free,
        }
    }

    pub fn claim(&self, port: u16, holder: &str) -> Result<PortLease, PortError> {
        self.claim_inner(port, holder, self.verify_free)
    }

    /// Claim a port that a live process we are adopting already listens on.
    pub fn claim_adopted(&self, port: u16, holder: &str) -> Result<PortLease, PortError> {
        self.claim_inner(port, holder, false)
    }

    fn claim_inner(&self, port: u16, holder: &str, verify: bool) -> Result<PortLease, PortError> {
        let mut claimed = self.claimed.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = claimed.get(&port) {
            return Err(PortError::Claimed {
                port,
                holder: existing.clone(),
            });
        }
        if verify && !check_port_available(port) {
            return Err(PortError::Unavailable {
                port,
                owner: identify_port_owner(port),
            });
        }
        claimed.insert(port, holder.to_string());
        debug!(port, holder, "port claimed");
        Ok(PortLease {
            port,
            claimed: self.claimed.clone(),
        })
    }

    pub fn holder(&self, port: u16) -> Option<String> {
        self.claimed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&port)
            .cloned()
    }

    pub fn claimed_ports(&self) -> Vec<u16> {
        self.claimed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .copied()
            .collect()
    }
}

/// An exclusive claim on one port.
#[derive(Debug)]
pub struct PortLease {
    port: u16,
    claimed: Arc<Mutex<BTreeMap<u16, String>>>,
}

impl PortLease {
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl Drop for PortLease {
    fn drop(&mut self) {
        let mut claimed = self.claimed.lock().unwrap_or_else(|e| e.into_inner());
        claimed.remove(&self.port);
        debug!(port = self.port, "port released");
    }
}
