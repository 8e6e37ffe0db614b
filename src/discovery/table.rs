use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use tokio::time::Instant;
use tracing::{debug, info};

/// A host seen on the local network
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredHost {
    pub display_name: String,
    pub session_id: String,
    pub address: Ipv4Addr,
    pub port: u16,
    // None while the host is announced, set once it is reported lost
    pub expires_at: Option<Instant>,
}

impl DiscoveredHost {
    pub fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|expires_at| now >= expires_at)
    }
}

/// Hosts keyed by service name; only the discovery actor writes to it
#[derive(Debug, Default)]
pub struct HostTable {
    entries: BTreeMap<String, DiscoveredHost>,
}

impl HostTable {
    /// Inserts or refreshes a host; a refreshed host never expires
    pub fn upsert(&mut self, host: DiscoveredHost) -> bool {
        let host = DiscoveredHost {
            expires_at: None,
            ..host
        };
        match self.entries.get(&host.display_name) {
            Some(existing) if *existing == host => false,
            _ => {
                info!(
                    "Host {} available at {}:{} (session {})",
                    host.display_name, host.address, host.port, host.session_id
                );
                self.entries.insert(host.display_name.clone(), host);
                true
            }
        }
    }

    /// Starts the grace period of a known host; unknown names are ignored
    pub fn mark_lost(&mut self, name: &str, expires_at: Instant) -> bool {
        match self.entries.get_mut(name) {
            Some(host) => {
                debug!("Host {} lost, keeping it for a grace period", name);
                host.expires_at = Some(expires_at);
                true
            }
            None => false,
        }
    }

    /// Starts the grace period of every host that is still announced
    pub fn mark_all_lost(&mut self, expires_at: Instant) -> bool {
        let mut changed = false;
        for host in self.entries.values_mut() {
            if host.expires_at.is_none() {
                host.expires_at = Some(expires_at);
                changed = true;
            }
        }
        changed
    }

    /// Removes expired hosts and returns how many went
    pub fn sweep(&mut self, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries.retain(|name, host| {
            let keep = !host.is_expired(now);
            if !keep {
                info!("Host {} expired", name);
            }
            keep
        });
        before - self.entries.len()
    }

    pub fn get(&self, name: &str) -> Option<&DiscoveredHost> {
        self.entries.get(name)
    }

    pub fn snapshot(&self) -> Vec<DiscoveredHost> {
        self.entries.values().cloned().collect()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
