//! DNS-SD browser over multicast DNS
//!
//! Hosts register an instance of the service type (`_neopad._tcp.local.`) with
//! TXT attributes `sessionId` and `timestamp`. The mDNS daemon resolves
//! instances on its own; resolved records are cached here and handed out by
//! [`ServiceBrowser::resolve`].

use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::service::{BrowseEvent, DiscoveryError, ResolvedService, ServiceBrowser, ServiceRecord};

// How often the pump checks whether anyone still listens
const POLL_INTERVAL: Duration = Duration::from_millis(250);

type ResolvedCache = Arc<Mutex<HashMap<String, ResolvedService>>>;

fn cache(cache: &ResolvedCache) -> MutexGuard<'_, HashMap<String, ResolvedService>> {
    cache.lock().unwrap_or_else(PoisonError::into_inner)
}

/// `_neopad._tcp` → `_neopad._tcp.local.`
pub fn qualified_type(service_type: &str) -> String {
    let trimmed = service_type.trim_end_matches('.');
    if trimmed.ends_with(".local") {
        format!("{trimmed}.")
    } else {
        format!("{trimmed}.local.")
    }
}

/// Instance part of a full name, `desk._neopad._tcp.local.` → `desk`
pub fn instance_name(fullname: &str, ty_domain: &str) -> String {
    fullname
        .strip_suffix(ty_domain)
        .map(|name| name.trim_end_matches('.'))
        .unwrap_or(fullname)
        .to_string()
}

pub fn resolved_from(info: &ServiceInfo, ty_domain: &str) -> ResolvedService {
    let mut addresses: Vec<IpAddr> = info.get_addresses().iter().copied().collect();
    addresses.sort();
    let attributes: BTreeMap<String, String> = info
        .get_properties()
        .iter()
        .map(|property| (property.key().to_string(), property.val_str().to_string()))
        .collect();

    ResolvedService {
        name: instance_name(info.get_fullname(), ty_domain),
        addresses,
        port: info.get_port(),
        attributes,
    }
}

/// [`ServiceBrowser`] backed by an `mdns-sd` daemon
pub struct MdnsBrowser {
    daemon: ServiceDaemon,
    resolved: ResolvedCache,
}

impl MdnsBrowser {
    pub fn new() -> Result<Self, DiscoveryError> {
        let daemon = ServiceDaemon::new().map_err(|e| DiscoveryError::Mdns(e.to_string()))?;
        Ok(Self {
            daemon,
            resolved: Arc::new(Mutex::new(HashMap::new())),
        })
    }
}

impl Drop for MdnsBrowser {
    fn drop(&mut self) {
        if let Err(e) = self.daemon.shutdown() {
            debug!("mDNS daemon shutdown: {}", e);
        }
    }
}

impl ServiceBrowser for MdnsBrowser {
    async fn browse(
        &self,
        service_type: &str,
    ) -> Result<mpsc::Receiver<BrowseEvent>, DiscoveryError> {
        let ty_domain = qualified_type(service_type);
        let receiver = self
            .daemon
            .browse(&ty_domain)
            .map_err(|e| DiscoveryError::Mdns(e.to_string()))?;
        info!("Browsing mDNS for {}", ty_domain);
        cache(&self.resolved).clear();

        let (events, browse_events) = mpsc::channel(64);
        let daemon = self.daemon.clone();
        let resolved = Arc::clone(&self.resolved);

        // The daemon hands out a blocking receiver; drain it off the runtime
        tokio::task::spawn_blocking(move || {
            loop {
                if events.is_closed() {
                    break;
                }
                let event = match receiver.recv_timeout(POLL_INTERVAL) {
                    Ok(event) => event,
                    Err(_) if receiver.is_disconnected() => {
                        warn!("mDNS daemon stopped browsing {}", ty_domain);
                        break;
                    }
                    Err(_) => continue,
                };

                let forwarded = match event {
                    ServiceEvent::ServiceResolved(service) => {
                        let service = resolved_from(&service, &ty_domain);
                        debug!("mDNS resolved {} on port {}", service.name, service.port);
                        let record = ServiceRecord {
                            name: service.name.clone(),
                            service_type: ty_domain.clone(),
                            attributes: service.attributes.clone(),
                        };
                        cache(&resolved).insert(service.name.clone(), service);
                        BrowseEvent::Found(record)
                    }
                    ServiceEvent::ServiceRemoved(_, fullname) => {
                        let name = instance_name(&fullname, &ty_domain);
                        cache(&resolved).remove(&name);
                        BrowseEvent::Lost { name }
                    }
                    other => {
                        debug!("mDNS event {:?}", other);
                        continue;
                    }
                };
                if events.blocking_send(forwarded).is_err() {
                    break;
                }
            }

            if let Err(e) = daemon.stop_browse(&ty_domain) {
                debug!("Stopping mDNS browse: {}", e);
            }
            debug!("mDNS pump for {} stopped", ty_domain);
        });

        Ok(browse_events)
    }

    async fn resolve(&self, record: ServiceRecord) -> Result<ResolvedService, DiscoveryError> {
        cache(&self.resolved)
            .get(&record.name)
            .cloned()
            .ok_or(DiscoveryError::Unresolved(record.name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TY: &str = "_neopad._tcp.local.";

    #[test]
    fn qualifies_service_types() {
        assert_eq!(qualified_type("_neopad._tcp"), TY);
        assert_eq!(qualified_type("_neopad._tcp."), TY);
        assert_eq!(qualified_type(TY), TY);
    }

    #[test]
    fn strips_type_from_full_names() {
        assert_eq!(instance_name("DESKTOP-7Q2._neopad._tcp.local.", TY), "DESKTOP-7Q2");
        assert_eq!(instance_name("odd-name", TY), "odd-name");
    }

    #[test]
    fn resolved_record_carries_txt_attributes() {
        let properties = [("sessionId", "s1"), ("timestamp", "2025-01-04T18:22:10Z")];
        let info = ServiceInfo::new(
            TY,
            "desk",
            "desk.local.",
            "192.168.1.20",
            5000,
            &properties[..],
        )
        .unwrap();

        let service = resolved_from(&info, TY);
        assert_eq!(service.name, "desk");
        assert_eq!(service.port, 5000);
        assert_eq!(service.ipv4(), Some("192.168.1.20".parse().unwrap()));
        assert_eq!(service.attributes.get("sessionId").unwrap(), "s1");
        assert!(service.attributes.contains_key("timestamp"));
    }
}
