use std::collections::BTreeMap;
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::table::{DiscoveredHost, HostTable};

pub const SESSION_ID_ATTRIBUTE: &str = "sessionId";
pub const TIMESTAMP_ATTRIBUTE: &str = "timestamp";

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("mDNS daemon failed: {0}")]
    Mdns(String),

    #[error("Service {0} was announced but never resolved")]
    Unresolved(String),

    #[error("Service {0} has no IPv4 address")]
    NoIpv4Address(String),
}

// Discovery settings
#[derive(Clone, Debug)]
pub struct DiscoverySettings {
    pub service_type: String,
    pub lost_grace: Duration,
    pub sweep_interval: Duration,
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self {
            service_type: "_neopad._tcp".to_string(),
            lost_grace: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(5),
        }
    }
}

/// A service seen by a browser, not yet resolved
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRecord {
    pub name: String,
    pub service_type: String,
    pub attributes: BTreeMap<String, String>,
}

/// Addresses, port and attributes of a resolved service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedService {
    pub name: String,
    pub addresses: Vec<IpAddr>,
    pub port: u16,
    pub attributes: BTreeMap<String, String>,
}

impl ResolvedService {
    pub fn ipv4(&self) -> Option<Ipv4Addr> {
        self.addresses.iter().find_map(|address| match address {
            IpAddr::V4(v4) => Some(*v4),
            IpAddr::V6(_) => None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrowseEvent {
    Found(ServiceRecord),
    Lost { name: String },
}

/// Source of service announcements on the local network
pub trait ServiceBrowser: Send + Sync + 'static {
    /// Starts browsing; events stop when the receiver is dropped
    fn browse(
        &self,
        service_type: &str,
    ) -> impl Future<Output = Result<mpsc::Receiver<BrowseEvent>, DiscoveryError>> + Send;

    fn resolve(
        &self,
        record: ServiceRecord,
    ) -> impl Future<Output = Result<ResolvedService, DiscoveryError>> + Send;
}

#[derive(Debug)]
struct Worker {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Keeps a live list of hosts announcing the configured service type.
///
/// A single actor task owns the [`HostTable`]; resolves run concurrently on a
/// `JoinSet` and report back to it. Lost hosts linger for a grace period so a
/// flapping announcement does not make them blink in and out.
pub struct DiscoveryService<B: ServiceBrowser> {
    browser: Arc<B>,
    settings: DiscoverySettings,
    hosts: watch::Sender<Vec<DiscoveredHost>>,
    worker: Mutex<Option<Worker>>,
}

impl<B: ServiceBrowser> DiscoveryService<B> {
    pub fn new(browser: B, settings: Option<DiscoverySettings>) -> Self {
        let (hosts, _) = watch::channel(Vec::new());
        Self {
            browser: Arc::new(browser),
            settings: settings.unwrap_or_default(),
            hosts,
            worker: Mutex::new(None),
        }
    }

    pub fn hosts(&self) -> watch::Receiver<Vec<DiscoveredHost>> {
        self.hosts.subscribe()
    }

    pub fn current_hosts(&self) -> Vec<DiscoveredHost> {
        self.hosts.borrow().clone()
    }

    pub async fn is_running(&self) -> bool {
        self.worker
            .lock()
            .await
            .as_ref()
            .is_some_and(|worker| !worker.task.is_finished())
    }

    /// Starts browsing from a clean table; a running browse is reset first
    pub async fn start_discovery(&self) -> Result<(), DiscoveryError> {
        let mut worker = self.worker.lock().await;
        if let Some(previous) = worker.take() {
            stop_worker(previous).await;
        }
        self.hosts.send_replace(Vec::new());

        info!("Starting discovery for {}", self.settings.service_type);
        let events = self.browser.browse(&self.settings.service_type).await?;
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_discovery(
            Arc::clone(&self.browser),
            self.settings.clone(),
            events,
            self.hosts.clone(),
            cancel.clone(),
        ));

        *worker = Some(Worker { cancel, task });
        Ok(())
    }

    /// Stops browsing and empties the published list
    pub async fn stop_discovery(&self) {
        let previous = self.worker.lock().await.take();
        if let Some(previous) = previous {
            info!("Stopping discovery");
            stop_worker(previous).await;
        }
        self.hosts.send_replace(Vec::new());
    }
}

async fn stop_worker(worker: Worker) {
    worker.cancel.cancel();
    if let Err(e) = worker.task.await {
        warn!("Discovery task ended abnormally: {}", e);
    }
}

async fn run_discovery<B: ServiceBrowser>(
    browser: Arc<B>,
    settings: DiscoverySettings,
    mut events: mpsc::Receiver<BrowseEvent>,
    hosts: watch::Sender<Vec<DiscoveredHost>>,
    cancel: CancellationToken,
) {
    let mut table = HostTable::default();
    let mut resolves: JoinSet<(String, Result<ResolvedService, DiscoveryError>)> = JoinSet::new();
    let mut browsing = true;

    let mut sweep = tokio::time::interval_at(
        Instant::now() + settings.sweep_interval,
        settings.sweep_interval,
    );
    sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let publish = |table: &HostTable| {
        hosts.send_replace(table.snapshot());
    };

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            event = events.recv(), if browsing => match event {
                Some(BrowseEvent::Found(record)) => {
                    if !record.service_type.contains(&settings.service_type) {
                        debug!("Ignoring {} of type {}", record.name, record.service_type);
                        continue;
                    }
                    let browser = Arc::clone(&browser);
                    let name = record.name.clone();
                    resolves.spawn(async move { (name, browser.resolve(record).await) });
                }
                Some(BrowseEvent::Lost { name }) => {
                    if table.mark_lost(&name, Instant::now() + settings.lost_grace) {
                        publish(&table);
                    }
                }
                None => {
                    warn!("Service browser stopped, expiring remaining hosts");
                    browsing = false;
                    if table.mark_all_lost(Instant::now() + settings.lost_grace) {
                        publish(&table);
                    }
                }
            },

            Some(joined) = resolves.join_next(), if !resolves.is_empty() => {
                let (name, resolved) = match joined {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        warn!("Resolve task failed: {}", e);
                        continue;
                    }
                };
                let changed = match resolved {
                    Ok(service) => match host_from(service) {
                        Some(host) => table.upsert(host),
                        None => false,
                    },
                    Err(e) => {
                        warn!("Resolve failed for {}: {}", name, e);
                        table.mark_lost(&name, Instant::now() + settings.lost_grace)
                    }
                };
                if changed {
                    publish(&table);
                }
            }

            _ = sweep.tick() => {
                if table.sweep(Instant::now()) > 0 {
                    publish(&table);
                }
            }
        }
    }

    resolves.abort_all();
    debug!("Discovery task stopped");
}

fn host_from(service: ResolvedService) -> Option<DiscoveredHost> {
    let Some(session_id) = service.attributes.get(SESSION_ID_ATTRIBUTE) else {
        debug!("{} announces no session, ignoring", service.name);
        return None;
    };
    let Some(address) = service.ipv4() else {
        warn!("{} has no IPv4 address, ignoring", service.name);
        return None;
    };
    let timestamp = service
        .attributes
        .get(TIMESTAMP_ATTRIBUTE)
        .map(String::as_str)
        .unwrap_or("unknown");
    debug!("Resolved {} (timestamp {})", service.name, timestamp);

    Some(DiscoveredHost {
        display_name: service.name,
        session_id: session_id.clone(),
        address,
        port: service.port,
        expires_at: None,
    })
}
