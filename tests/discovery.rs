use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Mutex;
use std::time::Duration;

use neopad_link::discovery::{
    BrowseEvent, DiscoveredHost, DiscoveryError, DiscoveryService, DiscoverySettings,
    ResolvedService, ServiceBrowser, ServiceRecord,
};
use tokio::sync::{mpsc, watch};

const SERVICE_TYPE: &str = "_neopad._tcp";

struct FakeBrowser {
    events: Mutex<Option<mpsc::Receiver<BrowseEvent>>>,
}

impl FakeBrowser {
    fn new() -> (Self, mpsc::Sender<BrowseEvent>) {
        let (tx, rx) = mpsc::channel(16);
        (
            Self {
                events: Mutex::new(Some(rx)),
            },
            tx,
        )
    }
}

impl ServiceBrowser for FakeBrowser {
    async fn browse(
        &self,
        _service_type: &str,
    ) -> Result<mpsc::Receiver<BrowseEvent>, DiscoveryError> {
        self.events
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| DiscoveryError::Mdns("browse called twice".to_string()))
    }

    async fn resolve(&self, record: ServiceRecord) -> Result<ResolvedService, DiscoveryError> {
        if record.name == "unreachable" {
            return Err(DiscoveryError::Unresolved(record.name));
        }
        Ok(ResolvedService {
            name: record.name,
            addresses: vec![IpAddr::V4(Ipv4Addr::new(192, 168, 1, 20))],
            port: 5000,
            attributes: record.attributes,
        })
    }
}

fn found(name: &str, service_type: &str, session_id: Option<&str>) -> BrowseEvent {
    let mut attributes = BTreeMap::new();
    if let Some(session_id) = session_id {
        attributes.insert("sessionId".to_string(), session_id.to_string());
    }
    BrowseEvent::Found(ServiceRecord {
        name: name.to_string(),
        service_type: service_type.to_string(),
        attributes,
    })
}

fn settings() -> DiscoverySettings {
    DiscoverySettings {
        service_type: SERVICE_TYPE.to_string(),
        lost_grace: Duration::from_secs(30),
        sweep_interval: Duration::from_secs(1),
    }
}

async fn next_hosts(hosts: &mut watch::Receiver<Vec<DiscoveredHost>>) -> Vec<DiscoveredHost> {
    hosts.changed().await.unwrap();
    hosts.borrow_and_update().clone()
}

#[tokio::test(start_paused = true)]
async fn lost_host_lingers_for_grace_period() {
    let (browser, events) = FakeBrowser::new();
    let discovery = DiscoveryService::new(browser, Some(settings()));
    discovery.start_discovery().await.unwrap();
    let mut hosts = discovery.hosts();

    events
        .send(found("desk", "_neopad._tcp.local.", Some("s1")))
        .await
        .unwrap();
    let listed = next_hosts(&mut hosts).await;
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].display_name, "desk");
    assert_eq!(listed[0].session_id, "s1");
    assert_eq!(listed[0].address, Ipv4Addr::new(192, 168, 1, 20));
    assert_eq!(listed[0].port, 5000);
    assert_eq!(listed[0].expires_at, None);

    events
        .send(BrowseEvent::Lost {
            name: "desk".to_string(),
        })
        .await
        .unwrap();
    let listed = next_hosts(&mut hosts).await;
    assert!(listed[0].expires_at.is_some());

    tokio::time::sleep(Duration::from_secs(29)).await;
    assert_eq!(discovery.current_hosts().len(), 1);

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(discovery.current_hosts().is_empty());

    discovery.stop_discovery().await;
    assert!(!discovery.is_running().await);
}

#[tokio::test(start_paused = true)]
async fn reannounce_cancels_expiry() {
    let (browser, events) = FakeBrowser::new();
    let discovery = DiscoveryService::new(browser, Some(settings()));
    discovery.start_discovery().await.unwrap();
    let mut hosts = discovery.hosts();

    events.send(found("desk", SERVICE_TYPE, Some("s1"))).await.unwrap();
    next_hosts(&mut hosts).await;
    events
        .send(BrowseEvent::Lost {
            name: "desk".to_string(),
        })
        .await
        .unwrap();
    next_hosts(&mut hosts).await;

    tokio::time::sleep(Duration::from_secs(10)).await;
    events.send(found("desk", SERVICE_TYPE, Some("s1"))).await.unwrap();
    let listed = next_hosts(&mut hosts).await;
    assert_eq!(listed[0].expires_at, None);

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(discovery.current_hosts().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn unusable_announcements_are_ignored() {
    let (browser, events) = FakeBrowser::new();
    let discovery = DiscoveryService::new(browser, Some(settings()));
    discovery.start_discovery().await.unwrap();
    let mut hosts = discovery.hosts();

    events.send(found("printer", "_ipp._tcp", Some("s0"))).await.unwrap();
    events.send(found("anonymous", SERVICE_TYPE, None)).await.unwrap();
    events.send(found("unreachable", SERVICE_TYPE, Some("s2"))).await.unwrap();
    events.send(found("desk", SERVICE_TYPE, Some("s1"))).await.unwrap();

    let listed = next_hosts(&mut hosts).await;
    let names: Vec<_> = listed.iter().map(|h| h.display_name.as_str()).collect();
    assert_eq!(names, ["desk"]);
}

#[tokio::test(start_paused = true)]
async fn browser_ending_expires_hosts() {
    let (browser, events) = FakeBrowser::new();
    let discovery = DiscoveryService::new(browser, Some(settings()));
    discovery.start_discovery().await.unwrap();
    let mut hosts = discovery.hosts();

    events.send(found("desk", SERVICE_TYPE, Some("s1"))).await.unwrap();
    next_hosts(&mut hosts).await;
    drop(events);

    let listed = next_hosts(&mut hosts).await;
    assert!(listed[0].expires_at.is_some());
    tokio::time::sleep(Duration::from_secs(31)).await;
    assert!(discovery.current_hosts().is_empty());
    assert!(discovery.is_running().await);
}

#[tokio::test]
async fn restart_begins_with_an_empty_list() {
    let (browser, events) = FakeBrowser::new();
    let discovery = DiscoveryService::new(browser, Some(settings()));
    discovery.start_discovery().await.unwrap();
    let mut hosts = discovery.hosts();

    events.send(found("desk", SERVICE_TYPE, Some("s1"))).await.unwrap();
    next_hosts(&mut hosts).await;
    assert_eq!(discovery.current_hosts().len(), 1);

    discovery.stop_discovery().await;
    assert!(discovery.current_hosts().is_empty());
    // the fake only hands out one event stream
    assert!(discovery.start_discovery().await.is_err());
}
