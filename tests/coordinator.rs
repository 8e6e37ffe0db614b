use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use neopad_link::config::Config;
use neopad_link::coordinator::ServiceCoordinator;
use neopad_link::discovery::{
    BrowseEvent, DiscoveredHost, DiscoveryError, ResolvedService, ServiceBrowser, ServiceRecord,
};
use neopad_link::gamepad::ControllerKind;
use neopad_link::persistence::SessionStore;
use neopad_link::session::channel::{ControlLink, PeerLink};
use neopad_link::session::{
    duplex, ChannelError, ConnectFailure, ConnectionStatus, Connector, OpenRequest, RpcError,
    ServerFrame,
};
use serde_json::json;
use tokio::sync::mpsc;

struct FakeConnector {
    peers: mpsc::UnboundedSender<(OpenRequest, PeerLink)>,
}

impl Connector for FakeConnector {
    async fn open(&self, request: OpenRequest) -> Result<ControlLink, ChannelError> {
        let (link, peer) = duplex(16);
        self.peers
            .send((request, peer))
            .map_err(|_| ChannelError::Closed)?;
        Ok(link)
    }
}

// Announces nothing
struct QuietBrowser;

impl ServiceBrowser for QuietBrowser {
    async fn browse(
        &self,
        _service_type: &str,
    ) -> Result<mpsc::Receiver<BrowseEvent>, DiscoveryError> {
        let (_events, receiver) = mpsc::channel(1);
        Ok(receiver)
    }

    async fn resolve(&self, record: ServiceRecord) -> Result<ResolvedService, DiscoveryError> {
        Err(DiscoveryError::NoIpv4Address(record.name))
    }
}

type Coordinator = ServiceCoordinator<FakeConnector, QuietBrowser>;

fn scratch_file() -> PathBuf {
    std::env::temp_dir()
        .join(format!("neopad-coordinator-{}", uuid::Uuid::new_v4()))
        .join("session.toml")
}

async fn coordinator(
    path: &PathBuf,
) -> (Arc<Coordinator>, mpsc::UnboundedReceiver<(OpenRequest, PeerLink)>) {
    let config = Config {
        disconnect_grace_ms: 50,
        reconnect_delay_ms: 0,
        ..Config::default()
    };
    let sessions = SessionStore::load(path).await.unwrap();
    let (peers_tx, peers_rx) = mpsc::unbounded_channel();
    let coordinator = ServiceCoordinator::new(
        config,
        FakeConnector { peers: peers_tx },
        QuietBrowser,
        sessions,
    );
    (Arc::new(coordinator), peers_rx)
}

async fn accept(peer: &PeerLink, token: &str) {
    accept_on(peer, token, 0).await;
}

async fn accept_on(peer: &PeerLink, token: &str, port: u16) {
    let gamepads = json!([{"Id": 4, "Type": 1, "Name": "Pad", "ClientRefId": "C4", "LayoutId": ""}]);
    peer.outgoing
        .send(ServerFrame::Event {
            target: "Connected".to_string(),
            arguments: vec![json!({
                "token": token,
                "computer": "desk",
                "port": port,
                "gamepads": gamepads,
            })],
        })
        .await
        .unwrap();
}

async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    tokio::time::timeout(Duration::from_secs(2), async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached");
}

#[tokio::test]
async fn connect_publishes_state_and_saves_token() {
    let path = scratch_file();
    let (coordinator, mut peers) = coordinator(&path).await;
    let host = DiscoveredHost {
        display_name: "desk".to_string(),
        session_id: "s1".to_string(),
        address: "192.168.1.20".parse().unwrap(),
        port: 5000,
        expires_at: None,
    };

    let connecting = tokio::spawn({
        let coordinator = Arc::clone(&coordinator);
        async move { coordinator.connect_to(&host).await }
    });
    let (request, peer) = peers.recv().await.unwrap();
    assert_eq!(request.endpoint.url, "http://192.168.1.20:5000/pcxhub");
    accept(&peer, "tok-1").await;

    let info = connecting.await.unwrap().unwrap();
    assert_eq!(info.host_display_name, "desk");
    assert_eq!(coordinator.current_status(), ConnectionStatus::Connected);

    let sessions = coordinator.sessions();
    eventually(move || async move { sessions.saved_connection().await.is_some() }).await;
    let saved = sessions.saved_connection().await.unwrap();
    assert_eq!(saved.token, "tok-1");
    assert_eq!(saved.session_id, "s1");

    let info = coordinator.connection_info();
    let roster = coordinator.roster();
    eventually(|| {
        let ready = info.borrow().is_some() && roster.borrow().len() == 1;
        async move { ready }
    })
    .await;
    assert_eq!(roster.borrow()[0].kind, ControllerKind::Xbox);
    assert!(coordinator.input().await.is_some());

    coordinator.shutdown().await;
}

#[tokio::test]
async fn close_clears_params_then_downgrades() {
    let path = scratch_file();
    let (coordinator, mut peers) = coordinator(&path).await;

    let connecting = tokio::spawn({
        let coordinator = Arc::clone(&coordinator);
        async move {
            coordinator
                .connect_url("http://127.0.0.1:5000/pcxhub", "s1", None)
                .await
        }
    });
    let (_request, peer) = peers.recv().await.unwrap();
    accept(&peer, "tok-1").await;
    connecting.await.unwrap().unwrap();

    coordinator.close_connection().await;
    assert_eq!(coordinator.current_status(), ConnectionStatus::Disconnected);

    // the pump may still be applying events from before the close
    let sessions = coordinator.sessions();
    eventually(move || async move { sessions.saved_connection().await.is_none() }).await;
    let info = coordinator.connection_info();
    eventually(|| {
        let cleared = info.borrow().is_none();
        async move { cleared }
    })
    .await;
    assert_eq!(
        coordinator.add_gamepad("x", ControllerKind::Ps4, "").await,
        Err(RpcError::NotConnected)
    );

    let mut status = coordinator.status();
    tokio::time::timeout(
        Duration::from_secs(2),
        status.wait_for(|s| *s == ConnectionStatus::NotConnected),
    )
    .await
    .expect("status was not downgraded")
    .unwrap();

    coordinator.shutdown().await;
}

#[tokio::test]
async fn invalid_url_clears_saved_params() {
    let path = scratch_file();
    let (coordinator, _peers) = coordinator(&path).await;
    coordinator
        .sessions()
        .save_connection("http://10.0.0.2:5000/pcxhub", "s1", "tok")
        .await
        .unwrap();

    let result = coordinator.connect_url("ftp://nowhere", "s1", None).await;
    assert!(matches!(result, Err(ConnectFailure::InvalidUrl(_))));
    assert!(coordinator.sessions().saved_connection().await.is_none());
    assert_eq!(coordinator.current_status(), ConnectionStatus::NotConnected);

    coordinator.shutdown().await;
}

#[tokio::test]
async fn start_resumes_saved_session_and_shutdown_keeps_it() {
    let path = scratch_file();
    {
        let sessions = SessionStore::load(&path).await.unwrap();
        sessions
            .save_connection("http://127.0.0.1:5000/pcxhub", "s9", "saved-token")
            .await
            .unwrap();
    }

    let (coordinator, mut peers) = coordinator(&path).await;
    coordinator.start().await;

    let (request, peer) = peers.recv().await.unwrap();
    assert_eq!(request.headers["X-Session-Id"], "s9");
    assert_eq!(request.headers["X-Session-Token"], "saved-token");
    accept(&peer, "rotated-token").await;

    let sessions = coordinator.sessions();
    eventually(move || async move {
        sessions
            .saved_connection()
            .await
            .is_some_and(|saved| saved.token == "rotated-token")
    })
    .await;

    coordinator.shutdown().await;
    let reloaded = SessionStore::load(&path).await.unwrap();
    assert_eq!(
        reloaded.saved_connection().await.map(|saved| saved.token),
        Some("rotated-token".to_string())
    );
}

#[tokio::test]
async fn username_is_persisted_without_a_session() {
    let path = scratch_file();
    let (coordinator, _peers) = coordinator(&path).await;
    coordinator.set_username("bob").await.unwrap();

    let reloaded = SessionStore::load(&path).await.unwrap();
    assert_eq!(reloaded.username().await, "bob");
    coordinator.shutdown().await;
}

#[tokio::test]
async fn open_failure_forgets_saved_params() {
    let path = scratch_file();
    let (coordinator, peers) = coordinator(&path).await;
    // with nobody accepting links every open fails
    drop(peers);
    coordinator
        .sessions()
        .save_connection("http://127.0.0.1:5000/pcxhub", "s1", "tok")
        .await
        .unwrap();

    let result = coordinator
        .connect_url("http://127.0.0.1:5000/pcxhub", "s1", Some("tok".to_string()))
        .await;
    assert!(matches!(result, Err(ConnectFailure::ChannelOpen(_))));
    assert!(matches!(
        coordinator.current_status(),
        ConnectionStatus::Error(_)
    ));

    let sessions = coordinator.sessions();
    eventually(move || async move { sessions.saved_connection().await.is_none() }).await;
    assert!(coordinator.connection_info().borrow().is_none());
    coordinator.shutdown().await;
}

#[tokio::test]
async fn host_failure_after_connect_forgets_saved_params() {
    let path = scratch_file();
    let (coordinator, mut peers) = coordinator(&path).await;

    let connecting = tokio::spawn({
        let coordinator = Arc::clone(&coordinator);
        async move {
            coordinator
                .connect_url("http://127.0.0.1:5000/pcxhub", "s1", None)
                .await
        }
    });
    let (_request, peer) = peers.recv().await.unwrap();
    accept(&peer, "tok-1").await;
    connecting.await.unwrap().unwrap();

    let sessions = coordinator.sessions();
    eventually(move || async move { sessions.saved_connection().await.is_some() }).await;

    peer.outgoing
        .send(ServerFrame::Event {
            target: "ConnectionFailed".to_string(),
            arguments: vec![json!("session revoked")],
        })
        .await
        .unwrap();

    let mut status = coordinator.status();
    tokio::time::timeout(
        Duration::from_secs(2),
        status.wait_for(|s| matches!(s, ConnectionStatus::Error(_))),
    )
    .await
    .expect("status did not reach Error")
    .unwrap();

    let sessions = coordinator.sessions();
    eventually(move || async move { sessions.saved_connection().await.is_none() }).await;
    let info = coordinator.connection_info();
    let roster = coordinator.roster();
    eventually(|| {
        let cleared = info.borrow().is_none() && roster.borrow().is_empty();
        async move { cleared }
    })
    .await;
    assert!(coordinator.input().await.is_none());

    coordinator.shutdown().await;
}

#[tokio::test]
async fn streaming_failure_is_republished() {
    let path = scratch_file();
    let (coordinator, mut peers) = coordinator(&path).await;

    // unicast sockets may not send to the broadcast address
    let connecting = tokio::spawn({
        let coordinator = Arc::clone(&coordinator);
        async move {
            coordinator
                .connect_url("http://255.255.255.255:5000/pcxhub", "s1", None)
                .await
        }
    });
    let (_request, peer) = peers.recv().await.unwrap();
    accept_on(&peer, "tok-1", 9).await;
    connecting.await.unwrap().unwrap();

    let failure = coordinator.streaming_failure();
    eventually(|| {
        let failed = failure.borrow().is_some();
        async move { failed }
    })
    .await;
    assert_eq!(coordinator.current_status(), ConnectionStatus::Connected);

    coordinator.close_connection().await;
    eventually(|| {
        let cleared = failure.borrow().is_none();
        async move { cleared }
    })
    .await;
    coordinator.shutdown().await;
}
