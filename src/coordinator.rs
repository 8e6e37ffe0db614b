//! # Service Coordinator
//!
//! Composition root of the client. It owns the discovery service, the
//! persisted identity and the current [`ControlSession`], and republishes
//! what the UI needs as `watch` streams:
//!
//! - connection status
//! - connection info (only while connected)
//! - device roster
//! - available hosts
//! - why input streaming last stopped, if it failed
//!
//! Session events are handled by a single pump task, in the order sessions
//! emit them, so a stale `Disconnected` from a closed session is always
//! applied before anything the next session reports.

use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use color_eyre::Result;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::discovery::{DiscoveredHost, DiscoveryService, ServiceBrowser};
use crate::gamepad::{ControllerKind, GamepadStore};
use crate::persistence::SessionStore;
use crate::session::{
    ConnectFailure, ConnectionInfo, ConnectionStatus, Connector, ControlSession, RpcError,
    SessionEvent, SessionParams, StatusCell, VirtualDevice,
};

struct Shared {
    sessions: SessionStore,
    info: watch::Sender<Option<ConnectionInfo>>,
    roster: watch::Sender<Vec<VirtualDevice>>,
    streaming_failure: watch::Sender<Option<String>>,
}

pub struct ServiceCoordinator<C: Connector, B: ServiceBrowser> {
    config: Config,
    connector: C,
    discovery: DiscoveryService<B>,
    status: Arc<StatusCell>,
    shared: Arc<Shared>,
    session: Mutex<Option<ControlSession>>,
    events: mpsc::UnboundedSender<SessionEvent>,
    pump: StdMutex<Option<JoinHandle<()>>>,
    cancel: CancellationToken,
}

impl<C: Connector, B: ServiceBrowser> ServiceCoordinator<C, B> {
    pub fn new(config: Config, connector: C, browser: B, sessions: SessionStore) -> Self {
        let discovery = DiscoveryService::new(browser, Some(config.discovery_settings()));
        let (info, _) = watch::channel(None);
        let (roster, _) = watch::channel(Vec::new());
        let (streaming_failure, _) = watch::channel(None);
        let shared = Arc::new(Shared {
            sessions,
            info,
            roster,
            streaming_failure,
        });

        let (events, receiver) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let pump = tokio::spawn(run_event_pump(
            Arc::clone(&shared),
            receiver,
            cancel.clone(),
        ));

        Self {
            config,
            connector,
            discovery,
            status: Arc::new(StatusCell::new()),
            shared,
            session: Mutex::new(None),
            events,
            pump: StdMutex::new(Some(pump)),
            cancel,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.subscribe()
    }

    pub fn current_status(&self) -> ConnectionStatus {
        self.status.current()
    }

    pub fn connection_info(&self) -> watch::Receiver<Option<ConnectionInfo>> {
        self.shared.info.subscribe()
    }

    pub fn roster(&self) -> watch::Receiver<Vec<VirtualDevice>> {
        self.shared.roster.subscribe()
    }

    /// Reason the send loop of the current session died, if it did
    pub fn streaming_failure(&self) -> watch::Receiver<Option<String>> {
        self.shared.streaming_failure.subscribe()
    }

    pub fn hosts(&self) -> watch::Receiver<Vec<DiscoveredHost>> {
        self.discovery.hosts()
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.shared.sessions
    }

    pub async fn current_session(&self) -> Option<ControlSession> {
        self.session.lock().await.clone()
    }

    /// Starts discovery and resumes the saved session, if any
    pub async fn start(self: &Arc<Self>) {
        if let Err(e) = self.discovery.start_discovery().await {
            warn!("Discovery unavailable: {}", e);
        }

        let Some(saved) = self.shared.sessions.saved_connection().await else {
            debug!("No saved session to resume");
            return;
        };
        info!(
            "Resuming session {} saved {}",
            saved.session_id,
            saved.saved_at.format("%Y-%m-%d %H:%M:%S")
        );

        let this = Arc::clone(self);
        let delay = self.config.reconnect_delay();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = this
                .connect_url(&saved.url, &saved.session_id, Some(saved.token))
                .await
            {
                warn!("Could not resume saved session: {}", e);
            }
        });
    }

    /// Connects to a discovered host, closing any current session first
    pub async fn connect_to(
        &self,
        host: &DiscoveredHost,
    ) -> Result<ConnectionInfo, ConnectFailure> {
        let url = format!(
            "http://{}:{}/{}",
            host.address, host.port, self.config.control_path
        );
        info!("Connecting to host {} at {}", host.display_name, url);
        self.connect_url(&url, &host.session_id, None).await
    }

    pub async fn connect_url(
        &self,
        url: &str,
        session_id: &str,
        token: Option<String>,
    ) -> Result<ConnectionInfo, ConnectFailure> {
        let session = {
            let mut current = self.session.lock().await;
            if let Some(previous) = current.take() {
                previous.close().await;
            }

            let params = SessionParams {
                url: url.to_string(),
                session_id: session_id.to_string(),
                device_id: self.shared.sessions.device_id().await,
                username: self.shared.sessions.username().await,
                token,
            };
            let session = match ControlSession::new(
                params,
                self.config.session_settings(),
                Arc::clone(&self.status),
                self.events.clone(),
            ) {
                Ok(session) => session,
                Err(failure) => {
                    warn!("Refusing to connect: {}", failure);
                    if let Err(e) = self.shared.sessions.clear_connection().await {
                        warn!("Failed to clear saved session: {}", e);
                    }
                    return Err(failure);
                }
            };
            *current = Some(session.clone());
            session
        };

        session.connect(&self.connector).await
    }

    /// Self-initiated close: Disconnected now, NotConnected after the grace
    /// period unless a newer attempt has started by then
    pub async fn close_connection(&self) {
        if let Err(e) = self.shared.sessions.clear_connection().await {
            warn!("Failed to clear saved session: {}", e);
        }

        let session = self.session.lock().await.take();
        match session {
            Some(session) => session.close().await,
            None => debug!("No session to close"),
        }
        self.shared.info.send_replace(None);

        let generation = self.status.generation();
        let status = Arc::clone(&self.status);
        let grace = self.config.disconnect_grace();
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            status.downgrade_if_idle(generation);
        });
    }

    async fn connected_session(&self) -> Result<ControlSession, RpcError> {
        self.current_session()
            .await
            .filter(ControlSession::is_connected)
            .ok_or(RpcError::NotConnected)
    }

    pub async fn add_gamepad(
        &self,
        name: &str,
        kind: ControllerKind,
        layout_id: &str,
    ) -> Result<VirtualDevice, RpcError> {
        self.connected_session()
            .await?
            .add_device(name, kind, layout_id)
            .await
    }

    /// Like [`add_gamepad`](Self::add_gamepad); `callback` runs exactly once
    pub fn add_gamepad_with<F>(
        self: &Arc<Self>,
        name: String,
        kind: ControllerKind,
        layout_id: String,
        callback: F,
    ) where
        F: FnOnce(Result<VirtualDevice, RpcError>) + Send + 'static,
    {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            callback(this.add_gamepad(&name, kind, &layout_id).await);
        });
    }

    pub async fn delete_gamepad(&self, client_ref_id: &str) -> Result<(), RpcError> {
        self.connected_session()
            .await?
            .remove_device(client_ref_id)
            .await
    }

    /// Like [`delete_gamepad`](Self::delete_gamepad); `callback` runs exactly once
    pub fn delete_gamepad_with<F>(self: &Arc<Self>, client_ref_id: String, callback: F)
    where
        F: FnOnce(Result<(), RpcError>) + Send + 'static,
    {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            callback(this.delete_gamepad(&client_ref_id).await);
        });
    }

    /// Stores the name locally, then tells the host if connected
    pub async fn set_username(&self, username: &str) -> Result<()> {
        self.shared.sessions.set_username(username).await?;
        if let Ok(session) = self.connected_session().await {
            if let Err(e) = session.set_username(username).await {
                warn!("Host did not take the new username: {}", e);
            }
        }
        Ok(())
    }

    /// Live device store for input setters; only while connected
    pub async fn input(&self) -> Option<Arc<GamepadStore>> {
        self.connected_session()
            .await
            .ok()
            .map(|session| session.store())
    }

    pub async fn shutdown(&self) {
        info!("Shutting down coordinator");
        // Stop the pump first so the saved session survives for the next start
        self.cancel.cancel();
        let pump = self
            .pump
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(pump) = pump {
            if let Err(e) = pump.await {
                warn!("Event pump ended abnormally: {}", e);
            }
        }

        let session = self.session.lock().await.take();
        if let Some(session) = session {
            session.close().await;
        }
        self.discovery.stop_discovery().await;
    }
}

async fn run_event_pump(
    shared: Arc<Shared>,
    mut events: mpsc::UnboundedReceiver<SessionEvent>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            biased;
            event = events.recv() => event,
            _ = cancel.cancelled() => None,
        };
        let Some(event) = event else { break };

        match event {
            SessionEvent::TokenRotated {
                url,
                session_id,
                token,
            } => {
                if let Err(e) = shared
                    .sessions
                    .save_connection(&url, &session_id, &token)
                    .await
                {
                    warn!("Failed to save session parameters: {}", e);
                }
            }
            SessionEvent::Connected(info) => {
                shared.streaming_failure.send_replace(None);
                shared.info.send_replace(Some(info));
            }
            SessionEvent::InfoUpdated(info) => {
                shared.info.send_replace(Some(info));
            }
            SessionEvent::StreamingFailed(reason) => {
                warn!("Input streaming failed: {}", reason);
                shared.streaming_failure.send_replace(Some(reason));
            }
            SessionEvent::RosterChanged(roster) => {
                shared.roster.send_replace(roster);
            }
            SessionEvent::Disconnected | SessionEvent::ConnectionFailed(_) => {
                shared.info.send_replace(None);
                shared.roster.send_replace(Vec::new());
                shared.streaming_failure.send_replace(None);
                if let Err(e) = shared.sessions.clear_connection().await {
                    warn!("Failed to clear saved session: {}", e);
                }
            }
        }
    }
    debug!("Event pump stopped");
}
