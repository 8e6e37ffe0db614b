use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::channel::{ControlEndpoint, ControlLink, Connector, OpenRequest};
use super::protocol::{
    AddGamepadRequest, ClientCall, ClientFrame, ConnectedPayload, GamepadInfo, ServerEvent,
    ServerFrame, VirtualDevice, DELETE_OK, DEVICE_ID_HEADER, SESSION_ID_HEADER,
    SESSION_TOKEN_HEADER, USERNAME_HEADER,
};
use super::status::{ConnectFailure, ConnectionStatus, StatusCell};
use crate::gamepad::{ControllerKind, GamepadStore, TriggerMode};
use crate::transport::{SenderSettings, SenderState, TransportSender};

/// Identity and credentials for one connection attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionParams {
    pub url: String,
    pub session_id: String,
    pub device_id: String,
    pub username: String,
    // Token from an earlier session, lets the host resume it
    pub token: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub handshake_timeout: Duration,
    pub rpc_timeout: Duration,
    pub sender: SenderSettings,
    pub trigger_mode: TriggerMode,
    pub soft_trigger_tick: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(10),
            rpc_timeout: Duration::from_secs(10),
            sender: SenderSettings::default(),
            trigger_mode: TriggerMode::Hard,
            soft_trigger_tick: Duration::from_millis(10),
        }
    }
}

/// What the UI shows about a live session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub session_id: String,
    pub control_url: String,
    pub host_display_name: String,
    pub username: String,
}

/// Notifications a session hands to its owner
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    TokenRotated {
        url: String,
        session_id: String,
        token: String,
    },
    Connected(ConnectionInfo),
    InfoUpdated(ConnectionInfo),
    RosterChanged(Vec<VirtualDevice>),
    Disconnected,
    ConnectionFailed(ConnectFailure),
    // The send loop died; the control channel stays up
    StreamingFailed(String),
}

/// Who ended the session; decides which terminal path runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClosingOrigin {
    None,
    Host,
    SelfInitiated,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RpcError {
    #[error("Not connected")]
    NotConnected,

    #[error("Failed to encode call: {0}")]
    Encode(String),

    #[error("Malformed response: {0}")]
    Malformed(String),

    #[error("Host answered with status {0}")]
    Status(i64),

    #[error("Host reported an error: {0}")]
    Remote(String),

    #[error("Control channel closed before the call completed")]
    ChannelClosed,

    #[error("Call timed out")]
    Timeout,
}

type Reply = Result<Value, RpcError>;
type HandshakeSignal = oneshot::Sender<Result<ConnectionInfo, ConnectFailure>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Default)]
struct LinkSlot {
    outgoing: Option<mpsc::Sender<ClientFrame>>,
    shutdown: Option<CancellationToken>,
}

#[derive(Debug, Default)]
struct HostInfo {
    display_name: String,
    data_port: u16,
}

#[derive(Debug)]
struct SessionInner {
    session_id: String,
    device_id: String,
    token: Option<String>,
    username: Mutex<String>,
    endpoint: ControlEndpoint,
    settings: SessionSettings,
    status: Arc<StatusCell>,
    events: mpsc::UnboundedSender<SessionEvent>,

    store: Arc<GamepadStore>,
    sender: TransportSender,
    roster: Mutex<Vec<VirtualDevice>>,
    host: Mutex<HostInfo>,

    link: Mutex<LinkSlot>,
    closing: Mutex<ClosingOrigin>,
    started: AtomicBool,

    // Outstanding calls by invocation id
    pending: Mutex<HashMap<u64, oneshot::Sender<Reply>>>,
    next_call_id: AtomicU64,

    // Stops the ramp timer and the sender watcher
    background: CancellationToken,
    background_tasks: Mutex<Vec<JoinHandle<()>>>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

/// One control session with a host, from handshake to teardown.
///
/// A session is used for exactly one connection. It owns the device store and
/// the transport sender for that connection; both are emptied and stopped on
/// every terminal path.
#[derive(Debug, Clone)]
pub struct ControlSession {
    inner: Arc<SessionInner>,
}

impl ControlSession {
    pub fn new(
        params: SessionParams,
        settings: SessionSettings,
        status: Arc<StatusCell>,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Result<Self, ConnectFailure> {
        let endpoint = ControlEndpoint::parse(&params.url)
            .map_err(|_| ConnectFailure::InvalidUrl(params.url.clone()))?;
        let store = Arc::new(GamepadStore::new(settings.trigger_mode));
        let sender = TransportSender::new(
            Arc::clone(&store),
            endpoint.host.clone(),
            settings.sender.clone(),
        );

        Ok(Self {
            inner: Arc::new(SessionInner {
                session_id: params.session_id,
                device_id: params.device_id,
                token: params.token,
                username: Mutex::new(params.username),
                endpoint,
                settings,
                status,
                events,
                store,
                sender,
                roster: Mutex::new(Vec::new()),
                host: Mutex::new(HostInfo::default()),
                link: Mutex::new(LinkSlot::default()),
                closing: Mutex::new(ClosingOrigin::None),
                started: AtomicBool::new(false),
                pending: Mutex::new(HashMap::new()),
                next_call_id: AtomicU64::new(1),
                background: CancellationToken::new(),
                background_tasks: Mutex::new(Vec::new()),
                reader: Mutex::new(None),
            }),
        })
    }

    pub fn url(&self) -> &str {
        &self.inner.endpoint.url
    }

    pub fn session_id(&self) -> &str {
        &self.inner.session_id
    }

    pub fn status(&self) -> ConnectionStatus {
        self.inner.status.current()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.status.current().is_connected() && self.closing_origin() == ClosingOrigin::None
    }

    pub fn closing_origin(&self) -> ClosingOrigin {
        *lock(&self.inner.closing)
    }

    pub fn store(&self) -> Arc<GamepadStore> {
        Arc::clone(&self.inner.store)
    }

    pub fn roster(&self) -> Vec<VirtualDevice> {
        lock(&self.inner.roster).clone()
    }

    pub fn sender_state(&self) -> tokio::sync::watch::Receiver<SenderState> {
        self.inner.sender.subscribe()
    }

    pub fn is_streaming(&self) -> bool {
        self.inner.sender.is_running()
    }

    /// Current info, only while connected
    pub fn connection_info(&self) -> Option<ConnectionInfo> {
        self.is_connected().then(|| self.inner.connection_info())
    }

    /// Opens the control channel and waits for the host's `Connected` push.
    ///
    /// On failure the status ends in `Error`, a `ConnectionFailed` event is
    /// emitted and no `Connected` event is ever produced for this session.
    pub async fn connect<C: Connector>(&self, connector: &C) -> Result<ConnectionInfo, ConnectFailure> {
        let inner = &self.inner;
        if inner.started.swap(true, Ordering::SeqCst) {
            return Err(ConnectFailure::AlreadyActive);
        }
        if inner.status.begin_attempt().is_none() {
            return Err(ConnectFailure::AlreadyActive);
        }

        info!(
            "Connecting to {} for session {}",
            inner.endpoint.url, inner.session_id
        );
        let request = OpenRequest {
            endpoint: inner.endpoint.clone(),
            headers: inner.headers(),
        };
        let timeout = inner.settings.handshake_timeout;

        let link = match tokio::time::timeout(timeout, connector.open(request)).await {
            Ok(Ok(link)) => link,
            Ok(Err(e)) => {
                error!("Failed to open control channel: {}", e);
                return Err(inner.fail(ConnectFailure::ChannelOpen(e.to_string())));
            }
            Err(_) => {
                error!("Opening control channel timed out after {:?}", timeout);
                return Err(inner.fail(ConnectFailure::ChannelOpen("timed out".to_string())));
            }
        };

        let ControlLink {
            outgoing,
            incoming,
            shutdown,
        } = link;
        {
            let mut slot = lock(&inner.link);
            slot.outgoing = Some(outgoing);
            slot.shutdown = Some(shutdown.clone());
        }

        inner.spawn_background();
        let (handshake_tx, handshake_rx) = oneshot::channel();
        let reader = tokio::spawn(read_loop(
            Arc::clone(inner),
            incoming,
            shutdown,
            handshake_tx,
        ));
        *lock(&inner.reader) = Some(reader);

        match tokio::time::timeout(timeout, handshake_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(inner.fail(ConnectFailure::ClosedDuringHandshake)),
            Err(_) => {
                warn!("Host did not confirm session within {:?}", timeout);
                Err(inner.fail(ConnectFailure::HandshakeTimeout))
            }
        }
    }

    /// Asks the host for a new virtual device and starts tracking it
    pub async fn add_device(
        &self,
        name: &str,
        kind: ControllerKind,
        layout_id: &str,
    ) -> Result<VirtualDevice, RpcError> {
        let call = ClientCall::AddGamepad(AddGamepadRequest {
            Name: name.to_string(),
            CType: kind.wire_value(),
            LayoutId: layout_id.to_string(),
        });
        info!("Adding gamepad {} ({:?}, layout {})", name, kind, layout_id);
        let value = self.inner.invoke(call).await?;

        let device = GamepadInfo::from_result(value)
            .map_err(|e| RpcError::Malformed(e.to_string()))?
            .into_virtual_device()
            .ok_or_else(|| RpcError::Malformed("unusable gamepad record".to_string()))?;

        self.inner.while_open(|| {
            self.inner
                .store
                .register(device.id, &device.client_ref_id, device.kind)
                .map_err(|e| RpcError::Malformed(e.to_string()))?;

            let roster = {
                let mut roster = lock(&self.inner.roster);
                roster.retain(|existing| existing.client_ref_id != device.client_ref_id);
                roster.push(device.clone());
                roster.clone()
            };
            self.inner.emit(SessionEvent::RosterChanged(roster));
            self.inner.start_streaming();
            Ok::<_, RpcError>(())
        })??;
        Ok(device)
    }

    /// Deletes a device on the host; local state goes only on success
    pub async fn remove_device(&self, client_ref_id: &str) -> Result<(), RpcError> {
        info!("Deleting gamepad {}", client_ref_id);
        let value = self
            .inner
            .invoke(ClientCall::DeleteGamepad {
                client_ref_id: client_ref_id.to_string(),
            })
            .await?;

        let code = value
            .as_i64()
            .ok_or_else(|| RpcError::Malformed(format!("expected status code, got {}", value)))?;
        if code != DELETE_OK {
            warn!("Host refused to delete {}: status {}", client_ref_id, code);
            return Err(RpcError::Status(code));
        }

        self.inner.while_open(|| {
            let roster = {
                let mut roster = lock(&self.inner.roster);
                roster.retain(|device| device.client_ref_id != client_ref_id);
                roster.clone()
            };
            self.inner.store.remove(client_ref_id);
            self.inner.emit(SessionEvent::RosterChanged(roster));
        })
    }

    /// Renames this client; the local name changes once the host acknowledges
    pub async fn set_username(&self, name: &str) -> Result<(), RpcError> {
        self.inner
            .invoke(ClientCall::SetUsername {
                name: name.to_string(),
            })
            .await?;
        self.inner.while_open(|| {
            *lock(&self.inner.username) = name.to_string();
            info!("Username updated to {}", name);
            self.inner
                .emit(SessionEvent::InfoUpdated(self.inner.connection_info()));
        })
    }

    /// Self-initiated teardown; safe to call more than once
    pub async fn close(&self) {
        let inner = &self.inner;
        if inner.mark_closing(ClosingOrigin::SelfInitiated) {
            info!("Closing session {}", inner.session_id);
            inner.notify_disconnect();
            inner.cleanup();
            inner.status.transition(ConnectionStatus::Disconnected);
            inner.emit(SessionEvent::Disconnected);
        } else {
            debug!("Session {} already closing", inner.session_id);
        }

        let reader = lock(&inner.reader).take();
        if let Some(reader) = reader {
            if let Err(e) = reader.await {
                warn!("Control channel reader ended abnormally: {}", e);
            }
        }
        let background = std::mem::take(&mut *lock(&inner.background_tasks));
        for task in background {
            if let Err(e) = task.await {
                warn!("Session background task ended abnormally: {}", e);
            }
        }
        inner.sender.shutdown().await;
    }
}

impl SessionInner {
    fn headers(&self) -> BTreeMap<String, String> {
        let mut headers = BTreeMap::new();
        headers.insert(SESSION_ID_HEADER.to_string(), self.session_id.clone());
        headers.insert(DEVICE_ID_HEADER.to_string(), self.device_id.clone());
        headers.insert(USERNAME_HEADER.to_string(), lock(&self.username).clone());
        if let Some(token) = &self.token {
            headers.insert(SESSION_TOKEN_HEADER.to_string(), token.clone());
        }
        headers
    }

    fn connection_info(&self) -> ConnectionInfo {
        ConnectionInfo {
            session_id: self.session_id.clone(),
            control_url: self.endpoint.url.clone(),
            host_display_name: lock(&self.host).display_name.clone(),
            username: lock(&self.username).clone(),
        }
    }

    fn emit(&self, event: SessionEvent) {
        if self.events.send(event).is_err() {
            debug!("Session event dropped, no listener");
        }
    }

    fn closing(&self) -> ClosingOrigin {
        *lock(&self.closing)
    }

    /// Applies a call's local effect unless the session is already closing.
    ///
    /// Holds the closing lock throughout, so a teardown either runs before
    /// (and the effect is dropped) or after (and undoes it).
    fn while_open<R>(&self, apply: impl FnOnce() -> R) -> Result<R, RpcError> {
        let closing = lock(&self.closing);
        if *closing != ClosingOrigin::None {
            debug!("Session {} closed while a call was in flight", self.session_id);
            return Err(RpcError::ChannelClosed);
        }
        Ok(apply())
    }

    /// First caller wins; later terminal paths become no-ops
    fn mark_closing(&self, origin: ClosingOrigin) -> bool {
        let mut closing = lock(&self.closing);
        if *closing != ClosingOrigin::None {
            return false;
        }
        *closing = origin;
        true
    }

    fn spawn_background(&self) {
        let mut tasks = lock(&self.background_tasks);
        let period = self.settings.soft_trigger_tick;
        tasks.extend(self.store.spawn_ramp(period, self.background.clone()));

        let mut sender_state = self.sender.subscribe();
        let cancel = self.background.clone();
        let events = self.events.clone();
        tasks.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    changed = sender_state.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let state = sender_state.borrow_and_update().clone();
                        if let SenderState::Failed(reason) = state {
                            warn!("Input streaming stopped: {}", reason);
                            if events.send(SessionEvent::StreamingFailed(reason)).is_err() {
                                debug!("Session event dropped, no listener");
                            }
                        }
                    }
                }
            }
        }));
    }

    fn start_streaming(&self) {
        let port = lock(&self.host).data_port;
        if port == 0 || self.store.is_empty() {
            debug!("Not streaming yet (port {}, {} devices)", port, self.store.len());
            return;
        }
        if self.sender.port().is_some_and(|current| current != port) {
            self.sender.stop();
        }
        self.sender.start(port);
    }

    /// Drops every per-connection resource
    fn cleanup(&self) {
        self.sender.stop();
        self.store.clear();
        lock(&self.roster).clear();
        self.emit(SessionEvent::RosterChanged(Vec::new()));

        let slot = std::mem::take(&mut *lock(&self.link));
        drop(slot.outgoing);
        if let Some(shutdown) = slot.shutdown {
            shutdown.cancel();
        }

        let pending = std::mem::take(&mut *lock(&self.pending));
        for (_, reply) in pending {
            let _ = reply.send(Err(RpcError::ChannelClosed));
        }

        self.background.cancel();
        debug!("Session {} resources released", self.session_id);
    }

    /// Terminal failure path; returns the failure for the caller
    fn fail(&self, failure: ConnectFailure) -> ConnectFailure {
        if self.mark_closing(ClosingOrigin::Host) {
            self.cleanup();
            self.status
                .transition(ConnectionStatus::Error(failure.clone()));
            self.emit(SessionEvent::ConnectionFailed(failure.clone()));
        }
        failure
    }

    /// Unsolicited channel loss after the handshake
    fn lose_channel(&self) {
        if self.mark_closing(ClosingOrigin::Host) {
            info!("Control channel for session {} lost", self.session_id);
            self.cleanup();
            self.status.transition(ConnectionStatus::Disconnected);
            self.emit(SessionEvent::Disconnected);
        }
    }

    /// Best-effort `Disconnected` notification before a self-initiated close
    fn notify_disconnect(&self) {
        if !self.status.current().is_connected() {
            return;
        }
        let Some(outgoing) = lock(&self.link).outgoing.clone() else {
            return;
        };
        let frame = ClientFrame::Send {
            target: ClientCall::Disconnected.target().to_string(),
            arguments: Vec::new(),
        };
        if let Err(e) = outgoing.try_send(frame) {
            debug!("Could not notify host of disconnect: {}", e);
        }
    }

    async fn invoke(&self, call: ClientCall) -> Result<Value, RpcError> {
        if !self.status.current().is_connected() || self.closing() != ClosingOrigin::None {
            return Err(RpcError::NotConnected);
        }
        let outgoing = lock(&self.link)
            .outgoing
            .clone()
            .ok_or(RpcError::NotConnected)?;

        let arguments = call
            .arguments()
            .map_err(|e| RpcError::Encode(e.to_string()))?;
        let id = self.next_call_id.fetch_add(1, Ordering::SeqCst);
        let (reply_tx, reply_rx) = oneshot::channel();
        lock(&self.pending).insert(id, reply_tx);

        let frame = ClientFrame::Invoke {
            id,
            target: call.target().to_string(),
            arguments,
        };
        debug!("Invoking {} as call {}", call.target(), id);
        if outgoing.send(frame).await.is_err() {
            lock(&self.pending).remove(&id);
            return Err(RpcError::ChannelClosed);
        }

        match tokio::time::timeout(self.settings.rpc_timeout, reply_rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => Err(RpcError::ChannelClosed),
            Err(_) => {
                lock(&self.pending).remove(&id);
                warn!("Call {} ({}) timed out", id, call.target());
                Err(RpcError::Timeout)
            }
        }
    }

    fn complete(&self, id: u64, result: Option<Value>, error: Option<String>) {
        let Some(reply) = lock(&self.pending).remove(&id) else {
            debug!("Completion for unknown call {}", id);
            return;
        };
        let outcome = match error {
            Some(message) => Err(RpcError::Remote(message)),
            None => Ok(result.unwrap_or(Value::Null)),
        };
        if reply.send(outcome).is_err() {
            debug!("Caller of call {} went away", id);
        }
    }

    fn handle_connected(
        &self,
        payload: ConnectedPayload,
        handshake: &mut Option<HandshakeSignal>,
    ) {
        let Some(token) = payload.token.clone() else {
            warn!("Connected push without token, ignoring");
            return;
        };
        if self.closing() != ClosingOrigin::None {
            debug!("Connected push after close, ignoring");
            return;
        }

        self.emit(SessionEvent::TokenRotated {
            url: self.endpoint.url.clone(),
            session_id: self.session_id.clone(),
            token,
        });

        {
            let mut host = lock(&self.host);
            host.display_name = payload.computer.clone();
            host.data_port = payload.port;
        }
        if payload.reconnected {
            info!("Host resumed session {}", self.session_id);
        }

        let roster = payload.roster();
        self.store.clear();
        for device in &roster {
            if let Err(e) = self
                .store
                .register(device.id, &device.client_ref_id, device.kind)
            {
                warn!("Skipping device {}: {}", device.client_ref_id, e);
            }
        }
        *lock(&self.roster) = roster.clone();
        info!(
            "Host {} reports {} devices, data port {}",
            payload.computer,
            roster.len(),
            payload.port
        );
        self.emit(SessionEvent::RosterChanged(roster));

        self.start_streaming();
        self.status.transition(ConnectionStatus::Connected);

        let info = self.connection_info();
        self.emit(SessionEvent::Connected(info.clone()));
        if let Some(signal) = handshake.take() {
            let _ = signal.send(Ok(info));
        }
    }

    fn clear_devices(&self) {
        info!("Host cleared all devices");
        self.sender.stop();
        self.store.clear();
        lock(&self.roster).clear();
        self.emit(SessionEvent::RosterChanged(Vec::new()));
    }
}

async fn read_loop(
    inner: Arc<SessionInner>,
    mut incoming: mpsc::Receiver<ServerFrame>,
    shutdown: CancellationToken,
    handshake: HandshakeSignal,
) {
    let mut handshake = Some(handshake);

    loop {
        let frame = tokio::select! {
            biased;
            _ = shutdown.cancelled() => None,
            frame = incoming.recv() => frame,
        };
        let Some(frame) = frame else { break };

        match frame {
            ServerFrame::Completion { id, result, error } => inner.complete(id, result, error),
            ServerFrame::Event { target, arguments } => {
                let event = match ServerEvent::parse(&target, arguments) {
                    Ok(event) => event,
                    Err(e) => {
                        warn!("Ignoring malformed {} event: {}", target, e);
                        continue;
                    }
                };
                match event {
                    ServerEvent::Connected(payload) => {
                        inner.handle_connected(payload, &mut handshake)
                    }
                    ServerEvent::ClearGamepad => inner.clear_devices(),
                    ServerEvent::Removed => {
                        info!("Removed by host");
                        break;
                    }
                    ServerEvent::ConnectionFailed(message) => {
                        error!("Host reported connection failure: {}", message);
                        let failure = inner.fail(ConnectFailure::Rejected(message));
                        if let Some(signal) = handshake.take() {
                            let _ = signal.send(Err(failure));
                        }
                        return;
                    }
                    ServerEvent::Unknown(target) => debug!("Ignoring unknown event {}", target),
                }
            }
        }
    }

    match handshake.take() {
        Some(signal) => {
            let failure = inner.fail(ConnectFailure::ClosedDuringHandshake);
            let _ = signal.send(Err(failure));
        }
        None => inner.lose_channel(),
    }
    debug!("Read loop for session {} finished", inner.session_id);
}
