use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Local;
use statum::{machine, state};
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::gamepad::{codec, GamepadStore};

// Sender settings
#[derive(Clone, Debug)]
pub struct SenderSettings {
    pub send_interval: Duration,
}

impl Default for SenderSettings {
    fn default() -> Self {
        Self {
            // ~120Hz
            send_interval: Duration::from_millis(8),
        }
    }
}

// Observable lifecycle of the send loop
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SenderState {
    Stopped,
    Running { port: u16 },
    Failed(String),
}

// Transport errors; all of them end the loop
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Failed to resolve {host}:{port}: {reason}")]
    Resolve {
        host: String,
        port: u16,
        reason: String,
    },

    #[error("Failed to bind datagram socket: {0}")]
    Bind(std::io::Error),

    #[error("Datagram send failed: {0}")]
    Send(std::io::Error),

    #[error("Send loop has no bound socket")]
    NotBound,
}

/// Last payload sent per device; a device is only sent when its bytes differ
#[derive(Debug, Default)]
pub struct PayloadCache {
    last: HashMap<String, Vec<u8>>,
}

impl PayloadCache {
    pub fn changed(&self, client_ref_id: &str, payload: &[u8]) -> bool {
        self.last
            .get(client_ref_id)
            .map_or(true, |last| last.as_slice() != payload)
    }

    pub fn record(&mut self, client_ref_id: String, payload: Vec<u8>) {
        self.last.insert(client_ref_id, payload);
    }

    /// Forgets devices that are no longer registered
    pub fn retain_live(&mut self, live: &HashSet<String>) {
        self.last.retain(|id, _| live.contains(id));
    }

    pub fn len(&self) -> usize {
        self.last.len()
    }

    pub fn is_empty(&self) -> bool {
        self.last.is_empty()
    }
}

// Bound socket and resolved host for the Streaming state
#[derive(Clone, Debug)]
pub struct Endpoint {
    socket: Arc<UdpSocket>,
    destination: SocketAddr,
}

// Result of one tick
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TickReport {
    pub devices: usize,
    pub sent: usize,
    pub skipped: usize,
}

// Define send loop states using statum's state macro
#[state]
#[derive(Debug, Clone)]
pub enum SendLoopState {
    Binding,
    Streaming(Endpoint),
}

#[machine]
#[derive(Debug)]
pub struct SendLoop<S: SendLoopState> {
    // Source of device states
    store: Arc<GamepadStore>,

    // Host taken from the control URL
    host: String,

    // Port announced by the host on connect
    port: u16,

    // Delta suppression
    cache: PayloadCache,
}

// Implementation for Binding state
impl SendLoop<Binding> {
    pub fn create(store: Arc<GamepadStore>, host: String, port: u16) -> Self {
        debug!("Creating send loop for {}:{}", host, port);
        Self::new(store, host, port, PayloadCache::default())
    }

    // Resolve the host, bind a socket and transition to Streaming
    pub async fn bind(self) -> Result<SendLoop<Streaming>, TransportError> {
        let resolve_error = |reason: String| TransportError::Resolve {
            host: self.host.clone(),
            port: self.port,
            reason,
        };

        let mut addresses = tokio::net::lookup_host((self.host.as_str(), self.port))
            .await
            .map_err(|e| resolve_error(e.to_string()))?
            .collect::<Vec<_>>();
        addresses.sort_by_key(|addr| !addr.is_ipv4());
        let destination = addresses
            .into_iter()
            .next()
            .ok_or_else(|| resolve_error("no addresses".to_string()))?;

        let local = if destination.is_ipv4() {
            "0.0.0.0:0"
        } else {
            "[::]:0"
        };
        let socket = UdpSocket::bind(local).await.map_err(TransportError::Bind)?;
        info!(
            "Datagram socket bound to {:?}, streaming to {}",
            socket.local_addr().ok(),
            destination
        );

        Ok(self.transition_with(Endpoint {
            socket: Arc::new(socket),
            destination,
        }))
    }
}

// Implementation for Streaming state
impl SendLoop<Streaming> {
    pub fn destination(&self) -> Option<SocketAddr> {
        self.get_state_data().map(|endpoint| endpoint.destination)
    }

    // Snapshot, encode and send whatever changed since the last tick
    pub async fn tick(&mut self) -> Result<TickReport, TransportError> {
        let endpoint = self
            .get_state_data()
            .cloned()
            .ok_or(TransportError::NotBound)?;

        let snapshots = self.store.all_snapshots();
        let mut report = TickReport {
            devices: snapshots.len(),
            ..TickReport::default()
        };
        let mut live = HashSet::with_capacity(snapshots.len());

        for state in snapshots {
            live.insert(state.client_ref_id.clone());

            let payload = match codec::encode(&state) {
                Ok(payload) => payload,
                Err(e) => {
                    warn!("Skipping device {} this tick: {}", state.client_ref_id, e);
                    report.skipped += 1;
                    continue;
                }
            };

            if !self.cache.changed(&state.client_ref_id, &payload) {
                continue;
            }

            endpoint
                .socket
                .send_to(&payload, endpoint.destination)
                .await
                .map_err(TransportError::Send)?;
            debug!(
                "Sent {} bytes for {} (mask {:016b})",
                payload.len(),
                state.client_ref_id,
                state.button_mask
            );
            self.cache.record(state.client_ref_id, payload);
            report.sent += 1;
        }

        self.cache.retain_live(&live);
        Ok(report)
    }
}

#[derive(Debug)]
struct RunningLoop {
    cancel: CancellationToken,
    task: JoinHandle<()>,
    port: u16,
}

/// Fixed-cadence datagram sender for every registered device.
///
/// `start` and `stop` may be called from any thread; only the spawned loop
/// touches the socket.
#[derive(Debug)]
pub struct TransportSender {
    store: Arc<GamepadStore>,
    host: String,
    settings: SenderSettings,
    running: Mutex<Option<RunningLoop>>,
    // Loops stopped without waiting; joined by `shutdown`
    retired: Mutex<Vec<JoinHandle<()>>>,
    state_sender: watch::Sender<SenderState>,
}

impl TransportSender {
    pub fn new(store: Arc<GamepadStore>, host: impl Into<String>, settings: SenderSettings) -> Self {
        let (state_sender, _) = watch::channel(SenderState::Stopped);
        Self {
            store,
            host: host.into(),
            settings,
            running: Mutex::new(None),
            retired: Mutex::new(Vec::new()),
            state_sender,
        }
    }

    fn running(&self) -> MutexGuard<'_, Option<RunningLoop>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn retired(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.retired.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn subscribe(&self) -> watch::Receiver<SenderState> {
        self.state_sender.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.running()
            .as_ref()
            .is_some_and(|running| !running.task.is_finished())
    }

    pub fn port(&self) -> Option<u16> {
        self.running().as_ref().map(|running| running.port)
    }

    /// Starts streaming to `port`; does nothing while a loop is alive.
    ///
    /// Returns whether a new loop was spawned.
    pub fn start(&self, port: u16) -> bool {
        let mut running = self.running();
        if running
            .as_ref()
            .is_some_and(|current| !current.task.is_finished())
        {
            debug!("Transport sender already running, ignoring start({})", port);
            return false;
        }

        info!(
            "Starting transport sender to {}:{} every {:?}",
            self.host, port, self.settings.send_interval
        );
        let cancel = CancellationToken::new();
        let send_loop = SendLoop::create(Arc::clone(&self.store), self.host.clone(), port);
        let task = tokio::spawn(run_send_loop(
            send_loop,
            self.settings.send_interval,
            cancel.clone(),
            self.state_sender.clone(),
        ));

        *running = Some(RunningLoop { cancel, task, port });
        true
    }

    /// Cancels the loop and drops its socket without waiting
    pub fn stop(&self) {
        if let Some(running) = self.running().take() {
            info!("Stopping transport sender");
            running.cancel.cancel();
            running.task.abort();
            let mut retired = self.retired();
            retired.retain(|task| !task.is_finished());
            retired.push(running.task);
        }
        self.state_sender.send_replace(SenderState::Stopped);
    }

    /// Like [`stop`](Self::stop) but waits until every loop task has exited,
    /// including ones stopped earlier
    pub async fn shutdown(&self) {
        let mut tasks = std::mem::take(&mut *self.retired());
        if let Some(running) = self.running().take() {
            running.cancel.cancel();
            tasks.push(running.task);
        }
        for task in tasks {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    warn!("Send loop task ended abnormally: {}", e);
                }
            }
        }
        self.state_sender.send_replace(SenderState::Stopped);
    }
}

impl Drop for TransportSender {
    fn drop(&mut self) {
        if let Some(running) = self.running().take() {
            running.cancel.cancel();
            running.task.abort();
        }
    }
}

async fn run_send_loop(
    send_loop: SendLoop<Binding>,
    period: Duration,
    cancel: CancellationToken,
    state_sender: watch::Sender<SenderState>,
) {
    let port = send_loop.port;
    let mut send_loop = tokio::select! {
        _ = cancel.cancelled() => return,
        bound = send_loop.bind() => match bound {
            Ok(streaming) => streaming,
            Err(e) => {
                error!("Transport sender failed to start: {}", e);
                state_sender.send_replace(SenderState::Failed(e.to_string()));
                return;
            }
        },
    };
    state_sender.send_replace(SenderState::Running { port });

    let mut interval_timer = tokio::time::interval(period);
    // Late ticks run right away, missed ones are not replayed
    interval_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

    // Stats for performance monitoring
    let mut ticks: u64 = 0;
    let mut datagrams: u64 = 0;
    let mut last_stats_time = Local::now();
    let stats_interval = chrono::Duration::seconds(30);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = interval_timer.tick() => {}
        }

        let report = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            report = send_loop.tick() => report,
        };

        match report {
            Ok(report) => {
                ticks += 1;
                datagrams += report.sent as u64;
            }
            Err(e) => {
                error!("Transport sender aborted: {}", e);
                state_sender.send_replace(SenderState::Failed(e.to_string()));
                return;
            }
        }

        let now = Local::now();
        if now - last_stats_time > stats_interval {
            info!(
                "Transport stats: {} ticks, {} datagrams to {:?} in {} seconds",
                ticks,
                datagrams,
                send_loop.destination(),
                (now - last_stats_time).num_seconds()
            );
            ticks = 0;
            datagrams = 0;
            last_stats_time = now;
        }
    }

    debug!("Send loop cancelled");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_reports_only_differences() {
        let mut cache = PayloadCache::default();
        assert!(cache.changed("a", &[1, 2, 3]));
        cache.record("a".to_string(), vec![1, 2, 3]);
        assert!(!cache.changed("a", &[1, 2, 3]));
        assert!(cache.changed("a", &[1, 2, 4]));
        assert!(cache.changed("b", &[1, 2, 3]));
    }

    #[test]
    fn cache_forgets_removed_devices() {
        let mut cache = PayloadCache::default();
        cache.record("a".to_string(), vec![1]);
        cache.record("b".to_string(), vec![2]);
        let live = HashSet::from(["b".to_string()]);
        cache.retain_live(&live);
        assert_eq!(cache.len(), 1);
        assert!(cache.changed("a", &[1]));
        assert!(!cache.changed("b", &[2]));
    }
}
