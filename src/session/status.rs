use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::watch;
use tracing::{debug, info};

/// Why a connection attempt or a live session ended in `Error`
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectFailure {
    #[error("Invalid control url: {0}")]
    InvalidUrl(String),

    #[error("Failed to open control channel: {0}")]
    ChannelOpen(String),

    #[error("Host did not confirm the session in time")]
    HandshakeTimeout,

    #[error("Control channel closed during handshake")]
    ClosedDuringHandshake,

    #[error("Host rejected the session: {0}")]
    Rejected(String),

    #[error("Session already active")]
    AlreadyActive,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionStatus {
    NotConnected,
    Disconnected,
    Connecting,
    Connected,
    Error(ConnectFailure),
}

impl ConnectionStatus {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionStatus::Connected)
    }

    /// Neither connected nor on the way there
    pub fn is_idle(&self) -> bool {
        !matches!(
            self,
            ConnectionStatus::Connected | ConnectionStatus::Connecting
        )
    }

    /// Allowed edges of the connection state machine
    pub fn can_transition(&self, next: &ConnectionStatus) -> bool {
        use ConnectionStatus::*;
        matches!(
            (self, next),
            (NotConnected, Connecting)
                | (Disconnected, Connecting)
                | (Disconnected, NotConnected)
                | (Error(_), Connecting)
                | (Error(_), NotConnected)
                | (Connecting, Connected)
                | (Connecting, Error(_))
                | (Connecting, Disconnected)
                | (Connected, Connected)
                | (Connected, Disconnected)
                | (Connected, Error(_))
        )
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ConnectionStatus::NotConnected => "Not Connected",
            ConnectionStatus::Disconnected => "Disconnected",
            ConnectionStatus::Connecting => "Connecting...",
            ConnectionStatus::Connected => "Connected",
            ConnectionStatus::Error(_) => "Connection Failed",
        };
        f.write_str(text)
    }
}

/// Observable connection status shared by the coordinator and its sessions.
///
/// Every connect attempt bumps a generation counter so that a delayed
/// downgrade scheduled by an older close can tell it has been superseded.
#[derive(Debug)]
pub struct StatusCell {
    sender: watch::Sender<ConnectionStatus>,
    generation: AtomicU64,
}

impl Default for StatusCell {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusCell {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(ConnectionStatus::NotConnected);
        Self {
            sender,
            generation: AtomicU64::new(0),
        }
    }

    pub fn current(&self) -> ConnectionStatus {
        self.sender.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionStatus> {
        self.sender.subscribe()
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Applies `next` if the table allows it; returns whether it did
    pub fn transition(&self, next: ConnectionStatus) -> bool {
        let mut previous = None;
        let applied = self.sender.send_if_modified(|current| {
            if current.can_transition(&next) {
                previous = Some(std::mem::replace(current, next.clone()));
                true
            } else {
                false
            }
        });

        match previous {
            Some(previous) if previous != next => info!("Connection status: {} -> {}", previous, next),
            Some(_) => debug!("Connection status refreshed: {}", next),
            None => debug!(
                "Ignoring status change {} -> {}",
                self.sender.borrow().clone(),
                next
            ),
        }
        applied
    }

    /// Moves to `Connecting` and starts a new generation.
    ///
    /// Returns the generation of this attempt, or `None` while a session is
    /// already connecting or connected.
    pub fn begin_attempt(&self) -> Option<u64> {
        if !self.transition(ConnectionStatus::Connecting) {
            return None;
        }
        Some(self.generation.fetch_add(1, Ordering::SeqCst) + 1)
    }

    /// Delayed half of a close: falls back to `NotConnected` unless a newer
    /// attempt started since `generation` was taken
    pub fn downgrade_if_idle(&self, generation: u64) -> bool {
        if self.generation() != generation {
            debug!("Skipping downgrade, a newer connection attempt exists");
            return false;
        }
        if !self.current().is_idle() {
            return false;
        }
        self.transition(ConnectionStatus::NotConnected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_strings() {
        assert_eq!(ConnectionStatus::NotConnected.to_string(), "Not Connected");
        assert_eq!(ConnectionStatus::Connecting.to_string(), "Connecting...");
        assert_eq!(
            ConnectionStatus::Error(ConnectFailure::HandshakeTimeout).to_string(),
            "Connection Failed"
        );
    }

    #[test]
    fn transition_table_rejects_shortcuts() {
        let cell = StatusCell::new();
        assert!(!cell.transition(ConnectionStatus::Connected));
        assert_eq!(cell.current(), ConnectionStatus::NotConnected);

        assert!(cell.begin_attempt().is_some());
        assert!(cell.begin_attempt().is_none());
        assert!(cell.transition(ConnectionStatus::Connected));
        assert!(!cell.transition(ConnectionStatus::NotConnected));
        assert!(cell.transition(ConnectionStatus::Disconnected));
        assert!(cell.transition(ConnectionStatus::NotConnected));
    }

    #[test]
    fn downgrade_is_superseded_by_new_attempt() {
        let cell = StatusCell::new();
        let first = cell.begin_attempt().unwrap();
        cell.transition(ConnectionStatus::Connected);
        cell.transition(ConnectionStatus::Disconnected);

        // reconnect before the grace period ran out
        let second = cell.begin_attempt().unwrap();
        assert_ne!(first, second);
        assert!(!cell.downgrade_if_idle(first));
        assert_eq!(cell.current(), ConnectionStatus::Connecting);

        cell.transition(ConnectionStatus::Error(ConnectFailure::HandshakeTimeout));
        assert!(cell.downgrade_if_idle(second));
        assert_eq!(cell.current(), ConnectionStatus::NotConnected);
    }
}
