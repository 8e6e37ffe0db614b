//! Control channel plumbing
//!
//! A [`ControlLink`] is a pair of frame queues plus a shutdown token. The
//! session only ever talks to that pair; how the frames reach the host is up
//! to the [`Connector`]. [`TcpConnector`] speaks newline-delimited JSON over
//! TCP, [`duplex`] wires two in-process ends together.

use std::collections::BTreeMap;
use std::future::Future;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::protocol::{ClientFrame, ServerFrame};

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Invalid control url: {0}")]
    InvalidUrl(String),

    #[error("Failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        source: std::io::Error,
    },

    #[error("Timed out opening control channel")]
    Timeout,

    #[error("Control channel I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to encode frame: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Control channel closed")]
    Closed,

    #[error("{0} needs TLS, which this connector does not speak")]
    TlsUnsupported(String),
}

/// Host, port and path taken from a control url such as
/// `http://192.168.1.20:5000/pcxhub`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlEndpoint {
    pub url: String,
    pub host: String,
    pub port: u16,
    pub path: String,
    // https
    pub tls: bool,
}

impl ControlEndpoint {
    pub fn parse(url: &str) -> Result<Self, ChannelError> {
        let invalid = || ChannelError::InvalidUrl(url.to_string());

        let (rest, default_port, tls) = if let Some(rest) = url.strip_prefix("http://") {
            (rest, 80, false)
        } else if let Some(rest) = url.strip_prefix("https://") {
            (rest, 443, true)
        } else {
            return Err(invalid());
        };

        let (authority, path) = match rest.find('/') {
            Some(index) => (&rest[..index], rest[index..].to_string()),
            None => (rest, "/".to_string()),
        };

        let (host, port) = if let Some(bracketed) = authority.strip_prefix('[') {
            let (host, tail) = bracketed.split_once(']').ok_or_else(invalid)?;
            let port = match tail.strip_prefix(':') {
                Some(port) => port.parse().map_err(|_| invalid())?,
                None if tail.is_empty() => default_port,
                None => return Err(invalid()),
            };
            (host, port)
        } else {
            match authority.rsplit_once(':') {
                Some((host, port)) => (host, port.parse().map_err(|_| invalid())?),
                None => (authority, default_port),
            }
        };

        if host.is_empty() {
            return Err(invalid());
        }

        Ok(Self {
            url: url.to_string(),
            host: host.to_string(),
            port,
            path,
            tls,
        })
    }
}

/// Everything needed to open a control channel
#[derive(Debug, Clone)]
pub struct OpenRequest {
    pub endpoint: ControlEndpoint,
    pub headers: BTreeMap<String, String>,
}

impl OpenRequest {
    pub fn handshake_frame(&self) -> ClientFrame {
        ClientFrame::Handshake {
            path: self.endpoint.path.clone(),
            headers: self.headers.clone(),
        }
    }
}

/// Client end of an open control channel
#[derive(Debug)]
pub struct ControlLink {
    pub outgoing: mpsc::Sender<ClientFrame>,
    pub incoming: mpsc::Receiver<ServerFrame>,
    // Cancelled by either side when the channel goes away
    pub shutdown: CancellationToken,
}

/// Host end of an in-process control channel
#[derive(Debug)]
pub struct PeerLink {
    pub incoming: mpsc::Receiver<ClientFrame>,
    pub outgoing: mpsc::Sender<ServerFrame>,
    pub shutdown: CancellationToken,
}

/// Two connected in-process ends sharing one shutdown token
pub fn duplex(buffer: usize) -> (ControlLink, PeerLink) {
    let (client_tx, client_rx) = mpsc::channel(buffer);
    let (server_tx, server_rx) = mpsc::channel(buffer);
    let shutdown = CancellationToken::new();
    (
        ControlLink {
            outgoing: client_tx,
            incoming: server_rx,
            shutdown: shutdown.clone(),
        },
        PeerLink {
            incoming: client_rx,
            outgoing: server_tx,
            shutdown,
        },
    )
}

/// Opens control channels
pub trait Connector: Send + Sync + 'static {
    fn open(
        &self,
        request: OpenRequest,
    ) -> impl Future<Output = Result<ControlLink, ChannelError>> + Send;
}

/// Newline-delimited JSON over TCP
#[derive(Debug, Clone)]
pub struct TcpConnector {
    pub buffer: usize,
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self { buffer: 64 }
    }
}

impl Connector for TcpConnector {
    async fn open(&self, request: OpenRequest) -> Result<ControlLink, ChannelError> {
        if request.endpoint.tls {
            warn!("Refusing plaintext connection to {}", request.endpoint.url);
            return Err(ChannelError::TlsUnsupported(request.endpoint.url));
        }
        let addr = format!("{}:{}", request.endpoint.host, request.endpoint.port);
        info!("Opening control channel to {}{}", addr, request.endpoint.path);

        let endpoint = &request.endpoint;
        let stream = TcpStream::connect((endpoint.host.as_str(), endpoint.port))
            .await
            .map_err(|source| ChannelError::Connect {
                addr: addr.clone(),
                source,
            })?;
        stream.set_nodelay(true)?;
        let (read_half, mut write_half) = stream.into_split();

        let mut handshake = serde_json::to_vec(&request.handshake_frame())?;
        handshake.push(b'\n');
        write_half.write_all(&handshake).await?;
        debug!("Handshake sent to {}", addr);

        let (outgoing, mut frames_out) = mpsc::channel::<ClientFrame>(self.buffer);
        let (frames_in, incoming) = mpsc::channel::<ServerFrame>(self.buffer);
        let shutdown = CancellationToken::new();

        // Writer: drains outgoing frames until the session drops its sender
        let writer_cancel = shutdown.clone();
        tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    biased;
                    frame = frames_out.recv() => frame,
                    _ = writer_cancel.cancelled() => None,
                };
                let Some(frame) = frame else { break };

                let mut line = match serde_json::to_vec(&frame) {
                    Ok(line) => line,
                    Err(e) => {
                        warn!("Dropping unencodable frame: {}", e);
                        continue;
                    }
                };
                line.push(b'\n');
                if let Err(e) = write_half.write_all(&line).await {
                    warn!("Control channel write failed: {}", e);
                    writer_cancel.cancel();
                    break;
                }
            }
            if let Err(e) = write_half.shutdown().await {
                debug!("Control channel shutdown: {}", e);
            }
            debug!("Control channel writer stopped");
        });

        // Reader: forwards host frames until EOF, error or shutdown
        let reader_cancel = shutdown.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(read_half).lines();
            loop {
                let line = tokio::select! {
                    _ = reader_cancel.cancelled() => break,
                    line = lines.next_line() => line,
                };
                match line {
                    Ok(Some(line)) if line.trim().is_empty() => continue,
                    Ok(Some(line)) => match serde_json::from_str::<ServerFrame>(&line) {
                        Ok(frame) => {
                            if frames_in.send(frame).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!("Ignoring malformed frame: {}", e),
                    },
                    Ok(None) => {
                        info!("Control channel closed by host");
                        break;
                    }
                    Err(e) => {
                        warn!("Control channel read failed: {}", e);
                        break;
                    }
                }
            }
            reader_cancel.cancel();
            debug!("Control channel reader stopped");
        });

        Ok(ControlLink {
            outgoing,
            incoming,
            shutdown,
        })
    }
}
