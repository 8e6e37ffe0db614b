//! # Control Session
//!
//! Everything that happens on the control channel: the wire vocabulary, the
//! channel plumbing, the observable connection status and the session state
//! machine that ties them together.
//!
//! ## State Machine
//!
//! ```text
//!  NotConnected ──connect──► Connecting ──Connected push──► Connected
//!       ▲                      │    │                         │   │
//!       │                 fail │    │ close                   │   │ close / loss
//!       │                      ▼    ▼                         │   ▼
//!       └── grace period ── Error   Disconnected ◄────────────┘
//! ```
//!
//! Exactly one terminal path runs per session. The [`ClosingOrigin`] recorded
//! by the first one (`Host` or `SelfInitiated`) turns every later attempt into
//! a no-op, so a self-initiated close never also reports a channel loss.
//!
//! ## Calls
//!
//! Calls are correlated by invocation id and each resolves exactly once. A
//! call the host never answers ends in `Timeout`; calls still pending at
//! teardown end in `ChannelClosed`.

pub mod channel;
pub mod control;
pub mod protocol;
pub mod status;

pub use channel::{duplex, ChannelError, ControlEndpoint, Connector, OpenRequest, TcpConnector};
pub use control::{
    ClosingOrigin, ConnectionInfo, ControlSession, RpcError, SessionEvent, SessionParams,
    SessionSettings,
};
pub use protocol::{ClientFrame, ServerFrame, VirtualDevice};
pub use status::{ConnectFailure, ConnectionStatus, StatusCell};
