//! # Transport Module
//!
//! Ships device states to the host as unreliable unicast datagrams. A single
//! send loop per session ticks at a fixed cadence, encodes every registered
//! device and only puts a datagram on the wire when its bytes differ from the
//! last one sent for that device.
//!
//! The loop itself is a small statum machine: `Binding` resolves the host and
//! binds the socket, `Streaming` owns the endpoint and runs ticks. There is no
//! acknowledgement or retransmission; a dropped datagram is superseded by the
//! next change.

pub mod sender;

pub use sender::{PayloadCache, SenderSettings, SenderState, TransportError, TransportSender};
