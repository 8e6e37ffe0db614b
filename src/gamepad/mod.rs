//! # Gamepad Input Model
//!
//! Owns everything the client knows about the virtual devices it drives: the
//! per-device state, the button table shared by both controller layouts, the
//! soft trigger emulation and the datagram layout the host decodes.
//!
//! ## Module Architecture
//!
//! ```text
//! gamepad/
//! ├── state.rs  - DeviceState, button/D-pad tables, controller kinds
//! ├── codec.rs  - fixed little-endian datagram layout
//! └── store.rs  - thread-safe device table, setters, soft trigger ramp
//! ```
//!
//! ## Data Flow
//!
//! ```text
//! UI touch events ──► GamepadStore setters ──► DeviceState
//!                                                 │
//!                   TransportSender tick ◄────────┘ (all_snapshots + codec)
//! ```
//!
//! Input latency is decoupled from the send cadence: setters only mutate the
//! addressed device, the transport picks up whatever is current on its own
//! clock.

pub mod codec;
pub mod state;
pub mod store;

pub use codec::CodecError;
pub use state::{
    ButtonId, ControllerKind, DeviceState, DpadDirection, JoystickType, TriggerType,
};
pub use store::{GamepadStore, SoftTriggerRamp, StoreError, TriggerMode};
