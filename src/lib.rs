pub mod config;
pub mod coordinator;
pub mod discovery;
pub mod gamepad;
pub mod persistence;
pub mod session;
pub mod transport;
