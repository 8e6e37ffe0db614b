//! # Persistence Module
//!
//! ## Why This Module Exists
//! The client has to survive restarts without asking the user to pair again.
//! This module keeps the small amount of state that outlives a process: the
//! per-install device id, the chosen username and the parameters of the last
//! session so it can be resumed.
//!
//! ## Key Abstractions
//! - **SessionStore**: async, file-backed store for identity and the saved
//!   connection, written through on every change
//! - **Config directory**: everything lives under `~/.config/neopad/`
//!
//! ## Error Handling Strategy
//! Uses `color_eyre` for file operations. A missing or unreadable file is not
//! fatal: loading falls back to fresh defaults and logs what happened.

pub mod session_store;

pub use session_store::{SavedConnection, SessionStore, DEFAULT_USERNAME};

use std::path::PathBuf;
use tracing::warn;

pub const CONFIG_DIR: &str = ".config/neopad";

pub fn get_home_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| {
        warn!("Could not determine home directory, using current directory");
        PathBuf::from(".")
    })
}

/// `~/.config/neopad`
pub fn config_dir() -> PathBuf {
    let mut path = get_home_dir();
    path.push(CONFIG_DIR);
    path
}
