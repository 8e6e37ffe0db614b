use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::discovery::DiscoverySettings;
use crate::gamepad::TriggerMode;
use crate::persistence::config_dir;
use crate::session::SessionSettings;
use crate::transport::SenderSettings;

const CONFIG_FILE: &str = "config.toml";

/// Runtime settings, read from `~/.config/neopad/config.toml`.
///
/// Every field has a default, so a partial file only overrides what it names.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct Config {
    // Path of the control endpoint on the host
    pub control_path: String,
    pub service_type: String,
    pub send_interval_ms: u64,

    // Emulate analog triggers by ramping instead of snapping
    pub soft_trigger: bool,
    pub soft_trigger_tick_ms: u64,
    pub soft_trigger_step: u8,

    pub lost_grace_secs: u64,
    pub sweep_interval_secs: u64,

    pub handshake_timeout_secs: u64,
    pub rpc_timeout_secs: u64,
    // Time between Disconnected and NotConnected after a close
    pub disconnect_grace_ms: u64,
    // Delay before resuming a saved session on start
    pub reconnect_delay_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            control_path: "pcxhub".to_string(),
            service_type: "_neopad._tcp".to_string(),
            send_interval_ms: 8,
            soft_trigger: false,
            soft_trigger_tick_ms: 10,
            soft_trigger_step: 17,
            lost_grace_secs: 30,
            sweep_interval_secs: 5,
            handshake_timeout_secs: 10,
            rpc_timeout_secs: 10,
            disconnect_grace_ms: 3000,
            reconnect_delay_ms: 200,
        }
    }
}

impl Config {
    /// Reads the default config file; anything missing or broken yields defaults
    pub async fn load_or_default() -> Self {
        let mut path = config_dir();
        path.push(CONFIG_FILE);
        Self::load_from(&path).await
    }

    pub async fn load_from(path: &Path) -> Self {
        let content = match tokio::fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) => {
                info!("No config at {:?} ({}), using defaults", path, e);
                return Self::default();
            }
        };

        match toml::from_str::<Config>(&content) {
            Ok(config) => {
                debug!("Loaded config from {:?}", path);
                config.sanitized()
            }
            Err(e) => {
                warn!("Failed to parse config {:?}, using defaults: {}", path, e);
                Self::default()
            }
        }
    }

    // Zero periods would spin or panic in tokio intervals
    fn sanitized(mut self) -> Self {
        let defaults = Self::default();
        if self.send_interval_ms == 0 {
            warn!("send_interval_ms must be positive, using {}", defaults.send_interval_ms);
            self.send_interval_ms = defaults.send_interval_ms;
        }
        if self.soft_trigger_tick_ms == 0 {
            self.soft_trigger_tick_ms = defaults.soft_trigger_tick_ms;
        }
        if self.soft_trigger_step == 0 {
            self.soft_trigger_step = defaults.soft_trigger_step;
        }
        if self.sweep_interval_secs == 0 {
            self.sweep_interval_secs = defaults.sweep_interval_secs;
        }
        self.control_path = self.control_path.trim_matches('/').to_string();
        self
    }

    pub fn trigger_mode(&self) -> TriggerMode {
        if self.soft_trigger {
            TriggerMode::Soft {
                step: self.soft_trigger_step,
            }
        } else {
            TriggerMode::Hard
        }
    }

    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            handshake_timeout: Duration::from_secs(self.handshake_timeout_secs),
            rpc_timeout: Duration::from_secs(self.rpc_timeout_secs),
            sender: SenderSettings {
                send_interval: Duration::from_millis(self.send_interval_ms),
            },
            trigger_mode: self.trigger_mode(),
            soft_trigger_tick: Duration::from_millis(self.soft_trigger_tick_ms),
        }
    }

    pub fn discovery_settings(&self) -> DiscoverySettings {
        DiscoverySettings {
            service_type: self.service_type.clone(),
            lost_grace: Duration::from_secs(self.lost_grace_secs),
            sweep_interval: Duration::from_secs(self.sweep_interval_secs),
        }
    }

    pub fn disconnect_grace(&self) -> Duration {
        Duration::from_millis(self.disconnect_grace_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}
