use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::config_dir;

const SESSION_FILE: &str = "session.toml";

pub const DEFAULT_USERNAME: &str = "Unknown";

/// Parameters needed to resume the last session
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
pub struct SavedConnection {
    pub url: String,
    pub session_id: String,
    pub token: String,
    pub saved_at: DateTime<Local>,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
struct PersistedState {
    #[serde(default)]
    device_id: String,
    #[serde(default = "default_username")]
    username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    saved: Option<SavedConnection>,
}

fn default_username() -> String {
    DEFAULT_USERNAME.to_string()
}

impl Default for PersistedState {
    fn default() -> Self {
        Self {
            device_id: String::new(),
            username: default_username(),
            saved: None,
        }
    }
}

/// File-backed identity and resume parameters; every change is written through
#[derive(Debug)]
pub struct SessionStore {
    path: PathBuf,
    state: Mutex<PersistedState>,
}

impl SessionStore {
    /// Loads `~/.config/neopad/session.toml`
    pub async fn load_default() -> Result<Self> {
        let mut path = config_dir();
        path.push(SESSION_FILE);
        Self::load(path).await
    }

    /// Loads the store at `path`, creating a device id on first use
    pub async fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mut state = read_state(&path).await;

        let fresh_id = state.device_id.is_empty();
        if fresh_id {
            state.device_id = Uuid::new_v4().to_string();
            info!("Created device id {}", state.device_id);
        } else {
            debug!("Using device id {}", state.device_id);
        }

        let store = Self {
            path,
            state: Mutex::new(state),
        };
        if fresh_id {
            let state = store.state.lock().await;
            store.write(&state).await?;
        }
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn device_id(&self) -> String {
        self.state.lock().await.device_id.clone()
    }

    pub async fn username(&self) -> String {
        self.state.lock().await.username.clone()
    }

    pub async fn set_username(&self, username: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state.username = username.to_string();
        self.write(&state).await
    }

    pub async fn saved_connection(&self) -> Option<SavedConnection> {
        self.state.lock().await.saved.clone()
    }

    pub async fn save_connection(&self, url: &str, session_id: &str, token: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state.saved = Some(SavedConnection {
            url: url.to_string(),
            session_id: session_id.to_string(),
            token: token.to_string(),
            saved_at: Local::now(),
        });
        debug!("Saving connection parameters for session {}", session_id);
        self.write(&state).await
    }

    pub async fn clear_connection(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.saved.take().is_none() {
            return Ok(());
        }
        debug!("Clearing saved connection parameters");
        self.write(&state).await
    }

    async fn write(&self, state: &PersistedState) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| eyre!("Failed to create config directory: {}", e))?;
        }

        let content = toml::to_string_pretty(state)
            .map_err(|e| eyre!("Failed to serialize session state: {}", e))?;

        tokio::fs::write(&self.path, content)
            .await
            .map_err(|e| eyre!("Failed to write session file: {}", e))?;
        Ok(())
    }
}

async fn read_state(path: &Path) -> PersistedState {
    match tokio::fs::read_to_string(path).await {
        Ok(content) => match toml::from_str(&content) {
            Ok(state) => state,
            Err(e) => {
                warn!("Failed to parse session file {:?}, starting fresh: {}", path, e);
                PersistedState::default()
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            info!("No session file at {:?}, starting fresh", path);
            PersistedState::default()
        }
        Err(e) => {
            warn!("Failed to read session file {:?}, starting fresh: {}", path, e);
            PersistedState::default()
        }
    }
}
