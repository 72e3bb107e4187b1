use anyhow::{anyhow, Result};
use log::info;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Session configuration. The bearer token is assumed to be issued upstream;
/// this core only attaches it at handshake time.
#[derive(Serialize, Deserialize, Clone)]
pub struct ChatConfig {
    /// WebSocket endpoint, e.g. "wss://support.example.com/ws"
    pub server_url: String,
    /// HTTP side-channel base, e.g. "https://support.example.com/api"
    pub api_url: String,
    pub token: String,
    pub user_id: String,
    pub admin_id: String,
    #[serde(default = "default_reconnect_base_ms")]
    pub reconnect_base_ms: u64,
    #[serde(default = "default_reconnect_max_ms")]
    pub reconnect_max_ms: u64,
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    #[serde(default = "default_auth_timeout_ms")]
    pub auth_timeout_ms: u64,
    #[serde(default = "default_typing_window_ms")]
    pub typing_window_ms: u64,
}

fn default_reconnect_base_ms() -> u64 {
    500
}

fn default_reconnect_max_ms() -> u64 {
    30_000
}

fn default_max_reconnect_attempts() -> u32 {
    10
}

fn default_auth_timeout_ms() -> u64 {
    10_000
}

fn default_typing_window_ms() -> u64 {
    1_000
}

impl ChatConfig {
    pub fn new(server_url: &str, api_url: &str, token: &str, user_id: &str, admin_id: &str) -> Self {
        ChatConfig {
            server_url: server_url.to_string(),
            api_url: api_url.to_string(),
            token: token.to_string(),
            user_id: user_id.to_string(),
            admin_id: admin_id.to_string(),
            reconnect_base_ms: default_reconnect_base_ms(),
            reconnect_max_ms: default_reconnect_max_ms(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            auth_timeout_ms: default_auth_timeout_ms(),
            typing_window_ms: default_typing_window_ms(),
        }
    }

    pub fn reconnect_base(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_ms)
    }

    pub fn reconnect_max(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_ms)
    }

    pub fn auth_timeout(&self) -> Duration {
        Duration::from_millis(self.auth_timeout_ms)
    }

    pub fn typing_window(&self) -> Duration {
        Duration::from_millis(self.typing_window_ms)
    }
}

pub fn get_config_dir() -> Result<PathBuf> {
    let config_dir = dirs::config_dir()
        .ok_or_else(|| anyhow!("Could not determine config directory"))?
        .join("supportline");

    if !config_dir.exists() {
        fs::create_dir_all(&config_dir)?;
    }

    Ok(config_dir)
}

pub fn default_config_path() -> Result<PathBuf> {
    Ok(get_config_dir()?.join("session.json"))
}

pub fn save_config_to(config: &ChatConfig, path: &Path) -> Result<()> {
    let file = File::create(path)?;
    serde_json::to_writer_pretty(file, config)?;

    info!("Session config saved for {}", config.user_id);
    Ok(())
}

pub fn load_config_from(path: &Path) -> Result<Option<ChatConfig>> {
    if !path.exists() {
        return Ok(None);
    }

    let mut file = File::open(path)?;
    let mut contents = String::new();
    file.read_to_string(&mut contents)?;

    let config: ChatConfig = serde_json::from_str(&contents)?;
    info!("Loaded session config for {} from {}", config.user_id, path.display());

    Ok(Some(config))
}

/// Load from the default platform location.
pub fn load_config() -> Result<Option<ChatConfig>> {
    load_config_from(&default_config_path()?)
}
