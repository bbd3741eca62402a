use std::path::{Path, PathBuf};

use serde_derive::Deserialize;

#[derive(Deserialize, Debug, Clone)]
pub struct AppConfig {
    pub mqtt: MqttConfig,
    pub storage: Option<StorageConfig>,
    pub alarm: Option<AlarmConfig>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct MqttConfig {
    pub host: String,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub publisher_id: Option<String>,
    pub topic_path: Option<String>,
    pub keep_alive_seconds: Option<u64>,
    pub reconnect_delay_seconds: Option<u64>,
}

#[derive(Deserialize, Debug, Default, Clone)]
pub struct StorageConfig {
    pub path: Option<PathBuf>,
}

#[derive(Deserialize, Debug, Default, Clone)]
pub struct AlarmConfig {
    pub edge_buffer: Option<usize>,
    pub status_buffer: Option<usize>,
    /// Also publish alarm edges to `{topic_path}/alarm`.
    pub announce_mqtt: Option<bool>,
}

impl AppConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Ok(toml::de::from_str(&contents)?)
    }

    pub fn storage_path(&self) -> PathBuf {
        self.storage
            .as_ref()
            .and_then(|s| s.path.clone())
            .unwrap_or_else(|| PathBuf::from("devices.json"))
    }

    pub fn alarm(&self) -> AlarmConfig {
        self.alarm.clone().unwrap_or_default()
    }
}

impl AlarmConfig {
    pub fn edge_buffer(&self) -> usize {
        self.edge_buffer.unwrap_or(64)
    }

    pub fn status_buffer(&self) -> usize {
        self.status_buffer.unwrap_or(256)
    }
}
