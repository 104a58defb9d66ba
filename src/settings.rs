use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::error::EngineError;

/// Optional overrides read from the settings file. Every field falls back to
/// the built-in default when absent.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PersistentSettings {
    pub api_base_url: Option<String>,
    pub health_path: Option<String>,
    pub download_url: Option<String>,
    pub upload_url: Option<String>,
    pub ping_url: Option<String>,
    pub download_window_secs: Option<u64>,
    pub upload_window_secs: Option<u64>,
    pub upload_requests: Option<usize>,
    pub upload_payload_bytes: Option<usize>,
    pub ping_count: Option<usize>,
    pub ping_timeout_secs: Option<u64>,
    pub dns_timeout_secs: Option<u64>,
    pub http_timeout_secs: Option<u64>,
    pub tcp_timeout_secs: Option<u64>,
    pub tls_timeout_secs: Option<u64>,
    pub tunnel_timeout_secs: Option<u64>,
    pub history_max: Option<usize>,
    pub accept_invalid_certs: Option<bool>,
}

pub fn load_settings(path: &Path) -> PersistentSettings {
    match std::fs::read_to_string(path) {
        Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
            warn!("Ignoring malformed settings file {:?}: {}", path, e);
            PersistentSettings::default()
        }),
        Err(_) => PersistentSettings::default(),
    }
}

impl PersistentSettings {
    /// Every value of `config` that the settings file can carry.
    pub fn from_config(config: &EngineConfig) -> Self {
        let pipeline = &config.pipeline;
        let speed = &config.speed_test;
        Self {
            api_base_url: Some(config.api_base_url.to_string()),
            health_path: Some(pipeline.health_path.clone()),
            download_url: Some(speed.download_path.clone()),
            upload_url: Some(speed.upload_path.clone()),
            ping_url: Some(speed.ping_path.clone()),
            download_window_secs: Some(speed.download_window.as_secs()),
            upload_window_secs: Some(speed.upload_window.as_secs()),
            upload_requests: Some(speed.upload_requests),
            upload_payload_bytes: Some(speed.upload_payload_bytes),
            ping_count: Some(speed.ping_count),
            ping_timeout_secs: Some(speed.ping_timeout.as_secs()),
            dns_timeout_secs: Some(pipeline.dns_timeout.as_secs()),
            http_timeout_secs: Some(pipeline.http_timeout.as_secs()),
            tcp_timeout_secs: Some(pipeline.tcp_timeout.as_secs()),
            tls_timeout_secs: Some(pipeline.tls_timeout.as_secs()),
            tunnel_timeout_secs: Some(pipeline.tunnel_timeout.as_secs()),
            history_max: Some(config.history_max),
            accept_invalid_certs: Some(config.accept_invalid_certs),
        }
    }
}

pub fn save_settings(path: &Path, settings: &PersistentSettings) -> Result<(), EngineError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(settings)
        .map_err(|e| EngineError::Other(format!("failed to serialize settings: {}", e)))?;
    std::fs::write(path, json)?;
    info!("Saved settings to {:?}", path);
    Ok(())
}
