use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::diagnostics::PipelineConfig;
use crate::error::EngineError;
use crate::settings::{load_settings, PersistentSettings};
use crate::speed_test::SpeedTestConfig;

/// VPN Diagnostics — connectivity checks and speed tests for the VPN client.
#[derive(Parser, Debug, Clone)]
#[command(name = "vpn-diagnostics", version)]
pub struct CliArgs {
    /// Base URL of the backend API (health endpoint host)
    #[arg(long = "api-base-url", global = true)]
    pub api_base_url: Option<String>,

    /// Health endpoint path, relative to the API base URL
    #[arg(long = "health-path", global = true)]
    pub health_path: Option<String>,

    /// Directory for the history database and settings file
    #[arg(long = "data-dir", global = true)]
    pub data_dir: Option<PathBuf>,

    /// Settings file (defaults to <data-dir>/diagnostics-settings.json)
    #[arg(long = "settings", global = true)]
    pub settings: Option<PathBuf>,

    /// Maximum number of speed test results kept in history
    #[arg(long = "history-max", global = true)]
    pub history_max: Option<usize>,

    /// Complete TLS probes without verifying the server certificate
    #[arg(long = "accept-invalid-certs", global = true)]
    pub accept_invalid_certs: bool,

    /// Keep history in memory instead of SQLite
    #[arg(long = "in-memory", global = true)]
    pub in_memory: bool,

    /// Also write logs to a daily rolling file in this directory
    #[arg(long = "log-dir", global = true)]
    pub log_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Serve the diagnostics HTTP API
    Serve {
        #[arg(long = "port", default_value_t = DEFAULT_SERVER_PORT)]
        port: u16,
    },
    /// Run the diagnostic pipeline once and print the result
    Diagnose {
        /// VPN server as host:port
        #[arg(short = 't', long = "target")]
        target: Option<String>,
        /// Display name of the VPN server
        #[arg(long = "server-name")]
        server_name: Option<String>,
    },
    /// Run a speed test and save it to history
    SpeedTest {
        #[arg(long = "vpn-active")]
        vpn_active: bool,
        #[arg(long = "server-name")]
        server_name: Option<String>,
    },
    /// Print or clear the speed test history
    History {
        #[arg(long = "clear")]
        clear: bool,
        #[arg(long = "limit")]
        limit: Option<usize>,
    },
    /// Print the effective settings
    Settings {
        /// Also save them to the settings file
        #[arg(long = "write")]
        write: bool,
    },
}

// Server constants
pub const DEFAULT_SERVER_PORT: u16 = 9890;

// Backend constants
pub const DEFAULT_API_BASE_URL: &str = "http://localhost:8000";
pub const DEFAULT_HEALTH_PATH: &str = "/health";
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 5;

// Pipeline timeouts
pub const DEFAULT_DNS_TIMEOUT_SECS: u64 = 5;
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_TCP_TIMEOUT_SECS: u64 = 5;
pub const DEFAULT_TLS_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_TUNNEL_TIMEOUT_SECS: u64 = 30;

// Speed test constants (Cloudflare's public speed endpoints)
pub const DEFAULT_DOWNLOAD_URL: &str = "https://speed.cloudflare.com/__down?bytes=100000000";
pub const DEFAULT_UPLOAD_URL: &str = "https://speed.cloudflare.com/__up";
pub const DEFAULT_PING_URL: &str = "https://speed.cloudflare.com/__down?bytes=0";
pub const DEFAULT_DOWNLOAD_WINDOW_SECS: u64 = 10;
pub const DEFAULT_UPLOAD_WINDOW_SECS: u64 = 10;
pub const DEFAULT_UPLOAD_REQUESTS: usize = 10;
pub const DEFAULT_UPLOAD_PAYLOAD_BYTES: usize = 1_000_000;
pub const DEFAULT_PING_COUNT: usize = 5;
pub const DEFAULT_PING_TIMEOUT_SECS: u64 = 3;

// History constants
pub const DEFAULT_HISTORY_MAX: usize = 20;
pub const HISTORY_KEY: &str = "speed_test_history";
pub const HISTORY_DB_FILE: &str = "history.db";
pub const SETTINGS_FILE: &str = "diagnostics-settings.json";

// In-memory buffers
pub const DIAGNOSTICS_JOURNAL_SIZE: usize = 20;
pub const LOG_BUFFER_SIZE: usize = 500;

pub struct EngineConfig {
    pub api_base_url: Url,
    pub data_dir: PathBuf,
    pub settings_path: PathBuf,
    pub history_max: usize,
    pub history_key: String,
    pub accept_invalid_certs: bool,
    pub in_memory: bool,
    pub log_dir: Option<PathBuf>,
    pub connect_timeout: Duration,
    pub pipeline: PipelineConfig,
    pub speed_test: SpeedTestConfig,
}

pub fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("vpn-diagnostics")
}

impl EngineConfig {
    /// Read the settings file named by `args` (or the default one) and merge.
    pub fn from_args(args: &CliArgs) -> Result<Self, EngineError> {
        let data_dir = args.data_dir.clone().unwrap_or_else(default_data_dir);
        let settings_path = args
            .settings
            .clone()
            .unwrap_or_else(|| data_dir.join(SETTINGS_FILE));
        let settings = load_settings(&settings_path);
        Self::resolve(args, &settings, data_dir, settings_path)
    }

    /// CLI flags win over the settings file, which wins over built-in defaults.
    pub fn resolve(
        args: &CliArgs,
        settings: &PersistentSettings,
        data_dir: PathBuf,
        settings_path: PathBuf,
    ) -> Result<Self, EngineError> {
        let base = args
            .api_base_url
            .clone()
            .or_else(|| settings.api_base_url.clone())
            .unwrap_or_else(|| DEFAULT_API_BASE_URL.to_string());
        let api_base_url = Url::parse(&base)
            .map_err(|e| EngineError::Config(format!("invalid API base URL '{}': {}", base, e)))?;
        let api_host = api_base_url
            .host_str()
            .ok_or_else(|| EngineError::Config(format!("API base URL '{}' has no host", base)))?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();

        let secs = |value: Option<u64>, default: u64| Duration::from_secs(value.unwrap_or(default));

        let mut pipeline = PipelineConfig::new(api_host);
        pipeline.health_path = args
            .health_path
            .clone()
            .or_else(|| settings.health_path.clone())
            .unwrap_or_else(|| DEFAULT_HEALTH_PATH.to_string());
        pipeline.dns_timeout = secs(settings.dns_timeout_secs, DEFAULT_DNS_TIMEOUT_SECS);
        pipeline.http_timeout = secs(settings.http_timeout_secs, DEFAULT_HTTP_TIMEOUT_SECS);
        pipeline.tcp_timeout = secs(settings.tcp_timeout_secs, DEFAULT_TCP_TIMEOUT_SECS);
        pipeline.tls_timeout = secs(settings.tls_timeout_secs, DEFAULT_TLS_TIMEOUT_SECS);
        pipeline.tunnel_timeout = secs(settings.tunnel_timeout_secs, DEFAULT_TUNNEL_TIMEOUT_SECS);

        let defaults = SpeedTestConfig::default();
        let speed_test = SpeedTestConfig {
            download_path: settings.download_url.clone().unwrap_or(defaults.download_path),
            upload_path: settings.upload_url.clone().unwrap_or(defaults.upload_path),
            ping_path: settings.ping_url.clone().unwrap_or(defaults.ping_path),
            download_window: secs(settings.download_window_secs, DEFAULT_DOWNLOAD_WINDOW_SECS),
            upload_window: secs(settings.upload_window_secs, DEFAULT_UPLOAD_WINDOW_SECS),
            upload_requests: settings.upload_requests.unwrap_or(defaults.upload_requests),
            upload_payload_bytes: settings
                .upload_payload_bytes
                .unwrap_or(defaults.upload_payload_bytes),
            ping_count: settings.ping_count.unwrap_or(defaults.ping_count),
            ping_timeout: secs(settings.ping_timeout_secs, DEFAULT_PING_TIMEOUT_SECS),
        };

        let history_max = args
            .history_max
            .or(settings.history_max)
            .unwrap_or(DEFAULT_HISTORY_MAX);
        if history_max == 0 {
            return Err(EngineError::Config("history size must be at least 1".to_string()));
        }

        Ok(EngineConfig {
            api_base_url,
            data_dir,
            settings_path,
            history_max,
            history_key: HISTORY_KEY.to_string(),
            accept_invalid_certs: args.accept_invalid_certs
                || settings.accept_invalid_certs.unwrap_or(false),
            in_memory: args.in_memory,
            log_dir: args.log_dir.clone(),
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            pipeline,
            speed_test,
        })
    }

    /// SQLite file backing the speed test history.
    pub fn history_db_path(&self) -> PathBuf {
        self.data_dir.join(HISTORY_DB_FILE)
    }

    pub fn settings_path(&self) -> &Path {
        &self.settings_path
    }
}
