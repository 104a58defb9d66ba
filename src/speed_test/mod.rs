//! Throughput probe: download, upload, then latency/jitter.

pub mod probe;
pub mod stats;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::{
    DEFAULT_DOWNLOAD_URL, DEFAULT_DOWNLOAD_WINDOW_SECS, DEFAULT_PING_COUNT,
    DEFAULT_PING_TIMEOUT_SECS, DEFAULT_PING_URL, DEFAULT_UPLOAD_PAYLOAD_BYTES,
    DEFAULT_UPLOAD_REQUESTS, DEFAULT_UPLOAD_URL, DEFAULT_UPLOAD_WINDOW_SECS,
};

pub use probe::{ProgressSink, RunPermit, ThroughputProbe};

/// Result of one measurement. A throughput of 0 means the phase failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeedTestResult {
    pub download_mbps: f64,
    pub upload_mbps: f64,
    /// Mean round-trip time of successful pings, 0 if none succeeded.
    pub latency_ms: f64,
    /// Rounded population stddev of successful pings, 0 below two samples.
    pub jitter_ms: u32,
    pub tested_at: DateTime<Utc>,
    pub vpn_active: bool,
    pub server_name: Option<String>,
}

/// Caller-supplied context recorded on the result; never measured.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeedTestContext {
    #[serde(default)]
    pub vpn_active: bool,
    #[serde(default)]
    pub server_name: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpeedTestPhase {
    Download,
    Upload,
    Latency,
}

impl SpeedTestPhase {
    pub fn label(&self) -> &'static str {
        match self {
            SpeedTestPhase::Download => "Testing Download",
            SpeedTestPhase::Upload => "Testing Upload",
            SpeedTestPhase::Latency => "Testing Latency",
        }
    }
}

/// Progress event emitted to an optional sink during a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SpeedTestProgress {
    PhaseStarted {
        phase: SpeedTestPhase,
    },
    /// Interim download figures, throttled.
    DownloadProgress {
        bytes: u64,
        mbps: f64,
    },
    /// `value` is Mbps for download/upload and mean latency in ms for latency.
    PhaseCompleted {
        phase: SpeedTestPhase,
        value: f64,
    },
    /// One per completed latency probe; `index` is 1-based.
    Ping {
        index: usize,
        total: usize,
        rtt_ms: Option<f64>,
    },
    Completed {
        result: SpeedTestResult,
    },
}

#[derive(Debug, Clone)]
pub struct SpeedTestConfig {
    pub download_path: String,
    pub upload_path: String,
    pub ping_path: String,
    /// Wall-clock cap on the download phase.
    pub download_window: Duration,
    /// Wall-clock cap on the upload phase.
    pub upload_window: Duration,
    pub upload_requests: usize,
    pub upload_payload_bytes: usize,
    pub ping_count: usize,
    pub ping_timeout: Duration,
}

impl Default for SpeedTestConfig {
    fn default() -> Self {
        Self {
            download_path: DEFAULT_DOWNLOAD_URL.to_string(),
            upload_path: DEFAULT_UPLOAD_URL.to_string(),
            ping_path: DEFAULT_PING_URL.to_string(),
            download_window: Duration::from_secs(DEFAULT_DOWNLOAD_WINDOW_SECS),
            upload_window: Duration::from_secs(DEFAULT_UPLOAD_WINDOW_SECS),
            upload_requests: DEFAULT_UPLOAD_REQUESTS,
            upload_payload_bytes: DEFAULT_UPLOAD_PAYLOAD_BYTES,
            ping_count: DEFAULT_PING_COUNT,
            ping_timeout: Duration::from_secs(DEFAULT_PING_TIMEOUT_SECS),
        }
    }
}

/// Format speed for display (e.g., "125.5 Mbps" or "1.2 Gbps").
pub fn format_speed(mbps: f64) -> String {
    if mbps >= 1000.0 {
        format!("{:.1} Gbps", mbps / 1000.0)
    } else if mbps >= 100.0 {
        format!("{:.0} Mbps", mbps)
    } else if mbps >= 10.0 {
        format!("{:.1} Mbps", mbps)
    } else {
        format!("{:.2} Mbps", mbps)
    }
}
