#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use std::collections::{BTreeSet, VecDeque};
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

use clap::Parser;
use vpn_diagnostics::config::{CliArgs, EngineConfig};
use vpn_diagnostics::diagnostics::{DiagnosticPipeline, PipelineConfig};
use vpn_diagnostics::network::{
    ByteStream, ConnectivitySource, HttpProbeClient, InterfaceKind, ProbeError, ProbeResponse,
    ServerTarget, SocketProber, TlsHandshakeInfo,
};
use vpn_diagnostics::settings::PersistentSettings;
use vpn_diagnostics::speed_test::SpeedTestConfig;
use vpn_diagnostics::store::{KeyValueStore, StoreError};

pub const HEALTH_PATH: &str = "/health";

pub struct FakeConnectivity {
    result: Mutex<Result<BTreeSet<InterfaceKind>, String>>,
}

impl FakeConnectivity {
    pub fn with(kinds: &[InterfaceKind]) -> Self {
        Self {
            result: Mutex::new(Ok(kinds.iter().copied().collect())),
        }
    }

    pub fn failing(message: &str) -> Self {
        Self {
            result: Mutex::new(Err(message.to_string())),
        }
    }
}

#[async_trait]
impl ConnectivitySource for FakeConnectivity {
    async fn check_connectivity(&self) -> anyhow::Result<BTreeSet<InterfaceKind>> {
        self.result
            .lock()
            .unwrap()
            .clone()
            .map_err(anyhow::Error::msg)
    }
}

/// Scripted HTTP collaborator. Every call is recorded as "METHOD path".
pub struct FakeHttp {
    health: Mutex<Result<ProbeResponse, ProbeError>>,
    download: Mutex<Result<Vec<Bytes>, ProbeError>>,
    download_gate: Mutex<Option<Arc<Notify>>>,
    upload: Mutex<Result<u16, ProbeError>>,
    pings: Mutex<VecDeque<Result<(), ProbeError>>>,
    pub calls: Mutex<Vec<String>>,
    pub posts: AtomicUsize,
}

impl Default for FakeHttp {
    fn default() -> Self {
        Self {
            health: Mutex::new(Ok(ProbeResponse { status: 200 })),
            download: Mutex::new(Ok(vec![Bytes::from(vec![7u8; 64 * 1024]); 4])),
            download_gate: Mutex::new(None),
            upload: Mutex::new(Ok(200)),
            pings: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
            posts: AtomicUsize::new(0),
        }
    }
}

impl FakeHttp {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_health(self, result: Result<ProbeResponse, ProbeError>) -> Self {
        *self.health.lock().unwrap() = result;
        self
    }

    pub fn with_download(self, result: Result<Vec<Bytes>, ProbeError>) -> Self {
        *self.download.lock().unwrap() = result;
        self
    }

    /// Download blocks until the gate is notified.
    pub fn with_download_gate(self, gate: Arc<Notify>) -> Self {
        *self.download_gate.lock().unwrap() = Some(gate);
        self
    }

    pub fn with_upload(self, result: Result<u16, ProbeError>) -> Self {
        *self.upload.lock().unwrap() = result;
        self
    }

    /// Ping outcomes in order; pings past the end of the script succeed.
    pub fn with_pings(self, script: Vec<Result<(), ProbeError>>) -> Self {
        *self.pings.lock().unwrap() = script.into();
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl HttpProbeClient for FakeHttp {
    async fn get(&self, path: &str, _timeout: Duration) -> Result<ProbeResponse, ProbeError> {
        self.record(format!("GET {}", path));
        self.health.lock().unwrap().clone()
    }

    async fn head(&self, path: &str, _timeout: Duration) -> Result<ProbeResponse, ProbeError> {
        self.record(format!("HEAD {}", path));
        let next = self.pings.lock().unwrap().pop_front();
        match next {
            Some(Err(e)) => Err(e),
            _ => Ok(ProbeResponse { status: 200 }),
        }
    }

    async fn post(
        &self,
        path: &str,
        _body: Bytes,
        _timeout: Duration,
    ) -> Result<ProbeResponse, ProbeError> {
        self.record(format!("POST {}", path));
        self.posts.fetch_add(1, Ordering::SeqCst);
        self.upload
            .lock()
            .unwrap()
            .clone()
            .map(|status| ProbeResponse { status })
    }

    async fn get_stream(&self, path: &str) -> Result<ByteStream, ProbeError> {
        self.record(format!("STREAM {}", path));
        let gate = self.download_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        let chunks = self.download.lock().unwrap().clone()?;
        Ok(stream::iter(chunks.into_iter().map(Ok)).boxed())
    }
}

/// Scripted DNS/TCP/TLS collaborator.
pub struct FakeSockets {
    resolve: Mutex<Result<Vec<IpAddr>, ProbeError>>,
    tcp: Mutex<Result<(), ProbeError>>,
    tls: Mutex<Result<TlsHandshakeInfo, ProbeError>>,
    pub calls: Mutex<Vec<String>>,
}

impl Default for FakeSockets {
    fn default() -> Self {
        Self {
            resolve: Mutex::new(Ok(vec!["203.0.113.10".parse().unwrap()])),
            tcp: Mutex::new(Ok(())),
            tls: Mutex::new(Ok(TlsHandshakeInfo {
                protocol_version: Some("TLSv1_3".to_string()),
            })),
            calls: Mutex::new(Vec::new()),
        }
    }
}

impl FakeSockets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_resolve(self, result: Result<Vec<IpAddr>, ProbeError>) -> Self {
        *self.resolve.lock().unwrap() = result;
        self
    }

    pub fn with_tcp(self, result: Result<(), ProbeError>) -> Self {
        *self.tcp.lock().unwrap() = result;
        self
    }

    pub fn with_tls(self, result: Result<TlsHandshakeInfo, ProbeError>) -> Self {
        *self.tls.lock().unwrap() = result;
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl SocketProber for FakeSockets {
    async fn resolve(&self, host: &str, _timeout: Duration) -> Result<Vec<IpAddr>, ProbeError> {
        self.calls.lock().unwrap().push(format!("resolve {}", host));
        self.resolve.lock().unwrap().clone()
    }

    async fn tcp_connect(
        &self,
        target: &ServerTarget,
        _timeout: Duration,
    ) -> Result<(), ProbeError> {
        self.calls.lock().unwrap().push(format!("tcp {}", target));
        self.tcp.lock().unwrap().clone()
    }

    async fn tls_handshake(
        &self,
        target: &ServerTarget,
        _timeout: Duration,
    ) -> Result<TlsHandshakeInfo, ProbeError> {
        self.calls.lock().unwrap().push(format!("tls {}", target));
        self.tls.lock().unwrap().clone()
    }
}

/// Key-value store whose writes always fail.
pub struct FailingStore;

#[async_trait]
impl KeyValueStore for FailingStore {
    async fn get_string(&self, _key: &str) -> Result<Option<String>, StoreError> {
        Ok(None)
    }

    async fn set_string(&self, _key: &str, _value: &str) -> Result<(), StoreError> {
        Err(StoreError::Backend("disk full".to_string()))
    }
}

pub fn pipeline_config() -> PipelineConfig {
    let mut config = PipelineConfig::new("api.example.com");
    config.health_path = HEALTH_PATH.to_string();
    config.tunnel_timeout = Duration::from_millis(200);
    config
}

pub fn pipeline(
    connectivity: Arc<FakeConnectivity>,
    http: Arc<FakeHttp>,
    sockets: Arc<FakeSockets>,
) -> DiagnosticPipeline {
    DiagnosticPipeline::new(pipeline_config(), connectivity, http, sockets)
}

/// Short windows and a small payload so a run finishes in milliseconds.
pub fn speed_test_config() -> SpeedTestConfig {
    SpeedTestConfig {
        download_path: "/__down".to_string(),
        upload_path: "/__up".to_string(),
        ping_path: "/__ping".to_string(),
        download_window: Duration::from_secs(2),
        upload_window: Duration::from_secs(2),
        upload_requests: 3,
        upload_payload_bytes: 10_000,
        ping_count: 5,
        ping_timeout: Duration::from_millis(500),
    }
}

pub fn engine_config(data_dir: PathBuf) -> EngineConfig {
    let args = CliArgs::parse_from(["vpn-diagnostics", "--in-memory", "serve"]);
    let settings_path = data_dir.join("diagnostics-settings.json");
    let mut config =
        EngineConfig::resolve(&args, &PersistentSettings::default(), data_dir, settings_path)
            .unwrap();
    config.pipeline = pipeline_config();
    config.speed_test = speed_test_config();
    config
}

pub fn result_named(name: &str) -> vpn_diagnostics::speed_test::SpeedTestResult {
    vpn_diagnostics::speed_test::SpeedTestResult {
        download_mbps: 80.0,
        upload_mbps: 20.0,
        latency_ms: 35.0,
        jitter_ms: 4,
        tested_at: chrono::Utc::now(),
        vpn_active: true,
        server_name: Some(name.to_string()),
    }
}
