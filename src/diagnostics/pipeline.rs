use chrono::Utc;
use futures::stream::{self, BoxStream, StreamExt};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::{DiagnosticResult, DiagnosticStep, StepName, StepOutcome, StepStatus};
use crate::config::{
    DEFAULT_DNS_TIMEOUT_SECS, DEFAULT_HEALTH_PATH, DEFAULT_HTTP_TIMEOUT_SECS,
    DEFAULT_TCP_TIMEOUT_SECS, DEFAULT_TLS_TIMEOUT_SECS, DEFAULT_TUNNEL_TIMEOUT_SECS,
};
use crate::network::{
    ConnectivitySource, HttpProbeClient, InterfaceKind, ProbeError, ServerTarget, SocketProber,
    VpnConnectTest,
};

const SUGGEST_ENABLE_NETWORK: &str = "Enable WiFi or mobile data.";
const SUGGEST_CHECK_DNS: &str = "Check your DNS settings or switch to another network.";
const SUGGEST_API_DOWN: &str = "API server may be down. Try again later.";
const SUGGEST_API_STATUS: &str = "API server returned an unexpected status. Try again later.";
const SUGGEST_SELECT_SERVER: &str = "Select a VPN server.";
const SUGGEST_SERVER_REFUSED: &str = "The VPN server refused the connection. Try another server.";
const SUGGEST_PORT_BLOCKED: &str = "The VPN server port may be blocked by your network or firewall.";
const SUGGEST_TLS_BLOCKED: &str =
    "TLS to the VPN server is failing; the network may be intercepting encrypted traffic.";
const SUGGEST_TUNNEL_UNAVAILABLE: &str = "Connect from the main screen to verify the tunnel.";
const SUGGEST_PROTOCOL_ERROR: &str =
    "VPN protocol error. Try another server or switch the VPN protocol.";

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Host name resolved by the DNS step.
    pub api_host: String,
    /// Health endpoint probed by the API step, relative to the HTTP client's base.
    pub health_path: String,
    pub dns_timeout: Duration,
    pub http_timeout: Duration,
    pub tcp_timeout: Duration,
    pub tls_timeout: Duration,
    pub tunnel_timeout: Duration,
}

impl PipelineConfig {
    pub fn new(api_host: impl Into<String>) -> Self {
        Self {
            api_host: api_host.into(),
            health_path: DEFAULT_HEALTH_PATH.to_string(),
            dns_timeout: Duration::from_secs(DEFAULT_DNS_TIMEOUT_SECS),
            http_timeout: Duration::from_secs(DEFAULT_HTTP_TIMEOUT_SECS),
            tcp_timeout: Duration::from_secs(DEFAULT_TCP_TIMEOUT_SECS),
            tls_timeout: Duration::from_secs(DEFAULT_TLS_TIMEOUT_SECS),
            tunnel_timeout: Duration::from_secs(DEFAULT_TUNNEL_TIMEOUT_SECS),
        }
    }
}

/// Everything a run needs, shared by the lazy step stream.
struct RunContext {
    config: PipelineConfig,
    connectivity: Arc<dyn ConnectivitySource>,
    http: Arc<dyn HttpProbeClient>,
    sockets: Arc<dyn SocketProber>,
    vpn_connect_test: Option<VpnConnectTest>,
    target: Option<ServerTarget>,
}

#[derive(Clone)]
pub struct DiagnosticPipeline {
    config: PipelineConfig,
    connectivity: Arc<dyn ConnectivitySource>,
    http: Arc<dyn HttpProbeClient>,
    sockets: Arc<dyn SocketProber>,
    vpn_connect_test: Option<VpnConnectTest>,
}

impl DiagnosticPipeline {
    pub fn new(
        config: PipelineConfig,
        connectivity: Arc<dyn ConnectivitySource>,
        http: Arc<dyn HttpProbeClient>,
        sockets: Arc<dyn SocketProber>,
    ) -> Self {
        Self {
            config,
            connectivity,
            http,
            sockets,
            vpn_connect_test: None,
        }
    }

    pub fn with_vpn_connect_test(mut self, test: VpnConnectTest) -> Self {
        self.vpn_connect_test = Some(test);
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Lazy sequence of exactly six terminal steps in fixed order.
    ///
    /// A step's probe starts only when the consumer polls for it, so dropping
    /// the stream abandons the rest of the run. Calling again starts over.
    pub fn run_diagnostics(&self, target: Option<ServerTarget>) -> BoxStream<'static, DiagnosticStep> {
        let ctx = Arc::new(RunContext {
            config: self.config.clone(),
            connectivity: self.connectivity.clone(),
            http: self.http.clone(),
            sockets: self.sockets.clone(),
            vpn_connect_test: self.vpn_connect_test.clone(),
            target,
        });

        match &ctx.target {
            Some(t) => info!("Starting diagnostics against {}", t.label()),
            None => info!("Starting diagnostics without a VPN server"),
        }

        stream::unfold((ctx, 0usize), |(ctx, index)| async move {
            let name = *StepName::ALL.get(index)?;
            let step = ctx.run_step(name).await;
            Some((step, (ctx, index + 1)))
        })
        .boxed()
    }

    /// Drain [`run_diagnostics`](Self::run_diagnostics) into a [`DiagnosticResult`].
    pub async fn run_full_diagnostics(&self, target: Option<ServerTarget>) -> DiagnosticResult {
        let ran_at = Utc::now();
        let start = Instant::now();
        let steps: Vec<DiagnosticStep> = self.run_diagnostics(target).collect().await;
        let result = DiagnosticResult::new(steps, ran_at, start.elapsed());
        info!("Diagnostics finished: {}", result.summary());
        result
    }
}

impl RunContext {
    async fn run_step(&self, name: StepName) -> DiagnosticStep {
        let step = DiagnosticStep::pending(name).start();
        let start = Instant::now();
        let outcome = match name {
            StepName::NetworkConnectivity => self.check_network().await,
            StepName::DnsResolution => self.check_dns().await,
            StepName::ApiReachability => self.check_api().await,
            StepName::VpnTcpHandshake => self.check_tcp().await,
            StepName::TlsHandshake => self.check_tls().await,
            StepName::FullTunnel => self.check_tunnel().await,
        };
        let step = step.finish(outcome, start.elapsed());

        match step.status() {
            StepStatus::Success => debug!("{}: {}", name, step.message().unwrap_or("")),
            status => warn!(
                "{} {}: {}",
                name,
                status.as_str(),
                step.message().unwrap_or("")
            ),
        }
        step
    }

    async fn check_network(&self) -> StepOutcome {
        match self.connectivity.check_connectivity().await {
            Ok(kinds) => {
                let active: Vec<&str> = kinds
                    .iter()
                    .filter(|k| **k != InterfaceKind::None)
                    .map(InterfaceKind::as_str)
                    .collect();
                if active.is_empty() {
                    StepOutcome::failed("No network connection", SUGGEST_ENABLE_NETWORK)
                } else {
                    StepOutcome::success(format!("Connected via {}", active.join(", ")))
                }
            }
            Err(e) => StepOutcome::failed(
                format!("Unable to determine network state: {}", e),
                SUGGEST_ENABLE_NETWORK,
            ),
        }
    }

    async fn check_dns(&self) -> StepOutcome {
        let host = &self.config.api_host;
        match self.sockets.resolve(host, self.config.dns_timeout).await {
            Ok(addrs) => match addrs.first() {
                Some(addr) => StepOutcome::success(format!("Resolved {} to {}", host, addr)),
                None => StepOutcome::failed(
                    format!("Could not resolve {}: no addresses", host),
                    SUGGEST_CHECK_DNS,
                ),
            },
            Err(e) => StepOutcome::failed(
                format!("Could not resolve {}: {}", host, e),
                SUGGEST_CHECK_DNS,
            ),
        }
    }

    async fn check_api(&self) -> StepOutcome {
        match self
            .http
            .get(&self.config.health_path, self.config.http_timeout)
            .await
        {
            Ok(resp) if resp.is_success() => {
                StepOutcome::success(format!("API responded with status {}", resp.status))
            }
            Ok(resp) => StepOutcome::warning(
                format!("API responded with status {}", resp.status),
                Some(SUGGEST_API_STATUS.to_string()),
            ),
            Err(e) => StepOutcome::failed(format!("API request failed: {}", e), SUGGEST_API_DOWN),
        }
    }

    async fn check_tcp(&self) -> StepOutcome {
        let Some(target) = &self.target else {
            return no_server_selected();
        };
        match self.sockets.tcp_connect(target, self.config.tcp_timeout).await {
            Ok(()) => StepOutcome::success(format!("TCP connection to {} established", target)),
            Err(e) => {
                let suggestion = match e {
                    ProbeError::ConnectionRefused(_) => SUGGEST_SERVER_REFUSED,
                    _ => SUGGEST_PORT_BLOCKED,
                };
                StepOutcome::failed(
                    format!("TCP connection to {} failed: {}", target, e),
                    suggestion,
                )
            }
        }
    }

    async fn check_tls(&self) -> StepOutcome {
        let Some(target) = &self.target else {
            return no_server_selected();
        };
        match self.sockets.tls_handshake(target, self.config.tls_timeout).await {
            Ok(info) => {
                let message = match info.protocol_version {
                    Some(version) => format!(
                        "TLS handshake with {} completed ({})",
                        target.server_name(),
                        version
                    ),
                    None => format!("TLS handshake with {} completed", target.server_name()),
                };
                StepOutcome::success(message)
            }
            Err(e) => {
                let suggestion = match e {
                    ProbeError::Tls(_) => SUGGEST_TLS_BLOCKED,
                    ProbeError::ConnectionRefused(_) => SUGGEST_SERVER_REFUSED,
                    _ => SUGGEST_PORT_BLOCKED,
                };
                StepOutcome::failed(
                    format!("TLS handshake with {} failed: {}", target, e),
                    suggestion,
                )
            }
        }
    }

    async fn check_tunnel(&self) -> StepOutcome {
        let Some(test) = &self.vpn_connect_test else {
            return StepOutcome::warning(
                "Full tunnel test not available",
                Some(SUGGEST_TUNNEL_UNAVAILABLE.to_string()),
            );
        };
        // The callback is caller code; a panic in it still ends as a failed step.
        let attempt = AssertUnwindSafe(async { test().await }).catch_unwind();
        match tokio::time::timeout(self.config.tunnel_timeout, attempt).await {
            Ok(Ok(Ok(true))) => StepOutcome::success("VPN tunnel established"),
            Ok(Ok(Ok(false))) => {
                StepOutcome::failed("VPN tunnel could not be established", SUGGEST_PROTOCOL_ERROR)
            }
            Ok(Ok(Err(e))) => {
                StepOutcome::failed(format!("VPN tunnel test failed: {}", e), SUGGEST_PROTOCOL_ERROR)
            }
            Ok(Err(_)) => StepOutcome::failed("VPN tunnel test panicked", SUGGEST_PROTOCOL_ERROR),
            Err(_) => StepOutcome::failed(
                format!(
                    "VPN tunnel test timed out after {}s",
                    self.config.tunnel_timeout.as_secs()
                ),
                SUGGEST_PROTOCOL_ERROR,
            ),
        }
    }
}

fn no_server_selected() -> StepOutcome {
    StepOutcome::warning(
        "No VPN server selected",
        Some(SUGGEST_SELECT_SERVER.to_string()),
    )
}
