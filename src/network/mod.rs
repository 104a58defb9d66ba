//! Collaborator contracts consumed by the diagnostic pipeline and the
//! throughput probe, plus the host implementations used by the binary.

pub mod connectivity;
pub mod http;
pub mod socket;

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

pub use connectivity::SystemConnectivity;
pub use http::ReqwestProbeClient;
pub use socket::TokioSocketProber;

/// Kind of network interface reported by a [`ConnectivitySource`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InterfaceKind {
    Wifi,
    Cellular,
    Ethernet,
    Vpn,
    Other,
    None,
}

impl InterfaceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            InterfaceKind::Wifi => "wifi",
            InterfaceKind::Cellular => "cellular",
            InterfaceKind::Ethernet => "ethernet",
            InterfaceKind::Vpn => "vpn",
            InterfaceKind::Other => "other",
            InterfaceKind::None => "none",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProbeError {
    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("DNS resolution failed: {0}")]
    Dns(String),

    #[error("Connection refused: {0}")]
    ConnectionRefused(String),

    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("TLS handshake failed: {0}")]
    Tls(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
}

impl ProbeError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, ProbeError::Timeout(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeResponse {
    pub status: u16,
}

impl ProbeResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsHandshakeInfo {
    pub protocol_version: Option<String>,
}

pub type ByteStream = BoxStream<'static, Result<Bytes, ProbeError>>;

/// Async predicate answering "can a full tunnel be negotiated right now".
pub type VpnConnectTest = Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<bool>> + Send + Sync>;

#[async_trait]
pub trait ConnectivitySource: Send + Sync {
    async fn check_connectivity(&self) -> anyhow::Result<BTreeSet<InterfaceKind>>;
}

/// Bounded-timeout HTTP calls against a base URL.
///
/// A `path` that already carries an `http://` or `https://` scheme is used
/// verbatim; anything else is joined onto the base URL.
#[async_trait]
pub trait HttpProbeClient: Send + Sync {
    async fn get(&self, path: &str, timeout: Duration) -> Result<ProbeResponse, ProbeError>;

    async fn head(&self, path: &str, timeout: Duration) -> Result<ProbeResponse, ProbeError>;

    async fn post(
        &self,
        path: &str,
        body: Bytes,
        timeout: Duration,
    ) -> Result<ProbeResponse, ProbeError>;

    /// Streamed GET. No timeout is applied to the body; callers bound it.
    async fn get_stream(&self, path: &str) -> Result<ByteStream, ProbeError>;
}

/// DNS, TCP and TLS primitives of the host platform.
#[async_trait]
pub trait SocketProber: Send + Sync {
    async fn resolve(&self, host: &str, timeout: Duration) -> Result<Vec<IpAddr>, ProbeError>;

    async fn tcp_connect(&self, target: &ServerTarget, timeout: Duration)
        -> Result<(), ProbeError>;

    async fn tls_handshake(
        &self,
        target: &ServerTarget,
        timeout: Duration,
    ) -> Result<TlsHandshakeInfo, ProbeError>;
}

/// A VPN server endpoint to probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerTarget {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub name: Option<String>,
    /// TLS server name, when it differs from `host`.
    #[serde(default)]
    pub sni: Option<String>,
}

impl ServerTarget {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            name: None,
            sni: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_sni(mut self, sni: impl Into<String>) -> Self {
        self.sni = Some(sni.into());
        self
    }

    pub fn server_name(&self) -> &str {
        self.sni.as_deref().unwrap_or(&self.host)
    }

    pub fn label(&self) -> String {
        match &self.name {
            Some(name) => format!("{} ({})", name, self),
            None => self.to_string(),
        }
    }
}

impl fmt::Display for ServerTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for ServerTarget {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (host, port) = if let Some(rest) = s.strip_prefix('[') {
            let (host, tail) = rest
                .split_once(']')
                .ok_or_else(|| format!("unterminated IPv6 literal in '{}'", s))?;
            let port = tail
                .strip_prefix(':')
                .ok_or_else(|| format!("target must be host:port, got '{}'", s))?;
            (host, port)
        } else {
            s.rsplit_once(':')
                .ok_or_else(|| format!("target must be host:port, got '{}'", s))?
        };

        if host.is_empty() {
            return Err(format!("missing host in '{}'", s));
        }
        let port: u16 = port
            .parse()
            .map_err(|_| format!("invalid port '{}' in '{}'", port, s))?;
        if port == 0 {
            return Err(format!("port must be non-zero in '{}'", s));
        }

        Ok(ServerTarget::new(host, port))
    }
}
