use async_trait::async_trait;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tracing::debug;

use super::{ProbeError, ServerTarget, SocketProber, TlsHandshakeInfo};

/// [`SocketProber`] over tokio's resolver, `socket2` connects and `tokio-rustls`.
#[derive(Clone)]
pub struct TokioSocketProber {
    tls: TlsConnector,
}

impl TokioSocketProber {
    /// With `accept_invalid_certs` the TLS probe only checks that a handshake
    /// completes; the certificate chain is not verified.
    pub fn new(accept_invalid_certs: bool) -> Result<Self, ProbeError> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let builder = ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| ProbeError::Tls(format!("unsupported protocol versions: {}", e)))?;

        let config = if accept_invalid_certs {
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(NoVerifier))
                .with_no_client_auth()
        } else {
            let mut roots = RootCertStore::empty();
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            builder.with_root_certificates(roots).with_no_client_auth()
        };

        Ok(Self {
            tls: TlsConnector::from(Arc::new(config)),
        })
    }

    async fn resolve_target(
        &self,
        target: &ServerTarget,
        limit: Duration,
    ) -> Result<Vec<SocketAddr>, ProbeError> {
        let host = target.host.clone();
        let lookup = tokio::net::lookup_host((host.as_str(), target.port));
        let addrs: Vec<SocketAddr> = timeout(limit, lookup)
            .await
            .map_err(|_| ProbeError::Timeout(format!("resolving {} timed out", target.host)))?
            .map_err(|e| ProbeError::Dns(format!("{}: {}", target.host, e)))?
            .collect();
        if addrs.is_empty() {
            return Err(ProbeError::Dns(format!("{}: no addresses", target.host)));
        }
        Ok(addrs)
    }
}

/// Blocking connect on a fresh `socket2` socket. Runs on the blocking pool.
fn connect_blocking(addr: SocketAddr, limit: Duration) -> Result<(), ProbeError> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
        .map_err(|e| ProbeError::Connect(format!("{}: {}", addr, e)))?;
    socket
        .connect_timeout(&addr.into(), limit)
        .map_err(|e| classify_io(addr, e))
}

fn classify_io(addr: SocketAddr, err: io::Error) -> ProbeError {
    match err.kind() {
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => {
            ProbeError::Timeout(format!("connect to {} timed out", addr))
        }
        io::ErrorKind::ConnectionRefused => ProbeError::ConnectionRefused(addr.to_string()),
        _ => ProbeError::Connect(format!("{}: {}", addr, err)),
    }
}

#[async_trait]
impl SocketProber for TokioSocketProber {
    async fn resolve(&self, host: &str, limit: Duration) -> Result<Vec<IpAddr>, ProbeError> {
        let lookup = tokio::net::lookup_host((host, 0));
        let addrs: Vec<IpAddr> = timeout(limit, lookup)
            .await
            .map_err(|_| ProbeError::Timeout(format!("resolving {} timed out", host)))?
            .map_err(|e| ProbeError::Dns(format!("{}: {}", host, e)))?
            .map(|a| a.ip())
            .collect();
        if addrs.is_empty() {
            return Err(ProbeError::Dns(format!("{}: no addresses", host)));
        }
        debug!("Resolved {} -> {:?}", host, addrs);
        Ok(addrs)
    }

    /// `limit` bounds resolution plus every address attempt together.
    async fn tcp_connect(&self, target: &ServerTarget, limit: Duration) -> Result<(), ProbeError> {
        let attempt = async {
            let addrs = self.resolve_target(target, limit).await?;
            let mut last_err = None;
            for addr in addrs {
                match tokio::task::spawn_blocking(move || connect_blocking(addr, limit)).await {
                    Ok(Ok(())) => {
                        debug!("TCP connect to {} succeeded", addr);
                        return Ok(());
                    }
                    Ok(Err(e)) => {
                        debug!("TCP connect to {} failed: {}", addr, e);
                        last_err = Some(e);
                    }
                    Err(e) => last_err = Some(ProbeError::Connect(e.to_string())),
                }
            }
            Err(last_err.unwrap_or_else(|| ProbeError::Connect(target.to_string())))
        };

        timeout(limit, attempt)
            .await
            .map_err(|_| ProbeError::Timeout(format!("TCP connect to {} timed out", target)))?
    }

    async fn tls_handshake(
        &self,
        target: &ServerTarget,
        limit: Duration,
    ) -> Result<TlsHandshakeInfo, ProbeError> {
        let server_name = ServerName::try_from(target.server_name().to_string())
            .map_err(|e| ProbeError::Tls(format!("invalid server name: {}", e)))?;
        let connector = self.tls.clone();
        let addr = (target.host.clone(), target.port);

        let handshake = async move {
            let tcp = TcpStream::connect(addr)
                .await
                .map_err(|e| match e.kind() {
                    io::ErrorKind::ConnectionRefused => {
                        ProbeError::ConnectionRefused(e.to_string())
                    }
                    _ => ProbeError::Connect(e.to_string()),
                })?;
            let stream = connector
                .connect(server_name, tcp)
                .await
                .map_err(|e| ProbeError::Tls(e.to_string()))?;
            let (_, session) = stream.get_ref();
            Ok::<_, ProbeError>(TlsHandshakeInfo {
                protocol_version: session
                    .protocol_version()
                    .and_then(|v| v.as_str())
                    .map(str::to_string),
            })
        };

        timeout(limit, handshake)
            .await
            .map_err(|_| ProbeError::Timeout(format!("TLS handshake with {} timed out", target)))?
    }
}

#[derive(Debug)]
struct NoVerifier;

impl ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        use SignatureScheme::*;
        vec![
            RSA_PSS_SHA512,
            RSA_PSS_SHA384,
            RSA_PSS_SHA256,
            RSA_PKCS1_SHA512,
            RSA_PKCS1_SHA384,
            RSA_PKCS1_SHA256,
            ECDSA_NISTP521_SHA512,
            ECDSA_NISTP384_SHA384,
            ECDSA_NISTP256_SHA256,
            ED25519,
        ]
    }
}
