use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use std::time::Duration;
use tracing::debug;
use url::Url;

use super::{ByteStream, HttpProbeClient, ProbeError, ProbeResponse};

/// [`HttpProbeClient`] backed by a shared `reqwest::Client`.
///
/// The client carries a connect timeout only. Per-request timeouts come from
/// the caller so the streamed download is never cut short by the client.
#[derive(Clone)]
pub struct ReqwestProbeClient {
    client: reqwest::Client,
    base_url: Url,
}

impl ReqwestProbeClient {
    /// `base_url` is treated as a prefix: a path on it is kept when relative
    /// paths are resolved.
    pub fn new(base_url: Url, connect_timeout: Duration) -> Result<Self, ProbeError> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .pool_max_idle_per_host(4)
            .user_agent(concat!("vpn-diagnostics/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ProbeError::Http(format!("failed to create HTTP client: {}", e)))?;
        Ok(Self::with_client(client, base_url))
    }

    pub fn with_client(client: reqwest::Client, base_url: Url) -> Self {
        Self {
            client,
            base_url: as_directory(base_url),
        }
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Absolute URLs pass through; relative paths, with or without a leading
    /// `/`, are appended to the base path.
    pub fn resolve_url(&self, path: &str) -> Result<Url, ProbeError> {
        if path.starts_with("http://") || path.starts_with("https://") {
            Url::parse(path).map_err(|e| ProbeError::InvalidUrl(format!("{}: {}", path, e)))
        } else {
            self.base_url
                .join(path.trim_start_matches('/'))
                .map_err(|e| ProbeError::InvalidUrl(format!("{}: {}", path, e)))
        }
    }
}

/// `Url::join` replaces the last segment unless the base ends with `/`.
fn as_directory(mut url: Url) -> Url {
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    url
}

fn classify(url: &Url, err: reqwest::Error) -> ProbeError {
    if err.is_timeout() {
        ProbeError::Timeout(format!("request to {} timed out", url))
    } else if err.is_connect() {
        ProbeError::Connect(format!("{}: {}", url, err))
    } else {
        ProbeError::Http(format!("{}: {}", url, err))
    }
}

#[async_trait]
impl HttpProbeClient for ReqwestProbeClient {
    async fn get(&self, path: &str, timeout: Duration) -> Result<ProbeResponse, ProbeError> {
        let url = self.resolve_url(path)?;
        debug!("GET {}", url);
        let resp = self
            .client
            .get(url.clone())
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| classify(&url, e))?;
        Ok(ProbeResponse {
            status: resp.status().as_u16(),
        })
    }

    async fn head(&self, path: &str, timeout: Duration) -> Result<ProbeResponse, ProbeError> {
        let url = self.resolve_url(path)?;
        let resp = self
            .client
            .head(url.clone())
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| classify(&url, e))?;
        Ok(ProbeResponse {
            status: resp.status().as_u16(),
        })
    }

    async fn post(
        &self,
        path: &str,
        body: Bytes,
        timeout: Duration,
    ) -> Result<ProbeResponse, ProbeError> {
        let url = self.resolve_url(path)?;
        let resp = self
            .client
            .post(url.clone())
            .header("Content-Type", "application/octet-stream")
            .body(body)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| classify(&url, e))?;
        Ok(ProbeResponse {
            status: resp.status().as_u16(),
        })
    }

    async fn get_stream(&self, path: &str) -> Result<ByteStream, ProbeError> {
        let url = self.resolve_url(path)?;
        debug!("Streaming GET {}", url);
        let resp = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| classify(&url, e))?;

        if !resp.status().is_success() {
            return Err(ProbeError::Http(format!(
                "{} responded with status {}",
                url,
                resp.status()
            )));
        }

        let stream = resp
            .bytes_stream()
            .map(move |chunk| chunk.map_err(|e| classify(&url, e)));
        Ok(stream.boxed())
    }
}
