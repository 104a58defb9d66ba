use bytes::Bytes;
use chrono::Utc;
use futures::StreamExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

use super::stats::{jitter_ms, mean, throughput_mbps};
use super::{
    SpeedTestConfig, SpeedTestContext, SpeedTestPhase, SpeedTestProgress, SpeedTestResult,
};
use crate::error::EngineError;
use crate::network::{HttpProbeClient, ProbeError};
use crate::store::ResultStore;

/// Interim download events are sent at most this often.
const PROGRESS_INTERVAL: Duration = Duration::from_millis(100);

/// Receives progress events. Sends never block; a closed receiver is ignored.
pub type ProgressSink = UnboundedSender<SpeedTestProgress>;

/// Holds the single in-flight slot of a [`ThroughputProbe`]. The slot is
/// released when the permit is dropped, whichever way the run exits.
#[derive(Debug)]
pub struct RunPermit {
    flag: Arc<AtomicBool>,
}

impl RunPermit {
    fn acquire(flag: &Arc<AtomicBool>) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| RunPermit { flag: flag.clone() })
    }
}

impl Drop for RunPermit {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

fn emit(sink: Option<&ProgressSink>, event: SpeedTestProgress) {
    if let Some(tx) = sink {
        let _ = tx.send(event);
    }
}

/// Three-phase throughput measurement with at most one run in flight.
pub struct ThroughputProbe {
    http: Arc<dyn HttpProbeClient>,
    config: SpeedTestConfig,
    store: Option<Arc<ResultStore>>,
    running: Arc<AtomicBool>,
}

impl ThroughputProbe {
    pub fn new(http: Arc<dyn HttpProbeClient>, config: SpeedTestConfig) -> Self {
        Self {
            http,
            config,
            store: None,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Persist every completed result through `store`.
    pub fn with_store(mut self, store: Arc<ResultStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn config(&self) -> &SpeedTestConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Claim the in-flight slot ahead of a run, or `None` while one is held.
    pub fn try_reserve(&self) -> Option<RunPermit> {
        RunPermit::acquire(&self.running)
    }

    /// Run download, upload and latency phases in order.
    ///
    /// Transport failures zero the affected metric instead of failing the
    /// run. The only error is [`EngineError::SpeedTestInProgress`], returned
    /// immediately when another run on this instance has not finished.
    pub async fn run_speed_test(
        &self,
        context: SpeedTestContext,
        progress: Option<ProgressSink>,
    ) -> Result<SpeedTestResult, EngineError> {
        let permit = self.try_reserve().ok_or(EngineError::SpeedTestInProgress)?;
        Ok(self.run_reserved(permit, context, progress).await)
    }

    /// [`run_speed_test`](Self::run_speed_test) with a slot already claimed
    /// through [`try_reserve`](Self::try_reserve).
    pub async fn run_reserved(
        &self,
        _permit: RunPermit,
        context: SpeedTestContext,
        progress: Option<ProgressSink>,
    ) -> SpeedTestResult {
        let sink = progress.as_ref();
        info!(
            "Starting speed test (vpn_active={}, server={:?})",
            context.vpn_active, context.server_name
        );

        emit(sink, SpeedTestProgress::PhaseStarted { phase: SpeedTestPhase::Download });
        let download_mbps = self.measure_download(sink).await;
        emit(
            sink,
            SpeedTestProgress::PhaseCompleted {
                phase: SpeedTestPhase::Download,
                value: download_mbps,
            },
        );

        emit(sink, SpeedTestProgress::PhaseStarted { phase: SpeedTestPhase::Upload });
        let upload_mbps = self.measure_upload().await;
        emit(
            sink,
            SpeedTestProgress::PhaseCompleted {
                phase: SpeedTestPhase::Upload,
                value: upload_mbps,
            },
        );

        emit(sink, SpeedTestProgress::PhaseStarted { phase: SpeedTestPhase::Latency });
        let samples = self.measure_latency(sink).await;
        let latency_ms = mean(&samples);
        let jitter = jitter_ms(&samples);
        emit(
            sink,
            SpeedTestProgress::PhaseCompleted {
                phase: SpeedTestPhase::Latency,
                value: latency_ms,
            },
        );

        let result = SpeedTestResult {
            download_mbps,
            upload_mbps,
            latency_ms,
            jitter_ms: jitter,
            tested_at: Utc::now(),
            vpn_active: context.vpn_active,
            server_name: context.server_name,
        };

        info!(
            "Speed test complete: download={:.2} Mbps, upload={:.2} Mbps, latency={:.1}ms, jitter={}ms",
            result.download_mbps, result.upload_mbps, result.latency_ms, result.jitter_ms
        );

        if let Some(store) = &self.store {
            if let Err(e) = store.save_result(&result).await {
                warn!("Failed to save speed test result: {}", e);
            }
        }

        emit(sink, SpeedTestProgress::Completed { result: result.clone() });
        result
    }

    /// Stream the download endpoint until the window closes or the body ends.
    async fn measure_download(&self, sink: Option<&ProgressSink>) -> f64 {
        let window = self.config.download_window;
        let start = Instant::now();
        let mut bytes_received: u64 = 0;
        let mut last_progress = start;

        let transfer = async {
            let mut stream = self.http.get_stream(&self.config.download_path).await?;
            while let Some(chunk) = stream.next().await {
                bytes_received += chunk?.len() as u64;
                if last_progress.elapsed() >= PROGRESS_INTERVAL {
                    let mbps = throughput_mbps(bytes_received, start.elapsed()).unwrap_or(0.0);
                    emit(
                        sink,
                        SpeedTestProgress::DownloadProgress {
                            bytes: bytes_received,
                            mbps,
                        },
                    );
                    last_progress = Instant::now();
                }
            }
            Ok::<(), ProbeError>(())
        };

        match tokio::time::timeout(window, transfer).await {
            Ok(Ok(())) => debug!("Download body finished before the window closed"),
            Ok(Err(e)) => {
                warn!("Download failed: {}", e);
                return 0.0;
            }
            Err(_) => debug!("Download window of {:?} elapsed", window),
        }

        let elapsed = start.elapsed();
        debug!("Downloaded {} bytes in {:?}", bytes_received, elapsed);
        phase_mbps("Download", bytes_received, elapsed)
    }

    /// POST synthetic payloads until the request budget or the window runs out.
    async fn measure_upload(&self) -> f64 {
        let window = self.config.upload_window;
        let payload = Bytes::from(
            (0..self.config.upload_payload_bytes)
                .map(|i| (i % 256) as u8)
                .collect::<Vec<u8>>(),
        );
        let start = Instant::now();
        let mut bytes_sent: u64 = 0;

        let transfer = async {
            for i in 0..self.config.upload_requests {
                let remaining = window.saturating_sub(start.elapsed());
                let resp = self
                    .http
                    .post(&self.config.upload_path, payload.clone(), remaining)
                    .await?;
                if !resp.is_success() {
                    return Err(ProbeError::Http(format!(
                        "upload {} responded with status {}",
                        i + 1,
                        resp.status
                    )));
                }
                bytes_sent += payload.len() as u64;
            }
            Ok::<(), ProbeError>(())
        };

        match tokio::time::timeout(window, transfer).await {
            Ok(Ok(())) => debug!("All {} upload requests completed", self.config.upload_requests),
            Ok(Err(e)) if e.is_timeout() && bytes_sent > 0 => {
                debug!("Upload window closed mid-request: {}", e)
            }
            Ok(Err(e)) => {
                warn!("Upload failed: {}", e);
                return 0.0;
            }
            Err(_) => debug!("Upload window of {:?} elapsed", window),
        }

        let elapsed = start.elapsed();
        debug!("Uploaded {} bytes in {:?}", bytes_sent, elapsed);
        phase_mbps("Upload", bytes_sent, elapsed)
    }

    /// Sequential pings; each failure is independent of the others.
    async fn measure_latency(&self, sink: Option<&ProgressSink>) -> Vec<f64> {
        let total = self.config.ping_count;
        let mut samples = Vec::with_capacity(total);

        for index in 1..=total {
            let start = Instant::now();
            let rtt_ms = match self
                .http
                .head(&self.config.ping_path, self.config.ping_timeout)
                .await
            {
                Ok(_) => {
                    let ms = start.elapsed().as_secs_f64() * 1000.0;
                    debug!("Ping #{}: {:.1}ms", index, ms);
                    samples.push(ms);
                    Some(ms)
                }
                Err(e) => {
                    debug!("Ping #{}: {}", index, e);
                    None
                }
            };
            emit(sink, SpeedTestProgress::Ping { index, total, rtt_ms });
        }

        samples
    }
}

fn phase_mbps(phase: &str, bytes: u64, elapsed: Duration) -> f64 {
    match throughput_mbps(bytes, elapsed) {
        Some(mbps) => mbps,
        None => {
            warn!("{} window measured zero elapsed time; recording 0 Mbps", phase);
            0.0
        }
    }
}
