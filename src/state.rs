use futures::Stream;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tracing::info;

use crate::config::EngineConfig;
use crate::diagnostics::{DiagnosticPipeline, DiagnosticsJournal};
use crate::error::EngineError;
use crate::log_capture::LogState;
use crate::network::{
    ConnectivitySource, HttpProbeClient, ReqwestProbeClient, SocketProber, SystemConnectivity,
    TokioSocketProber,
};
use crate::speed_test::ThroughputProbe;
use crate::store::{KeyValueStore, MemoryStore, ResultStore, SqliteStore};

pub type SharedState = Arc<EngineState>;

pub struct EngineState {
    pub pipeline: DiagnosticPipeline,
    pub probe: Arc<ThroughputProbe>,
    pub history: Arc<ResultStore>,
    pub journal: RwLock<DiagnosticsJournal>,
    pub logs: LogState,
    /// Fired once when the server begins shutting down.
    pub shutdown_tx: broadcast::Sender<()>,
}

/// Collaborators the engine is assembled from. The binary builds the host
/// implementations; tests substitute fakes.
pub struct EngineParts {
    pub connectivity: Arc<dyn ConnectivitySource>,
    pub http: Arc<dyn HttpProbeClient>,
    pub sockets: Arc<dyn SocketProber>,
    pub kv: Arc<dyn KeyValueStore>,
}

impl EngineParts {
    /// Host network stack plus SQLite (or in-memory) persistence.
    pub fn from_config(config: &EngineConfig) -> Result<Self, EngineError> {
        let connectivity = SystemConnectivity::new()
            .map_err(|e| EngineError::Config(format!("interface classifier: {}", e)))?;
        let http = ReqwestProbeClient::new(config.api_base_url.clone(), config.connect_timeout)
            .map_err(|e| EngineError::Config(format!("HTTP client: {}", e)))?;
        let sockets = TokioSocketProber::new(config.accept_invalid_certs)
            .map_err(|e| EngineError::Config(format!("TLS connector: {}", e)))?;

        let kv: Arc<dyn KeyValueStore> = if config.in_memory {
            Arc::new(MemoryStore::new())
        } else {
            std::fs::create_dir_all(&config.data_dir)?;
            let path = config.history_db_path();
            info!("History database: {:?}", path);
            Arc::new(SqliteStore::open(&path)?)
        };

        Ok(Self {
            connectivity: Arc::new(connectivity),
            http: Arc::new(http),
            sockets: Arc::new(sockets),
            kv,
        })
    }
}

impl EngineState {
    pub fn new(config: &EngineConfig) -> Result<Self, EngineError> {
        let parts = EngineParts::from_config(config)?;
        Ok(Self::from_parts(config, parts))
    }

    pub fn from_parts(config: &EngineConfig, parts: EngineParts) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let history = Arc::new(ResultStore::with_options(
            parts.kv,
            &config.history_key,
            config.history_max,
        ));
        let pipeline = DiagnosticPipeline::new(
            config.pipeline.clone(),
            parts.connectivity,
            parts.http.clone(),
            parts.sockets,
        );
        let probe = Arc::new(
            ThroughputProbe::new(parts.http, config.speed_test.clone()).with_store(history.clone()),
        );
        Self {
            pipeline,
            probe,
            history,
            journal: RwLock::new(DiagnosticsJournal::new()),
            logs: LogState::new(),
            shutdown_tx,
        }
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Ends `stream` when [`shutdown`](Self::shutdown) is called, so long-lived
    /// SSE responses do not hold up a graceful shutdown.
    pub fn until_shutdown<S>(&self, stream: S) -> impl Stream<Item = S::Item> + Send + 'static
    where
        S: Stream + Send + 'static,
    {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        futures::StreamExt::take_until(stream, async move {
            let _ = shutdown_rx.recv().await;
        })
    }
}
