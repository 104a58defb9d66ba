use clap::Parser;
use futures::StreamExt;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use vpn_diagnostics::config::{CliArgs, Command, EngineConfig};
use vpn_diagnostics::diagnostics::{DiagnosticResult, DiagnosticStep, StepStatus};
use vpn_diagnostics::log_capture::{LogLevel, LogSource};
use vpn_diagnostics::network::ServerTarget;
use vpn_diagnostics::server;
use vpn_diagnostics::settings::{save_settings, PersistentSettings};
use vpn_diagnostics::speed_test::{
    format_speed, SpeedTestContext, SpeedTestPhase, SpeedTestProgress,
};
use vpn_diagnostics::state::EngineState;

/// Returning the exit code lets the log file guard flush on the way out.
#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let args = CliArgs::parse();
    let _log_guard = init_tracing(&args)?;

    let config = match EngineConfig::from_args(&args) {
        Ok(config) => config,
        Err(e) => {
            error!("{}", e);
            return Ok(ExitCode::from(2));
        }
    };
    info!("Starting vpn-diagnostics v{}", env!("CARGO_PKG_VERSION"));
    info!("Data dir: {:?}", config.data_dir);
    info!("API base URL: {}", config.api_base_url);

    let state = Arc::new(EngineState::new(&config)?);

    match args.command {
        Command::Serve { port } => serve(state, port).await?,
        Command::Diagnose {
            target,
            server_name,
        } => return diagnose(state, target, server_name).await,
        Command::SpeedTest {
            vpn_active,
            server_name,
        } => {
            speed_test(
                state,
                SpeedTestContext {
                    vpn_active,
                    server_name,
                },
            )
            .await?
        }
        Command::History { clear, limit } => history(state, clear, limit).await?,
        Command::Settings { write } => show_settings(&config, write)?,
    }
    Ok(ExitCode::SUCCESS)
}

/// Stderr logging, plus a daily rolling file when `--log-dir` is set.
fn init_tracing(
    args: &CliArgs,
) -> anyhow::Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "vpn_diagnostics=info,tower_http=info".into());

    let (file_layer, guard) = match &args.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let appender = tracing_appender::rolling::daily(dir, "vpn-diagnostics.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .init();

    Ok(guard)
}

async fn serve(state: Arc<EngineState>, port: u16) -> anyhow::Result<()> {
    state
        .logs
        .emit(
            LogSource::Server,
            LogLevel::Info,
            format!("Diagnostics server starting on port {}", port),
        )
        .await;

    let router = server::build_router(state.clone());
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;
    info!("Listening on http://0.0.0.0:{}", port);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal(state.clone()))
        .await?;

    info!("Diagnostics server shutting down");
    Ok(())
}

/// Waits for Ctrl+C, then tells open SSE streams to finish so graceful
/// shutdown is not held up by them.
async fn shutdown_signal(state: Arc<EngineState>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for Ctrl+C: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Received shutdown signal");
    state
        .logs
        .emit(LogSource::Server, LogLevel::Info, "Shutdown signal received")
        .await;
    state.shutdown();
}

fn print_step(step: &DiagnosticStep) {
    let marker = match step.status() {
        StepStatus::Success => "ok",
        StepStatus::Warning => "warn",
        StepStatus::Failed => "FAIL",
        StepStatus::Pending | StepStatus::Running => "..",
    };
    println!(
        "[{:>4}] {:<26} {} ({}ms)",
        marker,
        step.name().label(),
        step.message().unwrap_or(""),
        step.duration_ms().unwrap_or(0)
    );
    if let Some(suggestion) = step.suggestion() {
        println!("       -> {}", suggestion);
    }
}

async fn diagnose(
    state: Arc<EngineState>,
    target: Option<String>,
    server_name: Option<String>,
) -> anyhow::Result<ExitCode> {
    let target = match target {
        Some(spec) => {
            let mut target: ServerTarget = spec.parse().map_err(anyhow::Error::msg)?;
            if let Some(name) = server_name {
                target = target.with_name(name);
            }
            Some(target)
        }
        None => None,
    };

    let ran_at = chrono::Utc::now();
    let start = std::time::Instant::now();
    let mut steps = Vec::with_capacity(6);
    let mut stream = state.pipeline.run_diagnostics(target);
    while let Some(step) = stream.next().await {
        print_step(&step);
        steps.push(step);
    }

    let result = DiagnosticResult::new(steps, ran_at, start.elapsed());
    println!("{}", result.summary());

    if result.overall_status() == StepStatus::Failed {
        return Ok(ExitCode::FAILURE);
    }
    Ok(ExitCode::SUCCESS)
}

async fn speed_test(state: Arc<EngineState>, context: SpeedTestContext) -> anyhow::Result<()> {
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let printer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match event {
                SpeedTestProgress::PhaseStarted { phase } => println!("{}...", phase.label()),
                SpeedTestProgress::PhaseCompleted { phase, value } => match phase {
                    SpeedTestPhase::Latency => {
                        println!("  latency: {:.0} ms", value)
                    }
                    _ => println!("  {}", format_speed(value)),
                },
                SpeedTestProgress::Ping {
                    index,
                    total,
                    rtt_ms,
                } => match rtt_ms {
                    Some(ms) => println!("  ping {}/{}: {:.1} ms", index, total, ms),
                    None => println!("  ping {}/{}: timed out", index, total),
                },
                SpeedTestProgress::DownloadProgress { .. } | SpeedTestProgress::Completed { .. } => {}
            }
        }
    });

    let result = state.probe.run_speed_test(context, Some(tx)).await?;
    let _ = printer.await;

    println!(
        "Download {} | Upload {} | Latency {:.0} ms | Jitter {} ms",
        format_speed(result.download_mbps),
        format_speed(result.upload_mbps),
        result.latency_ms,
        result.jitter_ms
    );
    Ok(())
}

async fn history(state: Arc<EngineState>, clear: bool, limit: Option<usize>) -> anyhow::Result<()> {
    if clear {
        state.history.clear_history().await?;
        println!("Speed test history cleared");
        return Ok(());
    }

    let results = state.history.get_history().await;
    if results.is_empty() {
        println!("No speed tests recorded");
        return Ok(());
    }
    for result in results.iter().take(limit.unwrap_or(usize::MAX)) {
        println!(
            "{}  down {:>10}  up {:>10}  {:>4.0} ms  jitter {:>3} ms  {}{}",
            result.tested_at.format("%Y-%m-%d %H:%M:%S"),
            format_speed(result.download_mbps),
            format_speed(result.upload_mbps),
            result.latency_ms,
            result.jitter_ms,
            if result.vpn_active { "vpn" } else { "direct" },
            result
                .server_name
                .as_deref()
                .map(|n| format!(" ({})", n))
                .unwrap_or_default()
        );
    }
    Ok(())
}

/// Print the effective settings; with `write`, persist them as the settings file.
fn show_settings(config: &EngineConfig, write: bool) -> anyhow::Result<()> {
    let settings = PersistentSettings::from_config(config);
    println!("{}", serde_json::to_string_pretty(&settings)?);
    if write {
        save_settings(&config.settings_path, &settings)?;
        println!("Saved to {}", config.settings_path.display());
    }
    Ok(())
}
