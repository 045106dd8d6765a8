//! Medic Agent entry point.
//!
//! Wires configuration, the outcome store, the decision engine, the stream
//! listener, the resurrector and the HTTP surface onto one tokio runtime,
//! then runs the orchestrator loop until shutdown.
//!
//! Exit codes: 0 normal shutdown, 2 configuration invalid, 3 outcome store
//! unrecoverable.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use chrono::Utc;
use clap::Parser;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use medic_agent::api::{create_router, AppState};
use medic_agent::config::{Config, ExecutorKind, Mode, StreamKind};
use medic_agent::decision::DecisionEngine;
use medic_agent::error::MedicError;
use medic_agent::listener::KillStream;
use medic_agent::orchestrator::{run_calibration_ticker, run_expiry_ticker, Orchestrator};
use medic_agent::pending::PendingQueue;
use medic_agent::resurrector::Resurrector;
use medic_agent::siem::SiemClient;
use medic_agent::store::OutcomeStore;

const EXIT_CONFIG_INVALID: u8 = 2;
const EXIT_STORE_UNRECOVERABLE: u8 = 3;

#[derive(Parser)]
#[command(name = "medic-agent", version, about = "Autonomous resurrection arbiter")]
struct Cli {
    /// Path to the configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the operating mode from config.
    #[arg(long, value_enum)]
    mode: Option<CliMode>,

    /// Use the mock listener and dry-run resurrector (for development).
    #[arg(long)]
    mock: bool,
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum CliMode {
    Observer,
    Live,
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "medic_agent=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let config_path = cli
        .config
        .or_else(|| std::env::var("MEDIC_CONFIG_PATH").ok().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("./config/medic.yaml"));

    let mut config = match Config::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(path = %config_path.display(), error = %e, "invalid configuration");
            return ExitCode::from(EXIT_CONFIG_INVALID);
        }
    };

    // CLI overrides win over both file and environment.
    if let Some(mode) = cli.mode {
        config.mode = match mode {
            CliMode::Observer => Mode::Observer,
            CliMode::Live => Mode::Live,
        };
    }
    if cli.mock {
        config.stream.kind = StreamKind::Mock;
        config.resurrection.executor = ExecutorKind::DryRun;
    }

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        mode = config.mode.as_str(),
        config = %config_path.display(),
        "Medic Agent starting"
    );

    match run(config).await {
        Ok(()) => {
            tracing::info!("Medic Agent stopped");
            ExitCode::SUCCESS
        }
        Err(e @ MedicError::Store(_)) => {
            tracing::error!(error = %e, "outcome store unrecoverable");
            ExitCode::from(EXIT_STORE_UNRECOVERABLE)
        }
        Err(e) => {
            tracing::error!(error = %e, "startup failed");
            ExitCode::from(EXIT_CONFIG_INVALID)
        }
    }
}

async fn run(config: Config) -> Result<(), MedicError> {
    // The store comes up first; every other component reads from it.
    let store = OutcomeStore::open(Path::new(&config.store.path)).await?;

    let engine = Arc::new(DecisionEngine::new(&config, store.clone()));
    engine.calibrate().await;

    // Observer mode never touches the runtime, whatever the config says.
    let resurrector = if config.mode == Mode::Observer {
        Arc::new(Resurrector::dry_run())
    } else {
        match config.resurrection.executor {
            ExecutorKind::DryRun => Arc::new(Resurrector::dry_run()),
            ExecutorKind::Container => Arc::new(Resurrector::docker(config.resurrection.clone())?),
        }
    };

    let siem = SiemClient::from_config(&config.siem);
    let pending = Arc::new(PendingQueue::default());
    let stream = match config.stream.kind {
        StreamKind::Mock => KillStream::mock(&config.stream),
        StreamKind::Durable => KillStream::redis(&config.stream)?,
    };

    let orchestrator = Arc::new(Orchestrator::new(
        store.clone(),
        engine.clone(),
        siem,
        resurrector,
        pending.clone(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // HTTP surface.
    let state = AppState {
        store,
        engine: engine.clone(),
        pending: pending.clone(),
        orchestrator: orchestrator.clone(),
        mode: config.mode,
        started_at: Utc::now(),
    };
    let router = create_router(state);
    let listener = tokio::net::TcpListener::bind(&config.http.listen)
        .await
        .map_err(|e| {
            MedicError::Config(format!("cannot bind http listener {}: {e}", config.http.listen))
        })?;
    tracing::info!(listen = %config.http.listen, "HTTP surface listening");

    let mut server_shutdown = shutdown_rx.clone();
    let server = tokio::spawn(async move {
        let shutdown = async move {
            server_shutdown.changed().await.ok();
        };
        if let Err(e) = axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await
        {
            tracing::error!(error = %e, "http server failed");
        }
    });

    // Background tickers.
    let expiry = tokio::spawn(run_expiry_ticker(
        orchestrator.clone(),
        pending.clone(),
        shutdown_rx.clone(),
    ));
    let calibration = tokio::spawn(run_calibration_ticker(
        engine.clone(),
        config.calibration.interval_hours,
        shutdown_rx.clone(),
    ));

    // Translate SIGTERM / ctrl-c into the shutdown signal.
    let signal_tx = shutdown_tx.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        tracing::info!("shutdown signal received");
        let _ = signal_tx.send(true);
    });

    let result = orchestrator.run(stream, shutdown_rx).await;

    // Wind down the server and tickers even when the loop died on its own
    // (unrecoverable store), not just on an operator signal.
    let _ = shutdown_tx.send(true);
    let _ = tokio::join!(server, expiry, calibration);
    result
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "cannot install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
