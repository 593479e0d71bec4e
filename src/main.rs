//! Preview Sandbox server
//!
//! Serves the file-store and preview API, keeps previews in sync with new
//! commits and reclaims expired sandboxes.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;

use preview_sandbox::{
    router, AppState, Config, ContainerEngine, DockerCli, EngineKind, InMemoryEngine, Sweeper,
    Validate,
};

#[derive(Debug, Parser)]
#[command(name = "preview-sandbox", version, about)]
struct Cli {
    /// TOML configuration file.
    #[arg(short, long, env = "PREVIEW_SANDBOX_CONFIG")]
    config: Option<PathBuf>,

    /// Listen address, overriding the configuration.
    #[arg(short, long)]
    bind: Option<SocketAddr>,

    /// Container engine, overriding the configuration.
    #[arg(long, value_parser = parse_engine)]
    engine: Option<EngineKind>,
}

fn parse_engine(raw: &str) -> Result<EngineKind, String> {
    match raw {
        "docker" => Ok(EngineKind::Docker),
        "memory" => Ok(EngineKind::Memory),
        other => Err(format!("unknown engine '{}', expected docker or memory", other)),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "preview-sandbox exited with an error");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> preview_sandbox::Result<()> {
    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    if let Some(bind) = cli.bind {
        config.server.bind = bind;
    }
    if let Some(engine) = cli.engine {
        config.preview.engine = engine;
    }
    // command-line overrides are checked again after the file was loaded
    config.validate().into_result()?;

    let engine: Arc<dyn ContainerEngine> = match config.preview.engine {
        EngineKind::Docker => Arc::new(DockerCli::new(config.preview.docker_bin.clone())),
        EngineKind::Memory => Arc::new(InMemoryEngine::new()),
    };
    tracing::info!(engine = engine.name(), work_dir = ?config.preview.work_dir, "starting");

    let state = AppState::new(engine, &config);
    match state.previews.reclaim_orphans().await {
        Ok(0) => {}
        Ok(removed) => tracing::info!(removed, "reclaimed orphaned preview resources"),
        Err(e) => tracing::warn!(error = %e, "orphan reclamation failed"),
    }

    let shutdown = CancellationToken::new();
    let sweeper =
        Sweeper::new(state.previews.clone(), config.sweeper.clone()).spawn(shutdown.clone());

    let listener = tokio::net::TcpListener::bind(config.server.bind).await?;
    tracing::info!(addr = %config.server.bind, "listening");

    let app = router(state.clone());
    let serve_token = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => tracing::info!("shutdown requested"),
                Err(e) => tracing::error!(error = %e, "failed to listen for ctrl-c"),
            }
            serve_token.cancel();
        })
        .await?;

    shutdown.cancel();
    state.watchers.stop_all().await;
    if let Err(e) = sweeper.await {
        tracing::warn!(error = %e, "sweeper task ended abnormally");
    }
    state.previews.shutdown().await;
    tracing::info!("shutdown complete");
    Ok(())
}
