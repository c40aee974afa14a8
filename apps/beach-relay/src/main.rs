use std::sync::Arc;

use anyhow::{Context, Result};
use beach_relay::{
    app::{self, AppState},
    config::{Cli, ServerConfig},
    origin::OriginPolicy,
    telemetry::Telemetry,
};
use clap::Parser;
use tokio::signal;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let telemetry = Telemetry::init(cli.log_format)?;
    let config = ServerConfig::try_from(cli)?;

    if let Err(err) = run(config, &telemetry).await {
        error!(error = ?err, "beach-relay exited with error");
        return Err(err);
    }
    Ok(())
}

async fn run(config: ServerConfig, telemetry: &Telemetry) -> Result<()> {
    info!(
        listen_addr = %config.listen_addr,
        environment = ?config.environment,
        idle_timeout_secs = config.lifecycle.idle_timeout.as_secs(),
        write_timeout_secs = config.registry.write_timeout.as_secs(),
        reap_after_failures = config.registry.reap_after_failures,
        "starting beach-relay"
    );
    if config.origin_policy == OriginPolicy::Disabled {
        warn!(
            environment = ?config.environment,
            "origin verification disabled; do not run this configuration in production"
        );
    }

    let state = Arc::new(AppState::new(&config, telemetry.metrics_handle()));
    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind listener on {}", config.listen_addr))?;

    info!("beach-relay listening on {}", config.listen_addr);
    app::serve(listener, state, config.shutdown_grace, shutdown_signal()).await?;
    info!("graceful shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            warn!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "failed to install SIGTERM handler");
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
