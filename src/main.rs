use tokio::sync::watch;
use trackgate::config::Config;
use trackgate::sequencer::StartupSequencer;
use tracing::{error, info};

const VERSION: &str = env!("CARGO_PKG_VERSION");
const PKG_NAME: &str = env!("CARGO_PKG_NAME");

fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("trackgate=info".parse().expect("valid log directive")),
        )
        .init();

    let config = Config::from_env().map_err(|e| {
        error!(error = %e, "Failed to load configuration");
        e
    })?;

    print_startup_banner(&config);

    // Worker count is configuration, so the runtime is built by hand
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.gateway.workers.max(1))
        .enable_all()
        .build()?;

    runtime.block_on(run(config))
}

async fn run(config: Config) -> anyhow::Result<()> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sequencer = StartupSequencer::new(config, shutdown_rx);

    let signals = tokio::spawn(async move {
        match wait_for_signal().await {
            Ok(()) => {
                let _ = shutdown_tx.send(true);
            }
            Err(e) => error!(error = %e, "Failed to install signal handlers"),
        }
    });

    let result = sequencer.run().await;
    signals.abort();

    match result {
        Ok(()) => {
            info!("Shutdown complete");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Startup failed");
            Err(e.into())
        }
    }
}

/// Wait for SIGTERM (container runtime) or SIGINT (Ctrl+C)
async fn wait_for_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result?;
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down...");
    }

    Ok(())
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting tracking gateway");
    info!(
        bind = %config.gateway.bind,
        port = config.gateway.port,
        realm = %config.gateway.realm,
        workers = config.gateway.workers,
        max_connections = config.gateway.max_connections,
        upstream_timeout_secs = config.gateway.upstream_timeout_secs,
        body_idle_timeout_secs = config.gateway.body_idle_timeout_secs,
        trust_forwarded = config.gateway.trust_forwarded,
        shutdown_grace_secs = config.gateway.shutdown_grace_secs,
        "Gateway configuration"
    );
    info!(
        username = %config.auth.username,
        password_configured = config.auth.has_secret(),
        "Authentication settings"
    );
    info!(
        command = %config.backend.command,
        url = %config.backend.base_url(),
        workers = config.backend.workers,
        timeout_secs = config.backend.timeout_secs,
        "Tracking server settings"
    );
    info!(
        path = %config.probe.path,
        attempts = config.probe.attempts,
        interval_ms = config.probe.interval_ms,
        budget_secs = config.probe.budget().as_secs(),
        "Readiness probe settings"
    );
}
