//! Supervised startup: validate, launch the backend, probe it, then serve
//!
//! ```text
//! Validating -> Launching -> ProbingReady -> Serving
//!     |
//!     +-> Failed
//! ```
//!
//! Probing never blocks the transition to `Serving`; a backend that is still
//! warming up surfaces as 502/504 responses until it becomes healthy.

use crate::config::{Config, ConfigError};
use crate::credentials::CredentialStore;
use crate::gateway::{Gateway, GatewaySettings};
use crate::launcher::{BackendLauncher, LaunchError};
use crate::prober::{ProbeOutcome, ReadinessProber};
use hyper::Uri;
use std::net::SocketAddr;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Startup phase of the process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartupState {
    /// Checking required configuration
    Validating,
    /// Spawning the tracking server
    Launching,
    /// Waiting (bounded) for the tracking server to answer
    ProbingReady,
    /// Gateway bound to the public port and serving
    Serving,
    /// Required configuration missing; nothing was started
    Failed,
}

#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("failed to launch backend: {0}")]
    Launch(#[from] LaunchError),

    #[error("failed to bind gateway on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },

    #[error("gateway error: {0}")]
    Serve(String),
}

/// Everything derived from configuration during validation
struct Validated {
    credentials: CredentialStore,
    settings: GatewaySettings,
    probe_url: Uri,
}

/// Drives the startup state machine and then serves until shutdown
pub struct StartupSequencer {
    config: Config,
    state_tx: watch::Sender<StartupState>,
    shutdown_rx: watch::Receiver<bool>,
}

impl StartupSequencer {
    pub fn new(config: Config, shutdown_rx: watch::Receiver<bool>) -> Self {
        let (state_tx, _) = watch::channel(StartupState::Validating);
        Self {
            config,
            state_tx,
            shutdown_rx,
        }
    }

    /// Observe state transitions
    pub fn subscribe(&self) -> watch::Receiver<StartupState> {
        self.state_tx.subscribe()
    }

    pub fn state(&self) -> StartupState {
        *self.state_tx.borrow()
    }

    fn transition(&self, to: StartupState) {
        let from = self.state_tx.send_replace(to);
        info!(?from, ?to, "Startup state changed");
    }

    fn validate(&self) -> Result<Validated, ConfigError> {
        self.config.validate()?;

        let credentials = CredentialStore::from_config(&self.config.auth)?;
        let settings = GatewaySettings::from_config(&self.config)?;

        let probe_url = format!("{}{}", self.config.backend.base_url(), self.config.probe.path);
        let probe_url = probe_url
            .parse::<Uri>()
            .map_err(|e| ConfigError::InvalidValue {
                name: "probe.path",
                value: self.config.probe.path.clone(),
                reason: e.to_string(),
            })?;

        Ok(Validated {
            credentials,
            settings,
            probe_url,
        })
    }

    /// Run startup and serve until shutdown is requested.
    ///
    /// Returns an error only for fatal conditions: invalid configuration, a
    /// backend that cannot be spawned, or a public port that cannot be bound.
    pub async fn run(self) -> Result<(), StartupError> {
        let validated = match self.validate() {
            Ok(v) => v,
            Err(e) => {
                self.transition(StartupState::Failed);
                error!(error = %e, "Required configuration missing or invalid, not starting");
                return Err(e.into());
            }
        };

        if !validated.credentials.is_configured() {
            warn!(
                username = validated.credentials.username(),
                "No password configured, every request will be rejected"
            );
        }

        self.transition(StartupState::Launching);
        let backend = &self.config.backend;
        let mut handle = BackendLauncher::new(backend.clone())
            .launch(backend.store_uri(), backend.artifact_root())?;

        self.transition(StartupState::ProbingReady);
        let probe = &self.config.probe;
        let prober = ReadinessProber::new(probe.timeout());
        let outcome = tokio::select! {
            outcome = prober.probe(&validated.probe_url, probe.attempts, probe.interval()) => outcome,
            _ = shutdown_requested(self.shutdown_rx.clone()) => {
                info!("Shutdown requested during startup, not serving");
                return Ok(());
            }
        };

        match outcome {
            ProbeOutcome::Reachable { attempts, elapsed } => {
                info!(attempts, elapsed_ms = elapsed.as_millis(), "Tracking server is ready");
            }
            ProbeOutcome::NotReachable { attempts, elapsed } => {
                warn!(
                    attempts,
                    elapsed_ms = elapsed.as_millis(),
                    url = %validated.probe_url,
                    "Tracking server not reachable yet, starting gateway in degraded mode"
                );
                if let Some(status) = handle.try_exit_status() {
                    error!(?status, "Tracking server already exited");
                }
            }
        }

        let addr = validated.settings.bind_addr;
        let gateway = Gateway::new(validated.settings, validated.credentials, self.shutdown_rx.clone());
        let bound = gateway
            .bind()
            .await
            .map_err(|source| StartupError::Bind { addr, source })?;

        // From here on the gateway is the serving process; the child is only watched
        let backend_pid = handle.pid();
        let _monitor = handle.monitor();
        info!(
            addr = %bound.local_addr(),
            pid = std::process::id(),
            backend_pid,
            "Gateway is the foreground process"
        );
        self.transition(StartupState::Serving);

        bound
            .serve()
            .await
            .map_err(|e| StartupError::Serve(e.to_string()))
    }
}

/// Resolves once shutdown has been requested; never resolves if the sender is gone
async fn shutdown_requested(mut rx: watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ARTIFACT_ROOT_ENV, BACKEND_STORE_URI_ENV};

    fn config_without(missing: &str) -> Config {
        let mut config = Config::default();
        if missing != BACKEND_STORE_URI_ENV {
            config.backend.store_uri = Some("sqlite:///mlflow.db".to_string());
        }
        if missing != ARTIFACT_ROOT_ENV {
            config.backend.artifact_root = Some("/tmp/artifacts".to_string());
        }
        config.gateway.bind = "127.0.0.1".to_string();
        config.gateway.port = 0;
        config
    }

    #[test]
    fn test_initial_state() {
        let (_tx, rx) = watch::channel(false);
        let sequencer = StartupSequencer::new(Config::default(), rx);
        assert_eq!(sequencer.state(), StartupState::Validating);
    }

    #[tokio::test]
    async fn test_missing_artifact_root_fails() {
        let (_tx, rx) = watch::channel(false);
        let sequencer = StartupSequencer::new(config_without(ARTIFACT_ROOT_ENV), rx);
        let states = sequencer.subscribe();

        let err = sequencer.run().await.unwrap_err();
        assert!(matches!(err, StartupError::Config(ConfigError::Missing(ARTIFACT_ROOT_ENV))));
        assert_eq!(*states.borrow(), StartupState::Failed);
    }

    #[tokio::test]
    async fn test_missing_store_uri_fails() {
        let (_tx, rx) = watch::channel(false);
        let sequencer = StartupSequencer::new(config_without(BACKEND_STORE_URI_ENV), rx);
        let states = sequencer.subscribe();

        assert!(sequencer.run().await.is_err());
        assert_eq!(*states.borrow(), StartupState::Failed);
    }

    #[tokio::test]
    async fn test_invalid_password_hash_fails() {
        let (_tx, rx) = watch::channel(false);
        let mut config = config_without("");
        config.auth.password_hash = Some("plain-text".to_string());
        let sequencer = StartupSequencer::new(config, rx);
        let states = sequencer.subscribe();

        assert!(matches!(sequencer.run().await, Err(StartupError::Config(_))));
        assert_eq!(*states.borrow(), StartupState::Failed);
    }

    #[tokio::test]
    async fn test_spawn_failure_is_fatal() {
        let (_tx, rx) = watch::channel(false);
        let mut config = config_without("");
        config.backend.command = "/nonexistent/mlflow".to_string();
        let sequencer = StartupSequencer::new(config, rx);

        assert!(matches!(sequencer.run().await, Err(StartupError::Launch(_))));
    }

    #[tokio::test]
    async fn test_shutdown_during_probing() {
        let (tx, rx) = watch::channel(false);
        let mut config = config_without("");
        config.backend.command = "sleep".to_string();
        config.backend.args = Some(vec!["2".to_string()]);
        // nothing listens on the backend port
        config.backend.port = 1;
        config.probe.attempts = 1000;
        config.probe.interval_ms = 50;

        let sequencer = StartupSequencer::new(config, rx);
        let mut states = sequencer.subscribe();
        let task = tokio::spawn(sequencer.run());

        while *states.borrow_and_update() != StartupState::ProbingReady {
            states.changed().await.unwrap();
        }
        tx.send(true).unwrap();

        let result = tokio::time::timeout(std::time::Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
        assert_eq!(*states.borrow(), StartupState::ProbingReady);
    }
}
