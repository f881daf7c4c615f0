use crate::config::{BackendConfig, ARTIFACT_ROOT_ENV, BACKEND_STORE_URI_ENV};
use std::process::{ExitStatus, Stdio};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("backend store URI is empty")]
    MissingStoreUri,

    #[error("artifact root is empty")]
    MissingArtifactRoot,

    #[error("failed to spawn backend command {command:?}: {source}")]
    Spawn {
        command: String,
        source: std::io::Error,
    },
}

/// Handle to the launched tracking server.
///
/// Only the PID is exposed. The child is never stopped from here; it goes
/// down with the container.
#[derive(Debug)]
pub struct BackendHandle {
    child: Child,
    pid: Option<u32>,
}

impl BackendHandle {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Exit status if the backend has already terminated
    pub fn try_exit_status(&mut self) -> Option<ExitStatus> {
        self.child.try_wait().ok().flatten()
    }

    /// Hand the child to a background task that reaps it and reports an
    /// unexpected exit.
    pub fn monitor(self) -> JoinHandle<Option<ExitStatus>> {
        let BackendHandle { mut child, pid } = self;
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) if status.success() => {
                    warn!(pid, ?status, "Backend process exited");
                    Some(status)
                }
                Ok(status) => {
                    error!(pid, ?status, "Backend process exited with failure, requests will fail until restart");
                    Some(status)
                }
                Err(e) => {
                    error!(pid, error = %e, "Error waiting for backend process");
                    None
                }
            }
        })
    }
}

/// Starts the tracking server as a child process on a loopback address
#[derive(Debug, Clone)]
pub struct BackendLauncher {
    config: BackendConfig,
}

impl BackendLauncher {
    pub fn new(config: BackendConfig) -> Self {
        Self { config }
    }

    /// Arguments passed to the backend program
    pub fn command_args(&self, store_uri: &str, artifact_root: &str) -> Vec<String> {
        let config = &self.config;
        let mut args = match &config.args {
            Some(args) => args.clone(),
            None => vec![
                "server".to_string(),
                "--backend-store-uri".to_string(),
                store_uri.to_string(),
                "--default-artifact-root".to_string(),
                artifact_root.to_string(),
                "--host".to_string(),
                config.host.clone(),
                "--port".to_string(),
                config.port.to_string(),
                "--gunicorn-opts".to_string(),
                format!("--timeout {} --workers {}", config.timeout_secs, config.workers),
            ],
        };
        args.extend(config.extra_args.iter().cloned());
        args
    }

    /// Spawn the backend. Both locations must be non-empty.
    pub fn launch(&self, store_uri: &str, artifact_root: &str) -> Result<BackendHandle, LaunchError> {
        if store_uri.trim().is_empty() {
            return Err(LaunchError::MissingStoreUri);
        }
        if artifact_root.trim().is_empty() {
            return Err(LaunchError::MissingArtifactRoot);
        }

        let args = self.command_args(store_uri, artifact_root);
        info!(
            command = %self.config.command,
            host = %self.config.host,
            port = self.config.port,
            workers = self.config.workers,
            timeout_secs = self.config.timeout_secs,
            "Starting tracking server"
        );

        let mut cmd = Command::new(&self.config.command);
        cmd.args(&args);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::inherit());
        cmd.stderr(Stdio::inherit());
        cmd.kill_on_drop(false);

        cmd.env(BACKEND_STORE_URI_ENV, store_uri);
        cmd.env(ARTIFACT_ROOT_ENV, artifact_root);
        cmd.env("PORT", self.config.port.to_string());

        let child = cmd.spawn().map_err(|source| LaunchError::Spawn {
            command: self.config.command.clone(),
            source,
        })?;
        let pid = child.id();
        info!(pid, "Tracking server process spawned");

        Ok(BackendHandle { child, pid })
    }
}
