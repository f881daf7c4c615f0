use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Environment variable naming an optional TOML file with tuning settings
pub const CONFIG_PATH_ENV: &str = "TRACKGATE_CONFIG";

/// Required: where the tracking server keeps run metadata
pub const BACKEND_STORE_URI_ENV: &str = "MLFLOW_BACKEND_STORE_URI";
/// Required: where the tracking server keeps artifacts
pub const ARTIFACT_ROOT_ENV: &str = "MLFLOW_DEFAULT_ARTIFACT_ROOT";

/// Errors raised while loading or validating configuration.
///
/// All of these are fatal: the process exits before binding any port.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("required setting {0} is not set")]
    Missing(&'static str),

    #[error("invalid value {value:?} for {name}: {reason}")]
    InvalidValue {
        name: &'static str,
        value: String,
        reason: String,
    },

    #[error("failed to read config file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("configuration errors:\n  - {}", .0.join("\n  - "))]
    Invalid(Vec<String>),
}

/// Gateway configuration, immutable once loaded
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Public listener settings
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Single-user credentials
    #[serde(default)]
    pub auth: AuthConfig,

    /// Internal tracking server settings
    #[serde(default)]
    pub backend: BackendConfig,

    /// Startup readiness probing
    #[serde(default)]
    pub probe: ProbeConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct GatewayConfig {
    /// Public port, normally assigned by the platform via PORT (default: 8080)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Realm advertised in the Basic challenge
    #[serde(default = "default_realm")]
    pub realm: String,

    /// Maximum time to wait for the backend's response head once the
    /// request body has been sent
    #[serde(default = "default_upstream_timeout")]
    pub upstream_timeout_secs: u64,

    /// Longest pause between body frames before a transfer is abandoned
    #[serde(default = "default_body_idle_timeout")]
    pub body_idle_timeout_secs: u64,

    /// Keep X-Forwarded-Proto/Host set by the proxy in front and append to
    /// X-Forwarded-For; when false the gateway overwrites all three
    #[serde(default = "default_trust_forwarded")]
    pub trust_forwarded: bool,

    /// Connect timeout towards the backend
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Runtime worker threads serving connections
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Maximum concurrently served connections
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// How long in-flight connections may run after a termination signal
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,

    /// Maximum idle pooled connections to the backend
    #[serde(default = "default_pool_max_idle")]
    pub pool_max_idle: usize,

    /// Idle pooled connection timeout in seconds
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,
}

impl GatewayConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        format!("{}:{}", self.bind, self.port)
            .parse()
            .map_err(|e: std::net::AddrParseError| ConfigError::InvalidValue {
                name: "gateway.bind",
                value: self.bind.clone(),
                reason: e.to_string(),
            })
    }

    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_timeout_secs)
    }

    pub fn body_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.body_idle_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    pub fn pool_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.pool_idle_timeout_secs)
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind: default_bind_address(),
            realm: default_realm(),
            upstream_timeout_secs: default_upstream_timeout(),
            body_idle_timeout_secs: default_body_idle_timeout(),
            trust_forwarded: default_trust_forwarded(),
            connect_timeout_secs: default_connect_timeout(),
            workers: default_workers(),
            max_connections: default_max_connections(),
            shutdown_grace_secs: default_shutdown_grace(),
            pool_max_idle: default_pool_max_idle(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
        }
    }
}

#[derive(Deserialize, Clone)]
pub struct AuthConfig {
    /// The single accepted username (default: admin)
    #[serde(default = "default_username")]
    pub username: String,

    /// Plaintext password; without it (or a hash) every request is rejected
    pub password: Option<String>,

    /// Pre-hashed password in the form `sha256:<hex>`, takes precedence
    pub password_hash: Option<String>,
}

impl AuthConfig {
    pub fn has_secret(&self) -> bool {
        self.password.as_deref().is_some_and(|p| !p.is_empty())
            || self.password_hash.as_deref().is_some_and(|h| !h.is_empty())
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            username: default_username(),
            password: None,
            password_hash: None,
        }
    }
}

// Secrets never reach log output
impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthConfig")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field(
                "password_hash",
                &self.password_hash.as_ref().map(|_| "<redacted>"),
            )
            .finish()
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct BackendConfig {
    /// Backend store URI (required)
    pub store_uri: Option<String>,

    /// Default artifact root (required)
    pub artifact_root: Option<String>,

    /// Program to launch (default: mlflow)
    #[serde(default = "default_backend_command")]
    pub command: String,

    /// Replaces the generated `server ...` argument list when set
    pub args: Option<Vec<String>>,

    /// Extra arguments appended to the generated argument list
    #[serde(default)]
    pub extra_args: Vec<String>,

    /// Loopback host the backend binds to
    #[serde(default = "default_backend_host")]
    pub host: String,

    /// Loopback port the backend binds to (default: 5000)
    #[serde(default = "default_backend_port")]
    pub port: u16,

    /// Backend worker processes
    #[serde(default = "default_backend_workers")]
    pub workers: u32,

    /// Backend request timeout in seconds
    #[serde(default = "default_backend_timeout")]
    pub timeout_secs: u64,
}

impl BackendConfig {
    /// Base URL of the backend, e.g. `http://127.0.0.1:5000`
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    pub fn store_uri(&self) -> &str {
        self.store_uri.as_deref().unwrap_or_default()
    }

    pub fn artifact_root(&self) -> &str {
        self.artifact_root.as_deref().unwrap_or_default()
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            store_uri: None,
            artifact_root: None,
            command: default_backend_command(),
            args: None,
            extra_args: Vec::new(),
            host: default_backend_host(),
            port: default_backend_port(),
            workers: default_backend_workers(),
            timeout_secs: default_backend_timeout(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProbeConfig {
    /// Number of readiness checks before giving up (default: 30)
    #[serde(default = "default_probe_attempts")]
    pub attempts: u32,

    /// Delay between failed checks in milliseconds (default: 2000)
    #[serde(default = "default_probe_interval")]
    pub interval_ms: u64,

    /// Timeout of a single check in milliseconds
    #[serde(default = "default_probe_timeout")]
    pub timeout_ms: u64,

    /// Path requested on the backend
    #[serde(default = "default_probe_path")]
    pub path: String,
}

impl ProbeConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Worst-case time spent probing before the gateway starts anyway
    pub fn budget(&self) -> Duration {
        self.interval().saturating_mul(self.attempts)
    }
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            attempts: default_probe_attempts(),
            interval_ms: default_probe_interval(),
            timeout_ms: default_probe_timeout(),
            path: default_probe_path(),
        }
    }
}

fn default_port() -> u16 {
    8080
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_realm() -> String {
    "MLFlow Login".to_string()
}

fn default_upstream_timeout() -> u64 {
    300
}

fn default_body_idle_timeout() -> u64 {
    300
}

fn default_trust_forwarded() -> bool {
    true
}

fn default_connect_timeout() -> u64 {
    5
}

fn default_workers() -> usize {
    4
}

fn default_max_connections() -> usize {
    64
}

fn default_shutdown_grace() -> u64 {
    10
}

fn default_pool_max_idle() -> usize {
    8
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_username() -> String {
    "admin".to_string()
}

fn default_backend_command() -> String {
    "mlflow".to_string()
}

fn default_backend_host() -> String {
    "127.0.0.1".to_string()
}

fn default_backend_port() -> u16 {
    5000
}

fn default_backend_workers() -> u32 {
    2
}

fn default_backend_timeout() -> u64 {
    300
}

fn default_probe_attempts() -> u32 {
    30
}

fn default_probe_interval() -> u64 {
    2000
}

fn default_probe_timeout() -> u64 {
    2000
}

fn default_probe_path() -> String {
    "/health".to_string()
}

fn parse_env<T>(name: &'static str, value: String) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        name,
        reason: e.to_string(),
        value,
    })
}

impl Config {
    /// Load a TOML file. Required settings may still come from the environment,
    /// so this does not validate.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Build configuration from the process environment, starting from the
    /// file named by `TRACKGATE_CONFIG` when present.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an injectable variable source
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = match lookup(CONFIG_PATH_ENV) {
            Some(path) if !path.is_empty() => Self::load(path)?,
            _ => Self::default(),
        };
        config.apply_env(lookup)?;
        Ok(config)
    }

    /// Override settings with environment variables
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup(BACKEND_STORE_URI_ENV) {
            self.backend.store_uri = Some(v);
        }
        if let Some(v) = lookup(ARTIFACT_ROOT_ENV) {
            self.backend.artifact_root = Some(v);
        }
        if let Some(v) = lookup("PORT") {
            self.gateway.port = parse_env("PORT", v)?;
        }
        if let Some(v) = lookup("MLFLOW_AUTH_USERNAME") {
            self.auth.username = v;
        }
        if let Some(v) = lookup("MLFLOW_AUTH_PASSWORD") {
            self.auth.password = Some(v);
        }
        if let Some(v) = lookup("MLFLOW_AUTH_PASSWORD_HASH") {
            self.auth.password_hash = Some(v);
        }

        if let Some(v) = lookup("TRACKGATE_BIND") {
            self.gateway.bind = v;
        }
        if let Some(v) = lookup("TRACKGATE_REALM") {
            self.gateway.realm = v;
        }
        if let Some(v) = lookup("TRACKGATE_UPSTREAM_TIMEOUT_SECS") {
            self.gateway.upstream_timeout_secs = parse_env("TRACKGATE_UPSTREAM_TIMEOUT_SECS", v)?;
        }
        if let Some(v) = lookup("TRACKGATE_BODY_IDLE_TIMEOUT_SECS") {
            self.gateway.body_idle_timeout_secs = parse_env("TRACKGATE_BODY_IDLE_TIMEOUT_SECS", v)?;
        }
        if let Some(v) = lookup("TRACKGATE_TRUST_FORWARDED") {
            self.gateway.trust_forwarded = parse_env("TRACKGATE_TRUST_FORWARDED", v)?;
        }
        if let Some(v) = lookup("TRACKGATE_WORKERS") {
            self.gateway.workers = parse_env("TRACKGATE_WORKERS", v)?;
        }
        if let Some(v) = lookup("TRACKGATE_MAX_CONNECTIONS") {
            self.gateway.max_connections = parse_env("TRACKGATE_MAX_CONNECTIONS", v)?;
        }
        if let Some(v) = lookup("TRACKGATE_SHUTDOWN_GRACE_SECS") {
            self.gateway.shutdown_grace_secs = parse_env("TRACKGATE_SHUTDOWN_GRACE_SECS", v)?;
        }

        if let Some(v) = lookup("TRACKGATE_PROBE_ATTEMPTS") {
            self.probe.attempts = parse_env("TRACKGATE_PROBE_ATTEMPTS", v)?;
        }
        if let Some(v) = lookup("TRACKGATE_PROBE_INTERVAL_MS") {
            self.probe.interval_ms = parse_env("TRACKGATE_PROBE_INTERVAL_MS", v)?;
        }
        if let Some(v) = lookup("TRACKGATE_PROBE_TIMEOUT_MS") {
            self.probe.timeout_ms = parse_env("TRACKGATE_PROBE_TIMEOUT_MS", v)?;
        }
        if let Some(v) = lookup("TRACKGATE_PROBE_PATH") {
            self.probe.path = v;
        }

        if let Some(v) = lookup("MLFLOW_SERVER_COMMAND") {
            self.backend.command = v;
        }
        if let Some(v) = lookup("MLFLOW_SERVER_PORT") {
            self.backend.port = parse_env("MLFLOW_SERVER_PORT", v)?;
        }
        if let Some(v) = lookup("MLFLOW_SERVER_WORKERS") {
            self.backend.workers = parse_env("MLFLOW_SERVER_WORKERS", v)?;
        }
        if let Some(v) = lookup("MLFLOW_SERVER_TIMEOUT_SECS") {
            self.backend.timeout_secs = parse_env("MLFLOW_SERVER_TIMEOUT_SECS", v)?;
        }
        if let Some(v) = lookup("MLFLOW_SERVER_EXTRA_ARGS") {
            self.backend.extra_args =
                shell_words::split(&v).map_err(|e| ConfigError::InvalidValue {
                    name: "MLFLOW_SERVER_EXTRA_ARGS",
                    reason: e.to_string(),
                    value: v.clone(),
                })?;
        }

        Ok(())
    }

    /// Validate all configuration.
    ///
    /// Missing store URI or artifact root is reported on its own so the
    /// operator sees exactly which variable the platform failed to inject.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.backend.store_uri().trim().is_empty() {
            return Err(ConfigError::Missing(BACKEND_STORE_URI_ENV));
        }
        if self.backend.artifact_root().trim().is_empty() {
            return Err(ConfigError::Missing(ARTIFACT_ROOT_ENV));
        }

        let mut errors = Vec::new();

        if let Err(e) = self.gateway.socket_addr() {
            errors.push(e.to_string());
        }
        if self.gateway.workers == 0 {
            errors.push("gateway.workers must be greater than 0".to_string());
        }
        if self.gateway.max_connections == 0 {
            errors.push("gateway.max_connections must be greater than 0".to_string());
        }
        if self.gateway.upstream_timeout_secs == 0 {
            errors.push("gateway.upstream_timeout_secs must be greater than 0".to_string());
        }
        if self.gateway.body_idle_timeout_secs == 0 {
            errors.push("gateway.body_idle_timeout_secs must be greater than 0".to_string());
        }
        if self.backend.command.trim().is_empty() {
            errors.push("backend.command must not be empty".to_string());
        }
        if self.backend.port == 0 {
            errors.push("backend.port must be non-zero".to_string());
        }
        if !self.probe.path.starts_with('/') {
            errors.push(format!("probe.path must start with '/', got {:?}", self.probe.path));
        }

        if !errors.is_empty() {
            return Err(ConfigError::Invalid(errors));
        }

        Ok(())
    }
}
