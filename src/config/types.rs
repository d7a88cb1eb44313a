use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Log level enum (replaces stringly-typed field)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogLevel::Trace => write!(f, "trace"),
            LogLevel::Debug => write!(f, "debug"),
            LogLevel::Info => write!(f, "info"),
            LogLevel::Warn => write!(f, "warn"),
            LogLevel::Error => write!(f, "error"),
        }
    }
}

/// Log format enum (replaces stringly-typed field)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    Json,
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogFormat::Pretty => write!(f, "pretty"),
            LogFormat::Json => write!(f, "json"),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Inbound listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    pub listen: String,
    #[serde(default = "default_host_key_path")]
    pub host_key_path: PathBuf,
    #[serde(default = "default_server_id")]
    pub server_id: String,
    /// Seconds to wait for active sessions to drain on shutdown.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout: u64,
    /// Per-session grace window between the TERM and KILL signals sent to the
    /// upstream program during shutdown.
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace: u64,
    /// Keepalive interval in seconds on the inbound connection (0 = disabled).
    #[serde(default = "default_keepalive_interval_secs")]
    pub keepalive_interval_secs: u64,
    /// Unanswered keepalives tolerated before the inbound client is dropped.
    #[serde(default = "default_keepalive_max")]
    pub keepalive_max: u32,
}

fn default_host_key_path() -> PathBuf {
    PathBuf::from("hopssh_host_key")
}

fn default_server_id() -> String {
    "SSH-2.0-hopssh".to_string()
}

fn default_shutdown_timeout() -> u64 {
    30
}

fn default_shutdown_grace() -> u64 {
    10
}

fn default_keepalive_interval_secs() -> u64 {
    30
}

fn default_keepalive_max() -> u32 {
    3
}

/// The backing SSH server and the credentials and policy used to reach it.
///
/// Field names follow the wire configuration contract, hence camelCase.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpstreamConfig {
    /// Hostname or IP address of the backing server.
    pub server: String,
    /// TCP port of the backing server.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Take the username from the connecting client instead of `username`.
    #[serde(default)]
    pub username_pass_through: bool,
    /// Static username presented to the backing server.
    #[serde(default)]
    pub username: String,
    /// Password offered to the backing server (may be empty).
    #[serde(default)]
    pub password: String,
    /// Private key for public-key authentication: inline PEM if the value
    /// starts with `-----`, otherwise a filesystem path.
    #[serde(default)]
    pub private_key: String,
    /// Host key fingerprints the proxy will accept from the backing server.
    #[serde(default)]
    pub allowed_host_key_fingerprints: Vec<String>,
    /// Cipher preference list for the backing connection.
    #[serde(default = "default_ciphers")]
    pub ciphers: Vec<String>,
    /// Key exchange preference list for the backing connection.
    #[serde(default = "default_kex")]
    pub kex: Vec<String>,
    /// MAC preference list for the backing connection.
    #[serde(default = "default_macs")]
    pub macs: Vec<String>,
    /// Host key algorithms accepted from the backing server.
    #[serde(default = "default_host_key_algos")]
    pub host_key_algos: Vec<String>,
    /// Seconds the proxy is willing to wait for the backing TCP connection.
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    /// Version banner sent to the backing server (RFC 4253 section 4.2,
    /// without the trailing CR LF).
    #[serde(default = "default_client_version")]
    pub client_version: String,
}

fn default_port() -> u16 {
    22
}

fn default_timeout() -> u64 {
    60
}

fn default_client_version() -> String {
    "SSH-2.0-hopssh".to_string()
}

fn default_ciphers() -> Vec<String> {
    [
        "chacha20-poly1305@openssh.com",
        "aes256-gcm@openssh.com",
        "aes128-gcm@openssh.com",
        "aes256-ctr",
        "aes192-ctr",
        "aes128-ctr",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_kex() -> Vec<String> {
    [
        "curve25519-sha256@libssh.org",
        "ecdh-sha2-nistp521",
        "ecdh-sha2-nistp384",
        "ecdh-sha2-nistp256",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_macs() -> Vec<String> {
    ["hmac-sha2-256-etm@openssh.com", "hmac-sha2-256"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_host_key_algos() -> Vec<String> {
    [
        "ssh-ed25519",
        "rsa-sha2-512",
        "rsa-sha2-256",
        "ecdsa-sha2-nistp256",
        "ecdsa-sha2-nistp384",
        "ecdsa-sha2-nistp521",
        "ssh-rsa",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: LogLevel,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> LogLevel {
    LogLevel::Info
}

fn default_log_format() -> LogFormat {
    LogFormat::Pretty
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_metrics_listen")]
    pub listen: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen: default_metrics_listen(),
        }
    }
}

fn default_metrics_listen() -> String {
    "127.0.0.1:9090".to_string()
}
