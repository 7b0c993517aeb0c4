//! Configuration management.

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Configuration structure that matches the TOML file format.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct ConfigFile {
    #[serde(default)]
    server: ServerConfig,
    #[serde(default)]
    transport: TransportSettings,
    #[serde(default)]
    logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ServerConfig {
    #[serde(default = "default_host")]
    host: String,
    #[serde(default = "default_port")]
    port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct LoggingConfig {
    /// Path to log file (if set, logs will be written to file in addition to stdout)
    log_file: Option<PathBuf>,
    /// Log level (trace, debug, info, warn, error)
    /// If not set, uses RUST_LOG environment variable or defaults to "info"
    log_level: Option<String>,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    relay_types::DEFAULT_PORT
}

fn default_keep_alive_secs() -> u64 {
    15
}

fn default_drain_timeout_secs() -> u64 {
    5
}

fn default_shutdown_timeout_secs() -> u64 {
    10
}

fn default_session_idle_timeout_secs() -> u64 {
    3600
}

/// Tuning of the Streamable HTTP transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportSettings {
    /// Interval between SSE keep-alive comments.
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
    /// End a GET stream that delivered nothing for this long.
    #[serde(default)]
    pub stream_idle_timeout_secs: Option<u64>,
    /// How long a terminating session waits for in-flight requests.
    #[serde(default = "default_drain_timeout_secs")]
    pub drain_timeout_secs: u64,
    /// Overall budget for closing all sessions on shutdown.
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
    /// Reclaim a session with no stream and no requests for this long. 0 disables.
    #[serde(default = "default_session_idle_timeout_secs")]
    pub session_idle_timeout_secs: u64,
    /// Per-session retention cap of the event log. Unset keeps everything.
    #[serde(default)]
    pub event_log_capacity: Option<usize>,
    /// Origins accepted in addition to localhost. Empty means localhost only.
    #[serde(default)]
    pub allowed_origins: Vec<String>,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            keep_alive_secs: default_keep_alive_secs(),
            stream_idle_timeout_secs: None,
            drain_timeout_secs: default_drain_timeout_secs(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
            session_idle_timeout_secs: default_session_idle_timeout_secs(),
            event_log_capacity: None,
            allowed_origins: Vec::new(),
        }
    }
}

impl TransportSettings {
    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs.max(1))
    }

    pub fn stream_idle_timeout(&self) -> Option<Duration> {
        self.stream_idle_timeout_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn session_idle_timeout(&self) -> Option<Duration> {
        (self.session_idle_timeout_secs > 0)
            .then(|| Duration::from_secs(self.session_idle_timeout_secs))
    }
}

/// Application configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Address to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Streamable HTTP transport settings
    pub transport: TransportSettings,
    /// Path to log file (if set, logs will be written to file in addition to stdout)
    pub log_file: Option<PathBuf>,
    /// Log level (if set, overrides RUST_LOG environment variable)
    pub log_level: Option<String>,
}

impl Config {
    /// Load configuration with full priority chain: CLI args > env vars > config files > defaults.
    ///
    /// Config files are merged in this order:
    /// 1. `config.toml` in user config directory (~/.config/relay/ on Linux)
    /// 2. `.relay.toml` in current directory
    /// 3. The file given with `--config`, if any
    pub fn from_figment(
        host: Option<String>,
        port: Option<u16>,
        config_file: Option<PathBuf>,
        log_level: Option<String>,
        log_file: Option<PathBuf>,
    ) -> anyhow::Result<Self> {
        let local_config = std::env::current_dir().ok().map(|d| d.join(".relay.toml"));
        let user_config = directories::ProjectDirs::from("", "", "relay")
            .map(|dirs| dirs.config_dir().join("config.toml"));

        // 1. Start with defaults
        let mut figment = Figment::new().merge(Serialized::defaults(ConfigFile::default()));

        // 2. Merge config files that exist
        for path in [user_config, local_config].into_iter().flatten() {
            if path.exists() {
                figment = figment.merge(Toml::file(path));
            }
        }
        if let Some(path) = config_file {
            if !path.exists() {
                anyhow::bail!("Config file not found: {}", path.display());
            }
            figment = figment.merge(Toml::file(path));
        }

        // 3. Merge environment variables (RELAY_SERVER__PORT, RELAY_TRANSPORT__KEEP_ALIVE_SECS, ...)
        figment = figment.merge(Env::prefixed("RELAY_").split("__"));

        // 4. Merge CLI arguments (highest priority)
        if let Some(h) = host {
            figment = figment.merge(Serialized::default("server.host", h));
        }
        if let Some(p) = port {
            figment = figment.merge(Serialized::default("server.port", p));
        }
        if let Some(level) = log_level {
            figment = figment.merge(Serialized::default("logging.log_level", level));
        }
        if let Some(file) = log_file {
            figment = figment.merge(Serialized::default("logging.log_file", file));
        }

        let config_file: ConfigFile = figment.extract()?;

        Ok(Self {
            host: config_file.server.host,
            port: config_file.server.port,
            transport: config_file.transport,
            log_file: config_file.logging.log_file,
            log_level: config_file.logging.log_level,
        })
    }

    /// Socket address string to bind.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            transport: TransportSettings::default(),
            log_file: None,
            log_level: None,
        }
    }
}
