//! Server configuration: TOML file + CLI overrides.

use mailgate_core::{GateError, GateResult};
use serde::Deserialize;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub gateway: GatewaySection,
    #[serde(default)]
    pub supervisor: SupervisorSection,
    #[serde(default)]
    pub log: LogSection,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
        }
    }
}

/// `[gateway]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewaySection {
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
    #[serde(default = "default_read_buffer_size")]
    pub read_buffer_size: usize,
    #[serde(default = "default_event_queue")]
    pub event_queue: usize,
}

impl Default for GatewaySection {
    fn default() -> Self {
        Self {
            max_message_size: default_max_message_size(),
            read_buffer_size: default_read_buffer_size(),
            event_queue: default_event_queue(),
        }
    }
}

/// `[supervisor]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct SupervisorSection {
    #[serde(default = "default_restart_delay_ms")]
    pub restart_delay_ms: u64,
}

impl Default for SupervisorSection {
    fn default() -> Self {
        Self {
            restart_delay_ms: default_restart_delay_ms(),
        }
    }
}

/// `[log]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct LogSection {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8585
}
fn default_max_message_size() -> usize {
    1_048_576
}
fn default_read_buffer_size() -> usize {
    8192
}
fn default_event_queue() -> usize {
    256
}
fn default_restart_delay_ms() -> u64 {
    1000
}
fn default_log_level() -> String {
    "info".to_string()
}

/// Values given on the command line. `None` keeps the file value.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub port: Option<u16>,
    pub bind: Option<String>,
    pub log_level: Option<String>,
    pub restart_delay_ms: Option<u64>,
}

/// Per-session gateway tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayConfig {
    /// Largest accepted client frame in bytes; bigger frames are dropped.
    pub max_message_size: usize,
    /// Socket read buffer per stream.
    pub read_buffer_size: usize,
    /// Capacity of the bridge → session event queue.
    pub event_queue: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        let section = GatewaySection::default();
        Self {
            max_message_size: section.max_message_size,
            read_buffer_size: section.read_buffer_size,
            event_queue: section.event_queue,
        }
    }
}

/// Resolved server configuration (file loaded, CLI overrides applied).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: IpAddr,
    pub port: u16,
    pub gateway: GatewayConfig,
    pub restart_delay: Duration,
    pub log_level: String,
    /// The config file that was read, if it existed.
    pub source: Option<PathBuf>,
}

impl ServerConfig {
    /// Load config from a TOML file, then apply CLI overrides.
    ///
    /// A missing file is not an error; defaults are used instead.
    pub fn load(config_path: Option<&Path>, overrides: &CliOverrides) -> GateResult<Self> {
        let (file_config, source) = match config_path.map(expand_tilde) {
            Some(path) if path.exists() => {
                let content = std::fs::read_to_string(&path)?;
                let parsed = toml::from_str::<ConfigFile>(&content).map_err(|e| {
                    GateError::Config(format!("{}: {e}", path.display()))
                })?;
                (parsed, Some(path))
            }
            _ => (ConfigFile::default(), None),
        };

        let mut config = Self::resolve(file_config, overrides)?;
        config.source = source;
        Ok(config)
    }

    /// Merge a parsed config file with CLI overrides and validate the result.
    pub fn resolve(file_config: ConfigFile, overrides: &CliOverrides) -> GateResult<Self> {
        let bind_str = overrides
            .bind
            .clone()
            .unwrap_or(file_config.server.bind);
        let bind: IpAddr = bind_str
            .parse()
            .map_err(|e| GateError::Config(format!("invalid bind address {bind_str:?}: {e}")))?;

        let gateway = GatewayConfig {
            max_message_size: file_config.gateway.max_message_size,
            read_buffer_size: file_config.gateway.read_buffer_size,
            event_queue: file_config.gateway.event_queue,
        };
        if gateway.read_buffer_size == 0 {
            return Err(GateError::Config("gateway.read_buffer_size must be > 0".into()));
        }
        if gateway.event_queue == 0 {
            return Err(GateError::Config("gateway.event_queue must be > 0".into()));
        }
        if gateway.max_message_size == 0 {
            return Err(GateError::Config("gateway.max_message_size must be > 0".into()));
        }

        let restart_delay_ms = overrides
            .restart_delay_ms
            .unwrap_or(file_config.supervisor.restart_delay_ms);

        Ok(Self {
            bind,
            port: overrides.port.unwrap_or(file_config.server.port),
            gateway,
            restart_delay: Duration::from_millis(restart_delay_ms),
            log_level: overrides
                .log_level
                .clone()
                .unwrap_or(file_config.log.level),
            source: None,
        })
    }

    /// The address the WebSocket listener binds.
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.port)
    }
}

/// Expand `~` to the user's home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}
