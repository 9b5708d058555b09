//! Gateway configuration: TOML file + programmatic overrides.

use rssh_core::{RsshError, RsshResult};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub session: SessionSection,
    #[serde(default)]
    pub forward: ForwardSection,
}

/// `[server]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Absent means any key is accepted.
    #[serde(default)]
    pub authorized_keys: Option<String>,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            authorized_keys: None,
            log_level: default_log_level(),
        }
    }
}

/// `[session]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionSection {
    #[serde(default = "default_shell")]
    pub shell: String,
    #[serde(default = "default_term")]
    pub default_term: String,
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            shell: default_shell(),
            default_term: default_term(),
            drain_timeout_ms: default_drain_timeout_ms(),
        }
    }
}

/// `[forward]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct ForwardSection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_allowed_destinations")]
    pub allowed_destinations: Vec<String>,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_relay_buffer_size")]
    pub relay_buffer_size: usize,
}

impl Default for ForwardSection {
    fn default() -> Self {
        Self {
            enabled: true,
            connect_timeout_ms: default_connect_timeout_ms(),
            allowed_destinations: default_allowed_destinations(),
            max_connections: default_max_connections(),
            relay_buffer_size: default_relay_buffer_size(),
        }
    }
}

const DEFAULT_PORT: u16 = 51022;

fn default_listen() -> String {
    format!("0.0.0.0:{DEFAULT_PORT}")
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_shell() -> String {
    std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string())
}
fn default_term() -> String {
    "xterm-256color".to_string()
}
fn default_drain_timeout_ms() -> u64 {
    500
}
fn default_true() -> bool {
    true
}
fn default_connect_timeout_ms() -> u64 {
    10_000
}
fn default_allowed_destinations() -> Vec<String> {
    vec!["*".to_string()]
}
fn default_max_connections() -> usize {
    256
}
fn default_relay_buffer_size() -> usize {
    8192
}

/// Values that take precedence over the file (e.g. from a command line).
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub listen: Option<String>,
    pub authorized_keys: Option<String>,
    pub shell: Option<String>,
    pub log_level: Option<String>,
    pub forward_enabled: Option<bool>,
}

/// Resolved configuration (paths expanded, overrides applied).
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub listen: SocketAddr,
    pub authorized_keys_path: Option<PathBuf>,
    pub log_level: String,
    pub shell: String,
    pub default_term: String,
    pub drain_timeout: Duration,
    pub forward_enabled: bool,
    pub connect_timeout: Duration,
    pub allowed_destinations: Vec<String>,
    pub max_connections: usize,
    pub relay_buffer_size: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            authorized_keys_path: None,
            log_level: default_log_level(),
            shell: default_shell(),
            default_term: default_term(),
            drain_timeout: Duration::from_millis(default_drain_timeout_ms()),
            forward_enabled: true,
            connect_timeout: Duration::from_millis(default_connect_timeout_ms()),
            allowed_destinations: default_allowed_destinations(),
            max_connections: default_max_connections(),
            relay_buffer_size: default_relay_buffer_size(),
        }
    }
}

impl GatewayConfig {
    /// Load config from a TOML file, then apply overrides. A missing file
    /// means defaults.
    pub fn load(config_path: Option<&Path>, overrides: &ConfigOverrides) -> RsshResult<Self> {
        let file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)?;
                    parse(&content)?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };
        Self::resolve(file_config, overrides)
    }

    pub fn from_toml_str(content: &str, overrides: &ConfigOverrides) -> RsshResult<Self> {
        Self::resolve(parse(content)?, overrides)
    }

    fn resolve(file: ConfigFile, overrides: &ConfigOverrides) -> RsshResult<Self> {
        let listen_str = overrides
            .listen
            .clone()
            .unwrap_or(file.server.listen);
        let listen = listen_str
            .parse::<SocketAddr>()
            .map_err(|e| RsshError::Config(format!("invalid listen address {listen_str:?}: {e}")))?;

        if file.forward.relay_buffer_size == 0 {
            return Err(RsshError::Config("relay_buffer_size must be positive".into()));
        }

        Ok(Self {
            listen,
            authorized_keys_path: overrides
                .authorized_keys
                .as_deref()
                .or(file.server.authorized_keys.as_deref())
                .map(expand_tilde_str),
            log_level: overrides
                .log_level
                .clone()
                .unwrap_or(file.server.log_level),
            shell: overrides.shell.clone().unwrap_or(file.session.shell),
            default_term: file.session.default_term,
            drain_timeout: Duration::from_millis(file.session.drain_timeout_ms),
            forward_enabled: overrides.forward_enabled.unwrap_or(file.forward.enabled),
            connect_timeout: Duration::from_millis(file.forward.connect_timeout_ms),
            allowed_destinations: file.forward.allowed_destinations,
            max_connections: file.forward.max_connections,
            relay_buffer_size: file.forward.relay_buffer_size,
        })
    }
}

fn parse(content: &str) -> RsshResult<ConfigFile> {
    toml::from_str::<ConfigFile>(content)
        .map_err(|e| RsshError::Config(format!("config parse error: {e}")))
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    expand_tilde_str(&s)
}

fn expand_tilde_str(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}
