//! Server configuration: TOML file + CLI overrides.

use crate::ports::{parse_port_ranges, PortRange};
use rift_core::{RiftError, RiftResult, DEFAULT_MAX_FRAME_LEN};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub auth: AuthSection,
    #[serde(default)]
    pub limits: LimitsSection,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default = "default_bind_port")]
    pub bind_port: u16,
    /// UDP port of the hole-punch coordinator. Unset disables xtcp.
    #[serde(default)]
    pub nat_hole_port: Option<u16>,
    #[serde(default = "default_proxy_bind_addr")]
    pub proxy_bind_addr: String,
    /// Allowed public ports, e.g. `"2000-3000,3001"`. Empty allows any.
    #[serde(default)]
    pub allow_ports: String,
    #[serde(default)]
    pub vhost_http_port: Option<u16>,
    #[serde(default)]
    pub vhost_https_port: Option<u16>,
    #[serde(default)]
    pub subdomain_host: String,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            bind_port: default_bind_port(),
            nat_hole_port: None,
            proxy_bind_addr: default_proxy_bind_addr(),
            allow_ports: String::new(),
            vhost_http_port: None,
            vhost_https_port: None,
            subdomain_host: String::new(),
        }
    }
}

/// `[auth]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthSection {
    #[serde(default)]
    pub token: String,
    /// Seconds a signed timestamp stays valid. `0` disables the check.
    #[serde(default = "default_freshness_window")]
    pub freshness_window: u64,
}

impl Default for AuthSection {
    fn default() -> Self {
        Self {
            token: String::new(),
            freshness_window: default_freshness_window(),
        }
    }
}

/// `[limits]` section of the config TOML. All durations are in seconds.
#[derive(Debug, Clone, Deserialize)]
pub struct LimitsSection {
    /// `0` disables heartbeat expiry.
    #[serde(default = "default_heartbeat_timeout")]
    pub heartbeat_timeout: u64,
    #[serde(default = "default_pending_conn_timeout")]
    pub pending_conn_timeout: u64,
    #[serde(default = "default_work_conn_idle_timeout")]
    pub work_conn_idle_timeout: u64,
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout: u64,
    #[serde(default = "default_max_pool_count")]
    pub max_pool_count: u32,
    #[serde(default = "default_nat_hole_expiry")]
    pub nat_hole_expiry: u64,
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
}

impl Default for LimitsSection {
    fn default() -> Self {
        Self {
            heartbeat_timeout: default_heartbeat_timeout(),
            pending_conn_timeout: default_pending_conn_timeout(),
            work_conn_idle_timeout: default_work_conn_idle_timeout(),
            handshake_timeout: default_handshake_timeout(),
            max_pool_count: default_max_pool_count(),
            nat_hole_expiry: default_nat_hole_expiry(),
            max_message_size: default_max_message_size(),
        }
    }
}

fn default_bind_addr() -> String {
    "0.0.0.0".to_string()
}
fn default_bind_port() -> u16 {
    7000
}
fn default_proxy_bind_addr() -> String {
    "0.0.0.0".to_string()
}
fn default_freshness_window() -> u64 {
    900
}
fn default_heartbeat_timeout() -> u64 {
    90
}
fn default_pending_conn_timeout() -> u64 {
    10
}
fn default_work_conn_idle_timeout() -> u64 {
    60
}
fn default_handshake_timeout() -> u64 {
    10
}
fn default_max_pool_count() -> u32 {
    5
}
fn default_nat_hole_expiry() -> u64 {
    10
}
fn default_max_message_size() -> usize {
    DEFAULT_MAX_FRAME_LEN
}

/// Resolved server configuration (ranges parsed, durations typed, CLI overrides applied).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub bind_port: u16,
    pub nat_hole_port: Option<u16>,
    pub proxy_bind_addr: String,
    pub allow_ports: Vec<PortRange>,
    pub vhost_http_port: Option<u16>,
    pub vhost_https_port: Option<u16>,
    pub subdomain_host: String,
    pub token: String,
    pub freshness_window: u64,
    pub heartbeat_timeout: Duration,
    pub pending_conn_timeout: Duration,
    pub work_conn_idle_timeout: Duration,
    pub handshake_timeout: Duration,
    pub max_pool_count: u32,
    pub nat_hole_expiry: Duration,
    pub max_message_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::resolve(ConfigFile::default(), Vec::new())
    }
}

impl ServerConfig {
    /// Load config from TOML file, then apply CLI overrides.
    pub fn load(
        config_path: Option<&Path>,
        cli_bind_addr: Option<&str>,
        cli_bind_port: Option<u16>,
        cli_token: Option<&str>,
    ) -> RiftResult<Self> {
        let file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)?;
                    Self::parse(&content)?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };

        let mut config = Self::from_file(file_config)?;
        if let Some(addr) = cli_bind_addr {
            config.bind_addr = addr.to_string();
        }
        if let Some(port) = cli_bind_port {
            config.bind_port = port;
        }
        if let Some(token) = cli_token {
            config.token = token.to_string();
        }
        Ok(config)
    }

    pub fn parse(content: &str) -> RiftResult<ConfigFile> {
        toml::from_str::<ConfigFile>(content)
            .map_err(|e| RiftError::Config(format!("config parse error: {e}")))
    }

    pub fn from_file(file: ConfigFile) -> RiftResult<Self> {
        let allow_ports = parse_port_ranges(&file.server.allow_ports)?;
        Ok(Self::resolve(file, allow_ports))
    }

    fn resolve(file: ConfigFile, allow_ports: Vec<PortRange>) -> Self {
        let ConfigFile {
            server,
            auth,
            limits,
        } = file;

        Self {
            bind_addr: server.bind_addr,
            bind_port: server.bind_port,
            nat_hole_port: server.nat_hole_port,
            proxy_bind_addr: server.proxy_bind_addr,
            allow_ports,
            vhost_http_port: server.vhost_http_port.filter(|p| *p != 0),
            vhost_https_port: server.vhost_https_port.filter(|p| *p != 0),
            subdomain_host: server.subdomain_host,
            token: auth.token,
            freshness_window: auth.freshness_window,
            heartbeat_timeout: Duration::from_secs(limits.heartbeat_timeout),
            pending_conn_timeout: Duration::from_secs(limits.pending_conn_timeout),
            work_conn_idle_timeout: Duration::from_secs(limits.work_conn_idle_timeout),
            handshake_timeout: Duration::from_secs(limits.handshake_timeout),
            max_pool_count: limits.max_pool_count,
            nat_hole_expiry: Duration::from_secs(limits.nat_hole_expiry),
            max_message_size: limits.max_message_size,
        }
    }

    /// Control listener address.
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind_addr, self.bind_port)
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

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_resolve() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.bind_port, 7000);
        assert_eq!(cfg.heartbeat_timeout, Duration::from_secs(90));
        assert!(cfg.allow_ports.is_empty());
        assert!(cfg.nat_hole_port.is_none());
    }

    #[test]
    fn load_file_with_overrides() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[server]
bind_port = 7100
nat_hole_port = 7101
allow_ports = "6000-6010,7000"
vhost_http_port = 0

[auth]
token = "from-file"
freshness_window = 0

[limits]
heartbeat_timeout = 30
max_pool_count = 2
"#
        )
        .unwrap();

        let cfg = ServerConfig::load(Some(file.path()), Some("127.0.0.1"), None, Some("cli")).unwrap();
        assert_eq!(cfg.bind_addr, "127.0.0.1");
        assert_eq!(cfg.bind_port, 7100);
        assert_eq!(cfg.nat_hole_port, Some(7101));
        assert_eq!(cfg.allow_ports.len(), 2);
        assert_eq!(cfg.vhost_http_port, None);
        assert_eq!(cfg.token, "cli");
        assert_eq!(cfg.freshness_window, 0);
        assert_eq!(cfg.heartbeat_timeout, Duration::from_secs(30));
        assert_eq!(cfg.max_pool_count, 2);
        assert_eq!(cfg.pending_conn_timeout, Duration::from_secs(10));
    }

    #[test]
    fn bad_port_range_is_config_error() {
        let file = ServerConfig::parse("[server]\nallow_ports = \"9-1\"\n").unwrap();
        let err = ServerConfig::from_file(file).unwrap_err();
        assert!(matches!(err, RiftError::Config(_)));
    }

    #[test]
    fn missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = ServerConfig::load(Some(&dir.path().join("nope.toml")), None, Some(1), None).unwrap();
        assert_eq!(cfg.bind_port, 1);
        assert_eq!(cfg.token, "");
    }
}
