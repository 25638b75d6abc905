//! Client configuration: `[common]`, `[[proxy]]` and `[[visitor]]` tables.

use rift_core::messages::NewProxy;
use rift_core::{ProxyType, RiftError, RiftResult};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::time::Duration;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClientConfig {
    #[serde(default)]
    pub common: CommonSection,
    #[serde(default, rename = "proxy")]
    pub proxies: Vec<ProxyConfig>,
    #[serde(default, rename = "visitor")]
    pub visitors: Vec<VisitorConfig>,
}

/// `[common]` section. Durations are in seconds.
#[derive(Debug, Clone, Deserialize)]
pub struct CommonSection {
    #[serde(default = "default_server_addr")]
    pub server_addr: String,
    #[serde(default = "default_server_port")]
    pub server_port: u16,
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub user: String,
    /// Work connections the server should keep pre-dialed.
    #[serde(default = "default_pool_count")]
    pub pool_count: u32,
    /// `0` disables pings.
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval: u64,
    /// `0` disables the pong deadline.
    #[serde(default = "default_heartbeat_timeout")]
    pub heartbeat_timeout: u64,
    /// Bounds the dial plus the login round trip, and visitor handshakes.
    #[serde(default = "default_login_timeout")]
    pub login_timeout: u64,
    /// How long either side of a hole punch keeps probing.
    #[serde(default = "default_nat_hole_timeout")]
    pub nat_hole_timeout: u64,
    #[serde(default)]
    pub metas: HashMap<String, String>,
}

impl Default for CommonSection {
    fn default() -> Self {
        Self {
            server_addr: default_server_addr(),
            server_port: default_server_port(),
            token: String::new(),
            user: String::new(),
            pool_count: default_pool_count(),
            heartbeat_interval: default_heartbeat_interval(),
            heartbeat_timeout: default_heartbeat_timeout(),
            login_timeout: default_login_timeout(),
            nat_hole_timeout: default_nat_hole_timeout(),
            metas: HashMap::new(),
        }
    }
}

impl CommonSection {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout)
    }

    pub fn login_timeout(&self) -> Duration {
        Duration::from_secs(self.login_timeout)
    }

    pub fn nat_hole_timeout(&self) -> Duration {
        Duration::from_secs(self.nat_hole_timeout)
    }

    /// `host:port` of the server control listener.
    pub fn server_endpoint(&self) -> String {
        format!("{}:{}", self.server_addr, self.server_port)
    }
}

/// One `[[proxy]]` table: a local service to expose through the server.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProxyConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub proxy_type: String,
    #[serde(default = "default_local_ip")]
    pub local_ip: String,
    #[serde(default)]
    pub local_port: u16,
    /// Public port for tcp and udp. `0` lets the server choose.
    #[serde(default)]
    pub remote_port: u16,
    #[serde(default)]
    pub use_encryption: bool,
    #[serde(default)]
    pub use_compression: bool,
    #[serde(default)]
    pub group: String,
    #[serde(default)]
    pub group_key: String,
    #[serde(default)]
    pub custom_domains: Vec<String>,
    #[serde(default)]
    pub subdomain: String,
    #[serde(default)]
    pub locations: Vec<String>,
    #[serde(default)]
    pub http_user: String,
    #[serde(default)]
    pub http_pwd: String,
    #[serde(default)]
    pub host_header_rewrite: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Shared secret for stcp and xtcp.
    #[serde(default)]
    pub sk: String,
    #[serde(default)]
    pub metas: HashMap<String, String>,
}

impl ProxyConfig {
    pub fn kind(&self) -> RiftResult<ProxyType> {
        self.proxy_type
            .parse()
            .map_err(RiftError::UnsupportedProxyType)
    }

    /// Address of the local service this proxy forwards to.
    pub fn local_endpoint(&self) -> String {
        format!("{}:{}", self.local_ip, self.local_port)
    }

    /// The registration request sent on the control connection.
    pub fn to_new_proxy(&self) -> NewProxy {
        NewProxy {
            proxy_name: self.name.clone(),
            proxy_type: self.proxy_type.clone(),
            use_encryption: self.use_encryption,
            use_compression: self.use_compression,
            group: self.group.clone(),
            group_key: self.group_key.clone(),
            metas: self.metas.clone(),
            remote_port: self.remote_port,
            custom_domains: self.custom_domains.clone(),
            subdomain: self.subdomain.clone(),
            locations: self.locations.clone(),
            http_user: self.http_user.clone(),
            http_pwd: self.http_pwd.clone(),
            host_header_rewrite: self.host_header_rewrite.clone(),
            headers: self.headers.clone(),
            sk: self.sk.clone(),
            multiplexer: String::new(),
        }
    }
}

/// One `[[visitor]]` table: a local listener that reaches a secret proxy.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct VisitorConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub visitor_type: String,
    /// Name of the stcp or xtcp proxy on the server.
    pub server_name: String,
    #[serde(default)]
    pub sk: String,
    #[serde(default = "default_local_ip")]
    pub bind_addr: String,
    #[serde(default)]
    pub bind_port: u16,
    #[serde(default)]
    pub use_encryption: bool,
    #[serde(default)]
    pub use_compression: bool,
}

impl VisitorConfig {
    pub fn kind(&self) -> RiftResult<ProxyType> {
        self.visitor_type
            .parse()
            .map_err(RiftError::UnsupportedProxyType)
    }

    pub fn bind_endpoint(&self) -> String {
        format!("{}:{}", self.bind_addr, self.bind_port)
    }
}

fn default_server_addr() -> String {
    "127.0.0.1".to_string()
}
fn default_server_port() -> u16 {
    7000
}
fn default_pool_count() -> u32 {
    1
}
fn default_heartbeat_interval() -> u64 {
    30
}
fn default_heartbeat_timeout() -> u64 {
    90
}
fn default_login_timeout() -> u64 {
    10
}
fn default_nat_hole_timeout() -> u64 {
    10
}
fn default_local_ip() -> String {
    "127.0.0.1".to_string()
}

impl ClientConfig {
    pub fn parse(content: &str) -> RiftResult<Self> {
        let config = toml::from_str::<Self>(content)
            .map_err(|e| RiftError::Config(format!("config parse error: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configs the server would refuse anyway, before dialing it.
    pub fn validate(&self) -> RiftResult<()> {
        let mut names = HashSet::new();
        for proxy in &self.proxies {
            if proxy.name.is_empty() {
                return Err(RiftError::Config("proxy without a name".into()));
            }
            if !names.insert(proxy.name.as_str()) {
                return Err(RiftError::Config(format!("duplicate proxy name [{}]", proxy.name)));
            }
            let kind = proxy.kind()?;
            if kind.is_visitor_reachable() && proxy.sk.is_empty() {
                return Err(RiftError::Config(format!("proxy [{}] of type {kind} needs an sk", proxy.name)));
            }
        }

        let mut names = HashSet::new();
        for visitor in &self.visitors {
            if !names.insert(visitor.name.as_str()) {
                return Err(RiftError::Config(format!("duplicate visitor name [{}]", visitor.name)));
            }
            if !visitor.kind()?.is_visitor_reachable() {
                return Err(RiftError::Config(format!(
                    "visitor [{}] must be stcp or xtcp, not {}",
                    visitor.name, visitor.visitor_type
                )));
            }
        }
        Ok(())
    }

    pub fn proxy(&self, name: &str) -> Option<&ProxyConfig> {
        self.proxies.iter().find(|p| p.name == name)
    }
}
