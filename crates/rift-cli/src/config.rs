//! Client configuration at `~/.rift/client.toml`.
//!
//! CLI flags always override config file values.

use anyhow::{Context, Result};
use rift_client::ClientConfig;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Connection settings given on the command line.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub server_addr: Option<String>,
    pub server_port: Option<u16>,
    pub token: Option<String>,
}

/// Load the config file, returning defaults if it does not exist, then apply `overrides`.
pub fn load(path: &str, overrides: &Overrides) -> Result<ClientConfig> {
    let path = expand_tilde(Path::new(path));
    let mut config = if path.exists() {
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read config at {}", path.display()))?;
        let config = ClientConfig::parse(&content)
            .with_context(|| format!("invalid config at {}", path.display()))?;
        debug!(path = %path.display(), proxies = config.proxies.len(), visitors = config.visitors.len(), "loaded config");
        config
    } else {
        debug!(path = %path.display(), "config file not found, using defaults");
        ClientConfig::default()
    };

    if let Some(addr) = &overrides.server_addr {
        config.common.server_addr = addr.clone();
    }
    if let Some(port) = overrides.server_port {
        config.common.server_port = port;
    }
    if let Some(token) = &overrides.token {
        config.common.token = token.clone();
    }
    Ok(config)
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    } else if s == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    }
    path.to_path_buf()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn loads_file_and_applies_overrides() {
        let file = write_config(
            r#"
[common]
server_addr = "gw.example.com"
server_port = 7000
token = "from-file"

[[proxy]]
name = "ssh"
type = "tcp"
local_port = 22
remote_port = 6000
"#,
        );
        let overrides = Overrides {
            server_port: Some(7443),
            token: Some("from-cli".into()),
            ..Default::default()
        };
        let config = load(file.path().to_str().unwrap(), &overrides).unwrap();
        assert_eq!(config.common.server_addr, "gw.example.com");
        assert_eq!(config.common.server_port, 7443);
        assert_eq!(config.common.token, "from-cli");
        assert_eq!(config.proxies.len(), 1);
    }

    #[test]
    fn missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.toml");
        let config = load(path.to_str().unwrap(), &Overrides::default()).unwrap();
        assert_eq!(config.common.server_port, 7000);
        assert!(config.proxies.is_empty());
    }

    #[test]
    fn invalid_file_names_the_path() {
        let file = write_config("[[proxy]]\nname = \"a\"\ntype = \"gopher\"\n");
        let err = load(file.path().to_str().unwrap(), &Overrides::default()).unwrap_err();
        let message = format!("{err:#}");
        assert!(message.contains("invalid config at"), "{message}");
        assert!(message.contains("gopher"), "{message}");
    }

    #[test]
    fn tilde_expands_to_home() {
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_tilde(Path::new("~/.rift/client.toml")), home.join(".rift/client.toml"));
        }
        assert_eq!(expand_tilde(Path::new("/etc/rift.toml")), PathBuf::from("/etc/rift.toml"));
    }
}
