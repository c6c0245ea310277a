//! Configuration Loader (spec §6): JSON config file, read once at startup.
//!
//! Ground: `req-urls::config::Config::load` (serde + `fs::read_to_string`
//! pattern), with the field set and defaults fixed by spec §6.

use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};

use serde::Deserialize;

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    8888
}
fn default_thread_pool_size() -> usize {
    10
}
fn default_backlog() -> i32 {
    100
}
fn default_blocked_domains_file() -> String {
    "config/blocked_domains.txt".to_string()
}
fn default_log_file() -> String {
    "logs/proxy.log".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_thread_pool_size")]
    pub thread_pool_size: usize,
    #[serde(default = "default_backlog")]
    pub backlog: i32,
    #[serde(default = "default_blocked_domains_file")]
    pub blocked_domains_file: String,
    #[serde(default = "default_log_file")]
    pub log_file: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            host: default_host(),
            port: default_port(),
            thread_pool_size: default_thread_pool_size(),
            backlog: default_backlog(),
            blocked_domains_file: default_blocked_domains_file(),
            log_file: default_log_file(),
        }
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Config> {
        let text = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            anyhow::anyhow!("failed to read config file {}: {e}", path.as_ref().display())
        })?;
        let config: Config = serde_json::from_str(&text).map_err(|e| {
            anyhow::anyhow!("failed to parse config file {}: {e}", path.as_ref().display())
        })?;
        Ok(config)
    }

    pub fn bind_addr(&self) -> anyhow::Result<SocketAddr> {
        let ip: IpAddr = self
            .host
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid bind host {:?}: {e}", self.host))?;
        Ok(SocketAddr::new(ip, self.port))
    }

    pub fn blocked_domains_path(&self) -> PathBuf {
        PathBuf::from(&self.blocked_domains_file)
    }

    pub fn log_file_path(&self) -> PathBuf {
        PathBuf::from(&self.log_file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_to_empty_document() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{}").unwrap();
        let config = Config::load(&path).unwrap();
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 8888);
        assert_eq!(config.thread_pool_size, 10);
        assert_eq!(config.backlog, 100);
        assert_eq!(config.blocked_domains_file, "config/blocked_domains.txt");
        assert_eq!(config.log_file, "logs/proxy.log");
    }

    #[test]
    fn partial_overrides_merge_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"port": 18888, "thread_pool_size": 4}"#).unwrap();
        let config = Config::load(&path).unwrap();
        assert_eq!(config.port, 18888);
        assert_eq!(config.thread_pool_size, 4);
        assert_eq!(config.host, "127.0.0.1");
    }

    #[test]
    fn invalid_json_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "not json").unwrap();
        assert!(Config::load(&path).is_err());
    }

    #[test]
    fn bind_addr_combines_host_and_port() {
        let config = Config {
            host: "127.0.0.1".into(),
            port: 9999,
            ..Default::default()
        };
        assert_eq!(config.bind_addr().unwrap(), "127.0.0.1:9999".parse().unwrap());
    }
}
