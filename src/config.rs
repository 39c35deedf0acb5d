//! Configuration loading
//!
//! The entire server is driven by a single YAML file. Every section has
//! sensible defaults so a minimal config only needs a database DSN.

use std::collections::HashMap;
use std::fs;

use derive_more::{Display, Error, From};
use serde::{Deserialize, Serialize};

#[derive(Debug, Display, From, Error)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(serde_yaml::Error),
}

type Result<T> = std::result::Result<T, ConfigError>;

/// Relational store settings. Only sqlite is wired up; `dsn` is a file
/// path or `:memory:`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DbConfig {
    #[serde(default)]
    pub driver: String,
    #[serde(default)]
    pub dsn: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GeoIpConfig {
    #[serde(default)]
    pub enabled: bool,
    /// A single .mmdb file or a directory of them.
    #[serde(default)]
    pub mmdb_path: String,
    /// Re-open databases from disk every this many seconds. 0 disables.
    #[serde(default)]
    pub reload_sec: u64,
    /// Honor the EDNS Client Subnet option on incoming queries.
    #[serde(default)]
    pub use_ecs: bool,
    /// URLs fetched into `mmdb_path` on the download interval.
    #[serde(default)]
    pub download_urls: Vec<String>,
    /// 0 disables periodic downloads.
    #[serde(default)]
    pub download_interval_sec: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub require_tsig: bool,
    /// Key name -> base64 secret.
    #[serde(default)]
    pub tsig_secrets: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// "master", "slave" or empty for standalone.
    #[serde(default)]
    pub mode: String,
    #[serde(default)]
    pub master_url: String,
    /// Token for outgoing sync requests; falls back to the global api_token.
    #[serde(default)]
    pub api_token: String,
    #[serde(default = "default_sync_interval")]
    pub sync_interval_sec: u64,
}

fn default_sync_interval() -> u64 {
    60
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogConfig {
    /// Per-query geo/rule detail in the query log lines.
    #[serde(default)]
    pub dns_verbose: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_size")]
    pub size: usize,
}

fn default_cache_size() -> usize {
    1024
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            size: default_cache_size(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// DNS listen address, e.g. "0.0.0.0:53".
    #[serde(default)]
    pub listen: String,
    /// Upstream resolver consulted on local miss, e.g. "8.8.8.8". Empty
    /// disables forwarding.
    #[serde(default)]
    pub forwarder: String,
    /// Bearer token protecting the management API. Empty disables auth.
    #[serde(default)]
    pub api_token: String,
    /// Management/replication HTTP listen address.
    #[serde(default)]
    pub rest_listen: String,
    /// Synthesize a default SOA when an update targets a zone without one.
    #[serde(default)]
    pub auto_soa_on_missing: bool,
    /// Applied to rrsets created with TTL 0.
    #[serde(default)]
    pub default_ttl: u32,

    #[serde(default)]
    pub db: DbConfig,
    #[serde(default)]
    pub geoip: GeoIpConfig,
    #[serde(default)]
    pub update: UpdateConfig,
    #[serde(default)]
    pub replication: ReplicationConfig,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub cache: CacheConfig,
}

impl Config {
    /// Read and parse the config file, filling in listen defaults.
    pub fn load(path: &str) -> Result<Config> {
        let raw = fs::read_to_string(path)?;
        let mut cfg: Config = serde_yaml::from_str(&raw)?;
        cfg.apply_defaults();
        Ok(cfg)
    }

    fn apply_defaults(&mut self) {
        if self.listen.is_empty() {
            self.listen = "0.0.0.0:53".to_string();
        }
        if self.rest_listen.is_empty() {
            self.rest_listen = "0.0.0.0:8080".to_string();
        }
        if self.replication.sync_interval_sec == 0 {
            self.replication.sync_interval_sec = default_sync_interval();
        }
    }

    pub fn is_slave(&self) -> bool {
        self.replication.mode.eq_ignore_ascii_case("slave")
    }

    pub fn is_master(&self) -> bool {
        self.replication.mode.eq_ignore_ascii_case("master")
    }
}
