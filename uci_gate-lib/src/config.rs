use ipnet::Ipv4Net;
use serde::Deserialize;
use thiserror::Error;

use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::fs;

use crate::uci::OptionPolicy;

pub const DEFAULT_PATH: &str = "config.json";
pub const ENV_VAR: &str = "UCI_GATE_CONFIG_PATH";

/// Server configuration, immutable after load.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    pub host: String,
    pub base_log_dir: PathBuf,
    pub engines: BTreeMap<String, Engine>,
    /// Options applied to every engine that does not override the name locally.
    #[serde(default)]
    pub custom_variables: BTreeMap<String, String>,
    /// Global cap on concurrently live sessions.
    pub max_connections: usize,
    #[serde(default)]
    pub trusted_sources: BTreeSet<Ipv4Addr>,
    #[serde(default)]
    pub trusted_subnets: Vec<Ipv4Net>,
    pub max_connection_attempts: u32,
    /// Sliding-window length in seconds.
    pub connection_attempt_period: u64,
    #[serde(default)]
    pub enable_trusted_sources: bool,
    #[serde(default)]
    pub enable_firewall_rules: bool,
    #[serde(default)]
    pub enable_firewall_subnet_blocking: bool,
    #[serde(default)]
    pub enable_firewall_ip_blocking: bool,
    #[serde(default)]
    pub enable_server_log: bool,
    #[serde(default)]
    pub enable_uci_log: bool,
    #[serde(default, alias = "Log_untrusted_connection_attempts")]
    pub log_untrusted_connection_attempts: bool,
    #[serde(default)]
    pub detailed_log_verbosity: bool,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Engine {
    pub path: PathBuf,
    pub port: u16,
    #[serde(default)]
    pub custom_variables: BTreeMap<String, String>,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration file not found")]
    NoFile,
    #[error("IO error: {0}")]
    IO(#[from] std::io::Error),
    #[error("Deserialization error: {0}")]
    JsonDeserialization(#[from] serde_json::Error),
    #[error("No engines configured")]
    NoEngines,
    #[error("max_connections must be at least 1")]
    InvalidMaxConnections,
}

impl Config {
    pub fn attempt_period(&self) -> Duration {
        Duration::from_secs(self.connection_attempt_period)
    }

    /// Comma-joined list of every engine port, the `localport=` value for
    /// firewall rules covering the whole server.
    pub fn engine_ports(&self) -> String {
        self.engines
            .values()
            .map(|engine| engine.port.to_string())
            .collect::<Vec<_>>()
            .join(",")
    }

    pub fn policy_for(&self, engine: &Engine) -> OptionPolicy {
        OptionPolicy::new(engine.custom_variables.clone(), self.custom_variables.clone())
    }

    pub fn transcript_path(&self, engine_name: &str) -> PathBuf {
        self.base_log_dir
            .join(format!("communication_log_{engine_name}.txt"))
    }
}

pub async fn read(path: &Path) -> Result<Config, Error> {
    let content = fs::read_to_string(path).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            Error::NoFile
        } else {
            Error::IO(e)
        }
    })?;

    let config: Config = serde_json::from_str(&content)?;
    validate(config)
}

fn validate(config: Config) -> Result<Config, Error> {
    if config.engines.is_empty() {
        return Err(Error::NoEngines);
    }
    if config.max_connections == 0 {
        return Err(Error::InvalidMaxConnections);
    }
    Ok(config)
}
