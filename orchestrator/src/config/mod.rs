// File: orchestrator/src/config/mod.rs
pub mod manager;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
pub use manager::ConfigManager;

use crate::constants::{defaults, limits, polling};
use crate::operation::PollSettings;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub poll_interval_ms: Option<u64>,
    pub task_timeout_seconds: Option<u64>,
    pub max_scans_per_connection: Option<usize>,
    // Populated from individual pool config files
    #[serde(skip)]
    pub pools: HashMap<String, PoolConnectionConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConnectionConfig {
    pub url: String,
    pub api_key: String,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfigFile {
    pub connection: PoolConnectionConfig,
}

fn default_host() -> String {
    defaults::HOST.to_string()
}

fn default_port() -> u16 {
    defaults::PORT
}

fn default_request_timeout() -> u64 {
    defaults::GATEWAY_REQUEST_TIMEOUT_SECONDS
}

impl Config {
    pub fn poll_settings(&self) -> PollSettings {
        PollSettings {
            interval: self
                .poll_interval_ms
                .map(Duration::from_millis)
                .unwrap_or(polling::TASK_POLL_INTERVAL),
            timeout: self
                .task_timeout_seconds
                .map(Duration::from_secs)
                .unwrap_or(polling::TASK_TIMEOUT),
        }
    }

    pub fn max_scans_per_connection(&self) -> usize {
        self.max_scans_per_connection
            .unwrap_or(limits::MAX_SCANS_PER_CONNECTION)
            .max(1)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            poll_interval_ms: None,
            task_timeout_seconds: None,
            max_scans_per_connection: None,
            pools: HashMap::new(),
        }
    }
}
