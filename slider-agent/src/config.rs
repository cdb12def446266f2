//! Agent configuration loaded from TOML.
//!
//! The config file path comes from `SLIDER_AGENT_CONFIG` (default
//! `agent.toml`); a missing file falls back to defaults so a freshly
//! provisioned host can start against a local server without any setup.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

pub const CONFIG_PATH_ENV: &str = "SLIDER_AGENT_CONFIG";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub server: ServerConfig,
    pub agent: AgentInfo,
    pub heartbeat: HeartbeatConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub scheme: String,
    pub hostname: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentInfo {
    /// Label under which this agent registers; the server addresses the agent
    /// by it in both endpoint paths.
    pub label: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    pub idle_interval_secs: u64,
    pub min_interval_secs: u64,
    /// Upper bound of the uniform retry delay applied to transient
    /// registration and heartbeat failures.
    pub retry_jitter_secs: u64,
    pub request_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            scheme: "http".to_string(),
            hostname: "localhost".to_string(),
            port: 8080,
        }
    }
}

impl Default for AgentInfo {
    fn default() -> Self {
        Self {
            label: hostname::get()
                .map(|h| h.to_string_lossy().to_string())
                .unwrap_or_else(|_| "localhost".to_string()),
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            idle_interval_secs: 10,
            min_interval_secs: 1,
            retry_jitter_secs: 30,
            request_timeout_secs: 60,
        }
    }
}

impl AgentConfig {
    /// Load config from the path in `SLIDER_AGENT_CONFIG`, or defaults when
    /// no file exists.
    pub async fn load() -> Result<Self> {
        let path = std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| "agent.toml".to_string());
        if Path::new(&path).exists() {
            let content = tokio::fs::read_to_string(&path).await?;
            let config = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    pub fn base_url(&self) -> String {
        format!(
            "{}://{}:{}",
            self.server.scheme, self.server.hostname, self.server.port
        )
    }
}

impl HeartbeatConfig {
    pub fn idle_interval(&self) -> Duration {
        Duration::from_secs(self.idle_interval_secs)
    }

    pub fn min_interval(&self) -> Duration {
        Duration::from_secs(self.min_interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}
