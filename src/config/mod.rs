//! Service configuration.
//!
//! Loaded from an optional TOML file, then overridden by `CONDUCTOR_*`
//! environment variables. Every field has a default so `conductor serve`
//! works out of the box with the scripted demo adapter.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

fn default_bind_addr() -> String {
    "127.0.0.1:8700".into()
}

fn default_api_base() -> String {
    "/api/executor/v1".into()
}

fn default_db_path() -> PathBuf {
    PathBuf::from("conductor.db")
}

fn default_worker_pool_size() -> usize {
    8
}

fn default_subscriber_buffer() -> usize {
    256
}

fn default_adapter_kind() -> String {
    "scripted".into()
}

fn default_adapter_base_url() -> String {
    "https://api.openai.com".into()
}

fn default_adapter_model() -> String {
    "gpt-4o-mini".into()
}

fn default_temperature() -> f64 {
    0.7
}

/// Top-level service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Address the HTTP facade binds to.
    pub bind_addr: String,
    /// URL prefix for all run/hierarchy endpoints.
    pub api_base: String,
    /// SQLite database file.
    pub db_path: PathBuf,
    /// Maximum number of concurrently executing runs.
    pub worker_pool_size: usize,
    /// Bounded per-subscriber event queue size.
    pub subscriber_buffer: usize,
    pub adapter: AdapterConfig,
}

/// Agent invocation adapter settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdapterConfig {
    /// `scripted` (deterministic, no network) or `compatible`
    /// (OpenAI-compatible chat completions API).
    pub kind: String,
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub temperature: f64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            api_base: default_api_base(),
            db_path: default_db_path(),
            worker_pool_size: default_worker_pool_size(),
            subscriber_buffer: default_subscriber_buffer(),
            adapter: AdapterConfig::default(),
        }
    }
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            kind: default_adapter_kind(),
            base_url: default_adapter_base_url(),
            api_key: None,
            model: default_adapter_model(),
            temperature: default_temperature(),
        }
    }
}

impl Config {
    /// Load configuration: defaults, then the TOML file (if given), then
    /// environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) => {
                let raw = std::fs::read_to_string(p)
                    .with_context(|| format!("Failed to read config file: {}", p.display()))?;
                toml::from_str(&raw)
                    .with_context(|| format!("Failed to parse config file: {}", p.display()))?
            }
            None => Self::default(),
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("CONDUCTOR_BIND_ADDR") {
            self.bind_addr = v;
        }
        if let Ok(v) = std::env::var("CONDUCTOR_DB_PATH") {
            self.db_path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("CONDUCTOR_WORKER_POOL_SIZE") {
            if let Ok(n) = v.parse() {
                self.worker_pool_size = n;
            }
        }
        if let Ok(v) = std::env::var("CONDUCTOR_SUBSCRIBER_BUFFER") {
            if let Ok(n) = v.parse() {
                self.subscriber_buffer = n;
            }
        }
        if let Ok(v) = std::env::var("CONDUCTOR_ADAPTER") {
            self.adapter.kind = v;
        }
        if let Ok(v) = std::env::var("CONDUCTOR_API_KEY") {
            self.adapter.api_key = Some(v);
        }
        if let Ok(v) = std::env::var("CONDUCTOR_MODEL") {
            self.adapter.model = v;
        }
    }

    fn validate(&self) -> Result<()> {
        if self.worker_pool_size == 0 {
            anyhow::bail!("worker_pool_size must be at least 1");
        }
        if self.subscriber_buffer == 0 {
            anyhow::bail!("subscriber_buffer must be at least 1");
        }
        if !self.api_base.starts_with('/') {
            anyhow::bail!("api_base must start with '/': {}", self.api_base);
        }
        Ok(())
    }
}
