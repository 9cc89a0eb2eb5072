// src/config.rs
//! Pipeline configuration, loaded from TOML.
//!
//! Resolution order: $CHANNELWATCH_CONFIG, then `config/channelwatch.toml`,
//! then built-in defaults. Loaded values are sanitized into valid ranges
//! rather than rejected.

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::types::Channel;

pub const ENV_CONFIG_PATH: &str = "CHANNELWATCH_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "config/channelwatch.toml";

fn default_poll_interval_secs() -> u64 {
    60
}
fn default_poll_timeout_secs() -> u64 {
    30
}
fn default_worker_pool() -> usize {
    4
}
fn default_digest_interval_secs() -> u64 {
    3600
}
fn default_digest_window_secs() -> u64 {
    3600
}
fn default_similarity_threshold() -> f64 {
    0.5
}
fn default_semantic_confidence_threshold() -> f32 {
    0.6
}
fn default_target_language() -> String {
    "en".to_string()
}
fn default_max_posts_per_digest() -> usize {
    100
}
fn default_gateway_timeout_secs() -> u64 {
    20
}
fn default_gateway_max_attempts() -> u32 {
    3
}
fn default_gateway_backoff_ms() -> u64 {
    250
}

#[derive(Debug, Clone, Deserialize)]
pub struct GatewaySection {
    #[serde(default = "default_gateway_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_gateway_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_gateway_backoff_ms")]
    pub backoff_base_ms: u64,
}

impl Default for GatewaySection {
    fn default() -> Self {
        Self {
            timeout_secs: default_gateway_timeout_secs(),
            max_attempts: default_gateway_max_attempts(),
            backoff_base_ms: default_gateway_backoff_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChannelSection {
    pub id: i64,
    pub address: String,
    #[serde(default = "default_true")]
    pub active: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_poll_timeout_secs")]
    pub poll_timeout_secs: u64,
    #[serde(default = "default_worker_pool")]
    pub worker_pool: usize,
    #[serde(default = "default_digest_interval_secs")]
    pub digest_interval_secs: u64,
    #[serde(default = "default_digest_window_secs")]
    pub digest_window_secs: u64,
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f64,
    #[serde(default = "default_semantic_confidence_threshold")]
    pub semantic_confidence_threshold: f32,
    #[serde(default = "default_target_language")]
    pub target_language: String,
    #[serde(default = "default_max_posts_per_digest")]
    pub max_posts_per_digest: usize,
    #[serde(default)]
    pub gateway: GatewaySection,
    #[serde(default)]
    pub channels: Vec<ChannelSection>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        toml::from_str("").expect("defaults deserialize")
    }
}

impl PipelineConfig {
    /// Load using env override, then the default path, then defaults.
    pub fn load_default() -> Result<Self> {
        if let Ok(p) = std::env::var(ENV_CONFIG_PATH) {
            let pb = PathBuf::from(p);
            if !pb.exists() {
                return Err(anyhow!("{ENV_CONFIG_PATH} points to non-existent path"));
            }
            return Self::load_from(&pb);
        }
        let default = PathBuf::from(DEFAULT_CONFIG_PATH);
        if default.exists() {
            return Self::load_from(&default);
        }
        Ok(Self::default())
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        let mut cfg: PipelineConfig =
            toml::from_str(&content).with_context(|| format!("parsing {}", path.display()))?;
        cfg.sanitize();
        Ok(cfg)
    }

    /// Clamp tunables into valid ranges instead of failing the boot.
    fn sanitize(&mut self) {
        if !(0.0..=1.0).contains(&self.similarity_threshold) {
            self.similarity_threshold = default_similarity_threshold();
        }
        if !(0.0..=1.0).contains(&self.semantic_confidence_threshold) {
            self.semantic_confidence_threshold = default_semantic_confidence_threshold();
        }
        if self.worker_pool == 0 {
            self.worker_pool = default_worker_pool();
        }
        if self.max_posts_per_digest == 0 {
            self.max_posts_per_digest = default_max_posts_per_digest();
        }
        if self.gateway.max_attempts == 0 {
            self.gateway.max_attempts = default_gateway_max_attempts();
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_secs(self.poll_timeout_secs.max(1))
    }

    pub fn digest_interval(&self) -> Duration {
        Duration::from_secs(self.digest_interval_secs.max(1))
    }

    pub fn digest_window(&self) -> Duration {
        Duration::from_secs(self.digest_window_secs.max(1))
    }

    pub fn channels(&self) -> Vec<Channel> {
        self.channels
            .iter()
            .map(|c| Channel {
                id: c.id,
                address: c.address.clone(),
                active: c.active,
            })
            .collect()
    }

    pub fn gateway_config(&self) -> crate::gateway::GatewayConfig {
        crate::gateway::GatewayConfig {
            call_timeout: Duration::from_secs(self.gateway.timeout_secs.max(1)),
            max_attempts: self.gateway.max_attempts,
            backoff_base: Duration::from_millis(self.gateway.backoff_base_ms),
        }
    }

    pub fn generator_config(&self) -> crate::digest::GeneratorConfig {
        crate::digest::GeneratorConfig {
            similarity_threshold: self.similarity_threshold,
            target_lang: self.target_language.clone(),
            max_posts: self.max_posts_per_digest,
        }
    }

    pub fn poller_config(&self) -> crate::ingest::PollerConfig {
        crate::ingest::PollerConfig {
            poll_timeout: self.poll_timeout(),
            worker_pool: self.worker_pool,
        }
    }

    pub fn scheduler_config(&self) -> crate::scheduler::SchedulerCfg {
        crate::scheduler::SchedulerCfg {
            poll_interval: self.poll_interval(),
            digest_interval: self.digest_interval(),
            digest_window: self.digest_window(),
        }
    }
}
