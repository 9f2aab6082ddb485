//! Configuration for the orchestrator.
//!
//! Provides defaults matching the operational SLAs, a builder, and loading
//! from environment variables (`SWITCHBOARD_*`) or a TOML file.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::breaker::BreakerConfig;
use crate::enrich::ContextCaps;

/// Orchestrator-wide configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Hard bound on `handoff_chain` length.
    pub max_handoffs: usize,

    /// Routing gate: classification confidence must exceed this.
    pub route_confidence: f64,

    /// Routing gate: classification complexity must exceed this.
    pub route_complexity: u8,

    /// A domain switch additionally requires the new confidence to exceed
    /// the stored one by more than this margin.
    pub switch_margin: f64,

    /// Deadline for a single agent invocation (1 s hard SLA).
    pub agent_timeout: Duration,

    /// Deadline for the classifier call (200 ms soft SLA); expiry is
    /// treated as "absent classification", never an error.
    pub classifier_timeout: Duration,

    /// Backoff before the single save retry.
    pub save_retry_backoff: Duration,

    pub breaker: BreakerConfig,
    pub context_caps: ContextCaps,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_handoffs: 5,
            route_confidence: 0.70,
            route_complexity: 3,
            switch_margin: 0.20,
            agent_timeout: Duration::from_secs(1),
            classifier_timeout: Duration::from_millis(200),
            save_retry_backoff: Duration::from_millis(50),
            breaker: BreakerConfig::default(),
            context_caps: ContextCaps::default(),
        }
    }
}

/// Configuration builder.
pub struct ConfigBuilder {
    config: OrchestratorConfig,
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: OrchestratorConfig::default(),
        }
    }

    pub fn max_handoffs(mut self, max: usize) -> Self {
        self.config.max_handoffs = max;
        self
    }

    pub fn route_gate(mut self, confidence: f64, complexity: u8) -> Self {
        self.config.route_confidence = confidence;
        self.config.route_complexity = complexity;
        self
    }

    pub fn switch_margin(mut self, margin: f64) -> Self {
        self.config.switch_margin = margin;
        self
    }

    pub fn agent_timeout(mut self, timeout: Duration) -> Self {
        self.config.agent_timeout = timeout;
        self
    }

    pub fn classifier_timeout(mut self, timeout: Duration) -> Self {
        self.config.classifier_timeout = timeout;
        self
    }

    pub fn breaker(mut self, breaker: BreakerConfig) -> Self {
        self.config.breaker = breaker;
        self
    }

    pub fn context_caps(mut self, caps: ContextCaps) -> Self {
        self.config.context_caps = caps;
        self
    }

    pub fn build(self) -> OrchestratorConfig {
        self.config
    }
}

/// Load configuration overrides from environment variables.
pub fn from_env() -> OrchestratorConfig {
    let mut config = OrchestratorConfig::default();

    if let Ok(max) = std::env::var("SWITCHBOARD_MAX_HANDOFFS") {
        if let Ok(n) = max.parse::<usize>() {
            config.max_handoffs = n;
        }
    }

    if let Ok(conf) = std::env::var("SWITCHBOARD_ROUTE_CONFIDENCE") {
        if let Ok(f) = conf.parse::<f64>() {
            config.route_confidence = f;
        }
    }

    if let Ok(ms) = std::env::var("SWITCHBOARD_AGENT_TIMEOUT_MS") {
        if let Ok(n) = ms.parse::<u64>() {
            config.agent_timeout = Duration::from_millis(n);
        }
    }

    if let Ok(n) = std::env::var("SWITCHBOARD_BREAKER_THRESHOLD") {
        if let Ok(t) = n.parse::<u32>() {
            config.breaker.failure_threshold = t;
        }
    }

    if let Ok(secs) = std::env::var("SWITCHBOARD_BREAKER_COOLDOWN_SECS") {
        if let Ok(n) = secs.parse::<u64>() {
            config.breaker.cooldown = Duration::from_secs(n);
        }
    }

    config
}

/// Load configuration from a TOML file. Missing fields fall back to
/// defaults.
pub fn from_file(
    path: impl AsRef<std::path::Path>,
) -> Result<OrchestratorConfig, Box<dyn std::error::Error>> {
    let contents = std::fs::read_to_string(path)?;
    let config: OrchestratorConfig = toml::from_str(&contents)?;
    Ok(config)
}
