//! Configuration for the pool client

use crate::consensus::bft_quorum;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How many agreeing replies make a quorum
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum QuorumPolicy {
    /// `floor((n-1)/3) + 1`
    #[default]
    Bft,
    /// Strict majority, `floor(n/2) + 1`
    Majority,
    /// Fixed count, clamped to the active node count
    Fixed(usize),
}

impl QuorumPolicy {
    /// Quorum for `node_count` active validators
    pub fn quorum_for(&self, node_count: usize) -> usize {
        match self {
            QuorumPolicy::Bft => bft_quorum(node_count),
            QuorumPolicy::Majority => node_count / 2 + 1,
            QuorumPolicy::Fixed(count) => (*count).clamp(1, node_count.max(1)),
        }
    }
}

/// Pool client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Dial timeout per connection attempt (milliseconds)
    pub connect_timeout_ms: u64,

    /// Overall request deadline (milliseconds)
    pub request_timeout_ms: u64,

    /// Per-exchange reply timeout (milliseconds)
    pub reply_timeout_ms: u64,

    /// Extra nodes tried after the initial fan-out fails
    pub retry_budget: usize,

    /// Quorum formula
    pub quorum_policy: QuorumPolicy,

    /// Initial fan-out for reads (0 = quorum size)
    pub read_fanout: usize,

    /// Reject state proofs older than this (seconds, 0 = disabled)
    pub freshness_threshold_secs: u64,

    /// Reconnection backoff
    pub backoff: BackoffConfig,

    /// Node health scoring
    pub health: HealthConfig,

    /// Pool ledger catchup
    pub catchup: CatchupConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 5_000,
            request_timeout_ms: 20_000,
            reply_timeout_ms: 10_000,
            retry_budget: 3,
            quorum_policy: QuorumPolicy::Bft,
            read_fanout: 2,
            freshness_threshold_secs: 300,
            backoff: BackoffConfig::default(),
            health: HealthConfig::default(),
            catchup: CatchupConfig::default(),
        }
    }
}

/// Reconnection backoff configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// First delay after a failed attempt (milliseconds)
    pub initial_delay_ms: u64,

    /// Upper bound on the delay (milliseconds)
    pub max_delay_ms: u64,

    /// Growth factor per consecutive failure
    pub multiplier: f64,

    /// Relative jitter applied to each delay (0.0 - 1.0)
    pub jitter_factor: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 100,
            max_delay_ms: 10_000,
            multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

/// Health scoring configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// EWMA smoothing factor for new observations
    pub alpha: f64,

    /// Nodes scoring below this are tried last
    pub floor: f64,

    /// Latency that halves a success's contribution (milliseconds)
    pub reference_latency_ms: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            alpha: 0.3,
            floor: 0.3,
            reference_latency_ms: 250,
        }
    }
}

/// Catchup configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CatchupConfig {
    /// Maximum transactions requested per batch
    pub batch_size: u64,

    /// Nodes tried per batch before giving up
    pub max_attempts: usize,

    /// Catchup mailbox capacity
    pub mailbox_size: usize,
}

impl Default for CatchupConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            max_attempts: 3,
            mailbox_size: 16,
        }
    }
}

impl PoolConfig {
    /// Load from a TOML file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: PoolConfig = toml::from_str(&content)
            .map_err(|e| Error::Configuration(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `POOL_*` environment variables on top of the defaults
    pub fn from_env() -> Result<Self> {
        let mut config = PoolConfig::default();

        if let Some(v) = env_parse("POOL_CONNECT_TIMEOUT_MS")? {
            config.connect_timeout_ms = v;
        }
        if let Some(v) = env_parse("POOL_REQUEST_TIMEOUT_MS")? {
            config.request_timeout_ms = v;
        }
        if let Some(v) = env_parse("POOL_REPLY_TIMEOUT_MS")? {
            config.reply_timeout_ms = v;
        }
        if let Some(v) = env_parse("POOL_RETRY_BUDGET")? {
            config.retry_budget = v;
        }
        if let Some(v) = env_parse("POOL_READ_FANOUT")? {
            config.read_fanout = v;
        }
        if let Some(v) = env_parse("POOL_FRESHNESS_THRESHOLD_SECS")? {
            config.freshness_threshold_secs = v;
        }
        if let Some(v) = env_parse("POOL_CATCHUP_BATCH_SIZE")? {
            config.catchup.batch_size = v;
        }
        if let Ok(policy) = std::env::var("POOL_QUORUM_POLICY") {
            config.quorum_policy = parse_quorum_policy(&policy)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the client cannot operate with
    pub fn validate(&self) -> Result<()> {
        if self.connect_timeout_ms == 0 {
            return Err(Error::Configuration("connect_timeout_ms must be > 0".into()));
        }
        if self.request_timeout_ms == 0 {
            return Err(Error::Configuration("request_timeout_ms must be > 0".into()));
        }
        if self.reply_timeout_ms == 0 {
            return Err(Error::Configuration("reply_timeout_ms must be > 0".into()));
        }
        if matches!(self.quorum_policy, QuorumPolicy::Fixed(0)) {
            return Err(Error::Configuration("fixed quorum must be at least 1".into()));
        }
        if self.backoff.multiplier < 1.0 {
            return Err(Error::Configuration("backoff.multiplier must be >= 1.0".into()));
        }
        if !(0.0..=1.0).contains(&self.backoff.jitter_factor) {
            return Err(Error::Configuration(
                "backoff.jitter_factor must be within [0, 1]".into(),
            ));
        }
        if self.backoff.initial_delay_ms > self.backoff.max_delay_ms {
            return Err(Error::Configuration(
                "backoff.initial_delay_ms exceeds backoff.max_delay_ms".into(),
            ));
        }
        if !(self.health.alpha > 0.0 && self.health.alpha <= 1.0) {
            return Err(Error::Configuration("health.alpha must be within (0, 1]".into()));
        }
        if !(0.0..=1.0).contains(&self.health.floor) {
            return Err(Error::Configuration("health.floor must be within [0, 1]".into()));
        }
        if self.catchup.batch_size == 0 || self.catchup.max_attempts == 0 {
            return Err(Error::Configuration(
                "catchup.batch_size and catchup.max_attempts must be > 0".into(),
            ));
        }
        if self.catchup.mailbox_size == 0 {
            return Err(Error::Configuration("catchup.mailbox_size must be > 0".into()));
        }
        Ok(())
    }

    /// Dial timeout
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Overall request deadline
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Per-exchange reply timeout
    pub fn reply_timeout(&self) -> Duration {
        Duration::from_millis(self.reply_timeout_ms)
    }

    /// Freshness threshold, if enabled
    pub fn freshness_threshold(&self) -> Option<Duration> {
        (self.freshness_threshold_secs > 0)
            .then(|| Duration::from_secs(self.freshness_threshold_secs))
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Result<Option<T>> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| Error::Configuration(format!("Invalid value for {}: {}", name, raw))),
        Err(_) => Ok(None),
    }
}

fn parse_quorum_policy(raw: &str) -> Result<QuorumPolicy> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "bft" => Ok(QuorumPolicy::Bft),
        "majority" => Ok(QuorumPolicy::Majority),
        other => other
            .parse()
            .map(QuorumPolicy::Fixed)
            .map_err(|_| Error::Configuration(format!("Invalid quorum policy: {}", raw))),
    }
}
