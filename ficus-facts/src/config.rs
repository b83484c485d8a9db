//! Configuration module for the datasource registry, change listener and rule cache.
//!
//! All structures are plain in-memory values supplied by the host application.
//! They also deserialize from JSON, with durations expressed in milliseconds.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::datasource::{DatasourceConfig, DatasourceKind};
use crate::error::{FactError, FactResult};

/// Default backend connect timeout in milliseconds
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5_000;

/// Default grace period before a replaced handle is closed, in milliseconds
pub const DEFAULT_CLOSE_GRACE_MS: u64 = 2_000;

/// Default per-event processing budget in milliseconds
pub const DEFAULT_EVENT_BUDGET_MS: u64 = 10_000;

/// Default transport poll timeout in milliseconds
pub const DEFAULT_POLL_TIMEOUT_MS: u64 = 1_000;

/// Default change-event topic
pub const DEFAULT_TOPIC: &str = "ficus.datasource.changed";

/// Default maximum rule script length in bytes
pub const DEFAULT_MAX_SOURCE_LEN: usize = 64 * 1024;

/// Datasource registry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Kind used when a datasource does not name one
    pub default_kind: DatasourceKind,

    /// Upper bound on a single backend connect
    #[serde(with = "millis")]
    pub connect_timeout: Duration,

    /// Delay between retiring a handle and closing its connection
    #[serde(with = "millis")]
    pub close_grace_period: Duration,

    /// Datasources registered at construction, connected lazily
    pub initial: Vec<DatasourceConfig>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            default_kind: DatasourceKind::Kafka,
            connect_timeout: Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS),
            close_grace_period: Duration::from_millis(DEFAULT_CLOSE_GRACE_MS),
            initial: Vec::new(),
        }
    }
}

impl RegistryConfig {
    /// Create a new default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the fallback backend kind
    pub fn default_kind(mut self, kind: DatasourceKind) -> Self {
        self.default_kind = kind;
        self
    }

    /// Set the connect timeout
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the close grace period
    pub fn close_grace_period(mut self, grace: Duration) -> Self {
        self.close_grace_period = grace;
        self
    }

    /// Add an initial datasource
    pub fn initial_datasource(mut self, config: DatasourceConfig) -> Self {
        self.initial.push(config);
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> FactResult<()> {
        if self.default_kind == DatasourceKind::Default {
            return Err(FactError::InvalidConfig(
                "default_kind must name a concrete backend kind".to_string(),
            ));
        }
        if self.connect_timeout.is_zero() {
            return Err(FactError::InvalidConfig("connect_timeout must be positive".to_string()));
        }
        for datasource in &self.initial {
            datasource.validate()?;
        }
        Ok(())
    }
}

/// Exponential backoff configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// First delay
    #[serde(with = "millis")]
    pub initial: Duration,

    /// Delay cap
    #[serde(with = "millis")]
    pub max: Duration,

    /// Growth factor between attempts
    pub multiplier: f64,

    /// Random extra fraction of each delay, in `[0, 1]`
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: 0.1,
        }
    }
}

impl BackoffConfig {
    /// Create a new default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the first delay
    pub fn initial(mut self, initial: Duration) -> Self {
        self.initial = initial;
        self
    }

    /// Set the delay cap
    pub fn max(mut self, max: Duration) -> Self {
        self.max = max;
        self
    }

    /// Set the growth factor
    pub fn multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Set the jitter fraction
    pub fn jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> FactResult<()> {
        if self.initial > self.max {
            return Err(FactError::InvalidConfig("backoff initial delay exceeds max".to_string()));
        }
        if !(self.multiplier >= 1.0) {
            return Err(FactError::InvalidConfig("backoff multiplier must be >= 1".to_string()));
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(FactError::InvalidConfig(
                "backoff jitter must be within [0, 1]".to_string(),
            ));
        }
        Ok(())
    }
}

/// Change listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Topic carrying datasource change events
    pub topic: String,

    /// Upper bound on applying one event, including connect retries
    #[serde(with = "millis")]
    pub event_budget: Duration,

    /// How long a single transport poll may wait for a message
    #[serde(with = "millis")]
    pub poll_timeout: Duration,

    /// Reconnect and connect-retry backoff
    pub backoff: BackoffConfig,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            topic: DEFAULT_TOPIC.to_string(),
            event_budget: Duration::from_millis(DEFAULT_EVENT_BUDGET_MS),
            poll_timeout: Duration::from_millis(DEFAULT_POLL_TIMEOUT_MS),
            backoff: BackoffConfig::default(),
        }
    }
}

impl ListenerConfig {
    /// Create a new default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the topic
    pub fn topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = topic.into();
        self
    }

    /// Set the per-event budget
    pub fn event_budget(mut self, budget: Duration) -> Self {
        self.event_budget = budget;
        self
    }

    /// Set the poll timeout
    pub fn poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    /// Set the backoff configuration
    pub fn backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> FactResult<()> {
        if self.topic.trim().is_empty() {
            return Err(FactError::InvalidConfig("listener topic cannot be empty".to_string()));
        }
        if self.event_budget.is_zero() {
            return Err(FactError::InvalidConfig("event_budget must be positive".to_string()));
        }
        self.backoff.validate()
    }
}

/// Which declaration wins when several implement the requested capability
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TieBreak {
    /// The candidate declared last in the source wins
    LastDeclared,
    /// Several candidates is a compile error
    RequireUnique,
}

impl Default for TieBreak {
    fn default() -> Self {
        TieBreak::LastDeclared
    }
}

/// Rule script cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuleCacheConfig {
    /// Candidate selection policy
    pub tie_break: TieBreak,

    /// Longest accepted source text, in bytes
    pub max_source_len: usize,

    /// Deepest accepted expression or statement nesting
    pub max_expr_depth: usize,

    /// Evaluation steps one rule invocation may take
    pub max_eval_steps: usize,
}

impl Default for RuleCacheConfig {
    fn default() -> Self {
        Self {
            tie_break: TieBreak::default(),
            max_source_len: DEFAULT_MAX_SOURCE_LEN,
            max_expr_depth: 64,
            max_eval_steps: 10_000,
        }
    }
}

impl RuleCacheConfig {
    /// Create a new default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the tie-break policy
    pub fn tie_break(mut self, tie_break: TieBreak) -> Self {
        self.tie_break = tie_break;
        self
    }

    /// Set the maximum source length
    pub fn max_source_len(mut self, len: usize) -> Self {
        self.max_source_len = len;
        self
    }

    /// Set the maximum nesting depth
    pub fn max_expr_depth(mut self, depth: usize) -> Self {
        self.max_expr_depth = depth;
        self
    }

    /// Set the evaluation step budget
    pub fn max_eval_steps(mut self, steps: usize) -> Self {
        self.max_eval_steps = steps;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> FactResult<()> {
        if self.max_source_len == 0 || self.max_expr_depth == 0 || self.max_eval_steps == 0 {
            return Err(FactError::InvalidConfig("rule cache limits must be positive".to_string()));
        }
        Ok(())
    }
}

/// Bundle of every configuration section
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FactsConfig {
    /// Registry section
    pub registry: RegistryConfig,
    /// Listener section
    pub listener: ListenerConfig,
    /// Rule cache section
    pub rules: RuleCacheConfig,
}

impl FactsConfig {
    /// Parse and validate a JSON document
    pub fn from_json_str(json: &str) -> FactResult<Self> {
        let config: FactsConfig = serde_json::from_str(json).map_err(|e| {
            FactError::InvalidConfig(format!("Invalid configuration document: {}", e))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate every section
    pub fn validate(&self) -> FactResult<()> {
        self.registry.validate()?;
        self.listener.validate()?;
        self.rules.validate()
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
