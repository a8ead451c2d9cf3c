use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::env;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::budget::BudgetConfig;
use crate::consensus::{policy::is_direction_permutation, ConsensusConfig};
use crate::registry::{BreakerConfig, Tier};
use crate::strategy::RuleSet;

pub const ENV_PREFIX: &str = "CONSENSUS";
pub const CONFIG_PATH_VAR: &str = "CONSENSUS_CONFIG";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub service: ServiceConfig,
    pub consensus: ConsensusConfig,
    pub budget: BudgetConfig,
    pub cache: CacheConfig,
    pub breaker: BreakerConfig,
    pub persistence: PersistenceConfig,
    pub producers: Vec<ProducerSettings>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServiceConfig {
    pub http_port: u16,
    pub log_level: String,
    /// How often the binary re-reads the config file for hot reload.
    pub config_poll_secs: u64,
    pub state_flush_secs: u64,
    pub cache_purge_secs: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            http_port: 3000,
            log_level: "info".to_string(),
            config_poll_secs: 30,
            state_flush_secs: 60,
            cache_purge_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CacheConfig {
    pub ttl_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { ttl_ms: 30_000 }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PersistenceConfig {
    /// Without a URL, state is kept in memory only.
    pub redis_url: Option<String>,
    pub state_key: String,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            state_key: "consensus:engine_state".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProducerSettings {
    pub id: String,
    pub weight: f64,
    #[serde(default)]
    pub cost_per_call: f64,
    #[serde(default)]
    pub tier: Tier,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub source: ProducerSource,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProducerSource {
    /// Remote advisory model.
    Http {
        endpoint: String,
        #[serde(default)]
        timeout_ms: Option<u64>,
    },
    /// Built-in declarative rule detector.
    Rules { rules: RuleSet },
}

impl Config {
    /// Layers an optional file (format picked by extension) under
    /// `CONSENSUS__SECTION__KEY` environment overrides, after loading `.env`.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        dotenv::dotenv().ok();

        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        let settings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reads the file named by `CONSENSUS_CONFIG`, if set.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenv::dotenv().ok();
        match env::var(CONFIG_PATH_VAR) {
            Ok(path) => Self::load(Some(Path::new(&path))),
            Err(_) => Self::load(None),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let c = &self.consensus;
        if c.min_votes == 0 {
            return invalid("consensus.min_votes must be at least 1");
        }
        if c.per_call_timeout_ms == 0 {
            return invalid("consensus.per_call_timeout_ms must be positive");
        }
        if c.max_outstanding_calls == 0 {
            return invalid("consensus.max_outstanding_calls must be positive");
        }
        if !is_direction_permutation(&c.tie_break_order) {
            return invalid("consensus.tie_break_order must list HOLD, BUY and SELL exactly once");
        }
        for (name, threshold) in c.action_tiers.iter() {
            if !in_unit_range(threshold.min_agreement) || !in_unit_range(threshold.min_confidence) {
                return Err(ConfigError::Invalid(format!(
                    "consensus.action_tiers.{} thresholds must be within [0, 1]",
                    name
                )));
            }
        }

        let b = &self.budget;
        if !b.ceiling.is_finite() || b.ceiling <= 0.0 {
            return invalid("budget.ceiling must be positive");
        }
        if !(b.warning_ratio > 0.0 && b.warning_ratio <= 1.0) {
            return invalid("budget.warning_ratio must be within (0, 1]");
        }
        if b.window_secs == 0 {
            return invalid("budget.window_secs must be positive");
        }
        if !b.floor.is_finite() || b.floor < 0.0 {
            return invalid("budget.floor must be non-negative");
        }

        if self.breaker.failure_threshold == 0 {
            return invalid("breaker.failure_threshold must be at least 1");
        }

        let mut seen = BTreeSet::new();
        for p in &self.producers {
            if !seen.insert(p.id.as_str()) {
                return Err(ConfigError::Invalid(format!("duplicate producer id '{}'", p.id)));
            }
            if !p.weight.is_finite() || p.weight <= 0.0 {
                return Err(ConfigError::Invalid(format!(
                    "producer '{}' weight must be positive, got {}",
                    p.id, p.weight
                )));
            }
            if !p.cost_per_call.is_finite() || p.cost_per_call < 0.0 {
                return Err(ConfigError::Invalid(format!(
                    "producer '{}' cost_per_call must be non-negative, got {}",
                    p.id, p.cost_per_call
                )));
            }
        }

        Ok(())
    }
}

fn invalid(message: &str) -> Result<(), ConfigError> {
    Err(ConfigError::Invalid(message.to_string()))
}

fn in_unit_range(value: f64) -> bool {
    (0.0..=1.0).contains(&value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::Direction;
    use std::io::Write;
    use tokio_test::{assert_err, assert_ok};

    const SAMPLE: &str = r#"
[service]
http_port = 8080

[consensus]
min_votes = 2
per_call_timeout_ms = 750

[budget]
ceiling = 25.0

[cache]
ttl_ms = 5000

[[producers]]
id = "advisor"
weight = 2.0
cost_per_call = 0.05
tier = "critical"

[producers.source]
kind = "http"
endpoint = "http://localhost:8500/advise"

[[producers]]
id = "ema_cross"
weight = 1.0
tier = "quick"

[producers.source]
kind = "rules"

[producers.source.rules]
indicators = [
  { id = "ema_fast", kind = "ema", period = 3 },
  { id = "ema_slow", kind = "ema", period = 5 },
]
entry = { and = [{ left = "ema_fast", operator = "cross_over", right = "ema_slow" }] }
"#;

    fn write_sample() -> std::path::PathBuf {
        let path = env::temp_dir().join(format!("consensus-config-{}.toml", uuid::Uuid::new_v4()));
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();
        path
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert_ok!(config.validate());
        assert_eq!(config.consensus.min_votes, 3);
        assert_eq!(config.cache.ttl(), Duration::from_secs(30));
        assert!(config.persistence.redis_url.is_none());
    }

    #[test]
    fn test_load_from_toml_file() {
        let path = write_sample();
        let config = Config::load(Some(&path)).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(config.service.http_port, 8080);
        assert_eq!(config.consensus.min_votes, 2);
        assert_eq!(config.consensus.tie_break_order[0], Direction::Hold);
        assert_eq!(config.budget.ceiling, 25.0);
        assert_eq!(config.budget.floor, 2.0);
        assert_eq!(config.producers.len(), 2);
        assert!(matches!(config.producers[0].source, ProducerSource::Http { .. }));
        assert_eq!(config.producers[1].tier, Tier::Quick);
        assert!(config.producers[1].enabled);
        match &config.producers[1].source {
            ProducerSource::Rules { rules } => assert_eq!(rules.indicators.len(), 2),
            other => panic!("unexpected source {:?}", other),
        }
    }

    #[test]
    fn test_rejects_duplicate_producers() {
        let mut config = Config::default();
        let producer = ProducerSettings {
            id: "dup".into(),
            weight: 1.0,
            cost_per_call: 0.0,
            tier: Tier::Quick,
            enabled: true,
            source: ProducerSource::Http {
                endpoint: "http://localhost".into(),
                timeout_ms: None,
            },
        };
        config.producers = vec![producer.clone(), producer];
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_rejects_bad_policy() {
        let mut config = Config::default();
        config.consensus.tie_break_order = vec![Direction::Buy, Direction::Sell];
        assert_err!(config.validate());

        let mut config = Config::default();
        config.consensus.action_tiers.execute_full.min_confidence = 1.5;
        assert_err!(config.validate());

        let mut config = Config::default();
        config.budget.warning_ratio = 0.0;
        assert_err!(config.validate());

        let mut config = Config::default();
        config.consensus.min_votes = 0;
        assert_err!(config.validate());
    }

    #[test]
    fn test_rejects_non_positive_weight() {
        let mut config = Config::default();
        config.producers.push(ProducerSettings {
            id: "zero".into(),
            weight: 0.0,
            cost_per_call: 0.0,
            tier: Tier::Quick,
            enabled: true,
            source: ProducerSource::Http {
                endpoint: "http://localhost".into(),
                timeout_ms: None,
            },
        });
        assert_err!(config.validate());
    }
}
