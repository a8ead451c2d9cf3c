//! Evaluation facade: tier resolution, cache key, single-flight cache and
//! engine wired together, plus hot reload and state persistence.

use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::api::{AdvisoryClient, CallLimiter, EvaluationRequest, EvaluationResponse};
use crate::budget::CostGovernor;
use crate::cache::{cache_key, CacheError, CacheStats, ResponseCache};
use crate::consensus::{ConsensusEngine, ConsensusResult};
use crate::core::{Config, ConfigError, HealthChecker, HealthStatus, ProducerSettings, ProducerSource};
use crate::monitoring::{
    ConsensusMetrics, EngineState, MemoryStateStore, RedisStateStore, StateStore, StoreError,
};
use crate::registry::{AnalyzerRegistry, AnalyzerSpec, RegistryError, Tier};
use crate::strategy::{MarketContext, RuleProducer, SignalProducer};

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("failed to build producer '{0}': {1}")]
    Producer(String, String),
    #[error("metrics registry error: {0}")]
    Metrics(#[from] prometheus::Error),
}

pub struct ConsensusService {
    engine: Arc<ConsensusEngine>,
    cache: ResponseCache<ConsensusResult>,
    store: Arc<dyn StateStore>,
    health: HealthChecker,
    config: RwLock<Config>,
}

impl ConsensusService {
    /// Builds the components with no producers registered.
    pub fn new(config: Config, store: Arc<dyn StateStore>) -> Result<Self, ServiceError> {
        config.validate()?;

        let registry = Arc::new(AnalyzerRegistry::new(config.breaker.clone(), config.budget.floor));
        let governor = Arc::new(CostGovernor::new(config.budget.clone()));
        let limiter = Arc::new(CallLimiter::new(config.consensus.max_outstanding_calls));
        let metrics = ConsensusMetrics::new()?;
        let engine = Arc::new(ConsensusEngine::new(
            registry,
            governor,
            limiter,
            config.consensus.clone(),
            metrics,
        ));

        Ok(Self {
            engine,
            cache: ResponseCache::new(config.cache.ttl()),
            store,
            health: HealthChecker::new(),
            config: RwLock::new(Config {
                producers: Vec::new(),
                ..config
            }),
        })
    }

    /// Full bootstrap: picks the state store, registers the configured
    /// producers and restores persisted state.
    pub async fn from_config(config: Config) -> Result<Self, ServiceError> {
        let store: Arc<dyn StateStore> = match &config.persistence.redis_url {
            Some(url) => {
                let store = RedisStateStore::new(url, config.persistence.state_key.clone())?;
                tracing::info!("💾 Engine state persisted under redis key {}", store.key());
                Arc::new(store)
            }
            None => {
                tracing::warn!("⚠️  No redis_url configured, engine state will not survive restarts");
                Arc::new(MemoryStateStore::new())
            }
        };

        let service = Self::new(config.clone(), store)?;
        service.apply_config(config).await?;

        if let Err(e) = service.restore().await {
            tracing::warn!("⚠️  Could not restore engine state: {}", e);
            service.health.update_component("state_store", false).await;
        }
        Ok(service)
    }

    pub fn engine(&self) -> &Arc<ConsensusEngine> {
        &self.engine
    }

    pub fn registry(&self) -> &Arc<AnalyzerRegistry> {
        self.engine.registry()
    }

    pub fn governor(&self) -> &Arc<CostGovernor> {
        self.engine.governor()
    }

    pub fn metrics(&self) -> &ConsensusMetrics {
        self.engine.metrics()
    }

    pub fn cache(&self) -> &ResponseCache<ConsensusResult> {
        &self.cache
    }

    /// Registers a producer that is not managed by the configuration file.
    pub async fn register(
        &self,
        spec: AnalyzerSpec,
        producer: Arc<dyn SignalProducer>,
    ) -> Result<(), ServiceError> {
        self.registry().register(spec, producer).await?;
        Ok(())
    }

    pub async fn evaluate(&self, request: EvaluationRequest) -> Result<EvaluationResponse, ServiceError> {
        if request.symbol.trim().is_empty() {
            return Err(ServiceError::InvalidRequest("symbol must not be empty".into()));
        }
        if let Some(budget) = request.budget_override {
            if !budget.is_finite() || budget < 0.0 {
                return Err(ServiceError::InvalidRequest(format!(
                    "budgetOverride must be a non-negative number, got {}",
                    budget
                )));
            }
        }

        let context = Arc::new(request.to_context());
        let tier = request.importance_tier.unwrap_or_default();
        let result = self
            .evaluate_context(context, tier, request.budget_override)
            .await?;
        Ok(result.into())
    }

    pub async fn evaluate_context(
        &self,
        context: Arc<MarketContext>,
        requested: Tier,
        budget_override: Option<f64>,
    ) -> Result<ConsensusResult, ServiceError> {
        let plan = self.engine.plan(requested, budget_override).await;
        let key = cache_key(&context, plan.tier);

        let engine = self.engine.clone();
        let (result, status) = self
            .cache
            .get_or_compute(&key, move || async move { engine.evaluate(context, plan).await })
            .await?;

        self.metrics().record_cache_lookup(status.as_str());
        if status.is_cached() {
            Ok(result.as_cache_hit())
        } else {
            Ok(result)
        }
    }

    /// Pushes a new configuration into the live components. Circuit state and
    /// window spend are kept; producers dropped from the file are deregistered.
    pub async fn apply_config(&self, config: Config) -> Result<(), ServiceError> {
        config.validate()?;
        let mut current = self.config.write().await;

        if config.consensus.max_outstanding_calls != current.consensus.max_outstanding_calls {
            tracing::warn!(
                "⚠️  max_outstanding_calls change ({} -> {}) takes effect after restart",
                current.consensus.max_outstanding_calls,
                config.consensus.max_outstanding_calls
            );
        }

        let previous: BTreeMap<String, ProducerSettings> = current
            .producers
            .iter()
            .map(|p| (p.id.clone(), p.clone()))
            .collect();
        let default_timeout = config.consensus.per_call_timeout();

        for settings in &config.producers {
            if !settings.enabled {
                self.registry().deregister(&settings.id).await;
                continue;
            }

            let unchanged_source = previous
                .get(&settings.id)
                .map(|old| old.source == settings.source)
                .unwrap_or(false);
            let known = self.registry().spec(&settings.id).await.is_some();

            if unchanged_source && known {
                self.registry()
                    .update_spec(&settings.id, settings.weight, settings.cost_per_call, settings.tier)
                    .await?;
            } else {
                let producer = build_producer(settings, default_timeout)?;
                self.registry()
                    .register(
                        AnalyzerSpec::new(
                            settings.id.clone(),
                            settings.weight,
                            settings.cost_per_call,
                            settings.tier,
                        ),
                        producer,
                    )
                    .await?;
            }
        }

        for id in previous.keys() {
            if !config.producers.iter().any(|p| &p.id == id) {
                self.registry().deregister(id).await;
            }
        }

        self.engine.set_policy(config.consensus.clone()).await;
        self.governor().set_config(config.budget.clone()).await;
        self.registry().set_breaker_config(config.breaker.clone()).await;
        self.registry().set_budget_floor(config.budget.floor).await;
        self.cache.set_ttl(config.cache.ttl());

        tracing::info!(
            "🔧 Configuration applied: {} producers, quorum {}, ceiling {:.2}",
            self.registry().len().await,
            config.consensus.min_votes,
            config.budget.ceiling
        );
        *current = config;
        Ok(())
    }

    pub async fn config(&self) -> Config {
        self.config.read().await.clone()
    }

    pub async fn snapshot(&self) -> EngineState {
        EngineState {
            governor: self.governor().snapshot().await,
            breakers: self.registry().snapshot().await,
            saved_at: Utc::now(),
        }
    }

    pub async fn persist(&self) -> Result<(), ServiceError> {
        let state = self.snapshot().await;
        let saved = self.store.save(&state).await;
        self.health
            .update_component("state_store", saved.is_ok())
            .await;
        saved?;
        Ok(())
    }

    /// Returns false when the store had nothing saved.
    pub async fn restore(&self) -> Result<bool, ServiceError> {
        match self.store.load().await? {
            Some(state) => {
                self.governor().restore(state.governor).await;
                self.registry().restore(&state.breakers).await;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub async fn health(&self) -> HealthStatus {
        self.health.refresh(self.registry(), self.governor()).await;
        self.health.get_status().await
    }

    pub fn render_metrics(&self) -> Result<String, ServiceError> {
        Ok(self.metrics().render()?)
    }

    pub async fn purge_cache(&self) -> usize {
        self.cache.purge_expired().await
    }

    pub async fn cache_stats(&self) -> CacheStats {
        self.cache.stats().await
    }

    /// Persists state and stops admitting producer calls.
    pub async fn shutdown(&self) -> Result<(), ServiceError> {
        self.engine.shutdown();
        self.persist().await
    }
}

fn build_producer(
    settings: &ProducerSettings,
    default_timeout: Duration,
) -> Result<Arc<dyn SignalProducer>, ServiceError> {
    match &settings.source {
        ProducerSource::Http {
            endpoint,
            timeout_ms,
        } => {
            let timeout = timeout_ms.map(Duration::from_millis).unwrap_or(default_timeout);
            let client = AdvisoryClient::new(settings.id.clone(), endpoint.clone(), timeout)
                .map_err(|e| ServiceError::Producer(settings.id.clone(), e.to_string()))?;
            tracing::info!("🌐 Advisory producer {} -> {}", settings.id, client.endpoint());
            Ok(Arc::new(client))
        }
        ProducerSource::Rules { rules } => {
            Ok(Arc::new(RuleProducer::new(settings.id.clone(), rules.clone())))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::Outcome;
    use crate::monitoring::state_store::MockStateStore;
    use crate::strategy::producer::MockSignalProducer;
    use crate::strategy::{
        Condition, ConditionGroup, Direction, Operand, Operator, RuleSet, Signal,
    };

    fn answering(direction: Direction, confidence: f64) -> Arc<dyn SignalProducer> {
        let mut mock = MockSignalProducer::new();
        mock.expect_produce()
            .returning(move |_| Ok(Signal::new("ignored", direction, confidence)));
        Arc::new(mock)
    }

    fn rule_settings(id: &str, weight: f64, threshold: f64) -> ProducerSettings {
        ProducerSettings {
            id: id.into(),
            weight,
            cost_per_call: 0.01,
            tier: Tier::Quick,
            enabled: true,
            source: ProducerSource::Rules {
                rules: RuleSet {
                    indicators: Vec::new(),
                    entry: Some(ConditionGroup::Leaf(Condition {
                        left: Operand::Feature("rsi".into()),
                        operator: Operator::Less,
                        right: Operand::Value(threshold),
                    })),
                    exit: None,
                    confidence: 0.8,
                },
            },
        }
    }

    fn service() -> ConsensusService {
        ConsensusService::new(Config::default(), Arc::new(MemoryStateStore::new())).unwrap()
    }

    #[tokio::test]
    async fn test_second_request_is_cache_hit() {
        let service = service();
        for id in ["a", "b", "c"] {
            service
                .register(AnalyzerSpec::new(id, 1.0, 0.1, Tier::Standard), answering(Direction::Buy, 0.8))
                .await
                .unwrap();
        }

        let request = EvaluationRequest::new("XBTUSDTM", "5m").with_feature("rsi", 25.0);
        let first = service.evaluate(request.clone()).await.unwrap();
        let second = service.evaluate(request).await.unwrap();

        assert!(!first.cache_hit);
        assert!(second.cache_hit);
        assert_eq!(first.evaluation_id, second.evaluation_id);
        assert_eq!(first.decision, Direction::Buy);
        assert_eq!(service.metrics().cache_lookups("hit"), 1);
    }

    #[tokio::test]
    async fn test_rejects_blank_symbol_and_bad_budget() {
        let service = service();
        let err = service.evaluate(EvaluationRequest::new("  ", "1m")).await.unwrap_err();
        assert!(matches!(err, ServiceError::InvalidRequest(_)));

        let err = service
            .evaluate(EvaluationRequest::new("XBTUSDTM", "1m").with_budget_override(f64::NAN))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_apply_config_registers_updates_and_removes() {
        let service = service();
        let mut config = Config::default();
        config.producers = vec![
            rule_settings("oversold", 1.0, 30.0),
            rule_settings("deep_oversold", 1.0, 20.0),
            rule_settings("mild_oversold", 0.5, 40.0),
        ];
        service.apply_config(config.clone()).await.unwrap();
        assert_eq!(service.registry().len().await, 3);

        let response = service
            .evaluate(EvaluationRequest::new("XBTUSDTM", "1h").with_feature("rsi", 25.0))
            .await
            .unwrap();
        assert_eq!(response.outcome, Outcome::Decided);
        assert_eq!(response.decision, Direction::Buy);
        assert!((response.agreement_ratio - 2.0 / 3.0).abs() < 1e-9);

        service.registry().record_failure("oversold").await;
        config.producers[0].weight = 4.0;
        config.producers.pop();
        config.cache.ttl_ms = 1_000;
        service.apply_config(config).await.unwrap();

        let spec = service.registry().spec("oversold").await.unwrap();
        assert_eq!(spec.weight, 4.0);
        assert_eq!(spec.consecutive_failures, 1);
        assert!(service.registry().spec("mild_oversold").await.is_none());
        assert_eq!(service.cache().ttl(), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_disabled_producer_is_not_registered() {
        let service = service();
        let mut config = Config::default();
        let mut settings = rule_settings("oversold", 1.0, 30.0);
        settings.enabled = false;
        config.producers = vec![settings];

        service.apply_config(config).await.unwrap();
        assert!(service.registry().is_empty().await);
    }

    #[tokio::test]
    async fn test_persist_and_restore_round_trip() {
        let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
        let first = ConsensusService::new(Config::default(), store.clone()).unwrap();
        first
            .register(AnalyzerSpec::new("waves", 1.0, 0.1, Tier::Standard), answering(Direction::Sell, 0.6))
            .await
            .unwrap();
        first.governor().log_cost("waves", 3.5).await;
        for _ in 0..3 {
            first.registry().record_failure("waves").await;
        }
        first.persist().await.unwrap();

        let second = ConsensusService::new(Config::default(), store).unwrap();
        second
            .register(AnalyzerSpec::new("waves", 1.0, 0.1, Tier::Standard), answering(Direction::Sell, 0.6))
            .await
            .unwrap();
        assert!(second.restore().await.unwrap());

        assert_eq!(second.governor().total_spend().await, 3.5);
        assert!(!second.registry().spec("waves").await.unwrap().enabled);
    }

    #[tokio::test]
    async fn test_failed_save_marks_store_unhealthy() {
        let mut store = MockStateStore::new();
        store.expect_save().returning(|_| {
            Err(StoreError::Encoding(
                serde_json::from_str::<u8>("not json").unwrap_err(),
            ))
        });
        let service = ConsensusService::new(Config::default(), Arc::new(store)).unwrap();

        assert!(service.persist().await.is_err());
        let health = service.health().await;
        assert_eq!(health.status, "degraded");
        assert_eq!(health.components.get("state_store"), Some(false));
    }
}
