use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio::time::Instant;

use super::aggregation::{decide_tally, Tally, Vote};
use super::policy::ConsensusConfig;
use super::result::{ConsensusResult, ProducerFailure};
use crate::api::CallLimiter;
use crate::budget::CostGovernor;
use crate::monitoring::ConsensusMetrics;
use crate::registry::{AnalyzerRegistry, CircuitState, Invocation, Tier};
use crate::strategy::{clamp_confidence, MarketContext, ProducerError, Signal};

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ConsensusError {
    #[error("consensus engine is shutting down")]
    ShuttingDown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Collecting,
    Aggregating,
    Decided,
    Degraded,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Collecting => write!(f, "COLLECTING"),
            Phase::Aggregating => write!(f, "AGGREGATING"),
            Phase::Decided => write!(f, "DECIDED"),
            Phase::Degraded => write!(f, "DEGRADED"),
        }
    }
}

/// Tier and budget resolved for one evaluation before any producer is called.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EvaluationPlan {
    pub requested: Tier,
    pub tier: Tier,
    pub budget_remaining: f64,
}

/// Why a selected producer was never called.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Skip {
    /// No call slot freed up within the per-call timeout.
    NoSlot,
    /// The limiter closed while waiting for a slot.
    Closed,
}

impl Skip {
    fn as_str(&self) -> &'static str {
        match self {
            Skip::NoSlot => "no_slot",
            Skip::Closed => "limiter_closed",
        }
    }
}

struct CallOutcome {
    invocation: Invocation,
    result: Result<Result<Signal, ProducerError>, Skip>,
    latency: Duration,
}

pub struct ConsensusEngine {
    registry: Arc<AnalyzerRegistry>,
    governor: Arc<CostGovernor>,
    limiter: Arc<CallLimiter>,
    policy: RwLock<ConsensusConfig>,
    metrics: ConsensusMetrics,
}

impl ConsensusEngine {
    pub fn new(
        registry: Arc<AnalyzerRegistry>,
        governor: Arc<CostGovernor>,
        limiter: Arc<CallLimiter>,
        policy: ConsensusConfig,
        metrics: ConsensusMetrics,
    ) -> Self {
        tracing::info!(
            "🧠 Consensus engine ready (quorum {}, per-call timeout {}ms)",
            policy.min_votes,
            policy.per_call_timeout_ms
        );

        Self {
            registry,
            governor,
            limiter,
            policy: RwLock::new(policy),
            metrics,
        }
    }

    pub fn registry(&self) -> &Arc<AnalyzerRegistry> {
        &self.registry
    }

    pub fn governor(&self) -> &Arc<CostGovernor> {
        &self.governor
    }

    pub fn limiter(&self) -> &Arc<CallLimiter> {
        &self.limiter
    }

    pub fn metrics(&self) -> &ConsensusMetrics {
        &self.metrics
    }

    pub async fn policy(&self) -> ConsensusConfig {
        self.policy.read().await.clone()
    }

    /// Takes effect for evaluations started after the call.
    pub async fn set_policy(&self, policy: ConsensusConfig) {
        *self.policy.write().await = policy;
    }

    /// Stops admitting producer calls; evaluations started afterwards fail fast.
    pub fn shutdown(&self) {
        self.limiter.close();
    }

    /// Resolves the tier for a request. An exhausted budget always means the
    /// quick tier; otherwise `budget_override` (when given) stands in for the
    /// governor's headroom in the floor check.
    pub async fn plan(&self, requested: Tier, budget_override: Option<f64>) -> EvaluationPlan {
        let exhausted = self.governor.is_exhausted().await;
        let budget_remaining = match budget_override {
            Some(budget) => budget,
            None => self.governor.remaining_budget().await,
        };

        let tier = if exhausted {
            Tier::Quick
        } else {
            self.registry.effective_tier(requested, budget_remaining).await
        };

        EvaluationPlan {
            requested,
            tier,
            budget_remaining,
        }
    }

    pub async fn evaluate(
        &self,
        context: Arc<MarketContext>,
        plan: EvaluationPlan,
    ) -> Result<ConsensusResult, ConsensusError> {
        if self.limiter.is_closed() {
            return Err(ConsensusError::ShuttingDown);
        }

        let policy = self.policy.read().await.clone();
        let tie_break = policy.tie_break();
        let timeout = policy.per_call_timeout();

        let selected = self.registry.select(plan.tier, plan.budget_remaining).await;
        let invocations = self.registry.checkout(&selected).await;

        tracing::debug!(
            "{} {} {} [{} -> {}]: {} selected, {} admitted",
            Phase::Collecting,
            context.symbol,
            context.timeframe,
            plan.requested,
            plan.tier,
            selected.len(),
            invocations.len()
        );

        let mut outstanding: BTreeMap<String, f64> = invocations
            .iter()
            .map(|inv| (inv.id.clone(), inv.weight))
            .collect();

        let mut pending: FuturesUnordered<_> = invocations
            .into_iter()
            .map(|inv| self.call(inv, context.clone(), timeout))
            .collect();

        let mut votes: Vec<Vote> = Vec::new();
        let mut signals: Vec<Signal> = Vec::new();
        let mut failures: Vec<ProducerFailure> = Vec::new();
        let mut skipped: Vec<String> = Vec::new();

        while let Some(outcome) = pending.next().await {
            let id = outcome.invocation.id.clone();
            outstanding.remove(&id);

            match outcome.result {
                Err(skip) => {
                    tracing::debug!("⏭️  Producer {} not called ({})", id, skip.as_str());
                    self.registry.record_cancelled(&id).await;
                    self.metrics
                        .record_producer_call(&id, skip.as_str(), Duration::ZERO);
                    skipped.push(id);
                }
                Ok(Ok(signal)) => {
                    self.registry.record_success(&id).await;
                    self.governor.log_cost(&id, signal.cost).await;
                    self.metrics.record_producer_call(&id, "ok", outcome.latency);

                    votes.push(Vote {
                        producer_id: id,
                        direction: signal.direction,
                        confidence: signal.confidence,
                        weight: outcome.invocation.weight,
                    });
                    signals.push(signal);
                }
                Ok(Err(err)) => {
                    tracing::warn!("⚠️  Producer {} failed ({}): {}", id, err.kind(), err.message());
                    self.registry.record_failure(&id).await;
                    self.metrics
                        .record_producer_call(&id, err.kind().as_str(), outcome.latency);

                    failures.push(ProducerFailure {
                        producer_id: id,
                        kind: err.kind(),
                        message: err.message().to_string(),
                    });
                }
            }

            if votes.len() >= policy.min_votes && !outstanding.is_empty() {
                let outstanding_weight: f64 = outstanding.values().sum();
                if Tally::from_votes(&votes).is_settled(outstanding_weight, &tie_break) {
                    tracing::debug!(
                        "⏩ {} decision determinable, cancelling {} outstanding calls",
                        context.symbol,
                        outstanding.len()
                    );
                    break;
                }
            }
        }
        drop(pending);

        let mut cancelled: Vec<String> = outstanding.into_keys().collect();
        for id in &cancelled {
            self.registry.record_cancelled(id).await;
            self.metrics
                .record_producer_call(id, "cancelled", Duration::ZERO);
        }
        cancelled.extend(skipped);
        cancelled.sort();

        tracing::debug!(
            "{} {}: {} votes, {} failures, {} cancelled",
            Phase::Aggregating,
            context.symbol,
            votes.len(),
            failures.len(),
            cancelled.len()
        );

        let tally = Tally::from_votes(&votes);
        signals.sort_by(|a, b| a.producer_id.cmp(&b.producer_id));
        failures.sort_by(|a, b| a.producer_id.cmp(&b.producer_id));

        let mut result = if tally.valid() < policy.min_votes {
            tracing::warn!(
                "{} {} {}: {} of {} required votes, issuing HOLD",
                Phase::Degraded,
                context.symbol,
                context.timeframe,
                tally.valid(),
                policy.min_votes
            );
            self.metrics.record_evaluation("degraded");
            ConsensusResult::degraded(
                &context.symbol,
                &context.timeframe,
                plan.tier,
                tally.buckets(),
                signals,
            )
        } else {
            let verdict = decide_tally(&tally, &tie_break, &policy.action_tiers);
            tracing::info!(
                "🗳️  {} {} {} -> {} (confidence {:.3}, agreement {:.2}, {})",
                Phase::Decided,
                context.symbol,
                context.timeframe,
                verdict.decision,
                verdict.confidence,
                verdict.agreement_ratio,
                verdict.action_tier
            );
            self.metrics.record_evaluation("decided");
            ConsensusResult::decided(&context.symbol, &context.timeframe, plan.tier, verdict, signals)
        };
        result.failures = failures;
        result.cancelled = cancelled;

        self.refresh_gauges().await;
        Ok(result)
    }

    /// Waiting for a call slot and the producer call are bounded separately by
    /// the same timeout. A call that never got a slot is not the producer's fault.
    async fn call(
        &self,
        invocation: Invocation,
        context: Arc<MarketContext>,
        timeout: Duration,
    ) -> CallOutcome {
        let permit = match tokio::time::timeout(timeout, self.limiter.acquire()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return not_called(invocation, Skip::Closed),
            Err(_) => return not_called(invocation, Skip::NoSlot),
        };

        let called = Instant::now();
        let attempt = tokio::time::timeout(timeout, invocation.producer.produce(&context)).await;
        drop(permit);

        let latency = called.elapsed();
        let result = match attempt {
            Ok(Ok(signal)) => stamp(signal, &invocation, latency),
            Ok(Err(err)) => Err(err),
            Err(_) => Err(ProducerError::Timeout(format!(
                "no response within {}ms",
                timeout.as_millis()
            ))),
        };

        CallOutcome {
            invocation,
            result: Ok(result),
            latency,
        }
    }

    async fn refresh_gauges(&self) {
        self.metrics.set_window_spend(self.governor.total_spend().await);
        let open = self
            .registry
            .circuit_states()
            .await
            .into_iter()
            .filter(|(_, state)| *state == CircuitState::Open)
            .count();
        self.metrics.set_open_circuits(open);
    }
}

fn not_called(invocation: Invocation, skip: Skip) -> CallOutcome {
    CallOutcome {
        invocation,
        result: Err(skip),
        latency: Duration::ZERO,
    }
}

/// Engine-side normalization: identity and latency come from the engine, the
/// cost falls back to the registered per-call cost.
fn stamp(
    mut signal: Signal,
    invocation: &Invocation,
    latency: Duration,
) -> Result<Signal, ProducerError> {
    if !signal.confidence.is_finite() {
        return Err(ProducerError::MalformedResponse(format!(
            "non-finite confidence {}",
            signal.confidence
        )));
    }

    signal.producer_id = invocation.id.clone();
    signal.confidence = clamp_confidence(signal.confidence);
    signal.latency_ms = latency.as_millis() as u64;
    signal.cost = if signal.cost.is_finite() && signal.cost > 0.0 {
        signal.cost
    } else {
        invocation.cost_per_call
    };
    Ok(signal)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::BudgetConfig;
    use crate::consensus::{ActionTier, Outcome, INSUFFICIENT_VOTES};
    use crate::registry::{AnalyzerSpec, BreakerConfig};
    use crate::strategy::producer::MockSignalProducer;
    use crate::strategy::{Direction, FailureKind, SignalProducer};
    use async_trait::async_trait;

    struct Delayed {
        delay: Duration,
        direction: Direction,
        confidence: f64,
    }

    #[async_trait]
    impl SignalProducer for Delayed {
        async fn produce(&self, _context: &MarketContext) -> Result<Signal, ProducerError> {
            tokio::time::sleep(self.delay).await;
            Ok(Signal::new("ignored", self.direction, self.confidence))
        }
    }

    fn answering(direction: Direction, confidence: f64) -> Arc<dyn SignalProducer> {
        let mut mock = MockSignalProducer::new();
        mock.expect_produce()
            .returning(move |_| Ok(Signal::new("ignored", direction, confidence)));
        Arc::new(mock)
    }

    fn failing(err: ProducerError) -> Arc<dyn SignalProducer> {
        let mut mock = MockSignalProducer::new();
        mock.expect_produce().returning(move |_| Err(err.clone()));
        Arc::new(mock)
    }

    fn slow(direction: Direction, confidence: f64, secs: u64) -> Arc<dyn SignalProducer> {
        Arc::new(Delayed {
            delay: Duration::from_secs(secs),
            direction,
            confidence,
        })
    }

    fn engine() -> ConsensusEngine {
        engine_with_slots(8)
    }

    fn engine_with_slots(slots: usize) -> ConsensusEngine {
        ConsensusEngine::new(
            Arc::new(AnalyzerRegistry::new(BreakerConfig::default(), 2.0)),
            Arc::new(CostGovernor::new(BudgetConfig::default())),
            Arc::new(CallLimiter::new(slots)),
            ConsensusConfig::default(),
            ConsensusMetrics::new().unwrap(),
        )
    }

    async fn add(engine: &ConsensusEngine, id: &str, weight: f64, producer: Arc<dyn SignalProducer>) {
        engine
            .registry()
            .register(AnalyzerSpec::new(id, weight, 0.1, Tier::Standard), producer)
            .await
            .unwrap();
    }

    async fn run(engine: &ConsensusEngine) -> ConsensusResult {
        let plan = engine.plan(Tier::Standard, None).await;
        engine
            .evaluate(Arc::new(MarketContext::new("XBTUSDTM", "15m")), plan)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_worked_example_through_engine() {
        let engine = engine();
        // every vote is needed, so no early exit trims the signal set
        engine
            .set_policy(ConsensusConfig {
                min_votes: 4,
                ..ConsensusConfig::default()
            })
            .await;
        add(&engine, "breakout", 1.3, answering(Direction::Buy, 0.9)).await;
        add(&engine, "phase", 1.2, answering(Direction::Buy, 0.8)).await;
        add(&engine, "regime", 1.0, answering(Direction::Hold, 0.6)).await;
        add(&engine, "waves", 0.9, answering(Direction::Sell, 0.7)).await;

        let result = run(&engine).await;
        assert_eq!(result.outcome, Outcome::Decided);
        assert_eq!(result.decision, Direction::Buy);
        assert!((result.confidence - 2.13 / 4.4).abs() < 1e-9);
        assert_eq!(result.agreement_ratio, 0.5);
        assert_eq!(result.action_tier, ActionTier::Wait);

        let ids: Vec<&str> = result.signals.iter().map(|s| s.producer_id.as_str()).collect();
        assert_eq!(ids, vec!["breakout", "phase", "regime", "waves"]);
    }

    #[tokio::test]
    async fn test_quorum_not_met_degrades_to_hold() {
        let engine = engine();
        add(&engine, "a", 1.0, answering(Direction::Buy, 0.9)).await;
        add(&engine, "b", 1.0, answering(Direction::Buy, 0.9)).await;
        add(&engine, "c", 1.0, failing(ProducerError::TransportError("reset".into()))).await;

        let result = run(&engine).await;
        assert!(result.is_degraded());
        assert_eq!(result.decision, Direction::Hold);
        assert_eq!(result.confidence, 0.0);
        assert_eq!(result.action_tier, ActionTier::HoldConflicting);
        assert_eq!(result.reason.as_deref(), Some(INSUFFICIENT_VOTES));
        assert_eq!(result.failures.len(), 1);
        assert_eq!(result.failures[0].kind, FailureKind::TransportError);

        let spec = engine.registry().spec("c").await.unwrap();
        assert_eq!(spec.consecutive_failures, 1);
        assert_eq!(engine.metrics().evaluations("degraded"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_out_call_is_excluded_and_counted() {
        let engine = engine();
        add(&engine, "buy", 1.0, answering(Direction::Buy, 0.9)).await;
        add(&engine, "sell", 1.0, answering(Direction::Sell, 0.8)).await;
        add(&engine, "hold", 1.0, answering(Direction::Hold, 0.5)).await;
        add(&engine, "sluggish", 1.0, slow(Direction::Sell, 1.0, 30)).await;

        let result = run(&engine).await;
        assert_eq!(result.decision, Direction::Buy);
        assert_eq!(result.signals.len(), 3);
        assert_eq!(result.failures[0].producer_id, "sluggish");
        assert_eq!(result.failures[0].kind, FailureKind::Timeout);
        assert!(result.cancelled.is_empty());

        let spec = engine.registry().spec("sluggish").await.unwrap();
        assert_eq!(spec.consecutive_failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_early_exit_cancels_stragglers_without_penalty() {
        let engine = engine();
        add(&engine, "a", 1.0, answering(Direction::Buy, 1.0)).await;
        add(&engine, "b", 1.0, answering(Direction::Buy, 1.0)).await;
        add(&engine, "c", 1.0, answering(Direction::Buy, 1.0)).await;
        add(&engine, "straggler", 1.0, slow(Direction::Sell, 1.0, 1)).await;

        let started = Instant::now();
        let result = run(&engine).await;

        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(result.decision, Direction::Buy);
        assert_eq!(result.cancelled, vec!["straggler".to_string()]);
        assert!(result.failures.is_empty());

        let spec = engine.registry().spec("straggler").await.unwrap();
        assert_eq!(spec.consecutive_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waits_when_outstanding_vote_could_flip_the_winner() {
        let engine = engine();
        add(&engine, "a", 1.0, answering(Direction::Buy, 0.6)).await;
        add(&engine, "b", 1.0, answering(Direction::Sell, 0.5)).await;
        add(&engine, "c", 1.0, answering(Direction::Hold, 0.4)).await;
        add(&engine, "late", 2.0, slow(Direction::Sell, 0.9, 1)).await;

        let result = run(&engine).await;
        assert!(result.cancelled.is_empty());
        assert_eq!(result.signals.len(), 4);
        assert_eq!(result.decision, Direction::Sell);
    }

    fn steady(direction: Direction, millis: u64) -> Arc<dyn SignalProducer> {
        Arc::new(Delayed {
            delay: Duration::from_millis(millis),
            direction,
            confidence: 0.8,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiting_for_a_call_slot_does_not_trip_breakers() {
        let engine = engine_with_slots(1);
        engine
            .set_policy(ConsensusConfig {
                per_call_timeout_ms: 1_000,
                ..ConsensusConfig::default()
            })
            .await;
        for id in ["a", "b", "c"] {
            add(&engine, id, 1.0, steady(Direction::Buy, 800)).await;
        }

        for _ in 0..3 {
            let result = run(&engine).await;
            assert!(result.failures.is_empty());
            assert_eq!(result.signals.len(), 2);
            assert_eq!(result.cancelled.len(), 1);
        }

        for id in ["a", "b", "c"] {
            let spec = engine.registry().spec(id).await.unwrap();
            assert!(spec.enabled);
            assert_eq!(spec.consecutive_failures, 0);
        }
        assert_eq!(engine.limiter().get_stats().in_use, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_mid_evaluation_is_not_a_producer_failure() {
        let engine = Arc::new(engine_with_slots(1));
        for id in ["a", "b", "c"] {
            add(&engine, id, 1.0, steady(Direction::Sell, 800)).await;
        }

        let running = {
            let engine = engine.clone();
            tokio::spawn(async move { run(&engine).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        engine.shutdown();

        let result = running.await.unwrap();
        assert!(result.failures.is_empty());
        assert_eq!(result.signals.len(), 1);
        assert_eq!(result.cancelled.len(), 2);
        for id in ["a", "b", "c"] {
            assert_eq!(engine.registry().spec(id).await.unwrap().consecutive_failures, 0);
        }
    }

    #[tokio::test]
    async fn test_costs_are_logged_with_fallback_to_registered_cost() {
        let engine = engine();
        let mut priced = MockSignalProducer::new();
        priced
            .expect_produce()
            .times(1)
            .returning(|_| Ok(Signal::new("x", Direction::Buy, 0.7).with_cost(0.25)));

        add(&engine, "priced", 1.0, Arc::new(priced)).await;
        add(&engine, "b", 1.0, answering(Direction::Buy, 0.7)).await;
        add(&engine, "c", 1.0, answering(Direction::Hold, 0.7)).await;

        let result = run(&engine).await;
        let governor = engine.governor();
        assert_eq!(governor.producer_spend("priced").await, 0.25);
        assert_eq!(governor.producer_spend("b").await, 0.1);
        assert!((result.total_cost - 0.45).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_non_finite_confidence_is_malformed() {
        let engine = engine();
        let mut broken = MockSignalProducer::new();
        broken.expect_produce().returning(|_| {
            Ok(Signal {
                producer_id: "broken".into(),
                direction: Direction::Buy,
                confidence: f64::INFINITY,
                rationale: String::new(),
                cost: 0.0,
                latency_ms: 0,
            })
        });
        add(&engine, "broken", 1.0, Arc::new(broken)).await;

        let result = run(&engine).await;
        assert!(result.is_degraded());
        assert_eq!(result.failures[0].kind, FailureKind::MalformedResponse);
    }

    #[tokio::test]
    async fn test_open_circuit_producer_is_not_called() {
        let engine = engine();
        let mut tripped = MockSignalProducer::new();
        tripped.expect_produce().times(0);
        add(&engine, "tripped", 1.0, Arc::new(tripped)).await;
        for _ in 0..3 {
            engine.registry().record_failure("tripped").await;
        }

        let result = run(&engine).await;
        assert!(result.is_degraded());
        assert!(result.signals.is_empty());
    }

    #[tokio::test]
    async fn test_exhausted_budget_plans_quick_tier() {
        let engine = engine();
        engine.governor().log_cost("advisor", 10.0).await;

        let plan = engine.plan(Tier::Critical, Some(100.0)).await;
        assert_eq!(plan.requested, Tier::Critical);
        assert_eq!(plan.tier, Tier::Quick);
    }

    #[tokio::test]
    async fn test_budget_override_drives_floor_check() {
        let engine = engine();
        assert_eq!(engine.plan(Tier::Critical, Some(1.0)).await.tier, Tier::Quick);
        assert_eq!(engine.plan(Tier::Critical, None).await.tier, Tier::Critical);
    }

    #[tokio::test]
    async fn test_shutdown_rejects_new_evaluations() {
        let engine = engine();
        engine.shutdown();
        let plan = engine.plan(Tier::Quick, None).await;
        let err = engine
            .evaluate(Arc::new(MarketContext::new("XBTUSDTM", "1m")), plan)
            .await
            .unwrap_err();
        assert_eq!(err, ConsensusError::ShuttingDown);
    }
}
