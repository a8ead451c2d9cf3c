use prometheus::{
    Encoder, Gauge, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::time::Duration;

/// Prometheus instruments for the consensus pipeline, kept in an owned registry
/// so several engines (and tests) can coexist in one process.
#[derive(Clone)]
pub struct ConsensusMetrics {
    registry: Registry,
    evaluations: IntCounterVec,
    cache_lookups: IntCounterVec,
    producer_calls: IntCounterVec,
    producer_latency: HistogramVec,
    window_spend: Gauge,
    open_circuits: IntGauge,
}

impl ConsensusMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let evaluations = IntCounterVec::new(
            Opts::new("consensus_evaluations_total", "Evaluations by outcome"),
            &["outcome"],
        )?;
        let cache_lookups = IntCounterVec::new(
            Opts::new("consensus_cache_lookups_total", "Response cache lookups by result"),
            &["result"],
        )?;
        let producer_calls = IntCounterVec::new(
            Opts::new("consensus_producer_calls_total", "Producer calls by outcome"),
            &["producer", "outcome"],
        )?;
        let producer_latency = HistogramVec::new(
            HistogramOpts::new("consensus_producer_latency_seconds", "Producer call latency")
                .buckets(vec![0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]),
            &["producer"],
        )?;
        let window_spend = Gauge::new("consensus_window_spend", "Spend in the current budget window")?;
        let open_circuits = IntGauge::new("consensus_open_circuits", "Producers with an open circuit")?;

        registry.register(Box::new(evaluations.clone()))?;
        registry.register(Box::new(cache_lookups.clone()))?;
        registry.register(Box::new(producer_calls.clone()))?;
        registry.register(Box::new(producer_latency.clone()))?;
        registry.register(Box::new(window_spend.clone()))?;
        registry.register(Box::new(open_circuits.clone()))?;

        Ok(Self {
            registry,
            evaluations,
            cache_lookups,
            producer_calls,
            producer_latency,
            window_spend,
            open_circuits,
        })
    }

    pub fn record_evaluation(&self, outcome: &str) {
        self.evaluations.with_label_values(&[outcome]).inc();
    }

    pub fn record_cache_lookup(&self, result: &str) {
        self.cache_lookups.with_label_values(&[result]).inc();
    }

    pub fn record_producer_call(&self, producer: &str, outcome: &str, latency: Duration) {
        self.producer_calls.with_label_values(&[producer, outcome]).inc();
        self.producer_latency
            .with_label_values(&[producer])
            .observe(latency.as_secs_f64());
    }

    pub fn set_window_spend(&self, spend: f64) {
        self.window_spend.set(spend);
    }

    pub fn set_open_circuits(&self, count: usize) {
        self.open_circuits.set(count as i64);
    }

    pub fn evaluations(&self, outcome: &str) -> u64 {
        self.evaluations.with_label_values(&[outcome]).get()
    }

    pub fn cache_lookups(&self, result: &str) -> u64 {
        self.cache_lookups.with_label_values(&[result]).get()
    }

    pub fn producer_calls(&self, producer: &str, outcome: &str) -> u64 {
        self.producer_calls.with_label_values(&[producer, outcome]).get()
    }

    /// Text exposition format for a `/metrics` endpoint.
    pub fn render(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}
