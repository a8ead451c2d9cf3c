use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;

use super::types::{AdvisoryRequest, AdvisoryResponse};
use crate::strategy::{Direction, MarketContext, ProducerError, Signal, SignalProducer};

/// Adapter for a remote advisory model reachable over HTTP.
pub struct AdvisoryClient {
    name: String,
    endpoint: String,
    client: Client,
}

impl AdvisoryClient {
    pub fn new(
        name: impl Into<String>,
        endpoint: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            name: name.into(),
            endpoint: endpoint.into(),
            client,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub(crate) fn interpret(&self, body: AdvisoryResponse) -> Result<Signal, ProducerError> {
        let direction: Direction = body
            .direction
            .parse()
            .map_err(ProducerError::MalformedResponse)?;

        if !body.confidence.is_finite() {
            return Err(ProducerError::MalformedResponse(format!(
                "non-finite confidence {}",
                body.confidence
            )));
        }

        let mut signal = Signal::new(self.name.clone(), direction, body.confidence)
            .with_rationale(body.rationale);
        if let Some(cost) = body.cost {
            signal = signal.with_cost(cost);
        }
        Ok(signal)
    }
}

fn classify(err: reqwest::Error) -> ProducerError {
    if err.is_timeout() {
        ProducerError::Timeout(err.to_string())
    } else if err.is_decode() {
        ProducerError::MalformedResponse(err.to_string())
    } else {
        ProducerError::TransportError(err.to_string())
    }
}

#[async_trait]
impl SignalProducer for AdvisoryClient {
    async fn produce(&self, context: &MarketContext) -> Result<Signal, ProducerError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&AdvisoryRequest {
                market_context: context,
            })
            .send()
            .await
            .map_err(classify)?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            tracing::warn!("{} advisory error: {} - {}", self.name, status, error_text);
            return Err(ProducerError::TransportError(format!(
                "advisory request failed: {} - {}",
                status, error_text
            )));
        }

        let body: AdvisoryResponse = response.json().await.map_err(classify)?;
        self.interpret(body)
    }
}
