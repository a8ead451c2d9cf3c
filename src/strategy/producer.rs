use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use super::signals::{MarketContext, Signal};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Timeout,
    TransportError,
    MalformedResponse,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Timeout => "timeout",
            FailureKind::TransportError => "transport_error",
            FailureKind::MalformedResponse => "malformed_response",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ProducerError {
    #[error("producer timed out: {0}")]
    Timeout(String),
    #[error("transport error: {0}")]
    TransportError(String),
    #[error("malformed response: {0}")]
    MalformedResponse(String),
}

impl ProducerError {
    pub fn kind(&self) -> FailureKind {
        match self {
            ProducerError::Timeout(_) => FailureKind::Timeout,
            ProducerError::TransportError(_) => FailureKind::TransportError,
            ProducerError::MalformedResponse(_) => FailureKind::MalformedResponse,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            ProducerError::Timeout(m)
            | ProducerError::TransportError(m)
            | ProducerError::MalformedResponse(m) => m,
        }
    }
}

/// Uniform contract for every detector, classifier and advisory model.
///
/// The engine stamps `producer_id` and `latency_ms` on the returned signal, so
/// adapters only need to fill in the opinion itself (and `cost` when they know it).
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SignalProducer: Send + Sync {
    async fn produce(&self, context: &MarketContext) -> Result<Signal, ProducerError>;
}
