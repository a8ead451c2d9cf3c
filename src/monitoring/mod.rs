pub mod metrics;
pub mod state_store;

pub use metrics::ConsensusMetrics;
pub use state_store::{EngineState, MemoryStateStore, RedisStateStore, StateStore, StoreError};
