pub mod config;
pub mod health;
pub mod logging;

pub use config::{CacheConfig, Config, ConfigError, PersistenceConfig, ProducerSettings, ProducerSource, ServiceConfig};
pub use health::{ComponentHealth, HealthChecker, HealthStatus};
pub use logging::init_logging;
