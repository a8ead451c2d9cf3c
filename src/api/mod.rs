pub mod advisory;
pub mod rate_limiter;
pub mod types;

pub use advisory::AdvisoryClient;
pub use rate_limiter::{CallLimiter, CallLimiterStats, CallPermit, LimiterClosed};
pub use types::*;
