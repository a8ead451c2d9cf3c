use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// `RUST_LOG`, when set, wins over the configured level.
pub fn init_logging(log_level: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));

    let initialized = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_target(false))
        .try_init()
        .is_ok();

    if initialized {
        tracing::info!("📝 Logging initialized at level: {}", log_level);
    }
}
