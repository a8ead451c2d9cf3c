use anyhow::Result;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use warp::http::StatusCode;
use warp::Filter;

use signal_consensus_engine::core::config::CONFIG_PATH_VAR;
use signal_consensus_engine::core::{init_logging, Config};
use signal_consensus_engine::{ConsensusService, EvaluationRequest, ServiceError};

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let config_path = std::env::var(CONFIG_PATH_VAR).ok().map(PathBuf::from);
    let config = Config::load(config_path.as_deref())?;

    init_logging(&config.service.log_level);

    tracing::info!("🚀 Signal consensus engine starting...");
    tracing::info!("Version: {}", env!("CARGO_PKG_VERSION"));
    tracing::info!(
        "Producers: {}, quorum: {}, budget ceiling: {:.2}",
        config.producers.len(),
        config.consensus.min_votes,
        config.budget.ceiling
    );

    let service = Arc::new(ConsensusService::from_config(config.clone()).await?);

    if let Some(path) = config_path.clone() {
        tokio::spawn(watch_config(service.clone(), path, config.service.config_poll_secs));
    }
    tokio::spawn(flush_state(service.clone(), config.service.state_flush_secs));
    tokio::spawn(purge_cache(service.clone(), config.service.cache_purge_secs));

    let (addr, server) = warp::serve(routes(service.clone())).try_bind_with_graceful_shutdown(
        ([0, 0, 0, 0], config.service.http_port),
        async {
            tokio::signal::ctrl_c().await.ok();
        },
    )?;
    tracing::info!("✅ HTTP API listening on {}", addr);

    server.await;

    tracing::info!("🛑 Shutting down, persisting engine state");
    service.shutdown().await?;
    Ok(())
}

fn routes(
    service: Arc<ConsensusService>,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
    let with_service = warp::any().map(move || service.clone());

    let evaluate = warp::path("evaluate")
        .and(warp::post())
        .and(warp::body::json())
        .and(with_service.clone())
        .and_then(handle_evaluate);

    let health = warp::path("health")
        .and(warp::get())
        .and(with_service.clone())
        .and_then(|service: Arc<ConsensusService>| async move {
            let status = service.health().await;
            Ok::<_, warp::Rejection>(warp::reply::json(&status))
        });

    let metrics = warp::path("metrics")
        .and(warp::get())
        .and(with_service)
        .and_then(|service: Arc<ConsensusService>| async move {
            let reply = match service.render_metrics() {
                Ok(text) => warp::reply::with_status(text, StatusCode::OK),
                Err(e) => warp::reply::with_status(e.to_string(), StatusCode::INTERNAL_SERVER_ERROR),
            };
            Ok::<_, warp::Rejection>(reply)
        });

    evaluate.or(health).or(metrics)
}

async fn handle_evaluate(
    request: EvaluationRequest,
    service: Arc<ConsensusService>,
) -> Result<impl warp::Reply, warp::Rejection> {
    let reply = match service.evaluate(request).await {
        Ok(response) => warp::reply::with_status(warp::reply::json(&response), StatusCode::OK),
        Err(e) => {
            let status = match &e {
                ServiceError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
                _ => StatusCode::SERVICE_UNAVAILABLE,
            };
            tracing::warn!("❌ Evaluation failed: {}", e);
            warp::reply::with_status(
                warp::reply::json(&serde_json::json!({ "error": e.to_string() })),
                status,
            )
        }
    };
    Ok(reply)
}

fn modified_at(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

async fn watch_config(service: Arc<ConsensusService>, path: PathBuf, poll_secs: u64) {
    let mut last_seen = modified_at(&path);
    let mut interval = tokio::time::interval(Duration::from_secs(poll_secs.max(1)));

    loop {
        interval.tick().await;
        let current = modified_at(&path);
        if current == last_seen {
            continue;
        }
        last_seen = current;

        match Config::load(Some(path.as_path())) {
            Ok(config) => match service.apply_config(config).await {
                Ok(()) => tracing::info!("🔄 Reloaded configuration from {}", path.display()),
                Err(e) => tracing::error!("Failed to apply reloaded configuration: {}", e),
            },
            Err(e) => tracing::error!("Ignoring invalid configuration in {}: {}", path.display(), e),
        }
    }
}

async fn flush_state(service: Arc<ConsensusService>, flush_secs: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(flush_secs.max(1)));
    loop {
        interval.tick().await;
        if let Err(e) = service.persist().await {
            tracing::warn!("⚠️  Failed to persist engine state: {}", e);
        }
    }
}

async fn purge_cache(service: Arc<ConsensusService>, purge_secs: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(purge_secs.max(1)));
    loop {
        interval.tick().await;
        let purged = service.purge_cache().await;
        let stats = service.cache_stats().await;
        tracing::debug!(
            "Cache: {} entries, {} in flight, {} hits / {} misses / {} joined (purged {})",
            stats.entries,
            stats.in_flight,
            stats.hits,
            stats.misses,
            stats.joined,
            purged
        );
    }
}
