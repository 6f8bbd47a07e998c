use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use bridge::analysis::{AnalysisService, DocumentAnalyzer};
use bridge::api::{ApiServer, AppState};
use bridge::cache::{collections, CacheRegistry, CacheStore, FileCache};
use bridge::config::{Config, ObservabilityConfig, DEFAULT_CONFIG_FILE};
use bridge::llm::create_model;
use bridge::task::{TaskRegistry, TaskRetention};
use bridge_storage::LocalStorage;
use chrono::{DateTime, Local, NaiveTime, TimeDelta, TimeZone};
use clap::Parser;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// How often expired tasks are swept when retention is enabled.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Parser, Debug)]
#[command(name = "deep-bridge-server")]
#[command(about = "Analysis cache and task server for deep-bridge clients")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Port to listen on (overrides config and BRIDGE_PORT)
    #[arg(short, long)]
    port: Option<u16>,
}

fn init_tracing(config: &ObservabilityConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    let json = config.log_format.eq_ignore_ascii_case("json");

    tracing_subscriber::registry()
        .with(filter)
        .with(json.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!json).then(|| tracing_subscriber::fmt::layer()))
        .init();
}

fn init_metrics(config: &ObservabilityConfig) -> Option<PrometheusHandle> {
    if !config.metrics_enabled {
        return None;
    }
    match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => Some(handle),
        Err(e) => {
            tracing::warn!(error = %e, "Failed to install metrics recorder, /metrics disabled");
            None
        }
    }
}

/// Time from `now` until the next occurrence of `hour:00` local time.
fn delay_until_hour<Tz: TimeZone>(now: &DateTime<Tz>, hour: u32) -> Duration {
    let target = NaiveTime::from_hms_opt(hour.min(23), 0, 0).unwrap_or_default();
    let mut delay = target.signed_duration_since(now.time());
    if delay <= TimeDelta::zero() {
        delay += TimeDelta::days(1);
    }
    delay.to_std().unwrap_or_default()
}

/// Remove entries older than `max_age` once a day at `hour`.
fn spawn_daily_cleanup(
    cache: Arc<dyn CacheStore>,
    hour: u32,
    max_age: Duration,
    shutdown: CancellationToken,
) {
    tokio::spawn(async move {
        loop {
            let delay = delay_until_hour(&Local::now(), hour);
            tracing::debug!(collection = cache.collection(), ?delay, "Next cache cleanup scheduled");
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }

            match cache.cleanup(max_age).await {
                Ok(0) => {}
                Ok(removed) => tracing::info!(
                    collection = cache.collection(),
                    removed,
                    "Cleaned old cache entries"
                ),
                Err(e) => tracing::error!(error = %e, "Cache cleanup failed"),
            }
        }
    });
}

fn spawn_task_sweeper(registry: Arc<TaskRegistry>, retention: TaskRetention, shutdown: CancellationToken) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    let removed = registry.sweep_expired(&retention);
                    if removed > 0 {
                        tracing::info!(removed, "Swept expired tasks");
                    }
                }
            }
        }
    });
}

async fn shutdown_signal(token: CancellationToken) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        return;
    }
    tracing::info!("Shutdown requested");
    token.cancel();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = Config::load_or_create(&args.config)
        .with_context(|| format!("Failed to load config from {}", args.config.display()))?;
    if let Some(port) = args.port {
        config.apply_env(|key| (key == "BRIDGE_PORT").then(|| port.to_string()))?;
    }

    init_tracing(&config.observability);
    let metrics = init_metrics(&config.observability);

    tracing::info!("Config file: {}", args.config.display());
    tracing::info!("Cache dir: {}", config.cache.dir.display());
    tracing::info!("Frontend URL: {}", config.server.frontend_url);
    tracing::info!("LLM: {}", config.llm.model_label());

    let storage = Arc::new(LocalStorage::new(&config.cache.dir));
    let cache: Arc<dyn CacheStore> = Arc::new(FileCache::new(
        storage,
        collections::ANALYSIS,
        Some(config.cache.analysis_capacity),
    ));
    let mut caches = CacheRegistry::new();
    caches.register(cache.clone());

    let model = create_model(&config.llm).context("Failed to create language model")?;
    let analyzer = Arc::new(DocumentAnalyzer::new(Arc::from(model)));
    let registry = Arc::new(TaskRegistry::new());
    let analysis = Arc::new(
        AnalysisService::new(
            analyzer,
            cache.clone(),
            registry.clone(),
            config.tasks.max_concurrent,
        )
        .with_max_content_length(config.tasks.max_content_length),
    );

    let shutdown = CancellationToken::new();
    spawn_daily_cleanup(
        cache,
        config.cache.cleanup_hour,
        config.cache.cleanup_max_age(),
        shutdown.clone(),
    );
    if let Some(retention) = &config.tasks.retention {
        spawn_task_sweeper(registry, retention.retention(), shutdown.clone());
    }
    tokio::spawn(shutdown_signal(shutdown.clone()));

    let mut state = AppState::new(analysis, Arc::new(caches));
    if let Some(handle) = metrics {
        state = state.with_metrics(handle);
    }

    ApiServer::new(state, &config)
        .serve(&config.server.bind_addr, shutdown)
        .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_delay_until_later_today() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 1, 30, 0).unwrap();
        assert_eq!(delay_until_hour(&now, 2), Duration::from_secs(30 * 60));
    }

    #[test]
    fn test_delay_rolls_to_tomorrow() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 2, 0, 0).unwrap();
        assert_eq!(delay_until_hour(&now, 2), Duration::from_secs(24 * 3600));

        let now = Utc.with_ymd_and_hms(2024, 5, 1, 23, 0, 0).unwrap();
        assert_eq!(delay_until_hour(&now, 2), Duration::from_secs(3 * 3600));
    }
}
