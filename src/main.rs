//! Predictor Activity Monitor
//!
//! Bootstraps logging and configuration, opens the SQLite store, wires the
//! feed client and notifier into the scheduler, and runs until Ctrl+C.

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt};

use tipster_monitor::config::MonitorConfig;
use tipster_monitor::discord::DiscordNotifier;
use tipster_monitor::notifier::{LogNotifier, Notifier};
use tipster_monitor::scheduler::Scheduler;
use tipster_monitor::sofascore::SofascoreClient;
use tipster_monitor::storage::open_storage;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // Initialize logging with both stdout and file output
    let file_appender = tracing_appender::rolling::never(".", "monitor.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive("tipster_monitor=info".parse().context("invalid log directive")?);

    let stdout_layer = fmt::layer().with_writer(std::io::stdout);
    let file_layer = fmt::layer().with_writer(non_blocking).with_ansi(false);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stdout_layer)
        .with(file_layer)
        .init();

    let config = MonitorConfig::from_env();

    info!("🚀 Predictor Activity Monitor v{}", env!("CARGO_PKG_VERSION"));
    info!("   Base interval: {}m (floor {}s, burst {}s)",
          config.scheduler.base_interval_minutes,
          config.scheduler.min_interval.as_secs(),
          config.scheduler.burst_interval.as_secs());
    info!("   Discovery: {} (limit {}, {} static)",
          if config.discovery.enabled { "on" } else { "off" },
          config.discovery.limit,
          config.discovery.static_entity_ids.len());
    info!("   Admission: ROI >= {}%, samples >= {}, avg odds >= {}, win rate >= {}%",
          config.discovery.filter.min_yield_pct,
          config.discovery.filter.min_samples,
          config.discovery.filter.min_avg_odds,
          config.discovery.filter.min_win_rate_pct);
    info!("   Window: {}h lookahead, {}m grace | movement threshold {:.0}%",
          config.detector.lookahead.num_hours(),
          config.detector.grace_period.num_minutes(),
          config.detector.movement_threshold * 100.0);

    let storage = open_storage(&config.storage.db_path)?;
    info!("💾 SQLite storage: {} (retention {}d)",
          config.storage.db_path,
          config.storage.retention.num_days());

    let fetcher = Arc::new(SofascoreClient::new(&config.fetcher)?);

    let notifier: Arc<dyn Notifier> = match DiscordNotifier::from_config(&config.notifier)? {
        Some(discord) => Arc::new(discord),
        None => {
            warn!("   ⚠️ DISCORD_WEBHOOK_URL not set - notifications go to the log only");
            Arc::new(LogNotifier)
        }
    };

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("🛑 Ctrl+C received, finishing current cycle...");
                signal_token.cancel();
            }
            Err(e) => error!("Failed to listen for Ctrl+C: {}", e),
        }
    });

    let mut scheduler = Scheduler::new(&config, storage.clone(), fetcher, notifier);
    scheduler.run(shutdown).await;

    storage.shutdown();
    info!("✅ Monitor stopped");
    Ok(())
}
