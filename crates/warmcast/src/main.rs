use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;

use warmcast_core::{
    config::Config,
    delivery::{BatchDispatcher, DeliveryLog, DeliveryWorker},
    scheduler::BroadcastScheduler,
    security::{AbuseGate, BlockedSubjects, FileBlockList},
    store::FileStore,
    transport::{ThrottleConfig, ThrottledTransport},
    utils::JsonlDeliverySink,
};
use warmcast_telegram::TelegramTransport;

const SWEEP_INTERVAL: std::time::Duration = std::time::Duration::from_secs(3600);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    warmcast_core::logging::init("warmcast")?;

    let cfg = Config::load().context("failed to load configuration")?;
    std::fs::create_dir_all(&cfg.storage.data_dir)
        .with_context(|| format!("failed to create {}", cfg.storage.data_dir.display()))?;

    let store = Arc::new(FileStore::new(&cfg.storage));
    let sink = Arc::new(JsonlDeliverySink::new(
        cfg.delivery_log.path.clone(),
        cfg.delivery_log.json,
    ));
    let (delivery_log, log_task) = DeliveryLog::spawn(sink, cfg.delivery_log.queue_capacity);

    let telegram = Arc::new(TelegramTransport::from_token(&cfg.telegram_bot_token));
    let transport = Arc::new(ThrottledTransport::new(telegram, ThrottleConfig::default()));

    let worker = DeliveryWorker::new(
        transport.clone(),
        store.clone(),
        delivery_log.clone(),
        Arc::new(cfg.dispatch.clone()),
    );
    let scheduler = BroadcastScheduler::new(
        cfg.schedule.clone(),
        store.clone(),
        store,
        BatchDispatcher::new(worker),
    );

    // Inbound admission; handed to the command surface when one is attached.
    let blocked = Arc::new(
        BlockedSubjects::load(Arc::new(FileBlockList::new(
            cfg.storage.blocked_subjects_file.clone(),
        )))
        .await,
    );
    let gate = Arc::new(AbuseGate::new(cfg.rate_limits.clone(), blocked));
    let stats = gate.stats();
    tracing::info!(
        blocked = stats.blocked_subjects,
        pattern_classes = stats.pattern_classes,
        "abuse gate ready"
    );
    let sweeper = {
        let gate = gate.clone();
        let transport = transport.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                tick.tick().await;
                let forgotten = gate.sweep(Utc::now());
                let idle = transport.sweep().await;
                if forgotten > 0 || idle > 0 {
                    tracing::debug!(forgotten, idle, "expired histories and throttle slots dropped");
                }
            }
        })
    };

    let plan = scheduler
        .reschedule()
        .await
        .context("failed to install daily broadcasts")?;
    for spec in &plan {
        tracing::info!(trigger = %spec, "daily broadcast installed");
    }
    for at in scheduler.upcoming_run_times().await {
        tracing::info!(at = %at.format("%Y-%m-%d %H:%M"), "upcoming broadcast");
    }

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("shutdown requested");

    scheduler.stop().await;
    sweeper.abort();

    // An in-flight run finishes its current batch before returning.
    let drain = async {
        while scheduler.is_running() {
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        }
    };
    if tokio::time::timeout(std::time::Duration::from_secs(60), drain)
        .await
        .is_err()
    {
        tracing::warn!("broadcast still running at shutdown");
    }

    let stats = scheduler.stats().await;
    tracing::info!(
        runs = stats.total_runs,
        sent = stats.total_sent,
        failed = stats.total_failed,
        dropped_log_records = delivery_log.dropped(),
        "broadcaster stopped"
    );

    // Remaining handles live in scheduler-owned tasks; don't wait on them forever.
    drop(delivery_log);
    let _ = tokio::time::timeout(std::time::Duration::from_secs(2), log_task).await;
    Ok(())
}
