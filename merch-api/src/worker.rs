use chrono::Utc;
use merch_order::SettlementEngine;
use std::sync::Arc;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, error, info};

/// Poll for due payouts forever: new ones the webhook path failed to send,
/// scheduled retries, and in-flight claims whose lease ran out.
pub async fn start_settlement_worker(engine: Arc<SettlementEngine>, poll_interval: Duration, batch_size: i64) {
    info!(
        "Settlement worker started, polling every {:?} for up to {} payouts",
        poll_interval, batch_size
    );

    let mut ticker = interval(poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        run_once(&engine, batch_size).await;
    }
}

pub async fn run_once(engine: &SettlementEngine, batch_size: i64) {
    match engine.run_due(Utc::now(), batch_size).await {
        Ok(report) if report.is_empty() => debug!("No payouts due"),
        Ok(report) => info!(?report, "Settlement pass finished"),
        Err(e) => error!("Settlement pass failed: {}", e),
    }
}
