use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::ReminderConfig;
use crate::engine::Engine;

/// Background task that enqueues reminders for upcoming reservations.
pub async fn run_reminder_scheduler(engine: Arc<Engine>, config: ReminderConfig) {
    let mut interval = tokio::time::interval(config.interval());
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        match engine
            .sweep_reminders(&config.lead_times_ms, config.tolerance_ms)
            .await
        {
            Ok(0) => {}
            Ok(n) => debug!(scheduled = n, "reminder sweep"),
            // The next sweep covers the same window again.
            Err(e) => warn!(error = %e, "reminder sweep failed"),
        }
    }
}

/// Compact the WAL when enough events piled up since the last compaction.
pub async fn compact_if_needed(engine: &Engine, threshold: u64) -> Option<usize> {
    let appends = engine.wal_appends_since_compact().await;
    if appends < threshold {
        return None;
    }
    match engine.compact_wal().await {
        Ok(events) => {
            info!(appends, events, "compaction finished");
            Some(events)
        }
        Err(e) => {
            warn!(error = %e, "compaction failed");
            None
        }
    }
}

/// Background task that checks the compaction threshold.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        compact_if_needed(&engine, threshold).await;
    }
}
