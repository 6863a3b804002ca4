use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::DateTime;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::OutboxConfig;
use crate::engine::{Engine, EngineError};
use crate::model::*;

/// A rendered notification, ready for a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub recipient: String,
    pub subject: String,
    pub body: String,
}

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("delivery timed out")]
    Timeout,
    #[error("recipient rejected: {0}")]
    Rejected(String),
    #[error("transport error: {0}")]
    Transport(String),
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn deliver(&self, message: &Message) -> Result<(), DeliveryError>;
}

/// Writes notifications to the log. Stands in for a real transport.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn deliver(&self, message: &Message) -> Result<(), DeliveryError> {
        info!(
            target: "berth::notify",
            recipient = %message.recipient,
            subject = %message.subject,
            body = %message.body,
            "notification"
        );
        Ok(())
    }
}

fn format_instant(ms: Ms) -> String {
    DateTime::from_timestamp_millis(ms)
        .map(|dt| dt.format("%Y-%m-%d %H:%M UTC").to_string())
        .unwrap_or_else(|| ms.to_string())
}

fn format_lead(lead: Ms) -> String {
    match lead {
        l if l % DAY_MS == 0 => format!("{} day(s)", l / DAY_MS),
        l if l % HOUR_MS == 0 => format!("{} hour(s)", l / HOUR_MS),
        l => format!("{} minute(s)", l / MINUTE_MS),
    }
}

/// Resolve an entry's references into readable text.
pub async fn render(engine: &Engine, entry: &OutboxEntry) -> Message {
    let p = &entry.payload;
    let resource = engine
        .resource_name(p.resource_id)
        .await
        .unwrap_or_else(|| p.resource_id.to_string());
    let when = p
        .starts_at
        .map(|t| format!(" on {}", format_instant(t)))
        .unwrap_or_default();

    let (subject, body) = match entry.kind {
        NotificationKind::Confirmation => (
            format!("Confirmed: {resource}"),
            format!("Your reservation {} for {resource}{when} is confirmed.", p.reservation_id),
        ),
        NotificationKind::Waitlisted => (
            format!("Waitlisted: {resource}"),
            format!(
                "{resource}{when} is full. You are number {} on the waitlist.",
                p.position.unwrap_or_default()
            ),
        ),
        NotificationKind::Promoted => (
            format!("A place opened up: {resource}"),
            format!(
                "You have been moved off the waitlist. Reservation {} for {resource}{when} is now confirmed.",
                p.reservation_id
            ),
        ),
        NotificationKind::Reminder { lead } => (
            format!("Reminder: {resource} in {}", format_lead(lead)),
            format!("Reservation {} for {resource}{when} starts soon.", p.reservation_id),
        ),
    };
    Message {
        recipient: p.participant.clone(),
        subject,
        body,
    }
}

/// Entries that should be retired without contacting the participant.
async fn skip_reason(engine: &Engine, entry: &OutboxEntry) -> Option<&'static str> {
    if entry.payload.silent {
        return Some("participant opted out");
    }
    if let NotificationKind::Reminder { .. } = entry.kind {
        match engine.get_reservation(entry.payload.reservation_id).await {
            Ok((r, _)) if r.status == Status::Confirmed => {}
            Ok(_) => return Some("reservation no longer confirmed"),
            Err(EngineError::NotFound(_)) => return Some("reservation gone"),
            Err(_) => {}
        }
    }
    None
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryStats {
    pub sent: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Try up to `batch_size` due entries once each. Entries are claimed one at
/// a time right before delivery, so a lease only has to outlive a single
/// attempt, however slow the ones before it were.
pub async fn deliver_once(
    engine: &Engine,
    notifier: &dyn Notifier,
    batch_size: usize,
    timeout: Duration,
) -> DeliveryStats {
    let mut stats = DeliveryStats::default();
    for _ in 0..batch_size {
        let Some(entry) = engine.outbox_next_batch(1).pop() else {
            break;
        };
        let result = match skip_reason(engine, &entry).await {
            Some(reason) => {
                debug!(id = %entry.id, kind = entry.kind.as_str(), reason, "notification skipped");
                stats.skipped += 1;
                engine.outbox_mark_delivered(entry.id).await
            }
            None => {
                let message = render(engine, &entry).await;
                let sent = match tokio::time::timeout(timeout, notifier.deliver(&message)).await {
                    Ok(r) => r,
                    Err(_) => Err(DeliveryError::Timeout),
                };
                match sent {
                    Ok(()) => {
                        stats.sent += 1;
                        engine.outbox_mark_delivered(entry.id).await
                    }
                    Err(e) => {
                        stats.failed += 1;
                        warn!(id = %entry.id, attempts = entry.attempts + 1, error = %e, "delivery failed");
                        engine.outbox_mark_failed(entry.id, &e.to_string()).await
                    }
                }
            }
        };
        if let Err(e) = result {
            // Another worker may have retired the entry after our lease lapsed.
            warn!(id = %entry.id, error = %e, "could not record delivery outcome");
        }
    }
    stats
}

/// Background task that drains the outbox.
pub async fn run_delivery_worker(engine: Arc<Engine>, notifier: Arc<dyn Notifier>, config: OutboxConfig) {
    let mut interval = tokio::time::interval(config.poll_interval());
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        let stats = deliver_once(
            &engine,
            notifier.as_ref(),
            config.batch_size,
            config.delivery_timeout(),
        )
        .await;
        if stats != DeliveryStats::default() {
            debug!(?stats, "outbox batch processed");
        }
        metrics::gauge!(crate::observability::OUTBOX_PENDING).set(engine.outbox_len() as f64);
    }
}
