pub mod activity_tracker;
pub mod billing_period;
pub mod fetch_pool;
pub mod hook_log;
pub mod notifier;
pub mod project_cache;
pub mod snapshot_store;
pub mod usage_collector;
pub mod usage_executor;

use crate::models::AlertKind;
use anyhow::Result;
use chrono::NaiveDate;

use self::usage_executor::RawUsageBlock;

/// A source of raw usage blocks (the external CLI, or a fake in tests).
///
/// Implementations absorb their own failures instead of raising: `None`
/// means "no data this cycle" (every acquisition path failed), while
/// `Some(vec![])` is a genuinely empty result. The distinction feeds the
/// collector's consecutive-failure counter.
pub trait UsageSource: Send + Sync {
    fn fetch(
        &self,
        since: Option<NaiveDate>,
    ) -> impl std::future::Future<Output = Option<Vec<RawUsageBlock>>> + Send;
}

/// Delivery seam for alerts that pass the rate limiter.
///
/// OS-level delivery (notify-send, terminal bells, push relays) lives behind
/// this trait in external collaborator processes; the in-tree sink logs.
pub trait NotificationSink: Send + Sync {
    fn deliver(&self, kind: AlertKind, message: &str) -> Result<()>;
}

/// Sink that writes alerts to the log stream.
#[derive(Debug, Default, Clone)]
pub struct LogNotificationSink;

impl NotificationSink for LogNotificationSink {
    fn deliver(&self, kind: AlertKind, message: &str) -> Result<()> {
        log::info!("[alert:{kind}] {message}");
        Ok(())
    }
}
