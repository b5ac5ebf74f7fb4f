use crate::models::{AlertKind, MonitorConfig, MonitoringSnapshot};
use crate::services::activity_tracker::ActivityTracker;
use crate::services::fetch_pool::FetchPool;
use crate::services::notifier::NotificationRateLimiter;
use crate::services::project_cache::ProjectIdentityCache;
use crate::services::snapshot_store::SnapshotStore;
use crate::services::usage_collector::{UsageCollector, UsageReport};
use crate::services::usage_executor::RawUsageBlock;
use crate::services::{NotificationSink, UsageSource};
use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tokio::sync::watch;
use tokio::time::interval;

/// Where the daemon's files live under the data directory.
#[derive(Debug, Clone)]
pub struct DaemonPaths {
    pub snapshot: PathBuf,
    pub hook_log: PathBuf,
    pub project_cache: PathBuf,
}

impl DaemonPaths {
    pub fn under(data_dir: &Path) -> Self {
        Self {
            snapshot: data_dir.join("snapshot.json"),
            hook_log: data_dir.join("hook-events.jsonl"),
            project_cache: data_dir.join("projects.json"),
        }
    }
}

/// The long-lived control loop tying the services together.
///
/// One tick: poll usage (through the collector's cache), refresh activity
/// from the hook log, evaluate alerts through the rate limiter, write the
/// merged snapshot. The daemon is the sole writer of the snapshot file and
/// only ever truncates (never appends to) the hook log. Nothing inside the
/// loop is permitted to terminate the process.
pub struct MonitorDaemon<S: UsageSource + 'static, N: NotificationSink> {
    config: MonitorConfig,
    collector: UsageCollector<S>,
    tracker: ActivityTracker,
    projects: ProjectIdentityCache,
    limiter: NotificationRateLimiter,
    sink: N,
    store: SnapshotStore,
    pool: Arc<FetchPool<Option<Vec<RawUsageBlock>>>>,
}

impl<S: UsageSource + 'static, N: NotificationSink> MonitorDaemon<S, N> {
    pub fn new(config: MonitorConfig, paths: DaemonPaths, source: Arc<S>, sink: N) -> Self {
        // One slot for the scheduled poll, one for a forced rescan racing it.
        let pool = Arc::new(FetchPool::new(
            2,
            StdDuration::from_secs(config.process_timeout_seconds + 5),
        ));
        let store = SnapshotStore::new(paths.snapshot);
        let mut collector = UsageCollector::new(Arc::clone(&source), Arc::clone(&pool), config.clone());
        if let Some(previous) = store.load() {
            log::info!(
                "Seeding historical maxima from previous snapshot ({} tokens, ${:.2})",
                previous.maxima.max_tokens,
                previous.maxima.max_cost_usd
            );
            collector.seed_maxima(previous.maxima);
        }
        let tracker = ActivityTracker::new(paths.hook_log, config.max_events_per_session);
        let projects = ProjectIdentityCache::load(
            paths.project_cache,
            config.project_cache_max_entries,
            Duration::minutes(config.project_cache_min_retention_minutes),
        );
        let limiter = NotificationRateLimiter::new(config.alerts.clone());

        Self {
            config,
            collector,
            tracker,
            projects,
            limiter,
            sink,
            store,
            pool,
        }
    }

    /// Run until the shutdown flag flips. Tick errors are logged and
    /// absorbed; the loop itself never fails.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut ticker = interval(StdDuration::from_secs(self.config.poll_interval_seconds));
        log::info!(
            "Monitoring started: poll every {}s, billing day {}",
            self.config.poll_interval_seconds,
            self.config.billing_start_day
        );

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.tick(Utc::now()).await {
                        log::error!("Poll cycle failed: {e:#}");
                    }
                }
            }
        }

        self.pool.shutdown();
        log::info!("Monitoring stopped");
        Ok(())
    }

    /// One poll cycle. Public so tests can drive the daemon with a
    /// controlled clock.
    pub async fn tick(&mut self, now: DateTime<Utc>) -> Result<()> {
        let report = self.collector.collect(now).await;

        let window = self.config.billing_window(now.date_naive());
        let advanced = match self
            .tracker
            .refresh(now, window, &mut self.projects)
            .await
        {
            Ok(advanced) => advanced,
            Err(e) => {
                log::warn!("Activity refresh failed: {e:#}");
                Vec::new()
            }
        };

        if self.projects.take_dirty() {
            if let Err(e) = self.projects.save() {
                log::warn!("Project cache save failed: {e:#}");
            }
        }

        self.evaluate_alerts(&report, &advanced, now);
        self.limiter.sweep(now);

        let snapshot = MonitoringSnapshot {
            period_start: report.period.start,
            period_end: report.period.end,
            billing_sessions: report.sessions.clone(),
            maxima: report.maxima,
            activity_sessions: self.tracker.sessions(),
            last_updated: now,
            error: report.error.clone(),
        };
        self.store.save(&snapshot)?;

        Ok(())
    }

    fn evaluate_alerts(&mut self, report: &UsageReport, advanced: &[String], now: DateTime<Utc>) {
        // Genuine new activity lifts long-session suppression for those
        // projects so the alert can legitimately repeat.
        for project in advanced {
            let needle = format!("'{project}'");
            self.limiter
                .reset_where(AlertKind::LongSession, |message| message.contains(&needle));
        }

        if let Some(error) = &report.error {
            let message = format!(
                "usage data source unavailable ({} consecutive failures)",
                error.consecutive_failures
            );
            self.send(AlertKind::DegradedSource, &message, now);
        }

        let maxima = report.maxima;
        for session in report.current_sessions(now) {
            if maxima.max_tokens > 0 {
                let fraction = session.total_tokens as f64 / maxima.max_tokens as f64;
                if fraction >= self.config.alerts.token_threshold {
                    let message = format!(
                        "billing session {} reached {:.0}% of the all-time token high",
                        session.id,
                        self.config.alerts.token_threshold * 100.0
                    );
                    self.send(AlertKind::TokenThreshold, &message, now);
                }
            }
            if maxima.max_cost_usd > 0.0 {
                let fraction = session.cost_usd / maxima.max_cost_usd;
                if fraction >= self.config.alerts.cost_threshold {
                    let message = format!(
                        "billing session {} reached {:.0}% of the all-time cost high",
                        session.id,
                        self.config.alerts.cost_threshold * 100.0
                    );
                    self.send(AlertKind::CostThreshold, &message, now);
                }
            }
        }

        let long_session = Duration::minutes(self.config.alerts.long_session_minutes);
        for session in self.tracker.sessions() {
            use crate::models::SessionStatus::{Active, WaitingForUser};
            let engaged = matches!(session.status, Active | WaitingForUser);
            if engaged && now - session.created_at >= long_session {
                let message = format!(
                    "session '{}' has been running for over {} minutes",
                    session.project_name, self.config.alerts.long_session_minutes
                );
                self.send(AlertKind::LongSession, &message, now);
            }
        }
    }

    fn send(&mut self, kind: AlertKind, message: &str, now: DateTime<Utc>) {
        if self.limiter.should_send(kind, message, now) {
            if let Err(e) = self.sink.deliver(kind, message) {
                log::warn!("Alert delivery failed: {e:#}");
            }
        }
    }
}
