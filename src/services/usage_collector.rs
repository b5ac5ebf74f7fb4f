use crate::models::{BillingSession, HistoricalMaxima, MonitorConfig, SnapshotError};
use crate::services::billing_period::{billing_period, BillingPeriod};
use crate::services::fetch_pool::{FetchOutcome, FetchPool};
use crate::services::usage_executor::RawUsageBlock;
use crate::services::UsageSource;
use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
use std::collections::HashMap;
use std::sync::Arc;

/// Fetch key for the pool: there is exactly one logical usage fetch, so a
/// forced rescan racing a scheduled poll joins it instead of spawning a
/// second external process.
const USAGE_FETCH_KEY: &str = "usage-blocks";

/// How a poll's fetch bounds its query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchStrategy {
    /// No lower bound; only when maxima are unknown or a recalculation is
    /// forced.
    FullRescan,
    /// Lower bound at the current period start, right after a rollover.
    PeriodBoundary,
    /// Lower bound at the last successful fetch minus the safety overlap.
    Incremental,
}

/// The collector's per-poll output.
#[derive(Debug, Clone)]
pub struct UsageReport {
    pub period: BillingPeriod,
    pub sessions: Vec<BillingSession>,
    pub maxima: HistoricalMaxima,
    pub error: Option<SnapshotError>,
}

impl UsageReport {
    /// Sessions current right now, range-based (see
    /// [`BillingSession::is_current`]).
    pub fn current_sessions(&self, now: DateTime<Utc>) -> Vec<&BillingSession> {
        let period_start = period_start_instant(self.period.start);
        self.sessions
            .iter()
            .filter(|s| s.is_current(period_start, now))
            .collect()
    }
}

/// Orchestrates usage fetches: strategy selection, gap and period filtering,
/// historical maxima, the poll cache, and failure degradation.
///
/// `collect` never raises past this call; failures keep the last good
/// cache and are counted toward the degraded flag.
pub struct UsageCollector<S: UsageSource + 'static> {
    source: Arc<S>,
    pool: Arc<FetchPool<Option<Vec<RawUsageBlock>>>>,
    config: MonitorConfig,
    /// Sessions known for the current period, by block id. Incremental
    /// fetches upsert into this; rescans replace it.
    sessions: HashMap<String, BillingSession>,
    maxima: HistoricalMaxima,
    last_fetch_time: Option<DateTime<Utc>>,
    last_period_start: Option<NaiveDate>,
    last_report: Option<(DateTime<Utc>, UsageReport)>,
    consecutive_failures: u32,
    force_rescan: bool,
}

impl<S: UsageSource + 'static> UsageCollector<S> {
    pub fn new(
        source: Arc<S>,
        pool: Arc<FetchPool<Option<Vec<RawUsageBlock>>>>,
        config: MonitorConfig,
    ) -> Self {
        Self {
            source,
            pool,
            config,
            sessions: HashMap::new(),
            maxima: HistoricalMaxima::default(),
            last_fetch_time: None,
            last_period_start: None,
            last_report: None,
            consecutive_failures: 0,
            force_rescan: false,
        }
    }

    /// Seed maxima from a previous snapshot so they survive restarts.
    pub fn seed_maxima(&mut self, maxima: HistoricalMaxima) {
        self.maxima.observe(maxima.max_tokens, maxima.max_cost_usd);
    }

    /// Request a full rescan on the next poll.
    pub fn force_rescan(&mut self) {
        self.force_rescan = true;
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// One poll. Returns the freshest report available; the cached one when
    /// it has not expired, so several consumers inside one tick share a
    /// single external-process invocation.
    pub async fn collect(&mut self, now: DateTime<Utc>) -> UsageReport {
        if let Some((fetched_at, report)) = &self.last_report {
            if now - *fetched_at < Duration::seconds(self.config.usage_cache_seconds as i64) {
                return report.clone();
            }
        }

        let today = now.date_naive();
        let period = billing_period(today, self.config.billing_start_day);
        let strategy = self.select_strategy(period.start);
        let since = self.lower_bound(strategy, period.start);
        log::debug!("Usage poll: {strategy:?}, since {since:?}");

        let source = Arc::clone(&self.source);
        let outcome = self
            .pool
            .submit(USAGE_FETCH_KEY, async move { source.fetch(since).await })
            .await;

        match outcome {
            FetchOutcome::Completed(Some(blocks)) => {
                self.apply_fetch(strategy, blocks, period, now);
            }
            FetchOutcome::Completed(None) => self.record_failure("usage command returned no data"),
            FetchOutcome::TimedOut => self.record_failure("usage fetch timed out"),
            FetchOutcome::Cancelled => self.record_failure("usage fetch cancelled"),
        }

        let report = self.build_report(period);
        self.last_report = Some((now, report.clone()));
        report
    }

    fn select_strategy(&self, period_start: NaiveDate) -> FetchStrategy {
        if self.force_rescan || !self.maxima.is_known() {
            FetchStrategy::FullRescan
        } else if self.last_period_start != Some(period_start) {
            FetchStrategy::PeriodBoundary
        } else {
            FetchStrategy::Incremental
        }
    }

    fn lower_bound(&self, strategy: FetchStrategy, period_start: NaiveDate) -> Option<NaiveDate> {
        match strategy {
            FetchStrategy::FullRescan => None,
            FetchStrategy::PeriodBoundary => Some(period_start),
            FetchStrategy::Incremental => {
                let overlap = Duration::minutes(self.config.fetch_overlap_minutes);
                self.last_fetch_time
                    .map(|t| (t - overlap).date_naive())
                    .or(Some(period_start))
            }
        }
    }

    fn apply_fetch(
        &mut self,
        strategy: FetchStrategy,
        blocks: Vec<RawUsageBlock>,
        period: BillingPeriod,
        now: DateTime<Utc>,
    ) {
        let period_start = period_start_instant(period.start);
        let fetched: Vec<BillingSession> = blocks
            .into_iter()
            .filter(|b| !b.is_gap)
            .filter_map(RawUsageBlock::into_billing_session)
            .filter(|s| s.start_time >= period_start)
            .collect();

        // Rescans and rollovers redefine the period's truth; incremental
        // results upsert so earlier blocks survive between polls.
        if strategy != FetchStrategy::Incremental {
            self.sessions.clear();
        }
        for session in fetched {
            self.sessions.insert(session.id.clone(), session);
        }
        // Period rollover may also leave stale entries behind after an
        // incremental poll raced the boundary.
        self.sessions.retain(|_, s| s.start_time >= period_start);

        for session in self.sessions.values() {
            self.maxima.observe(session.total_tokens, session.cost_usd);
        }

        self.last_fetch_time = Some(now);
        self.last_period_start = Some(period.start);
        self.consecutive_failures = 0;
        self.force_rescan = false;
    }

    fn record_failure(&mut self, reason: &str) {
        self.consecutive_failures += 1;
        log::warn!(
            "Usage fetch failed ({reason}); consecutive failures: {}",
            self.consecutive_failures
        );
    }

    fn build_report(&self, period: BillingPeriod) -> UsageReport {
        let mut sessions: Vec<BillingSession> = self.sessions.values().cloned().collect();
        sessions.sort_by(|a, b| a.start_time.cmp(&b.start_time));

        let error = if self.consecutive_failures >= self.config.max_consecutive_failures {
            Some(SnapshotError {
                message: "usage data source unavailable".to_string(),
                consecutive_failures: self.consecutive_failures,
            })
        } else {
            None
        };

        UsageReport {
            period,
            sessions,
            maxima: self.maxima,
            error,
        }
    }
}

/// Midnight UTC at the period's first day.
fn period_start_instant(start: NaiveDate) -> DateTime<Utc> {
    Utc.from_utc_datetime(&start.and_hms_opt(0, 0, 0).expect("midnight is valid"))
}
