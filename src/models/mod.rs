use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A stop event younger than this still counts as "waiting for the user".
pub const WAITING_FOR_USER_WINDOW_MINUTES: i64 = 2;

/// A stop event older than this marks the session inactive.
pub const IDLE_WINDOW_MINUTES: i64 = 30;

/// One metered billing window reported by the external usage source.
///
/// Immutable once closed (`is_active == false`); an open block may be
/// re-fetched with updated totals on later polls.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BillingSession {
    pub id: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    pub cost_usd: f64,
    pub is_active: bool,
}

impl BillingSession {
    /// Range-based currency check: a session counts as current when `now`
    /// falls inside `[period_start, end_time]`, end inclusive. Open sessions
    /// (no end time) are current whenever they started inside the period.
    pub fn is_current(&self, period_start: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        if self.start_time < period_start {
            return false;
        }
        match self.end_time {
            Some(end) => period_start <= now && now <= end,
            None => self.start_time <= now,
        }
    }
}

/// Event kinds accepted from the hook log.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum HookEventKind {
    Activity,
    Stop,
    Notification,
}

/// One validated line from the append-only hook event log.
#[derive(Clone, Serialize, Deserialize)]
pub struct HookEvent {
    pub timestamp: DateTime<Utc>,
    pub project_name: String,
    pub session_id: String,
    pub event_type: HookEventKind,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl fmt::Debug for HookEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookEvent")
            .field("timestamp", &self.timestamp)
            .field("project_name", &self.project_name)
            .field("session_id", &"[REDACTED]") // Redact session ID for privacy
            .field("event_type", &self.event_type)
            .finish()
    }
}

/// Derived engagement state of an activity session.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    WaitingForUser,
    Idle,
    Inactive,
}

impl SessionStatus {
    /// Pure transition function over `(last event kind, elapsed since it)`.
    ///
    /// A stop event fires after every completed response, not only at session
    /// end, so elapsed time since the stop carries the engagement signal.
    /// Notification events never drive the state machine and are treated like
    /// a stop here.
    pub fn derive(last_event: HookEventKind, elapsed: Duration) -> Self {
        match last_event {
            HookEventKind::Activity => SessionStatus::Active,
            HookEventKind::Stop | HookEventKind::Notification => {
                if elapsed < Duration::minutes(WAITING_FOR_USER_WINDOW_MINUTES) {
                    SessionStatus::WaitingForUser
                } else if elapsed < Duration::minutes(IDLE_WINDOW_MINUTES) {
                    SessionStatus::Idle
                } else {
                    SessionStatus::Inactive
                }
            }
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SessionStatus::Active => "ACTIVE",
            SessionStatus::WaitingForUser => "WAITING",
            SessionStatus::Idle => "IDLE",
            SessionStatus::Inactive => "INACTIVE",
        };
        write!(f, "{label}")
    }
}

/// One logical unit of live work, keyed by project name.
///
/// The underlying tool rotates its session id within a continuous work
/// session, so the project name is the stable key and the session id is
/// informational only.
#[derive(Clone, Serialize, Deserialize)]
pub struct ActivitySession {
    pub project_name: String,
    pub last_session_id: String,
    pub created_at: DateTime<Utc>,
    pub last_event_time: DateTime<Utc>,
    pub last_event_kind: HookEventKind,
    pub event_count: u32,
    pub status: SessionStatus,
}

impl ActivitySession {
    /// Recompute `status` from the last event and `now`. Called before every
    /// read so the stored value is never stale.
    pub fn refresh_status(&mut self, now: DateTime<Utc>) {
        self.status = SessionStatus::derive(self.last_event_kind, now - self.last_event_time);
    }
}

impl fmt::Debug for ActivitySession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActivitySession")
            .field("project_name", &self.project_name)
            .field("last_session_id", &"[REDACTED]") // Redact session ID for privacy
            .field("created_at", &self.created_at)
            .field("last_event_time", &self.last_event_time)
            .field("last_event_kind", &self.last_event_kind)
            .field("event_count", &self.event_count)
            .field("status", &self.status)
            .finish()
    }
}

/// Highest token count and cost ever observed, persisted across restarts.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
pub struct HistoricalMaxima {
    pub max_tokens: u64,
    pub max_cost_usd: f64,
}

impl HistoricalMaxima {
    /// Monotonic update: a new value is adopted only when it is higher.
    pub fn observe(&mut self, tokens: u64, cost_usd: f64) {
        if tokens > self.max_tokens {
            self.max_tokens = tokens;
        }
        if cost_usd > self.max_cost_usd {
            self.max_cost_usd = cost_usd;
        }
    }

    pub fn is_known(&self) -> bool {
        self.max_tokens > 0 || self.max_cost_usd > 0.0
    }
}

/// Degraded-state descriptor surfaced after repeated fetch failures.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SnapshotError {
    pub message: String,
    pub consecutive_failures: u32,
}

/// The merged, persisted view read by display clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringSnapshot {
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
    pub billing_sessions: Vec<BillingSession>,
    pub maxima: HistoricalMaxima,
    pub activity_sessions: Vec<ActivitySession>,
    pub last_updated: DateTime<Utc>,
    pub error: Option<SnapshotError>,
}

/// Alert categories routed through the notification rate limiter.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    TokenThreshold,
    CostThreshold,
    LongSession,
    DegradedSource,
}

impl fmt::Display for AlertKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            AlertKind::TokenThreshold => "token-threshold",
            AlertKind::CostThreshold => "cost-threshold",
            AlertKind::LongSession => "long-session",
            AlertKind::DegradedSource => "degraded-source",
        };
        write!(f, "{label}")
    }
}

/// Alert thresholds and per-kind cooldowns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertConfig {
    /// Alert when period tokens exceed this fraction of the historical max.
    pub token_threshold: f64,
    /// Alert when period cost exceeds this fraction of the historical max.
    pub cost_threshold: f64,
    /// Alert when one activity session stays engaged this long.
    pub long_session_minutes: i64,
    pub cooldown_usage_seconds: u64,
    pub cooldown_long_session_seconds: u64,
    pub cooldown_degraded_seconds: u64,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            token_threshold: 0.9,
            cost_threshold: 0.9,
            long_session_minutes: 120,
            cooldown_usage_seconds: 3600,
            cooldown_long_session_seconds: 1800,
            cooldown_degraded_seconds: 600,
        }
    }
}

impl AlertConfig {
    pub fn cooldown_for(&self, kind: AlertKind) -> Duration {
        let secs = match kind {
            AlertKind::TokenThreshold | AlertKind::CostThreshold => self.cooldown_usage_seconds,
            AlertKind::LongSession => self.cooldown_long_session_seconds,
            AlertKind::DegradedSource => self.cooldown_degraded_seconds,
        };
        Duration::seconds(secs as i64)
    }
}

/// Daemon configuration, immutable for the process lifetime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Day of month (1-31) the billing period starts on.
    pub billing_start_day: u32,
    pub poll_interval_seconds: u64,
    /// How long a fetched usage result stays fresh between polls.
    pub usage_cache_seconds: u64,
    /// Safety overlap subtracted from the incremental fetch lower bound.
    pub fetch_overlap_minutes: i64,
    pub process_timeout_seconds: u64,
    /// Consecutive fetch failures before the snapshot is flagged degraded.
    pub max_consecutive_failures: u32,
    /// Event counter cap per activity session.
    pub max_events_per_session: u32,
    pub project_cache_max_entries: usize,
    pub project_cache_min_retention_minutes: i64,
    pub alerts: AlertConfig,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            billing_start_day: 1,
            poll_interval_seconds: 10,
            usage_cache_seconds: 10,
            fetch_overlap_minutes: 60,
            process_timeout_seconds: 30,
            max_consecutive_failures: 5,
            max_events_per_session: 500,
            project_cache_max_entries: 64,
            project_cache_min_retention_minutes: 30,
            alerts: AlertConfig::default(),
        }
    }
}

impl MonitorConfig {
    /// Startup validation; configuration errors are the only fatal errors.
    pub fn validate(&self) -> Result<(), String> {
        if !(1..=31).contains(&self.billing_start_day) {
            return Err(format!(
                "billing_start_day must be 1-31, got {}",
                self.billing_start_day
            ));
        }
        if self.poll_interval_seconds == 0 {
            return Err("poll_interval_seconds must be positive".to_string());
        }
        if self.max_events_per_session == 0 {
            return Err("max_events_per_session must be positive".to_string());
        }
        Ok(())
    }

    /// Full duration of the billing window containing `today`.
    pub fn billing_window(&self, today: NaiveDate) -> Duration {
        crate::services::billing_period::billing_period(today, self.billing_start_day).duration()
    }
}
