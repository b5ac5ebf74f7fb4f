use crate::models::{ActivitySession, HookEvent, HookEventKind};
use crate::services::hook_log;
use crate::services::project_cache::ProjectIdentityCache;
use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tokio::fs;

/// Fingerprint of the log file at the last parse. Size is tracked alongside
/// mtime because coarse filesystem timestamps can miss rapid appends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct LogStamp {
    modified: SystemTime,
    len: u64,
}

/// Maintains one activity session per project from the hook event log.
///
/// Sessions are keyed by project name: the underlying tool's session id
/// rotates within a continuous work session, and keying by it would
/// fragment one logical session into many.
pub struct ActivityTracker {
    log_path: PathBuf,
    sessions: HashMap<String, ActivitySession>,
    last_stamp: Option<LogStamp>,
    max_events_per_session: u32,
}

impl ActivityTracker {
    pub fn new(log_path: PathBuf, max_events_per_session: u32) -> Self {
        Self {
            log_path,
            sessions: HashMap::new(),
            last_stamp: None,
            max_events_per_session,
        }
    }

    /// Re-read the log if it changed, merge events, recompute statuses and
    /// run billing-window cleanup. Hook events that report a working
    /// directory instead of a project name are resolved through `projects`.
    /// Returns the projects whose last event time advanced: the "new
    /// activity" signal for alert suppression resets.
    pub async fn refresh(
        &mut self,
        now: DateTime<Utc>,
        billing_window: Duration,
        projects: &mut ProjectIdentityCache,
    ) -> Result<Vec<String>> {
        let mut advanced = Vec::new();

        if let Some(stamp) = self.current_stamp().await? {
            if self.last_stamp != Some(stamp) {
                let events = hook_log::read_events(&self.log_path).await?;
                advanced = self.rebuild(&events, projects, now);
                self.last_stamp = Some(stamp);
            }
        } else {
            // Log absent: nothing to parse, keep in-memory state.
            self.last_stamp = None;
        }

        for session in self.sessions.values_mut() {
            session.refresh_status(now);
        }

        self.cleanup(now, billing_window).await?;
        Ok(advanced)
    }

    /// Sessions sorted most-recently-active first.
    pub fn sessions(&self) -> Vec<ActivitySession> {
        let mut sessions: Vec<ActivitySession> = self.sessions.values().cloned().collect();
        sessions.sort_by(|a, b| b.last_event_time.cmp(&a.last_event_time));
        sessions
    }

    async fn current_stamp(&self) -> Result<Option<LogStamp>> {
        match fs::metadata(&self.log_path).await {
            Ok(meta) => {
                let modified = meta
                    .modified()
                    .with_context(|| format!("no mtime for {}", self.log_path.display()))?;
                Ok(Some(LogStamp {
                    modified,
                    len: meta.len(),
                }))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("stat failed for {}", self.log_path.display())),
        }
    }

    /// Rebuild the session map from a full log parse. The map is a pure
    /// function of the log contents, so a rebuild and an incremental merge
    /// agree; rebuild keeps truncation and reordering trivially correct.
    fn rebuild(
        &mut self,
        events: &[HookEvent],
        projects: &mut ProjectIdentityCache,
        now: DateTime<Utc>,
    ) -> Vec<String> {
        let previous: HashMap<String, DateTime<Utc>> = self
            .sessions
            .iter()
            .map(|(name, s)| (name.clone(), s.last_event_time))
            .collect();

        self.sessions.clear();
        for event in events {
            // Hooks pass $PWD when they have no better name; map it onto a
            // stable project identity so subdirectories merge correctly.
            let project_name = if Path::new(&event.project_name).is_absolute() {
                projects.resolve(Path::new(&event.project_name), now)
            } else {
                event.project_name.clone()
            };
            self.apply_event(event, project_name);
        }

        self.sessions
            .values()
            .filter(|s| match previous.get(&s.project_name) {
                Some(last) => s.last_event_time > *last,
                None => true,
            })
            .map(|s| s.project_name.clone())
            .collect()
    }

    fn apply_event(&mut self, event: &HookEvent, project_name: String) {
        let session = self
            .sessions
            .entry(project_name.clone())
            .or_insert_with(|| ActivitySession {
                project_name,
                last_session_id: event.session_id.clone(),
                created_at: event.timestamp,
                last_event_time: event.timestamp,
                last_event_kind: event.event_type,
                event_count: 0,
                status: crate::models::SessionStatus::Inactive,
            });

        if event.timestamp >= session.last_event_time {
            session.last_event_time = event.timestamp;
            session.last_session_id = event.session_id.clone();
            // Notification events are informational; they never drive the
            // state machine.
            if event.event_type != HookEventKind::Notification {
                session.last_event_kind = event.event_type;
            }
        }
        // Saturating counter is the compaction: oldest events survive only
        // as part of the count.
        if session.event_count < self.max_events_per_session {
            session.event_count += 1;
        }
    }

    /// Once every session's last event is older than the billing window, the
    /// log has nothing left worth replaying: truncate it in place (the hook
    /// process keeps its write handle) and drop all records. If only some
    /// sessions are old, drop just those and leave the log untouched.
    async fn cleanup(&mut self, now: DateTime<Utc>, billing_window: Duration) -> Result<()> {
        if self.sessions.is_empty() {
            return Ok(());
        }
        let cutoff = now - billing_window;
        let all_expired = self
            .sessions
            .values()
            .all(|s| s.last_event_time < cutoff);

        if all_expired {
            log::info!(
                "All {} activity sessions aged out; truncating hook log",
                self.sessions.len()
            );
            self.truncate_log().await?;
            self.sessions.clear();
            self.last_stamp = None;
        } else {
            let before = self.sessions.len();
            self.sessions.retain(|_, s| s.last_event_time >= cutoff);
            let dropped = before - self.sessions.len();
            if dropped > 0 {
                log::debug!("Dropped {dropped} expired activity sessions");
            }
        }
        Ok(())
    }

    async fn truncate_log(&self) -> Result<()> {
        if !self.log_path.exists() {
            return Ok(());
        }
        fs::OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(&self.log_path)
            .await
            .with_context(|| format!("failed to truncate {}", self.log_path.display()))?;
        Ok(())
    }
}
