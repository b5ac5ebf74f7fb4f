use crate::models::MonitoringSnapshot;
use anyhow::{Context, Result};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Persists the merged snapshot for external display clients.
///
/// Writes go to a temp file in the same directory followed by a rename, so
/// a concurrent reader always observes either the previous complete
/// snapshot or the next one, never a torn write.
pub struct SnapshotStore {
    path: PathBuf,
}

impl SnapshotStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn save(&self, snapshot: &MonitoringSnapshot) -> Result<()> {
        let content =
            serde_json::to_string_pretty(snapshot).context("failed to serialize snapshot")?;

        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;

        let mut tmp = tempfile::NamedTempFile::new_in(dir)
            .context("failed to create snapshot temp file")?;
        tmp.write_all(content.as_bytes())
            .context("failed to write snapshot temp file")?;
        tmp.flush().context("failed to flush snapshot temp file")?;
        tmp.persist(&self.path)
            .map_err(|e| e.error)
            .with_context(|| format!("failed to persist {}", self.path.display()))?;

        Ok(())
    }

    /// Tolerant read: a missing or corrupt snapshot yields `None`, never an
    /// error; display clients and a restarting daemon both survive it.
    pub fn load(&self) -> Option<MonitoringSnapshot> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                log::warn!("Failed to read snapshot {}: {e}", self.path.display());
                return None;
            }
        };
        match serde_json::from_str(&content) {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                log::warn!("Discarding corrupt snapshot {}: {e}", self.path.display());
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{HistoricalMaxima, MonitoringSnapshot};
    use chrono::{NaiveDate, Utc};
    use tempfile::TempDir;

    fn sample_snapshot() -> MonitoringSnapshot {
        MonitoringSnapshot {
            period_start: NaiveDate::from_ymd_opt(2025, 6, 17).unwrap(),
            period_end: NaiveDate::from_ymd_opt(2025, 7, 17).unwrap(),
            billing_sessions: Vec::new(),
            maxima: HistoricalMaxima {
                max_tokens: 12345,
                max_cost_usd: 9.5,
            },
            activity_sessions: Vec::new(),
            last_updated: Utc::now(),
            error: None,
        }
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = TempDir::new().unwrap();
        let store = SnapshotStore::new(dir.path().join("snapshot.json"));

        store.save(&sample_snapshot()).unwrap();
        let loaded = store.load().unwrap();

        assert_eq!(loaded.maxima.max_tokens, 12345);
        assert_eq!(
            loaded.period_start,
            NaiveDate::from_ymd_opt(2025, 6, 17).unwrap()
        );
    }

    #[test]
    fn missing_file_loads_as_none() {
        let dir = TempDir::new().unwrap();
        let store = SnapshotStore::new(dir.path().join("absent.json"));
        assert!(store.load().is_none());
    }

    #[test]
    fn corrupt_file_loads_as_none() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("snapshot.json");
        std::fs::write(&path, "{ half a snapsh").unwrap();

        let store = SnapshotStore::new(path);
        assert!(store.load().is_none());
    }

    #[test]
    fn save_creates_missing_parent_directories() {
        let dir = TempDir::new().unwrap();
        let store = SnapshotStore::new(dir.path().join("nested/deeper/snapshot.json"));
        store.save(&sample_snapshot()).unwrap();
        assert!(store.load().is_some());
    }

    #[test]
    fn overwrite_replaces_previous_snapshot_completely() {
        let dir = TempDir::new().unwrap();
        let store = SnapshotStore::new(dir.path().join("snapshot.json"));

        store.save(&sample_snapshot()).unwrap();
        let mut second = sample_snapshot();
        second.maxima.max_tokens = 99999;
        store.save(&second).unwrap();

        assert_eq!(store.load().unwrap().maxima.max_tokens, 99999);
    }
}
