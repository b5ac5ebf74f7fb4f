use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Command;

/// Resolution record for one project: its repository root plus any
/// subdirectories observed to belong to it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectCacheEntry {
    pub git_root: PathBuf,
    #[serde(default)]
    pub aliases: Vec<PathBuf>,
    pub last_accessed: DateTime<Utc>,
}

/// On-disk shape of the cache file.
#[derive(Debug, Default, Serialize, Deserialize)]
struct CacheFile {
    #[serde(default)]
    projects: HashMap<String, ProjectCacheEntry>,
}

/// Maps working directories to stable project names.
///
/// Many-to-one: every subdirectory of a repository resolves to the same
/// project name. Reads and writes are always whole-file; the file is small
/// and access is rare relative to the poll interval.
pub struct ProjectIdentityCache {
    path: PathBuf,
    entries: HashMap<String, ProjectCacheEntry>,
    max_entries: usize,
    min_retention: Duration,
    dirty: bool,
}

impl ProjectIdentityCache {
    /// Full load; a missing or corrupt file starts an empty cache.
    pub fn load(path: PathBuf, max_entries: usize, min_retention: Duration) -> Self {
        let entries = match std::fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str::<CacheFile>(&content) {
                Ok(file) => file.projects,
                Err(e) => {
                    log::warn!("Resetting corrupt project cache {}: {e}", path.display());
                    HashMap::new()
                }
            },
            Err(_) => HashMap::new(),
        };
        Self {
            path,
            entries,
            max_entries,
            min_retention,
            dirty: false,
        }
    }

    /// True when in-memory state diverged from disk since the last save;
    /// reading it marks the cache clean again.
    pub fn take_dirty(&mut self) -> bool {
        std::mem::take(&mut self.dirty)
    }

    /// Full save, atomic.
    pub fn save(&self) -> Result<()> {
        let file = CacheFile {
            projects: self.entries.clone(),
        };
        let content =
            serde_json::to_string_pretty(&file).context("failed to serialize project cache")?;

        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir)
            .context("failed to create project cache temp file")?;
        tmp.write_all(content.as_bytes())
            .context("failed to write project cache temp file")?;
        tmp.flush().context("failed to flush project cache temp file")?;
        tmp.persist(&self.path)
            .map_err(|e| e.error)
            .with_context(|| format!("failed to persist {}", self.path.display()))?;
        Ok(())
    }

    /// Resolve a working directory to its project name, learning new
    /// projects and aliases as they appear.
    pub fn resolve(&mut self, dir: &Path, now: DateTime<Utc>) -> String {
        // Known root or alias first.
        let known = self.entries.iter().find_map(|(name, entry)| {
            if entry.git_root == dir || entry.aliases.iter().any(|a| a == dir) {
                Some(name.clone())
            } else {
                None
            }
        });
        if let Some(name) = known {
            if let Some(entry) = self.entries.get_mut(&name) {
                entry.last_accessed = now;
                self.dirty = true;
            }
            return name;
        }

        let git_root = discover_git_root(dir).unwrap_or_else(|| dir.to_path_buf());
        let name = project_name_of(&git_root);

        let entry = self
            .entries
            .entry(name.clone())
            .or_insert_with(|| ProjectCacheEntry {
                git_root: git_root.clone(),
                aliases: Vec::new(),
                last_accessed: now,
            });
        entry.last_accessed = now;
        if dir != entry.git_root && !entry.aliases.iter().any(|a| a == dir) {
            entry.aliases.push(dir.to_path_buf());
        }
        self.dirty = true;

        self.evict(now);
        name
    }

    pub fn insert(&mut self, name: String, entry: ProjectCacheEntry) {
        self.entries.insert(name, entry);
        self.dirty = true;
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Evict least-recently-accessed entries past the cap, but never one
    /// younger than the minimum retention age.
    pub fn evict(&mut self, now: DateTime<Utc>) {
        while self.entries.len() > self.max_entries {
            let cutoff = now - self.min_retention;
            let oldest = self
                .entries
                .iter()
                .filter(|(_, entry)| entry.last_accessed < cutoff)
                .min_by_key(|(_, entry)| entry.last_accessed)
                .map(|(name, _)| name.clone());
            match oldest {
                Some(name) => {
                    log::debug!("Evicting project cache entry '{name}'");
                    self.entries.remove(&name);
                    self.dirty = true;
                }
                None => break, // everything left is inside the retention age
            }
        }
    }
}

fn discover_git_root(dir: &Path) -> Option<PathBuf> {
    let output = Command::new("git")
        .arg("-C")
        .arg(dir)
        .arg("rev-parse")
        .arg("--show-toplevel")
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let root = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if root.is_empty() {
        None
    } else {
        Some(PathBuf::from(root))
    }
}

fn project_name_of(root: &Path) -> String {
    root.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| root.to_string_lossy().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn entry(accessed: DateTime<Utc>) -> ProjectCacheEntry {
        ProjectCacheEntry {
            git_root: PathBuf::from("/repo"),
            aliases: Vec::new(),
            last_accessed: accessed,
        }
    }

    fn cache(dir: &TempDir, max_entries: usize) -> ProjectIdentityCache {
        ProjectIdentityCache::load(
            dir.path().join("projects.json"),
            max_entries,
            Duration::minutes(30),
        )
    }

    #[test]
    fn resolve_falls_back_to_directory_name_outside_git() {
        let dir = TempDir::new().unwrap();
        let work = dir.path().join("my-project");
        std::fs::create_dir_all(&work).unwrap();

        let mut cache = cache(&dir, 8);
        let name = cache.resolve(&work, Utc::now());
        assert_eq!(name, "my-project");
        assert!(cache.contains("my-project"));
    }

    #[test]
    fn repeated_resolution_is_stable_and_touches_the_entry() {
        let dir = TempDir::new().unwrap();
        let work = dir.path().join("p");
        std::fs::create_dir_all(&work).unwrap();

        let mut cache = cache(&dir, 8);
        let early = Utc::now() - Duration::hours(1);
        let first = cache.resolve(&work, early);
        let second = cache.resolve(&work, Utc::now());
        assert_eq!(first, second);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn eviction_is_lru_past_the_cap() {
        let dir = TempDir::new().unwrap();
        let mut cache = cache(&dir, 2);
        let now = Utc::now();

        cache.insert("oldest".to_string(), entry(now - Duration::hours(3)));
        cache.insert("middle".to_string(), entry(now - Duration::hours(2)));
        cache.insert("newest".to_string(), entry(now - Duration::hours(1)));
        cache.evict(now);

        assert_eq!(cache.len(), 2);
        assert!(!cache.contains("oldest"));
        assert!(cache.contains("middle"));
        assert!(cache.contains("newest"));
    }

    #[test]
    fn entries_inside_retention_age_are_never_evicted() {
        let dir = TempDir::new().unwrap();
        let mut cache = cache(&dir, 1);
        let now = Utc::now();

        cache.insert("a".to_string(), entry(now - Duration::minutes(5)));
        cache.insert("b".to_string(), entry(now - Duration::minutes(2)));
        cache.evict(now);

        // Over cap, but both are younger than the 30-minute retention age.
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("projects.json");
        {
            let mut cache =
                ProjectIdentityCache::load(path.clone(), 8, Duration::minutes(30));
            cache.insert("p".to_string(), entry(Utc::now()));
            cache.save().unwrap();
        }
        let reloaded = ProjectIdentityCache::load(path, 8, Duration::minutes(30));
        assert!(reloaded.contains("p"));
    }

    #[test]
    fn corrupt_cache_file_resets_to_empty() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("projects.json");
        std::fs::write(&path, "}{ nope").unwrap();

        let cache = ProjectIdentityCache::load(path, 8, Duration::minutes(30));
        assert!(cache.is_empty());
    }
}
