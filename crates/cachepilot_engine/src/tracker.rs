//! On-deck retention tracking
//!
//! An episode someone started and abandoned would otherwise sit on the
//! cache tier forever, because the feed keeps reporting it as on deck. The
//! tracker remembers when each on-deck path was first reported; once that
//! age exceeds the configured retention window the path is dropped from the
//! desired set before planning, which makes it evictable.
//!
//! Keyed by logical feed path: the filter runs before path resolution.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::Result;
use crate::store::atomic_write;

const TRACKER_VERSION: u32 = 1;

/// Retention state for one on-deck path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetentionRecord {
    /// When the feed first reported this path. Survives every run; the
    /// retention clock measures from here. Absent in documents written by
    /// older producers, in which case the path never expires.
    #[serde(default)]
    pub first_seen: Option<DateTime<Utc>>,
    pub last_seen: DateTime<Utc>,
    /// Users who had the item on deck this run. Cleared by
    /// `prepare_for_run`.
    #[serde(default)]
    pub users: Vec<String>,
    /// Episode label from the feed, for the status view. Cleared by
    /// `prepare_for_run`.
    #[serde(default)]
    pub episode: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TrackerDocument {
    version: u32,
    updated_at: DateTime<Utc>,
    records: BTreeMap<PathBuf, RetentionRecord>,
}

/// Tracks how long each path has been continuously on deck.
#[derive(Debug)]
pub struct RetentionTracker {
    path: PathBuf,
    records: BTreeMap<PathBuf, RetentionRecord>,
    /// Paths refreshed since the last `prepare_for_run`. Not persisted.
    seen: HashSet<PathBuf>,
}

impl RetentionTracker {
    /// Load the tracker from disk. Missing or corrupt files yield an empty
    /// tracker with a warning.
    pub fn load(path: &Path) -> Result<Self> {
        let records = if path.exists() {
            let raw = fs::read_to_string(path)?;
            match serde_json::from_str::<TrackerDocument>(&raw) {
                Ok(doc) if doc.version == TRACKER_VERSION => doc.records,
                Ok(doc) => {
                    warn!(
                        "Retention tracker {} has version {}, expected {}; starting empty",
                        path.display(),
                        doc.version,
                        TRACKER_VERSION
                    );
                    BTreeMap::new()
                }
                Err(err) => {
                    warn!(
                        "Retention tracker {} is corrupt ({}); starting empty",
                        path.display(),
                        err
                    );
                    BTreeMap::new()
                }
            }
        } else {
            BTreeMap::new()
        };

        Ok(Self {
            path: path.to_path_buf(),
            records,
            seen: HashSet::new(),
        })
    }

    /// Begin a new run: clear every record's per-run fields. `first_seen`
    /// and `last_seen` survive.
    pub fn prepare_for_run(&mut self) {
        for record in self.records.values_mut() {
            record.users.clear();
            record.episode = None;
        }
        self.seen.clear();
    }

    /// Record that the feed reported `path` this run.
    pub fn update(
        &mut self,
        path: &Path,
        user: Option<&str>,
        episode: Option<&str>,
        now: DateTime<Utc>,
    ) {
        let record = self
            .records
            .entry(path.to_path_buf())
            .or_insert(RetentionRecord {
                first_seen: Some(now),
                last_seen: now,
                users: Vec::new(),
                episode: None,
            });
        record.last_seen = now;
        if let Some(user) = user {
            if !record.users.iter().any(|u| u == user) {
                record.users.push(user.to_string());
            }
        }
        if let Some(episode) = episode {
            record.episode = Some(episode.to_string());
        }
        self.seen.insert(path.to_path_buf());
    }

    /// Drop every record the feed did not refresh this run. Returns how
    /// many were removed.
    pub fn cleanup_unseen(&mut self) -> usize {
        let before = self.records.len();
        let seen = std::mem::take(&mut self.seen);
        self.records.retain(|path, _| seen.contains(path));
        self.seen = seen;
        before - self.records.len()
    }

    /// Whether `path` has been on deck longer than `retention_days`.
    /// Zero disables retention. Unknown paths and records without a
    /// `first_seen` never expire.
    pub fn is_expired(&self, path: &Path, retention_days: u32, now: DateTime<Utc>) -> bool {
        if retention_days == 0 {
            return false;
        }
        let Some(first_seen) = self.records.get(path).and_then(|r| r.first_seen) else {
            return false;
        };
        now - first_seen > Duration::days(i64::from(retention_days))
    }

    pub fn get(&self, path: &Path) -> Option<&RetentionRecord> {
        self.records.get(path)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Persist the tracker atomically.
    pub fn save(&self) -> Result<()> {
        let doc = TrackerDocument {
            version: TRACKER_VERSION,
            updated_at: Utc::now(),
            records: self.records.clone(),
        };
        let json = serde_json::to_string_pretty(&doc)?;
        atomic_write(&self.path, json.as_bytes())?;
        debug!(
            "Saved {} retention records to {}",
            self.records.len(),
            self.path.display()
        );
        Ok(())
    }

    #[cfg(test)]
    fn backdate_first_seen(&mut self, path: &Path, first_seen: DateTime<Utc>) {
        self.records.get_mut(path).unwrap().first_seen = Some(first_seen);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn tracker(temp: &TempDir) -> RetentionTracker {
        RetentionTracker::load(&temp.path().join("retention_tracker.json")).unwrap()
    }

    #[test]
    fn test_first_seen_survives_prepare_update_cycles() {
        let temp = TempDir::new().unwrap();
        let mut t = tracker(&temp);
        let path = Path::new("/data/media/movie.mkv");

        let start = Utc::now();
        t.update(path, Some("alice"), None, start);
        let original = t.get(path).unwrap().first_seen;

        for _ in 0..5 {
            t.prepare_for_run();
            t.update(path, Some("alice"), None, Utc::now());
            t.cleanup_unseen();
        }

        let record = t.get(path).unwrap();
        assert_eq!(record.first_seen, original);
        assert!(record.last_seen >= start);
    }

    #[test]
    fn test_prepare_clears_per_run_fields() {
        let temp = TempDir::new().unwrap();
        let mut t = tracker(&temp);
        let path = Path::new("/data/media/show/s01e01.mkv");

        t.update(path, Some("bob"), Some("Foundation S01E01"), Utc::now());
        let record = t.get(path).unwrap();
        assert_eq!(record.users, vec!["bob".to_string()]);
        assert!(record.episode.is_some());

        t.prepare_for_run();

        let record = t.get(path).unwrap();
        assert!(record.users.is_empty());
        assert!(record.episode.is_none());
        assert!(record.first_seen.is_some());
    }

    #[test]
    fn test_cleanup_removes_stale_entries() {
        let temp = TempDir::new().unwrap();
        let mut t = tracker(&temp);
        let now = Utc::now();

        t.update(Path::new("/data/media/movie1.mkv"), Some("alice"), None, now);
        t.update(Path::new("/data/media/movie2.mkv"), Some("bob"), None, now);

        t.prepare_for_run();
        t.update(Path::new("/data/media/movie1.mkv"), Some("alice"), None, now);
        let removed = t.cleanup_unseen();

        assert_eq!(removed, 1);
        assert!(t.get(Path::new("/data/media/movie1.mkv")).is_some());
        assert!(t.get(Path::new("/data/media/movie2.mkv")).is_none());
    }

    #[test]
    fn test_cleanup_keeps_refreshed_entries() {
        let temp = TempDir::new().unwrap();
        let mut t = tracker(&temp);
        let now = Utc::now();

        for name in ["movie1", "movie2", "movie3"] {
            t.update(&PathBuf::from(format!("/data/media/{name}.mkv")), None, None, now);
        }
        t.prepare_for_run();
        for name in ["movie1", "movie2", "movie3"] {
            t.update(&PathBuf::from(format!("/data/media/{name}.mkv")), None, None, now);
        }

        assert_eq!(t.cleanup_unseen(), 0);
        assert_eq!(t.len(), 3);
    }

    #[test]
    fn test_expires_items_older_than_window() {
        let temp = TempDir::new().unwrap();
        let mut t = tracker(&temp);
        let now = Utc::now();
        let path = Path::new("/data/media/old_movie.mkv");

        t.update(path, Some("alice"), None, now);
        t.backdate_first_seen(path, now - Duration::days(10));

        assert!(t.is_expired(path, 7, now));
    }

    #[test]
    fn test_fresh_items_do_not_expire() {
        let temp = TempDir::new().unwrap();
        let mut t = tracker(&temp);
        let now = Utc::now();
        let path = Path::new("/data/media/fresh_movie.mkv");

        t.update(path, Some("alice"), None, now);
        assert!(!t.is_expired(path, 7, now));
    }

    #[test]
    fn test_zero_retention_disables_expiry() {
        let temp = TempDir::new().unwrap();
        let mut t = tracker(&temp);
        let now = Utc::now();
        let path = Path::new("/data/media/movie.mkv");

        t.update(path, Some("alice"), None, now);
        t.backdate_first_seen(path, now - Duration::days(365));

        assert!(!t.is_expired(path, 0, now));
    }

    #[test]
    fn test_unknown_path_never_expires() {
        let temp = TempDir::new().unwrap();
        let t = tracker(&temp);
        assert!(!t.is_expired(Path::new("/data/media/unknown.mkv"), 7, Utc::now()));
    }

    #[test]
    fn test_record_without_first_seen_never_expires() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("retention_tracker.json");
        // A document from a producer that predates firstSeen.
        fs::write(
            &path,
            br#"{
                "version": 1,
                "updatedAt": "2026-08-21T00:00:00Z",
                "records": {
                    "/data/media/no_ts.mkv": {"lastSeen": "2020-01-01T00:00:00Z"}
                }
            }"#,
        )
        .unwrap();

        let t = RetentionTracker::load(&path).unwrap();
        assert!(!t.is_expired(Path::new("/data/media/no_ts.mkv"), 7, Utc::now()));
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("retention_tracker.json");
        let now = Utc::now();

        let mut t = RetentionTracker::load(&path).unwrap();
        t.update(Path::new("/data/media/movie.mkv"), Some("alice"), None, now);
        t.save().unwrap();

        let loaded = RetentionTracker::load(&path).unwrap();
        assert_eq!(loaded.len(), 1);
        let record = loaded.get(Path::new("/data/media/movie.mkv")).unwrap();
        assert_eq!(record.users, vec!["alice".to_string()]);
    }

    #[test]
    fn test_corrupt_tracker_starts_empty() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("retention_tracker.json");
        fs::write(&path, b"not json").unwrap();

        let t = RetentionTracker::load(&path).unwrap();
        assert!(t.is_empty());
    }

    #[test]
    fn test_expired_items_filtered_from_desired_set() {
        // The orchestrator's filter: expired on-deck paths drop out of the
        // desired list, everything else stays.
        let temp = TempDir::new().unwrap();
        let mut t = tracker(&temp);
        let now = Utc::now();

        t.prepare_for_run();
        t.update(Path::new("/data/media/old.mkv"), Some("alice"), None, now);
        t.update(Path::new("/data/media/new.mkv"), Some("bob"), None, now);
        t.backdate_first_seen(Path::new("/data/media/old.mkv"), now - Duration::days(20));

        let desired = [
            PathBuf::from("/data/media/old.mkv"),
            PathBuf::from("/data/media/new.mkv"),
        ];
        let filtered: Vec<_> = desired
            .iter()
            .filter(|p| !t.is_expired(p, 14, now))
            .collect();

        assert_eq!(filtered, vec![&PathBuf::from("/data/media/new.mkv")]);
    }
}
