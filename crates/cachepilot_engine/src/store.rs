//! Timestamp store - persistent cache residency bookkeeping
//!
//! One JSON document records, for every file currently on the cache tier,
//! when it was promoted and when the watch feed last mentioned it. The
//! planner orders evictions by these timestamps.
//!
//! # Storage Format
//!
//! ```text
//! {
//!   "version": 1,
//!   "updatedAt": "2026-08-21T10:00:00Z",
//!   "records": {
//!     "/mnt/user0/media/movies/A.mkv": {
//!       "cachedSince": "2026-08-19T08:00:00Z",
//!       "lastSeen": "2026-08-21T10:00:00Z"
//!     }
//!   }
//! }
//! ```

use std::collections::BTreeMap;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::Result;

/// Store format version - bump when the document shape changes
const STORE_VERSION: u32 = 1;

/// Residency timestamps for one cached file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimestampRecord {
    /// When the file was promoted to (or first observed on) the cache tier.
    pub cached_since: DateTime<Utc>,
    /// When the watch feed last mentioned the file.
    pub last_seen: DateTime<Utc>,
}

/// On-disk envelope.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoreDocument {
    version: u32,
    updated_at: DateTime<Utc>,
    /// Keyed by canonical array-tier path. BTreeMap keeps serialization
    /// deterministic.
    records: BTreeMap<PathBuf, TimestampRecord>,
}

/// In-memory timestamp store, loaded once per run, saved once per run.
#[derive(Debug)]
pub struct TimestampStore {
    path: PathBuf,
    records: BTreeMap<PathBuf, TimestampRecord>,
}

impl TimestampStore {
    /// Load the store from disk. A missing file yields an empty store.
    /// A corrupt file yields an empty store with a warning; the next save
    /// replaces it.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!("No timestamp store at {}, starting empty", path.display());
            return Ok(Self {
                path: path.to_path_buf(),
                records: BTreeMap::new(),
            });
        }

        let raw = fs::read_to_string(path)?;
        let records = match serde_json::from_str::<StoreDocument>(&raw) {
            Ok(doc) if doc.version == STORE_VERSION => doc.records,
            Ok(doc) => {
                warn!(
                    "Timestamp store {} has version {}, expected {}; starting empty",
                    path.display(),
                    doc.version,
                    STORE_VERSION
                );
                BTreeMap::new()
            }
            Err(err) => {
                warn!(
                    "Timestamp store {} is corrupt ({}); starting empty",
                    path.display(),
                    err
                );
                BTreeMap::new()
            }
        };

        debug!(
            "Loaded {} timestamp records from {}",
            records.len(),
            path.display()
        );
        Ok(Self {
            path: path.to_path_buf(),
            records,
        })
    }

    /// Record a file as newly resident on the cache tier. An already-tracked
    /// path keeps its original `cached_since`; `last_seen` always refreshes.
    pub fn mark_cached(&mut self, canonical: &Path, now: DateTime<Utc>) {
        let record = self
            .records
            .entry(canonical.to_path_buf())
            .or_insert(TimestampRecord {
                cached_since: now,
                last_seen: now,
            });
        record.last_seen = now;
    }

    /// Refresh `last_seen` for a path the feed still mentions. An untracked
    /// path is treated as newly cached rather than dropped.
    pub fn touch(&mut self, canonical: &Path, now: DateTime<Utc>) {
        self.mark_cached(canonical, now);
    }

    /// Forget a file that left the cache tier. Returns whether it was tracked.
    pub fn mark_evicted(&mut self, canonical: &Path) -> bool {
        self.records.remove(canonical).is_some()
    }

    pub fn get(&self, canonical: &Path) -> Option<&TimestampRecord> {
        self.records.get(canonical)
    }

    pub fn contains(&self, canonical: &Path) -> bool {
        self.records.contains_key(canonical)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&PathBuf, &TimestampRecord)> {
        self.records.iter()
    }

    /// Align the store with what is physically on the cache tier.
    ///
    /// Files on cache without a record get one stamped `now` (a file of
    /// unknown age must not jump the eviction queue). Records whose file is
    /// gone are dropped. Returns (added, removed).
    pub fn reconcile<'a, I>(&mut self, cache_files: I, now: DateTime<Utc>) -> (usize, usize)
    where
        I: IntoIterator<Item = &'a PathBuf>,
    {
        let present: HashSet<&PathBuf> = cache_files.into_iter().collect();

        let mut added = 0;
        for canonical in &present {
            if !self.records.contains_key(*canonical) {
                self.records.insert(
                    (*canonical).clone(),
                    TimestampRecord {
                        cached_since: now,
                        last_seen: now,
                    },
                );
                added += 1;
            }
        }

        let before = self.records.len();
        self.records.retain(|path, _| present.contains(path));
        let removed = before - self.records.len();

        if added > 0 || removed > 0 {
            debug!(added, removed, "Reconciled timestamp store against cache scan");
        }
        (added, removed)
    }

    /// Persist the store. The write is atomic; a crash leaves either the old
    /// document or the new one, never a torn file.
    pub fn save(&self) -> Result<()> {
        let doc = StoreDocument {
            version: STORE_VERSION,
            updated_at: Utc::now(),
            records: self.records.clone(),
        };
        let json = serde_json::to_string_pretty(&doc)?;
        atomic_write(&self.path, json.as_bytes())?;
        debug!(
            "Saved {} timestamp records to {}",
            self.records.len(),
            self.path.display()
        );
        Ok(())
    }
}

/// Atomic write via temp file + rename
pub(crate) fn atomic_write(path: &Path, content: &[u8]) -> std::io::Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let temp_path = parent.join(format!(".tmp_{}", uuid::Uuid::new_v4()));
    fs::write(&temp_path, content)?;
    fs::rename(&temp_path, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 8, 21, hour, 0, 0).unwrap()
    }

    #[test]
    fn test_load_missing_is_empty() {
        let temp = TempDir::new().unwrap();
        let store = TimestampStore::load(&temp.path().join("ts.json")).unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("ts.json");

        let mut store = TimestampStore::load(&path).unwrap();
        store.mark_cached(Path::new("/mnt/user0/media/A.mkv"), at(8));
        store.mark_cached(Path::new("/mnt/user0/media/B.mkv"), at(9));
        store.save().unwrap();

        let loaded = TimestampStore::load(&path).unwrap();
        assert_eq!(loaded.len(), 2);
        let rec = loaded.get(Path::new("/mnt/user0/media/A.mkv")).unwrap();
        assert_eq!(rec.cached_since, at(8));
        assert_eq!(rec.last_seen, at(8));
    }

    #[test]
    fn test_corrupt_store_starts_empty() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("ts.json");
        fs::write(&path, b"{not json at all").unwrap();

        let store = TimestampStore::load(&path).unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn test_mark_cached_preserves_cached_since() {
        let temp = TempDir::new().unwrap();
        let mut store = TimestampStore::load(&temp.path().join("ts.json")).unwrap();

        let canonical = Path::new("/mnt/user0/media/A.mkv");
        store.mark_cached(canonical, at(8));
        store.mark_cached(canonical, at(12));

        let rec = store.get(canonical).unwrap();
        assert_eq!(rec.cached_since, at(8));
        assert_eq!(rec.last_seen, at(12));
    }

    #[test]
    fn test_touch_unknown_path_inserts() {
        let temp = TempDir::new().unwrap();
        let mut store = TimestampStore::load(&temp.path().join("ts.json")).unwrap();

        store.touch(Path::new("/mnt/user0/media/C.mkv"), at(10));
        let rec = store.get(Path::new("/mnt/user0/media/C.mkv")).unwrap();
        assert_eq!(rec.cached_since, at(10));
    }

    #[test]
    fn test_mark_evicted() {
        let temp = TempDir::new().unwrap();
        let mut store = TimestampStore::load(&temp.path().join("ts.json")).unwrap();

        let canonical = Path::new("/mnt/user0/media/A.mkv");
        store.mark_cached(canonical, at(8));
        assert!(store.mark_evicted(canonical));
        assert!(!store.mark_evicted(canonical));
        assert!(store.get(canonical).is_none());
    }

    #[test]
    fn test_reconcile_adds_and_removes() {
        let temp = TempDir::new().unwrap();
        let mut store = TimestampStore::load(&temp.path().join("ts.json")).unwrap();

        store.mark_cached(Path::new("/mnt/user0/media/gone.mkv"), at(6));
        store.mark_cached(Path::new("/mnt/user0/media/kept.mkv"), at(7));

        let on_cache = vec![
            PathBuf::from("/mnt/user0/media/kept.mkv"),
            PathBuf::from("/mnt/user0/media/new.mkv"),
        ];
        let (added, removed) = store.reconcile(on_cache.iter(), at(10));

        assert_eq!(added, 1);
        assert_eq!(removed, 1);
        // The surviving record keeps its original promotion time.
        assert_eq!(
            store.get(Path::new("/mnt/user0/media/kept.mkv")).unwrap().cached_since,
            at(7)
        );
        // The unknown file is stamped with the reconcile time.
        assert_eq!(
            store.get(Path::new("/mnt/user0/media/new.mkv")).unwrap().cached_since,
            at(10)
        );
    }

    #[test]
    fn test_version_mismatch_starts_empty() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("ts.json");
        fs::write(
            &path,
            br#"{"version": 99, "updatedAt": "2026-08-21T00:00:00Z", "records": {}}"#,
        )
        .unwrap();

        let store = TimestampStore::load(&path).unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn test_serialization_is_deterministic() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("ts.json");

        let mut store = TimestampStore::load(&path).unwrap();
        store.mark_cached(Path::new("/mnt/user0/media/z.mkv"), at(8));
        store.mark_cached(Path::new("/mnt/user0/media/a.mkv"), at(8));
        store.save().unwrap();

        let raw = fs::read_to_string(&path).unwrap();
        let a = raw.find("/mnt/user0/media/a.mkv").unwrap();
        let z = raw.find("/mnt/user0/media/z.mkv").unwrap();
        assert!(a < z);
    }
}
