//! Watch feed input - what the media server wants cached
//!
//! The engine never talks to a media server itself. A collaborator drops a
//! JSON document describing the desired-on-cache set, and the orchestrator
//! reads it through the `WatchFeed` trait once per run, before planning.
//!
//! # Document Format
//!
//! ```text
//! {
//!   "generatedAt": "2026-08-21T10:00:00Z",
//!   "items": [
//!     {"path": "/data/media/movies/A.mkv", "priority": 12, "kind": "ondeck"},
//!     {"path": "/data/media/shows/B.mkv", "priority": 3, "protected": true}
//!   ]
//! }
//! ```
//!
//! Items are ordered by the collaborator; `priority` is its rank within this
//! run (higher first). Unknown fields are ignored so feed producers can
//! evolve independently.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{EngineError, Result};
use crate::store::atomic_write;

/// Why the feed considers an item relevant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ItemKind {
    /// Actively being watched or next up in a session.
    #[default]
    Ondeck,
    /// On a user watchlist.
    Watchlist,
    /// Recently added to the library.
    Recent,
}

impl ItemKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemKind::Ondeck => "ondeck",
            ItemKind::Watchlist => "watchlist",
            ItemKind::Recent => "recent",
        }
    }
}

/// One desired-on-cache entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedItem {
    /// Logical library path as the media server reports it.
    pub path: PathBuf,
    /// Rank within this document; higher promotes first.
    pub priority: i64,
    /// Pinned by the collaborator; never evicted while flagged.
    #[serde(default)]
    pub protected: bool,
    #[serde(default)]
    pub kind: ItemKind,
    /// User whose session put the item on deck, when the producer knows.
    #[serde(default)]
    pub user: Option<String>,
    /// Free-form episode label, e.g. "Foundation S01E01".
    #[serde(default)]
    pub episode: Option<String>,
}

/// A full feed document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedDocument {
    pub generated_at: DateTime<Utc>,
    pub items: Vec<FeedItem>,
}

impl FeedDocument {
    /// Persist this document as the snapshot a skip-refresh run reuses.
    pub fn save_snapshot(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        atomic_write(path, json.as_bytes())?;
        debug!("Saved feed snapshot to {}", path.display());
        Ok(())
    }

    /// Load a previously saved snapshot. Missing or corrupt snapshots yield
    /// `None`; the caller decides whether a live fetch can cover.
    pub fn load_snapshot(path: &Path) -> Option<FeedDocument> {
        let raw = match fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(_) => return None,
        };
        match serde_json::from_str(&raw) {
            Ok(doc) => Some(doc),
            Err(err) => {
                warn!("Feed snapshot {} is corrupt: {}", path.display(), err);
                None
            }
        }
    }
}

/// Source of feed documents.
pub trait WatchFeed: Send + Sync {
    fn fetch(&self) -> Result<FeedDocument>;
}

/// Reads the feed from a JSON file a collaborator maintains.
#[derive(Debug, Clone)]
pub struct JsonFileFeed {
    path: PathBuf,
}

impl JsonFileFeed {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl WatchFeed for JsonFileFeed {
    fn fetch(&self) -> Result<FeedDocument> {
        let raw = fs::read_to_string(&self.path).map_err(|err| {
            EngineError::FeedUnavailable(format!("{}: {}", self.path.display(), err))
        })?;
        let doc: FeedDocument = serde_json::from_str(&raw).map_err(|err| {
            EngineError::FeedUnavailable(format!("{}: {}", self.path.display(), err))
        })?;
        debug!(
            "Fetched feed from {}: {} items, generated {}",
            self.path.display(),
            doc.items.len(),
            doc.generated_at
        );
        Ok(doc)
    }
}
