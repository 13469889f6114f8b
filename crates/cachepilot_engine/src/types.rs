//! Core domain types shared across the engine
//!
//! File identity throughout the engine is the canonical array-tier path.
//! Cache-tier and logical feed paths are projections of it through the
//! path resolver.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Tiers
// ============================================================================

/// Which storage tier a file currently occupies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Cache,
    Array,
    /// Present on neither tier; the feed mentioned a file that does not exist.
    Unknown,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Cache => "cache",
            Tier::Array => "array",
            Tier::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// Media files
// ============================================================================

/// A companion file with both tier endpoints resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Companion {
    pub array_path: PathBuf,
    pub cache_path: PathBuf,
    pub size: u64,
}

/// A media file the planner reasons about. Derived fresh every run from the
/// feed and a cache-tier scan; never persisted itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaFile {
    /// Canonical array-tier path, the stable identity.
    pub canonical_path: PathBuf,
    /// Cache-tier twin of the canonical path.
    pub cache_path: PathBuf,
    /// Primary file size in bytes, measured on its current tier.
    pub size: u64,
    pub tier: Tier,
    /// Feed rank; higher promotes first. Zero for files the feed no longer
    /// mentions.
    pub priority: i64,
    /// Companions that move atomically with the primary.
    pub companions: Vec<Companion>,
}

impl MediaFile {
    /// Bytes a move of this file transfers, companions included.
    pub fn total_bytes(&self) -> u64 {
        self.size + self.companions.iter().map(|c| c.size).sum::<u64>()
    }
}

// ============================================================================
// Move plan
// ============================================================================

/// Direction of a single planned move.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MoveDirection {
    /// Array to cache.
    Promote,
    /// Cache to array.
    Evict,
}

impl MoveDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            MoveDirection::Promote => "promote",
            MoveDirection::Evict => "evict",
        }
    }
}

impl std::fmt::Display for MoveDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One planned move: a primary file plus its companions, moved together
/// or not at all.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MoveAction {
    pub direction: MoveDirection,
    /// Canonical array-tier path of the primary file.
    pub canonical_path: PathBuf,
    /// Physical source of the primary file.
    pub source: PathBuf,
    /// Physical destination of the primary file.
    pub dest: PathBuf,
    /// Companion moves as (source, dest) pairs, same direction as the primary.
    pub companions: Vec<(PathBuf, PathBuf)>,
    /// Bytes this action moves, companions included.
    pub bytes: u64,
}

impl MoveAction {
    /// Array-to-cache action for a file.
    pub fn promote(file: &MediaFile) -> Self {
        Self {
            direction: MoveDirection::Promote,
            canonical_path: file.canonical_path.clone(),
            source: file.canonical_path.clone(),
            dest: file.cache_path.clone(),
            companions: file
                .companions
                .iter()
                .map(|c| (c.array_path.clone(), c.cache_path.clone()))
                .collect(),
            bytes: file.total_bytes(),
        }
    }

    /// Cache-to-array action for a file.
    pub fn evict(file: &MediaFile) -> Self {
        Self {
            direction: MoveDirection::Evict,
            canonical_path: file.canonical_path.clone(),
            source: file.cache_path.clone(),
            dest: file.canonical_path.clone(),
            companions: file
                .companions
                .iter()
                .map(|c| (c.cache_path.clone(), c.array_path.clone()))
                .collect(),
            bytes: file.total_bytes(),
        }
    }

    /// Every source path this action reads, primary first.
    pub fn source_paths(&self) -> impl Iterator<Item = &PathBuf> {
        std::iter::once(&self.source).chain(self.companions.iter().map(|(s, _)| s))
    }

    /// Every destination path this action writes, primary first.
    pub fn dest_paths(&self) -> impl Iterator<Item = &PathBuf> {
        std::iter::once(&self.dest).chain(self.companions.iter().map(|(_, d)| d))
    }
}

/// A promotion the planner could not fit under the space budget. The file
/// stays on the array tier; reported, never fatal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SkippedPromotion {
    pub canonical_path: PathBuf,
    pub bytes: u64,
}

/// The full output of one planning pass. Evictions execute before
/// promotions so freed space exists before it is spent.
#[derive(Debug, Clone, Default)]
pub struct MovePlan {
    /// Evictions, least-recently-seen first.
    pub evictions: Vec<MoveAction>,
    /// Promotions, highest feed priority first.
    pub promotions: Vec<MoveAction>,
    /// Desired files that did not fit even after simulated evictions.
    pub skipped: Vec<SkippedPromotion>,
}

impl MovePlan {
    /// True when the plan moves nothing. Skipped promotions do not count;
    /// they involve no filesystem work.
    pub fn is_empty(&self) -> bool {
        self.evictions.is_empty() && self.promotions.is_empty()
    }

    pub fn action_count(&self) -> usize {
        self.evictions.len() + self.promotions.len()
    }

    pub fn eviction_bytes(&self) -> u64 {
        self.evictions.iter().map(|a| a.bytes).sum()
    }

    pub fn promotion_bytes(&self) -> u64 {
        self.promotions.iter().map(|a| a.bytes).sum()
    }
}

// ============================================================================
// Outcomes
// ============================================================================

/// Why an action failed or was skipped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MoveFailure {
    /// Source disappeared between planning and execution.
    SourceMissing,
    /// A stale backup from an earlier interrupted run blocks the action.
    BackupExists { path: PathBuf },
    /// The action exceeded its deadline and was rolled back.
    Timeout,
    /// Filesystem error, with the failing path and OS message.
    Io { path: PathBuf, message: String },
    /// Rollback itself failed; the audit command locates the pieces.
    RollbackFailed { path: PathBuf, message: String },
}

impl std::fmt::Display for MoveFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MoveFailure::SourceMissing => write!(f, "source missing"),
            MoveFailure::BackupExists { path } => {
                write!(f, "stale backup at {}", path.display())
            }
            MoveFailure::Timeout => write!(f, "timed out, rolled back"),
            MoveFailure::Io { path, message } => {
                write!(f, "io error at {}: {}", path.display(), message)
            }
            MoveFailure::RollbackFailed { path, message } => {
                write!(f, "rollback failed at {}: {}", path.display(), message)
            }
        }
    }
}

/// Result of executing one action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MoveOutcome {
    Moved,
    /// Nothing was touched; reason recorded.
    Skipped(MoveFailure),
    /// Attempted and rolled back; source tier intact.
    Failed(MoveFailure),
}

impl MoveOutcome {
    pub fn is_moved(&self) -> bool {
        matches!(self, MoveOutcome::Moved)
    }
}

/// One executed action paired with what happened to it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionReport {
    pub action: MoveAction,
    pub outcome: MoveOutcome,
}

// ============================================================================
// Run summary
// ============================================================================

/// Terminal status of a full run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RunStatus {
    /// Every planned action executed; an empty plan also succeeds.
    Succeeded,
    /// Some actions failed or were skipped; the rest executed.
    PartiallyFailed,
    /// The run could not proceed at all.
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Succeeded => "succeeded",
            RunStatus::PartiallyFailed => "partiallyFailed",
            RunStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What one orchestrated run did, for the CLI and collaborators.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub run_id: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub dry_run: bool,
    /// Actions that moved files, by direction.
    pub promoted: usize,
    pub evicted: usize,
    /// Actions skipped at execution time plus promotions the planner could
    /// not fit.
    pub skipped: usize,
    pub failed: usize,
    /// Feed paths no configured mapping covered.
    pub unmapped: usize,
    /// Bytes actually moved in each direction.
    pub promoted_bytes: u64,
    pub evicted_bytes: u64,
    /// Plan totals, meaningful for dry runs.
    pub planned_promotions: usize,
    pub planned_evictions: usize,
    /// Every action that did not cleanly move, with its reason.
    pub failures: Vec<ActionReport>,
    /// Promotions the planner skipped for lack of space.
    pub skipped_promotions: Vec<SkippedPromotion>,
    /// Per-phase wall time in milliseconds, keyed by phase name.
    pub phase_millis: BTreeMap<String, u64>,
}

impl RunSummary {
    pub fn duration(&self) -> chrono::Duration {
        self.finished_at - self.started_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn sample_file() -> MediaFile {
        MediaFile {
            canonical_path: PathBuf::from("/mnt/user0/media/A.mkv"),
            cache_path: PathBuf::from("/mnt/cache/media/A.mkv"),
            size: 1_000,
            tier: Tier::Array,
            priority: 5,
            companions: vec![Companion {
                array_path: PathBuf::from("/mnt/user0/media/A.srt"),
                cache_path: PathBuf::from("/mnt/cache/media/A.srt"),
                size: 10,
            }],
        }
    }

    #[test]
    fn test_tier_round_trip() {
        assert_eq!(Tier::Cache.as_str(), "cache");
        let json = serde_json::to_string(&Tier::Array).unwrap();
        assert_eq!(json, "\"array\"");
        let back: Tier = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Tier::Array);
    }

    #[test]
    fn test_total_bytes_includes_companions() {
        assert_eq!(sample_file().total_bytes(), 1_010);
    }

    #[test]
    fn test_promote_action_orientation() {
        let action = MoveAction::promote(&sample_file());
        assert_eq!(action.source, Path::new("/mnt/user0/media/A.mkv"));
        assert_eq!(action.dest, Path::new("/mnt/cache/media/A.mkv"));
        assert_eq!(
            action.companions,
            vec![(
                PathBuf::from("/mnt/user0/media/A.srt"),
                PathBuf::from("/mnt/cache/media/A.srt"),
            )]
        );
        assert_eq!(action.bytes, 1_010);
    }

    #[test]
    fn test_evict_action_orientation() {
        let action = MoveAction::evict(&sample_file());
        assert_eq!(action.source, Path::new("/mnt/cache/media/A.mkv"));
        assert_eq!(action.dest, Path::new("/mnt/user0/media/A.mkv"));
        assert_eq!(action.companions[0].0, PathBuf::from("/mnt/cache/media/A.srt"));
    }

    #[test]
    fn test_action_path_iterators() {
        let action = MoveAction::promote(&sample_file());
        let sources: Vec<_> = action.source_paths().collect();
        assert_eq!(sources.len(), 2);
        assert_eq!(sources[0], &action.source);
        let dests: Vec<_> = action.dest_paths().collect();
        assert_eq!(dests[1], &PathBuf::from("/mnt/cache/media/A.srt"));
    }

    #[test]
    fn test_plan_byte_totals() {
        let mut plan = MovePlan::default();
        assert!(plan.is_empty());
        plan.evictions.push(MoveAction::evict(&sample_file()));
        assert_eq!(plan.eviction_bytes(), 1_010);
        assert_eq!(plan.promotion_bytes(), 0);
        assert_eq!(plan.action_count(), 1);
    }
}
