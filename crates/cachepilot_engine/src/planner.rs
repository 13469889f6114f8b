//! Residency planning - who gets the fast tier
//!
//! The planner is a pure function over snapshots: the desired set from the
//! feed, the cached set from the scan, the timestamp records, and a byte
//! budget. It mutates nothing; the mover executes what it decides.
//!
//! Policy: the cache tier holds exactly the desired set. Everything cached
//! but no longer desired (and not protected) is evicted, least-recently-seen
//! first. Promotions are fitted greedily under `free_bytes - safety_margin`,
//! counting bytes that selected evictions will free; a promotion that still
//! does not fit is skipped and reported, never fatal.

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::store::TimestampRecord;
use crate::types::{MediaFile, MoveAction, MovePlan, SkippedPromotion, Tier};

/// Everything the planner needs, captured before planning starts. No
/// ambient state is read mid-plan.
#[derive(Debug, Clone)]
pub struct PlanInput {
    /// Feed-ranked files the cache should hold. Priority descends.
    pub desired: Vec<MediaFile>,
    /// Primaries currently resident on the cache tier.
    pub cached: Vec<MediaFile>,
    /// Timestamp snapshot; orders evictions by `last_seen`.
    pub records: BTreeMap<PathBuf, TimestampRecord>,
    /// Free bytes on the cache tier at plan time.
    pub free_cache_bytes: u64,
    /// Bytes to keep free no matter what.
    pub safety_margin: u64,
    /// Canonical paths that must never be evicted.
    pub protected: HashSet<PathBuf>,
}

/// Compute the move plan for one run.
pub fn plan(input: &PlanInput) -> MovePlan {
    let desired_set: HashSet<&PathBuf> =
        input.desired.iter().map(|f| &f.canonical_path).collect();
    let cached_set: HashSet<&PathBuf> =
        input.cached.iter().map(|f| &f.canonical_path).collect();

    // Promotion candidates: desired, on the array tier, not already cached.
    // Duplicate feed entries keep only their first occurrence.
    let mut seen: HashSet<&PathBuf> = HashSet::new();
    let mut to_promote: Vec<&MediaFile> = input
        .desired
        .iter()
        .filter(|f| f.tier == Tier::Array && !cached_set.contains(&f.canonical_path))
        .filter(|f| seen.insert(&f.canonical_path))
        .collect();
    to_promote.sort_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then_with(|| a.canonical_path.cmp(&b.canonical_path))
    });

    // Eviction candidates: cached, no longer desired, not protected.
    // Least-recently-seen first; a file without a record never got a
    // timestamp and goes first.
    let mut to_evict: Vec<&MediaFile> = input
        .cached
        .iter()
        .filter(|f| {
            !desired_set.contains(&f.canonical_path)
                && !input.protected.contains(&f.canonical_path)
        })
        .collect();
    to_evict.sort_by(|a, b| {
        last_seen(input, a)
            .cmp(&last_seen(input, b))
            .then_with(|| a.canonical_path.cmp(&b.canonical_path))
    });

    // Greedy fit. Every eviction happens regardless; pulling one here only
    // credits its bytes to the budget so dependent promotions can count on
    // space that will exist by the time they run (evictions execute first).
    let mut available = input.free_cache_bytes.saturating_sub(input.safety_margin);
    let mut freed = to_evict.iter();
    let mut promotions = Vec::new();
    let mut skipped = Vec::new();

    for file in to_promote {
        let need = file.total_bytes();
        while need > available {
            match freed.next() {
                Some(evicted) => available += evicted.total_bytes(),
                None => break,
            }
        }
        if need <= available {
            available -= need;
            promotions.push(MoveAction::promote(file));
        } else {
            debug!(
                "Skipping promotion of {} ({} bytes do not fit)",
                file.canonical_path.display(),
                need
            );
            skipped.push(SkippedPromotion {
                canonical_path: file.canonical_path.clone(),
                bytes: need,
            });
        }
    }

    let evictions: Vec<MoveAction> = to_evict.iter().map(|f| MoveAction::evict(f)).collect();

    debug!(
        evictions = evictions.len(),
        promotions = promotions.len(),
        skipped = skipped.len(),
        "Planned run"
    );
    MovePlan {
        evictions,
        promotions,
        skipped,
    }
}

fn last_seen(input: &PlanInput, file: &MediaFile) -> Option<DateTime<Utc>> {
    input.records.get(&file.canonical_path).map(|r| r.last_seen)
}
