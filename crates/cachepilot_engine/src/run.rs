//! Run orchestration - one full residency pass
//!
//! A run moves through fetching inputs, planning, executing and finalizing,
//! and ends Succeeded, PartiallyFailed or Failed. Per-file trouble (an
//! unmapped feed path, a failed move) lands in the summary and never aborts
//! the run; only lock contention, an unusable feed and timestamp-store I/O
//! are fatal. An empty plan that touches nothing is a successful no-op.
//!
//! The whole run holds the advisory run lock, so two invocations can never
//! interleave writes to the timestamp store or the exclusion list.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cancel::CancellationToken;
use crate::companion::CompanionFinder;
use crate::config::Settings;
use crate::disk::{FsProbe, SpaceProbe};
use crate::error::{EngineError, Result};
use crate::exclusions::ExclusionWriter;
use crate::feed::{FeedDocument, FeedItem, ItemKind, JsonFileFeed, WatchFeed};
use crate::lock;
use crate::mover::{self, MoveProgress, MoverConfig};
use crate::paths::PathResolver;
use crate::planner::{self, PlanInput};
use crate::scan::{self, CacheScan};
use crate::store::TimestampStore;
use crate::tracker::RetentionTracker;
use crate::types::{
    ActionReport, Companion, MediaFile, MoveDirection, MoveOutcome, MovePlan, RunStatus,
    RunSummary, Tier,
};

/// Flags for one invocation. The CLI maps its arguments onto this.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    /// Compute and report the full plan without touching a single file or
    /// artifact.
    pub dry_run: bool,
    /// Reuse the last feed snapshot instead of fetching. Fails the run if
    /// no usable snapshot exists.
    pub skip_feed_refresh: bool,
}

/// Sequences the engine components once per invocation.
pub struct Orchestrator {
    settings: Settings,
    feed: Box<dyn WatchFeed>,
    probe: Box<dyn SpaceProbe>,
    token: CancellationToken,
}

impl Orchestrator {
    /// Production wiring: JSON file feed and real free-space probing.
    pub fn new(settings: Settings) -> Self {
        let feed = Box::new(JsonFileFeed::new(settings.feed.path.clone()));
        Self::with_collaborators(settings, feed, Box::new(FsProbe))
    }

    /// Inject the external collaborators; tests use this with a fixed
    /// space probe.
    pub fn with_collaborators(
        settings: Settings,
        feed: Box<dyn WatchFeed>,
        probe: Box<dyn SpaceProbe>,
    ) -> Self {
        Self {
            settings,
            feed,
            probe,
            token: CancellationToken::new(),
        }
    }

    /// Token the binary wires to SIGINT/SIGTERM. Cancellation is honored
    /// between move actions.
    pub fn cancel_token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Run the engine once. Fatal errors (lock contention, no usable feed,
    /// store I/O) return `Err`; everything else is reported in the summary.
    pub fn trigger_run(
        &self,
        options: &RunOptions,
        progress_tx: Option<&mpsc::Sender<MoveProgress>>,
    ) -> Result<RunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4().to_string();
        info!(run_id = %run_id, dry_run = options.dry_run, "Starting run");

        fs::create_dir_all(self.settings.data_dir())?;
        let _lock = lock::try_lock_run(&self.settings.lock_path())?;

        let mut phase_millis: BTreeMap<String, u64> = BTreeMap::new();

        // FetchingInputs: store, feed, retention, resolution, cache scan.
        let phase = Instant::now();
        let mut store = TimestampStore::load(&self.settings.timestamps_path())?;
        let doc = self.fetch_feed(options)?;
        let mut tracker = RetentionTracker::load(&self.settings.tracker_path())?;
        let now = Utc::now();
        let desired_items = self.apply_retention(&doc, &mut tracker, now);

        let resolver = PathResolver::new(self.settings.mappings.clone());
        let finder = CompanionFinder::new(&self.settings.companions);
        let (desired, unmapped) = self.resolve_desired(&desired_items, &resolver, &finder);
        let protected = self.protected_set(&doc, &resolver);
        let scan = scan::scan_cache(&self.settings.mappings, &resolver, &finder)?;
        phase_millis.insert("fetchingInputs".into(), elapsed_ms(phase));

        // Planning: reconcile belief with reality, then compute the plan
        // from value snapshots.
        let phase = Instant::now();
        let cache_canonicals: Vec<PathBuf> = scan
            .primaries
            .iter()
            .map(|f| f.canonical_path.clone())
            .collect();
        store.reconcile(cache_canonicals.iter(), now);
        for file in &desired {
            if file.tier == Tier::Cache {
                store.touch(&file.canonical_path, now);
            }
        }
        let cached = self.cached_files(&scan, &resolver, &finder);
        let plan = planner::plan(&PlanInput {
            desired,
            cached,
            records: store.iter().map(|(p, r)| (p.clone(), *r)).collect(),
            free_cache_bytes: self.free_cache_bytes(),
            safety_margin: self.settings.cache.safety_margin,
            protected,
        });
        phase_millis.insert("planning".into(), elapsed_ms(phase));

        if options.dry_run {
            info!(
                evictions = plan.evictions.len(),
                promotions = plan.promotions.len(),
                "Dry run: reporting plan without executing"
            );
            return Ok(self.summarize(
                run_id,
                started_at,
                options,
                &plan,
                Vec::new(),
                unmapped,
                phase_millis,
            ));
        }

        // Executing: evictions commit before promotions inside the mover.
        let phase = Instant::now();
        let mover_config = MoverConfig {
            workers: self.settings.cache.workers,
            action_timeout: Duration::from_secs(self.settings.cache.action_timeout_secs),
        };
        let reports = mover::execute_plan(
            &plan,
            &mut store,
            &mover_config,
            &self.token,
            progress_tx,
        );
        phase_millis.insert("executing".into(), elapsed_ms(phase));

        // Finalizing: the store save is the only fatal step; the other
        // artifacts warn and let the next run repair them.
        let phase = Instant::now();
        store.save()?;
        if let Err(err) = self.write_exclusions(&store, &resolver, &finder) {
            warn!("Failed to rewrite exclusion list: {}", err);
        }
        if let Err(err) = tracker.save() {
            warn!("Failed to save retention tracker: {}", err);
        }
        if !options.skip_feed_refresh {
            if let Err(err) = doc.save_snapshot(&self.settings.feed_snapshot_path()) {
                warn!("Failed to save feed snapshot: {}", err);
            }
        }
        phase_millis.insert("finalizing".into(), elapsed_ms(phase));

        let summary = self.summarize(
            run_id,
            started_at,
            options,
            &plan,
            reports,
            unmapped,
            phase_millis,
        );
        info!(
            status = %summary.status,
            promoted = summary.promoted,
            evicted = summary.evicted,
            skipped = summary.skipped,
            failed = summary.failed,
            "Run finished"
        );
        Ok(summary)
    }

    fn fetch_feed(&self, options: &RunOptions) -> Result<FeedDocument> {
        if options.skip_feed_refresh {
            let path = self.settings.feed_snapshot_path();
            FeedDocument::load_snapshot(&path).ok_or_else(|| {
                EngineError::FeedUnavailable(format!(
                    "no usable feed snapshot at {}",
                    path.display()
                ))
            })
        } else {
            self.feed.fetch()
        }
    }

    /// Track on-deck items and drop the ones past the retention window from
    /// the desired set, which makes them evictable. Watchlist and recent
    /// items are unaffected.
    fn apply_retention(
        &self,
        doc: &FeedDocument,
        tracker: &mut RetentionTracker,
        now: DateTime<Utc>,
    ) -> Vec<FeedItem> {
        tracker.prepare_for_run();
        for item in doc.items.iter().filter(|i| i.kind == ItemKind::Ondeck) {
            tracker.update(&item.path, item.user.as_deref(), item.episode.as_deref(), now);
        }
        let removed = tracker.cleanup_unseen();
        if removed > 0 {
            debug!(removed, "Dropped retention records the feed no longer mentions");
        }

        let days = self.settings.retention.ondeck_days;
        doc.items
            .iter()
            .filter(|item| {
                if item.kind == ItemKind::Ondeck && tracker.is_expired(&item.path, days, now) {
                    info!(
                        "On-deck retention expired for {}, leaving it evictable",
                        item.path.display()
                    );
                    false
                } else {
                    true
                }
            })
            .cloned()
            .collect()
    }

    /// Map feed items to concrete files. Unmapped paths are counted and
    /// skipped, never fatal.
    fn resolve_desired(
        &self,
        items: &[FeedItem],
        resolver: &PathResolver,
        finder: &CompanionFinder,
    ) -> (Vec<MediaFile>, usize) {
        let mut desired = Vec::new();
        let mut unmapped = 0usize;

        for item in items {
            let (array_path, cache_path) = match (
                resolver.to_array_path(&item.path),
                resolver.to_cache_path(&item.path),
            ) {
                (Ok(a), Ok(c)) => (a, c),
                _ => {
                    warn!(
                        "No tier mapping covers feed path {}, skipping",
                        item.path.display()
                    );
                    unmapped += 1;
                    continue;
                }
            };

            let (tier, primary) = if cache_path.is_file() {
                (Tier::Cache, cache_path.clone())
            } else if array_path.is_file() {
                (Tier::Array, array_path.clone())
            } else {
                debug!(
                    "Feed path {} exists on neither tier",
                    item.path.display()
                );
                (Tier::Unknown, array_path.clone())
            };

            let size = if tier == Tier::Unknown {
                0
            } else {
                fs::metadata(&primary).map(|m| m.len()).unwrap_or(0)
            };
            let companions = if tier == Tier::Unknown {
                Vec::new()
            } else {
                self.companions_for(&primary, tier, resolver, finder)
            };

            desired.push(MediaFile {
                canonical_path: array_path,
                cache_path,
                size,
                tier,
                priority: item.priority,
                companions,
            });
        }
        (desired, unmapped)
    }

    /// Discover companions of a primary on its current tier and resolve
    /// their twins on the other tier.
    fn companions_for(
        &self,
        primary: &Path,
        tier: Tier,
        resolver: &PathResolver,
        finder: &CompanionFinder,
    ) -> Vec<Companion> {
        let found = match finder.find(primary) {
            Ok(found) => found,
            Err(err) => {
                warn!(
                    "Companion scan failed for {}: {}",
                    primary.display(),
                    err
                );
                return Vec::new();
            }
        };

        let mut companions = Vec::new();
        for path in found {
            let size = fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
            let twins = match tier {
                Tier::Cache => resolver
                    .array_from_cache(&path)
                    .map(|array| (array, path.clone())),
                _ => resolver
                    .cache_from_array(&path)
                    .map(|cache| (path.clone(), cache)),
            };
            match twins {
                Ok((array_path, cache_path)) => companions.push(Companion {
                    array_path,
                    cache_path,
                    size,
                }),
                Err(err) => warn!("Skipping companion outside any mapping: {}", err),
            }
        }
        companions
    }

    /// Union of config-pinned paths and feed items flagged protected, as
    /// canonical paths. A protected path is never evicted even when the
    /// feed no longer desires it.
    fn protected_set(&self, doc: &FeedDocument, resolver: &PathResolver) -> HashSet<PathBuf> {
        let mut protected = HashSet::new();
        let logical = self
            .settings
            .protected
            .paths
            .iter()
            .chain(doc.items.iter().filter(|i| i.protected).map(|i| &i.path));
        for path in logical {
            match resolver.to_array_path(path) {
                Ok(canonical) => {
                    protected.insert(canonical);
                }
                Err(err) => warn!("Protected path has no mapping: {}", err),
            }
        }
        protected
    }

    fn cached_files(
        &self,
        scan: &CacheScan,
        resolver: &PathResolver,
        finder: &CompanionFinder,
    ) -> Vec<MediaFile> {
        scan.primaries
            .iter()
            .map(|sf| MediaFile {
                canonical_path: sf.canonical_path.clone(),
                cache_path: sf.cache_path.clone(),
                size: sf.size,
                tier: Tier::Cache,
                priority: 0,
                companions: self.companions_for(&sf.cache_path, Tier::Cache, resolver, finder),
            })
            .collect()
    }

    /// Most conservative figure across the configured cache roots. A root
    /// that does not exist yet is probed through its nearest existing
    /// ancestor: the filesystem that will hold it already has a real free
    /// figure, and the mover creates the directories on first promotion.
    /// Only unprobeable roots budget zero (eviction-only planning).
    fn free_cache_bytes(&self) -> u64 {
        let roots: BTreeSet<&PathBuf> =
            self.settings.mappings.iter().map(|m| &m.cache_root).collect();
        let mut min_free: Option<u64> = None;
        for root in roots {
            let probe_at = nearest_existing(root);
            match self.probe.available_space(probe_at) {
                Ok(free) => min_free = Some(min_free.map_or(free, |m| m.min(free))),
                Err(err) => warn!(
                    "Free-space probe failed for {}: {}",
                    probe_at.display(),
                    err
                ),
            }
        }
        min_free.unwrap_or(0)
    }

    /// Exclusions mirror the store: the cache twin of every record plus its
    /// on-cache companions.
    fn write_exclusions(
        &self,
        store: &TimestampStore,
        resolver: &PathResolver,
        finder: &CompanionFinder,
    ) -> Result<()> {
        let mut paths = BTreeSet::new();
        for (canonical, _) in store.iter() {
            let cache_path = match resolver.cache_from_array(canonical) {
                Ok(path) => path,
                Err(err) => {
                    warn!("Cached record outside any mapping: {}", err);
                    continue;
                }
            };
            if let Ok(companions) = finder.find(&cache_path) {
                paths.extend(companions);
            }
            paths.insert(cache_path);
        }
        ExclusionWriter::new(self.settings.exclusions_path()).write(&paths)
    }

    #[allow(clippy::too_many_arguments)]
    fn summarize(
        &self,
        run_id: String,
        started_at: DateTime<Utc>,
        options: &RunOptions,
        plan: &MovePlan,
        reports: Vec<ActionReport>,
        unmapped: usize,
        phase_millis: BTreeMap<String, u64>,
    ) -> RunSummary {
        let mut promoted = 0;
        let mut evicted = 0;
        let mut exec_skipped = 0;
        let mut failed = 0;
        let mut promoted_bytes = 0;
        let mut evicted_bytes = 0;
        let mut failures = Vec::new();

        for report in reports {
            match &report.outcome {
                MoveOutcome::Moved => match report.action.direction {
                    MoveDirection::Promote => {
                        promoted += 1;
                        promoted_bytes += report.action.bytes;
                    }
                    MoveDirection::Evict => {
                        evicted += 1;
                        evicted_bytes += report.action.bytes;
                    }
                },
                MoveOutcome::Skipped(_) => {
                    exec_skipped += 1;
                    failures.push(report);
                }
                MoveOutcome::Failed(_) => {
                    failed += 1;
                    failures.push(report);
                }
            }
        }

        let attempted = promoted + evicted + exec_skipped + failed;
        let status = if options.dry_run {
            RunStatus::Succeeded
        } else if failed > 0 || exec_skipped > 0 || attempted < plan.action_count() {
            RunStatus::PartiallyFailed
        } else {
            RunStatus::Succeeded
        };

        RunSummary {
            run_id,
            status,
            started_at,
            finished_at: Utc::now(),
            dry_run: options.dry_run,
            promoted,
            evicted,
            skipped: exec_skipped + plan.skipped.len(),
            failed,
            unmapped,
            promoted_bytes,
            evicted_bytes,
            planned_promotions: plan.promotions.len(),
            planned_evictions: plan.evictions.len(),
            failures,
            skipped_promotions: plan.skipped.clone(),
            phase_millis,
        }
    }
}

fn elapsed_ms(since: Instant) -> u64 {
    since.elapsed().as_millis() as u64
}

/// Closest ancestor of `path` that exists, `path` itself when it does.
/// Returns `path` unchanged if nothing up the chain exists; the probe then
/// surfaces the error.
fn nearest_existing(path: &Path) -> &Path {
    let mut current = path;
    while !current.exists() {
        match current.parent() {
            Some(parent) => current = parent,
            None => return path,
        }
    }
    current
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        CacheSettings, CompanionSettings, FeedSettings, ProtectedSettings, RetentionSettings,
        TierMapping,
    };
    use crate::disk::FixedSpace;
    use crate::feed::FeedItem;
    use tempfile::TempDir;

    fn settings(temp: &TempDir) -> Settings {
        Settings {
            mappings: vec![TierMapping {
                logical_root: PathBuf::from("/data/media"),
                cache_root: temp.path().join("cache"),
                array_root: temp.path().join("array"),
            }],
            data_dir: Some(temp.path().join("data")),
            feed: FeedSettings {
                path: temp.path().join("data").join("feed.json"),
            },
            cache: CacheSettings {
                safety_margin: 0,
                workers: 2,
                action_timeout_secs: 60,
            },
            retention: RetentionSettings::default(),
            companions: CompanionSettings::default(),
            protected: ProtectedSettings::default(),
        }
    }

    fn write_feed(settings: &Settings, items: Vec<FeedItem>) {
        let doc = FeedDocument {
            generated_at: Utc::now(),
            items,
        };
        fs::create_dir_all(settings.feed.path.parent().unwrap()).unwrap();
        fs::write(&settings.feed.path, serde_json::to_string(&doc).unwrap()).unwrap();
    }

    fn item(path: &str, priority: i64) -> FeedItem {
        FeedItem {
            path: PathBuf::from(path),
            priority,
            protected: false,
            kind: ItemKind::Ondeck,
            user: None,
            episode: None,
        }
    }

    fn orchestrator(settings: Settings, free: u64) -> Orchestrator {
        let feed = Box::new(JsonFileFeed::new(settings.feed.path.clone()));
        Orchestrator::with_collaborators(settings, feed, Box::new(FixedSpace(free)))
    }

    #[test]
    fn test_empty_feed_and_empty_cache_is_a_successful_noop() {
        let temp = TempDir::new().unwrap();
        let s = settings(&temp);
        write_feed(&s, Vec::new());

        let summary = orchestrator(s, 1_000)
            .trigger_run(&RunOptions::default(), None)
            .unwrap();

        assert_eq!(summary.status, RunStatus::Succeeded);
        assert_eq!(summary.promoted + summary.evicted + summary.failed, 0);
    }

    #[test]
    fn test_missing_feed_is_fatal_before_any_mutation() {
        let temp = TempDir::new().unwrap();
        let s = settings(&temp);
        let timestamps = s.timestamps_path();

        let err = orchestrator(s, 1_000)
            .trigger_run(&RunOptions::default(), None)
            .unwrap_err();

        assert!(matches!(err, EngineError::FeedUnavailable(_)));
        assert!(!timestamps.exists());
    }

    #[test]
    fn test_skip_refresh_without_snapshot_is_fatal() {
        let temp = TempDir::new().unwrap();
        let s = settings(&temp);
        write_feed(&s, Vec::new());

        let options = RunOptions {
            skip_feed_refresh: true,
            ..Default::default()
        };
        let err = orchestrator(s, 1_000)
            .trigger_run(&options, None)
            .unwrap_err();
        assert!(matches!(err, EngineError::FeedUnavailable(_)));
    }

    #[test]
    fn test_skip_refresh_reuses_snapshot() {
        let temp = TempDir::new().unwrap();
        let s = settings(&temp);
        write_feed(&s, Vec::new());

        let orch = orchestrator(s.clone(), 1_000);
        orch.trigger_run(&RunOptions::default(), None).unwrap();
        assert!(s.feed_snapshot_path().exists());

        // The live feed disappears; the snapshot covers.
        fs::remove_file(&s.feed.path).unwrap();
        let options = RunOptions {
            skip_feed_refresh: true,
            ..Default::default()
        };
        let summary = orch.trigger_run(&options, None).unwrap();
        assert_eq!(summary.status, RunStatus::Succeeded);
    }

    #[test]
    fn test_lock_contention_refuses_to_start() {
        let temp = TempDir::new().unwrap();
        let s = settings(&temp);
        write_feed(&s, Vec::new());
        fs::create_dir_all(s.data_dir()).unwrap();
        let _held = lock::try_lock_run(&s.lock_path()).unwrap();

        let err = orchestrator(s, 1_000)
            .trigger_run(&RunOptions::default(), None)
            .unwrap_err();
        assert!(matches!(err, EngineError::Lock(_)));
    }

    #[test]
    fn test_unmapped_feed_path_is_counted_not_fatal() {
        let temp = TempDir::new().unwrap();
        let s = settings(&temp);
        write_feed(&s, vec![item("/srv/elsewhere/X.mkv", 5)]);

        let summary = orchestrator(s, 1_000)
            .trigger_run(&RunOptions::default(), None)
            .unwrap();
        assert_eq!(summary.unmapped, 1);
        assert_eq!(summary.status, RunStatus::Succeeded);
    }

    #[test]
    fn test_nearest_existing_walks_up_to_a_real_directory() {
        let temp = TempDir::new().unwrap();
        let missing = temp.path().join("cache").join("media");
        assert_eq!(nearest_existing(&missing), temp.path());

        let present = temp.path().join("cache");
        fs::create_dir_all(&present).unwrap();
        assert_eq!(nearest_existing(&present), present.as_path());
    }

    #[test]
    fn test_dry_run_reports_plan_and_touches_nothing() {
        let temp = TempDir::new().unwrap();
        let s = settings(&temp);
        let array_file = temp.path().join("array").join("A.mkv");
        fs::create_dir_all(array_file.parent().unwrap()).unwrap();
        fs::write(&array_file, b"data").unwrap();
        write_feed(&s, vec![item("/data/media/A.mkv", 5)]);

        let options = RunOptions {
            dry_run: true,
            ..Default::default()
        };
        let summary = orchestrator(s.clone(), 1_000)
            .trigger_run(&options, None)
            .unwrap();

        assert!(summary.dry_run);
        assert_eq!(summary.planned_promotions, 1);
        assert_eq!(summary.promoted, 0);
        assert!(array_file.exists());
        assert!(!s.timestamps_path().exists());
        assert!(!s.exclusions_path().exists());
    }
}
