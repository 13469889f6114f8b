//! Maintenance audit and repair
//!
//! Interrupted runs, manual file shuffling and external tools all leave
//! debris: orphaned `.cpbak` backups, exclusion entries for files that are
//! gone, timestamp records with no file behind them, files present on both
//! tiers. The audit finds all of it without touching anything; each fix
//! action previews by default and applies only when asked.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::companion::CompanionFinder;
use crate::config::Settings;
use crate::error::Result;
use crate::exclusions::ExclusionWriter;
use crate::mover::{BACKUP_EXT, PARTIAL_EXT};
use crate::paths::PathResolver;
use crate::scan;
use crate::store::TimestampStore;

/// A file found on both tiers at once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DuplicateEntry {
    /// Canonical array-tier path.
    pub canonical_path: PathBuf,
    pub cache_path: PathBuf,
}

/// Everything the audit found. Empty vectors mean a healthy layout.
#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditReport {
    /// Orphaned `.cpbak` files on either tier.
    pub backups: Vec<PathBuf>,
    /// Interrupted `.cp_partial` copies.
    pub partials: Vec<PathBuf>,
    /// Exclusion entries whose file is gone.
    pub stale_exclusions: Vec<PathBuf>,
    /// Timestamp records whose cache file is gone.
    pub stale_records: Vec<PathBuf>,
    /// Files present on both tiers.
    pub duplicates: Vec<DuplicateEntry>,
    /// Cache residents the store does not know about.
    pub unrecorded: Vec<PathBuf>,
}

impl AuditReport {
    pub fn is_clean(&self) -> bool {
        self.backups.is_empty()
            && self.partials.is_empty()
            && self.stale_exclusions.is_empty()
            && self.stale_records.is_empty()
            && self.duplicates.is_empty()
            && self.unrecorded.is_empty()
    }

    pub fn finding_count(&self) -> usize {
        self.backups.len()
            + self.partials.len()
            + self.stale_exclusions.len()
            + self.stale_records.len()
            + self.duplicates.len()
            + self.unrecorded.len()
    }
}

/// Per-path result of a fix action. `applied` is false for previews and
/// for paths the fix deliberately left alone.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FixOutcome {
    pub path: PathBuf,
    pub applied: bool,
    pub detail: String,
}

impl FixOutcome {
    fn new(path: &Path, applied: bool, detail: impl Into<String>) -> Self {
        Self {
            path: path.to_path_buf(),
            applied,
            detail: detail.into(),
        }
    }
}

/// Which copy survives when resolving a duplicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepTier {
    Cache,
    Array,
}

/// Inspect both tiers and every artifact. Read-only.
pub fn run_audit(settings: &Settings) -> Result<AuditReport> {
    let resolver = PathResolver::new(settings.mappings.clone());
    let finder = CompanionFinder::new(&settings.companions);
    let mut report = AuditReport::default();

    for path in mover_debris(settings) {
        match path.extension().and_then(|e| e.to_str()) {
            Some(BACKUP_EXT) => report.backups.push(path),
            Some(PARTIAL_EXT) => report.partials.push(path),
            _ => {}
        }
    }

    let cache_scan = scan::scan_cache(&settings.mappings, &resolver, &finder)?;
    let store = TimestampStore::load(&settings.timestamps_path())?;
    let exclusions = ExclusionWriter::new(settings.exclusions_path()).read()?;

    for entry in &exclusions {
        if !entry.exists() {
            report.stale_exclusions.push(entry.clone());
        }
    }

    for (canonical, _) in store.iter() {
        let gone = match resolver.cache_from_array(canonical) {
            Ok(cache_path) => !cache_path.is_file(),
            Err(_) => true,
        };
        if gone {
            report.stale_records.push(canonical.clone());
        }
    }

    for file in &cache_scan.primaries {
        if file.canonical_path.is_file() {
            report.duplicates.push(DuplicateEntry {
                canonical_path: file.canonical_path.clone(),
                cache_path: file.cache_path.clone(),
            });
        }
        if !store.contains(&file.canonical_path) {
            report.unrecorded.push(file.canonical_path.clone());
        }
    }

    debug!(findings = report.finding_count(), "Audit complete");
    Ok(report)
}

/// Put orphaned `.cpbak` files back under their original names. A backup
/// whose original reappeared is left alone; that is a duplicate question,
/// not a restore.
pub fn restore_backups(settings: &Settings, dry_run: bool) -> Result<Vec<FixOutcome>> {
    let mut outcomes = Vec::new();
    for backup in mover_debris(settings) {
        if backup.extension().and_then(|e| e.to_str()) != Some(BACKUP_EXT) {
            continue;
        }
        let original = backup.with_extension("");
        if original.exists() {
            outcomes.push(FixOutcome::new(
                &backup,
                false,
                "original present, left in place",
            ));
            continue;
        }
        if dry_run {
            outcomes.push(FixOutcome::new(
                &backup,
                false,
                format!("would restore to {}", original.display()),
            ));
            continue;
        }
        match fs::rename(&backup, &original) {
            Ok(()) => {
                info!("Restored {} from backup", original.display());
                outcomes.push(FixOutcome::new(&backup, true, "restored"));
            }
            Err(err) => outcomes.push(FixOutcome::new(&backup, false, err.to_string())),
        }
    }
    Ok(outcomes)
}

/// Drop exclusion entries whose file no longer exists.
pub fn clean_exclusions(settings: &Settings, dry_run: bool) -> Result<Vec<FixOutcome>> {
    let writer = ExclusionWriter::new(settings.exclusions_path());
    let entries = writer.read()?;

    let mut kept = BTreeSet::new();
    let mut outcomes = Vec::new();
    for entry in entries {
        if entry.exists() {
            kept.insert(entry);
        } else if dry_run {
            outcomes.push(FixOutcome::new(&entry, false, "would remove stale entry"));
        } else {
            outcomes.push(FixOutcome::new(&entry, true, "removed stale entry"));
        }
    }

    if !dry_run && !outcomes.is_empty() {
        writer.write(&kept)?;
    }
    Ok(outcomes)
}

/// Drop timestamp records whose cache file no longer exists.
pub fn clean_records(settings: &Settings, dry_run: bool) -> Result<Vec<FixOutcome>> {
    let resolver = PathResolver::new(settings.mappings.clone());
    let mut store = TimestampStore::load(&settings.timestamps_path())?;

    let stale: Vec<PathBuf> = store
        .iter()
        .filter_map(|(canonical, _)| {
            let gone = match resolver.cache_from_array(canonical) {
                Ok(cache_path) => !cache_path.is_file(),
                Err(_) => true,
            };
            gone.then(|| canonical.clone())
        })
        .collect();

    let mut outcomes = Vec::new();
    for canonical in stale {
        if dry_run {
            outcomes.push(FixOutcome::new(&canonical, false, "would remove stale record"));
        } else {
            store.mark_evicted(&canonical);
            outcomes.push(FixOutcome::new(&canonical, true, "removed stale record"));
        }
    }

    if !dry_run && outcomes.iter().any(|o| o.applied) {
        store.save()?;
    }
    Ok(outcomes)
}

/// Delete one copy of a file present on both tiers and bring the store in
/// line with the survivor.
pub fn resolve_duplicate(
    settings: &Settings,
    canonical: &Path,
    keep: KeepTier,
    dry_run: bool,
) -> Result<Vec<FixOutcome>> {
    let resolver = PathResolver::new(settings.mappings.clone());
    let cache_path = match resolver.cache_from_array(canonical) {
        Ok(path) => path,
        Err(err) => return Ok(vec![FixOutcome::new(canonical, false, err.to_string())]),
    };

    if !canonical.is_file() || !cache_path.is_file() {
        return Ok(vec![FixOutcome::new(
            canonical,
            false,
            "not present on both tiers, nothing to resolve",
        )]);
    }

    let doomed = match keep {
        KeepTier::Cache => canonical,
        KeepTier::Array => cache_path.as_path(),
    };
    if dry_run {
        return Ok(vec![FixOutcome::new(
            doomed,
            false,
            format!("would delete, keeping the {} copy", tier_name(keep)),
        )]);
    }

    fs::remove_file(doomed)?;
    let mut store = TimestampStore::load(&settings.timestamps_path())?;
    match keep {
        KeepTier::Cache => store.mark_cached(canonical, Utc::now()),
        KeepTier::Array => {
            store.mark_evicted(canonical);
        }
    }
    store.save()?;
    info!(
        "Resolved duplicate for {}, kept the {} copy",
        canonical.display(),
        tier_name(keep)
    );
    Ok(vec![FixOutcome::new(doomed, true, "deleted")])
}

fn tier_name(keep: KeepTier) -> &'static str {
    match keep {
        KeepTier::Cache => "cache",
        KeepTier::Array => "array",
    }
}

/// All `.cpbak` and `.cp_partial` files under every configured root, both
/// tiers, sorted.
fn mover_debris(settings: &Settings) -> Vec<PathBuf> {
    let mut roots: BTreeSet<&PathBuf> = settings.mappings.iter().map(|m| &m.cache_root).collect();
    roots.extend(settings.mappings.iter().map(|m| &m.array_root));

    let mut found = Vec::new();
    for root in roots {
        if !root.exists() {
            continue;
        }
        for entry in WalkDir::new(root).into_iter().filter_map(|e| e.ok()) {
            if !entry.file_type().is_file() {
                continue;
            }
            if matches!(
                entry.path().extension().and_then(|e| e.to_str()),
                Some(BACKUP_EXT) | Some(PARTIAL_EXT)
            ) {
                found.push(entry.path().to_path_buf());
            }
        }
    }
    found.sort();
    found
}
