//! `cachepilot status` - what is on the cache tier right now.

use anyhow::Result;
use serde_json::json;
use std::process::ExitCode;

use cachepilot_engine::companion::CompanionFinder;
use cachepilot_engine::disk::{FsProbe, SpaceProbe};
use cachepilot_engine::exclusions::ExclusionWriter;
use cachepilot_engine::paths::PathResolver;
use cachepilot_engine::scan;
use cachepilot_engine::store::TimestampStore;
use cachepilot_engine::Settings;

use super::output::{format_age, format_size, print_table};

pub fn run(settings: &Settings, json: bool) -> Result<ExitCode> {
    let resolver = PathResolver::new(settings.mappings.clone());
    let finder = CompanionFinder::new(&settings.companions);

    let scan = scan::scan_cache(&settings.mappings, &resolver, &finder)?;
    let store = TimestampStore::load(&settings.timestamps_path())?;
    let exclusions = ExclusionWriter::new(settings.exclusions_path()).read()?;

    let cached_bytes: u64 = scan.primaries.iter().map(|f| f.size).sum();
    let probe = FsProbe;
    let free: Vec<(String, Option<u64>)> = settings
        .mappings
        .iter()
        .map(|m| {
            let bytes = if m.cache_root.exists() {
                probe.available_space(&m.cache_root).ok()
            } else {
                None
            };
            (m.cache_root.display().to_string(), bytes)
        })
        .collect();

    if json {
        let files: Vec<_> = scan
            .primaries
            .iter()
            .map(|f| {
                let record = store.get(&f.canonical_path);
                json!({
                    "canonicalPath": f.canonical_path,
                    "cachePath": f.cache_path,
                    "bytes": f.size,
                    "cachedSince": record.map(|r| r.cached_since),
                    "lastSeen": record.map(|r| r.last_seen),
                })
            })
            .collect();
        let output = json!({
            "cachedFiles": files,
            "cachedPrimaries": scan.primaries.len(),
            "cachedCompanions": scan.companions.len(),
            "cachedBytes": cached_bytes,
            "freeBytesByCacheRoot": free
                .iter()
                .map(|(root, bytes)| json!({ "root": root, "freeBytes": bytes }))
                .collect::<Vec<_>>(),
            "exclusionEntries": exclusions.len(),
            "artifacts": {
                "timestamps": settings.timestamps_path(),
                "exclusions": settings.exclusions_path(),
                "retentionTracker": settings.tracker_path(),
                "feedSnapshot": settings.feed_snapshot_path(),
            },
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(ExitCode::SUCCESS);
    }

    if scan.primaries.is_empty() {
        println!("Cache tier is empty");
    } else {
        print_table(
            &["Cached file", "Size", "Cached", "Last seen"],
            scan.primaries
                .iter()
                .map(|f| {
                    let record = store.get(&f.canonical_path);
                    vec![
                        f.cache_path.display().to_string(),
                        format_size(f.size),
                        record
                            .map(|r| format_age(r.cached_since))
                            .unwrap_or_else(|| "unrecorded".to_string()),
                        record
                            .map(|r| format_age(r.last_seen))
                            .unwrap_or_else(|| "unrecorded".to_string()),
                    ]
                })
                .collect(),
        );
    }

    println!(
        "\n{} primary file(s), {} companion(s), {} on cache",
        scan.primaries.len(),
        scan.companions.len(),
        format_size(cached_bytes)
    );
    for (root, bytes) in &free {
        match bytes {
            Some(bytes) => println!("Free on {}: {}", root, format_size(*bytes)),
            None => println!("Free on {}: unavailable", root),
        }
    }
    println!("Exclusion entries: {}", exclusions.len());
    println!("Timestamp store:   {}", settings.timestamps_path().display());
    println!("Exclusion list:    {}", settings.exclusions_path().display());

    Ok(ExitCode::SUCCESS)
}
