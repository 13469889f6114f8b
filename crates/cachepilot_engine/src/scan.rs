//! Cache-tier scan - what is physically on the fast tier
//!
//! The timestamp store records what the engine believes is cached; the scan
//! reports what actually is. The orchestrator reconciles the two before
//! planning, so files that appeared or vanished behind the engine's back
//! are handled instead of trusted.

use std::collections::BTreeSet;
use std::fs;
use std::path::PathBuf;

use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::companion::CompanionFinder;
use crate::config::TierMapping;
use crate::error::Result;
use crate::mover::{BACKUP_EXT, PARTIAL_EXT};
use crate::paths::PathResolver;

/// One regular file found on the cache tier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedFile {
    /// Canonical array-tier identity.
    pub canonical_path: PathBuf,
    pub cache_path: PathBuf,
    pub size: u64,
}

/// Everything found under the configured cache roots.
#[derive(Debug, Default)]
pub struct CacheScan {
    /// Media files, the planner's eviction candidates.
    pub primaries: Vec<ScannedFile>,
    /// Sidecar files; they move with their primaries, never on their own.
    pub companions: Vec<ScannedFile>,
}

impl CacheScan {
    pub fn total_files(&self) -> usize {
        self.primaries.len() + self.companions.len()
    }
}

/// Walk every configured cache root and classify what lives there.
///
/// Backup (`.cpbak`) and in-flight copy (`.cp_partial`) files belong to the
/// mover and are invisible here; the audit command reports them instead.
/// A cache root that does not exist yet scans as empty.
pub fn scan_cache(
    mappings: &[TierMapping],
    resolver: &PathResolver,
    finder: &CompanionFinder,
) -> Result<CacheScan> {
    let mut scan = CacheScan::default();

    // Two mappings may share one cache root; walk each root once.
    let roots: BTreeSet<&PathBuf> = mappings.iter().map(|m| &m.cache_root).collect();

    for root in roots {
        if !root.exists() {
            debug!("Cache root {} does not exist, scanning as empty", root.display());
            continue;
        }
        for entry in WalkDir::new(root).into_iter().filter_map(|e| e.ok()) {
            let path = entry.path();
            if !entry.file_type().is_file() {
                continue;
            }
            if matches!(
                path.extension().and_then(|e| e.to_str()),
                Some(BACKUP_EXT) | Some(PARTIAL_EXT)
            ) {
                continue;
            }

            let metadata = match fs::metadata(path) {
                Ok(m) => m,
                Err(err) => {
                    warn!("Skipping unreadable file {}: {}", path.display(), err);
                    continue;
                }
            };

            let canonical_path = match resolver.array_from_cache(path) {
                Ok(p) => p,
                Err(err) => {
                    warn!("Skipping cache file outside any mapping: {}", err);
                    continue;
                }
            };

            let file = ScannedFile {
                canonical_path,
                cache_path: path.to_path_buf(),
                size: metadata.len(),
            };
            if finder.is_companion(path) {
                scan.companions.push(file);
            } else {
                scan.primaries.push(file);
            }
        }
    }

    scan.primaries.sort_by(|a, b| a.cache_path.cmp(&b.cache_path));
    scan.companions.sort_by(|a, b| a.cache_path.cmp(&b.cache_path));

    debug!(
        primaries = scan.primaries.len(),
        companions = scan.companions.len(),
        "Scanned cache tier"
    );
    Ok(scan)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CompanionSettings;
    use std::path::Path;
    use tempfile::TempDir;

    fn mapping(temp: &TempDir) -> TierMapping {
        TierMapping {
            logical_root: PathBuf::from("/data/media"),
            cache_root: temp.path().join("cache"),
            array_root: temp.path().join("array"),
        }
    }

    fn write(path: &Path, bytes: &[u8]) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, bytes).unwrap();
    }

    #[test]
    fn test_scan_classifies_and_sizes() {
        let temp = TempDir::new().unwrap();
        let m = mapping(&temp);
        write(&m.cache_root.join("movies/A.mkv"), &[0u8; 100]);
        write(&m.cache_root.join("movies/A.srt"), &[0u8; 5]);
        write(&m.cache_root.join("shows/B.mkv"), &[0u8; 50]);

        let resolver = PathResolver::new(vec![m.clone()]);
        let finder = CompanionFinder::new(&CompanionSettings::default());
        let scan = scan_cache(std::slice::from_ref(&m), &resolver, &finder).unwrap();

        assert_eq!(scan.primaries.len(), 2);
        assert_eq!(scan.companions.len(), 1);
        assert_eq!(scan.primaries[0].size, 100);
        assert_eq!(
            scan.primaries[0].canonical_path,
            temp.path().join("array/movies/A.mkv")
        );
    }

    #[test]
    fn test_scan_skips_mover_internals() {
        let temp = TempDir::new().unwrap();
        let m = mapping(&temp);
        write(&m.cache_root.join("A.mkv"), &[0u8; 10]);
        write(&m.cache_root.join("A.mkv.cpbak"), &[0u8; 10]);
        write(&m.cache_root.join("B.mkv.cp_partial"), &[0u8; 10]);

        let resolver = PathResolver::new(vec![m.clone()]);
        let finder = CompanionFinder::new(&CompanionSettings::default());
        let scan = scan_cache(std::slice::from_ref(&m), &resolver, &finder).unwrap();

        assert_eq!(scan.total_files(), 1);
        assert_eq!(scan.primaries[0].cache_path, m.cache_root.join("A.mkv"));
    }

    #[test]
    fn test_missing_cache_root_is_empty() {
        let temp = TempDir::new().unwrap();
        let m = mapping(&temp);

        let resolver = PathResolver::new(vec![m.clone()]);
        let finder = CompanionFinder::new(&CompanionSettings::default());
        let scan = scan_cache(std::slice::from_ref(&m), &resolver, &finder).unwrap();

        assert_eq!(scan.total_files(), 0);
    }

    #[test]
    fn test_shared_cache_root_scanned_once() {
        let temp = TempDir::new().unwrap();
        let m1 = mapping(&temp);
        let mut m2 = mapping(&temp);
        m2.logical_root = PathBuf::from("/data/media/4k");

        write(&m1.cache_root.join("A.mkv"), &[0u8; 10]);

        let mappings = vec![m1, m2];
        let resolver = PathResolver::new(mappings.clone());
        let finder = CompanionFinder::new(&CompanionSettings::default());
        let scan = scan_cache(&mappings, &resolver, &finder).unwrap();

        assert_eq!(scan.primaries.len(), 1);
    }
}
