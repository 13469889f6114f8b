//! Logical ↔ physical path mapping
//!
//! The media-server feed reports logical library paths. Each configured
//! mapping pins a logical root to the concrete cache-tier and array-tier
//! roots on this host. Resolution is pure path arithmetic: longest matching
//! logical prefix wins, no filesystem access.

use std::path::{Path, PathBuf};

use crate::config::TierMapping;
use crate::error::{EngineError, Result};

/// Resolves logical feed paths to physical tier paths and back.
#[derive(Debug, Clone)]
pub struct PathResolver {
    /// Sorted by descending logical-root component count so the first
    /// prefix hit is the longest match.
    mappings: Vec<TierMapping>,
}

impl PathResolver {
    pub fn new(mut mappings: Vec<TierMapping>) -> Self {
        mappings.sort_by_key(|m| std::cmp::Reverse(m.logical_root.components().count()));
        Self { mappings }
    }

    /// Cache-tier path for a logical path.
    pub fn to_cache_path(&self, logical: &Path) -> Result<PathBuf> {
        let (mapping, rel) = self.match_logical(logical)?;
        Ok(mapping.cache_root.join(rel))
    }

    /// Array-tier path for a logical path.
    pub fn to_array_path(&self, logical: &Path) -> Result<PathBuf> {
        let (mapping, rel) = self.match_logical(logical)?;
        Ok(mapping.array_root.join(rel))
    }

    /// Logical path for a cache-tier path.
    pub fn logical_from_cache(&self, cache_path: &Path) -> Result<PathBuf> {
        self.reverse(cache_path, |m| &m.cache_root)
    }

    /// Logical path for an array-tier path.
    pub fn logical_from_array(&self, array_path: &Path) -> Result<PathBuf> {
        self.reverse(array_path, |m| &m.array_root)
    }

    /// Translate a cache-tier path straight to its array-tier twin.
    pub fn array_from_cache(&self, cache_path: &Path) -> Result<PathBuf> {
        let logical = self.logical_from_cache(cache_path)?;
        self.to_array_path(&logical)
    }

    /// Translate an array-tier path straight to its cache-tier twin.
    pub fn cache_from_array(&self, array_path: &Path) -> Result<PathBuf> {
        let logical = self.logical_from_array(array_path)?;
        self.to_cache_path(&logical)
    }

    fn match_logical<'a>(&self, logical: &'a Path) -> Result<(&TierMapping, &'a Path)> {
        for mapping in &self.mappings {
            if let Ok(rel) = logical.strip_prefix(&mapping.logical_root) {
                return Ok((mapping, rel));
            }
        }
        Err(EngineError::UnmappedPath(logical.to_path_buf()))
    }

    fn reverse<'a, F>(&'a self, physical: &Path, root: F) -> Result<PathBuf>
    where
        F: Fn(&'a TierMapping) -> &'a PathBuf,
    {
        for mapping in &self.mappings {
            if let Ok(rel) = physical.strip_prefix(root(mapping)) {
                return Ok(mapping.logical_root.join(rel));
            }
        }
        Err(EngineError::UnmappedPath(physical.to_path_buf()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver() -> PathResolver {
        PathResolver::new(vec![
            TierMapping {
                logical_root: PathBuf::from("/data/media"),
                cache_root: PathBuf::from("/mnt/cache/media"),
                array_root: PathBuf::from("/mnt/user0/media"),
            },
            TierMapping {
                logical_root: PathBuf::from("/data/media/4k"),
                cache_root: PathBuf::from("/mnt/cache/4k"),
                array_root: PathBuf::from("/mnt/user0/4k"),
            },
        ])
    }

    #[test]
    fn test_forward_mapping() {
        let r = resolver();
        assert_eq!(
            r.to_cache_path(Path::new("/data/media/movies/A.mkv")).unwrap(),
            PathBuf::from("/mnt/cache/media/movies/A.mkv")
        );
        assert_eq!(
            r.to_array_path(Path::new("/data/media/movies/A.mkv")).unwrap(),
            PathBuf::from("/mnt/user0/media/movies/A.mkv")
        );
    }

    #[test]
    fn test_longest_prefix_wins() {
        let r = resolver();
        assert_eq!(
            r.to_cache_path(Path::new("/data/media/4k/B.mkv")).unwrap(),
            PathBuf::from("/mnt/cache/4k/B.mkv")
        );
    }

    #[test]
    fn test_reverse_mapping_round_trips() {
        let r = resolver();
        let logical = Path::new("/data/media/shows/S01E01.mkv");
        let cache = r.to_cache_path(logical).unwrap();
        let array = r.to_array_path(logical).unwrap();
        assert_eq!(r.logical_from_cache(&cache).unwrap(), logical);
        assert_eq!(r.logical_from_array(&array).unwrap(), logical);
        assert_eq!(r.array_from_cache(&cache).unwrap(), array);
        assert_eq!(r.cache_from_array(&array).unwrap(), cache);
    }

    #[test]
    fn test_unmapped_path_is_an_error() {
        let r = resolver();
        let err = r.to_cache_path(Path::new("/srv/other/C.mkv")).unwrap_err();
        assert!(matches!(err, EngineError::UnmappedPath(_)));
    }

    #[test]
    fn test_prefix_match_respects_component_boundaries() {
        // "/data/mediafoo" must not match the "/data/media" root.
        let r = resolver();
        assert!(r.to_cache_path(Path::new("/data/mediafoo/X.mkv")).is_err());
    }
}
