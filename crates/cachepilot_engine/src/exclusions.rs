//! Exclusion list - what the external array mover must leave alone
//!
//! The array-maintenance tool that rebalances files back onto the array
//! would happily undo every promotion. It consumes a flat text artifact of
//! cache-tier paths to skip; the engine rewrites it in full after every run
//! so it always mirrors the timestamp store. One absolute path per line,
//! lexically sorted, atomic replace.

use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::Result;
use crate::store::atomic_write;

/// Writes and reads the exclusion artifact.
#[derive(Debug, Clone)]
pub struct ExclusionWriter {
    path: PathBuf,
}

impl ExclusionWriter {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Full rewrite. The BTreeSet input keeps the output lexically sorted
    /// and duplicate-free by construction.
    pub fn write(&self, cached_paths: &BTreeSet<PathBuf>) -> Result<()> {
        let mut out = String::new();
        for path in cached_paths {
            out.push_str(&path.to_string_lossy());
            out.push('\n');
        }
        atomic_write(&self.path, out.as_bytes())?;
        debug!(
            "Wrote {} exclusion entries to {}",
            cached_paths.len(),
            self.path.display()
        );
        Ok(())
    }

    /// Read the current artifact. Missing file reads as empty; blank lines
    /// are ignored.
    pub fn read(&self) -> Result<BTreeSet<PathBuf>> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(BTreeSet::new()),
            Err(err) => return Err(err.into()),
        };
        Ok(raw
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(PathBuf::from)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_write_is_sorted_with_trailing_newline() {
        let temp = TempDir::new().unwrap();
        let writer = ExclusionWriter::new(temp.path().join("mover_exclude.txt"));

        let paths: BTreeSet<PathBuf> = ["/mnt/cache/media/z.mkv", "/mnt/cache/media/a.mkv"]
            .iter()
            .map(PathBuf::from)
            .collect();
        writer.write(&paths).unwrap();

        let raw = fs::read_to_string(writer.path()).unwrap();
        assert_eq!(raw, "/mnt/cache/media/a.mkv\n/mnt/cache/media/z.mkv\n");
    }

    #[test]
    fn test_rewrite_replaces_not_appends() {
        let temp = TempDir::new().unwrap();
        let writer = ExclusionWriter::new(temp.path().join("mover_exclude.txt"));

        let first: BTreeSet<PathBuf> = [PathBuf::from("/mnt/cache/media/old.mkv")]
            .into_iter()
            .collect();
        writer.write(&first).unwrap();

        let second: BTreeSet<PathBuf> = [PathBuf::from("/mnt/cache/media/new.mkv")]
            .into_iter()
            .collect();
        writer.write(&second).unwrap();

        assert_eq!(writer.read().unwrap(), second);
    }

    #[test]
    fn test_missing_artifact_reads_empty() {
        let temp = TempDir::new().unwrap();
        let writer = ExclusionWriter::new(temp.path().join("nope.txt"));
        assert!(writer.read().unwrap().is_empty());
    }

    #[test]
    fn test_empty_set_writes_empty_file() {
        let temp = TempDir::new().unwrap();
        let writer = ExclusionWriter::new(temp.path().join("mover_exclude.txt"));
        writer.write(&BTreeSet::new()).unwrap();
        assert_eq!(fs::read_to_string(writer.path()).unwrap(), "");
    }
}
