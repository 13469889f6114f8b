//! Companion discovery - subtitle and sidecar files that travel with media
//!
//! A companion of `Movie.mkv` is any regular file in the same directory whose
//! name starts with `Movie.` and whose extension is in the configured set, so
//! `Movie.srt`, `Movie.en.srt` and `Movie.en.forced.srt` all qualify while
//! `Movie2.srt` does not.

use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::config::CompanionSettings;
use crate::error::Result;

/// Finds sidecar files for a primary media file.
#[derive(Debug, Clone)]
pub struct CompanionFinder {
    /// Lowercased extensions, matched case-insensitively.
    extensions: HashSet<String>,
}

impl CompanionFinder {
    pub fn new(settings: &CompanionSettings) -> Self {
        let extensions = settings
            .extensions
            .iter()
            .map(|ext| ext.trim_start_matches('.').to_ascii_lowercase())
            .collect();
        Self { extensions }
    }

    /// Whether `path` carries a recognized companion extension.
    pub fn is_companion(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .map(|e| self.extensions.contains(&e.to_ascii_lowercase()))
            .unwrap_or(false)
    }

    /// List companions of `primary`, sorted by name. The primary itself is
    /// never included. A missing directory yields an empty list.
    pub fn find(&self, primary: &Path) -> Result<Vec<PathBuf>> {
        let Some(dir) = primary.parent() else {
            return Ok(Vec::new());
        };
        let Some(stem) = primary.file_stem().and_then(|s| s.to_str()) else {
            return Ok(Vec::new());
        };
        let prefix = format!("{stem}.");

        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let mut companions = Vec::new();
        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    warn!("Skipping unreadable entry in {}: {}", dir.display(), err);
                    continue;
                }
            };
            let path = entry.path();
            if path == primary {
                continue;
            }
            if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !name.starts_with(&prefix) {
                continue;
            }
            let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
                continue;
            };
            if self.extensions.contains(&ext.to_ascii_lowercase()) {
                companions.push(path);
            }
        }

        companions.sort();
        Ok(companions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn finder() -> CompanionFinder {
        CompanionFinder::new(&CompanionSettings::default())
    }

    fn touch(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, b"x").unwrap();
        path
    }

    #[test]
    fn test_finds_stem_prefixed_subtitles() {
        let temp = TempDir::new().unwrap();
        let primary = touch(temp.path(), "Movie.mkv");
        let srt = touch(temp.path(), "Movie.srt");
        let en = touch(temp.path(), "Movie.en.srt");
        let forced = touch(temp.path(), "Movie.en.forced.srt");

        let found = finder().find(&primary).unwrap();
        assert_eq!(found, vec![forced, en, srt]);
    }

    #[test]
    fn test_other_stems_do_not_match() {
        let temp = TempDir::new().unwrap();
        let primary = touch(temp.path(), "Movie.mkv");
        touch(temp.path(), "Movie2.srt");
        touch(temp.path(), "OtherMovie.srt");

        let found = finder().find(&primary).unwrap();
        assert!(found.is_empty());
    }

    #[test]
    fn test_prefix_alone_is_not_enough() {
        // "Movie2.mkv" must not claim "Movie.srt".
        let temp = TempDir::new().unwrap();
        let primary = touch(temp.path(), "Movie2.mkv");
        touch(temp.path(), "Movie.srt");
        let own = touch(temp.path(), "Movie2.srt");

        let found = finder().find(&primary).unwrap();
        assert_eq!(found, vec![own]);
    }

    #[test]
    fn test_extension_match_is_case_insensitive() {
        let temp = TempDir::new().unwrap();
        let primary = touch(temp.path(), "Movie.mkv");
        let upper = touch(temp.path(), "Movie.SRT");

        let found = finder().find(&primary).unwrap();
        assert_eq!(found, vec![upper]);
    }

    #[test]
    fn test_unrecognized_extensions_ignored() {
        let temp = TempDir::new().unwrap();
        let primary = touch(temp.path(), "Movie.mkv");
        touch(temp.path(), "Movie.nfo");
        touch(temp.path(), "Movie.jpg");

        let found = finder().find(&primary).unwrap();
        assert!(found.is_empty());
    }

    #[test]
    fn test_missing_directory_is_empty() {
        let temp = TempDir::new().unwrap();
        let primary = temp.path().join("nope").join("Movie.mkv");
        let found = finder().find(&primary).unwrap();
        assert!(found.is_empty());
    }
}
