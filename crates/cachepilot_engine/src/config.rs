//! Configuration for cachepilot
//!
//! Settings live in a TOML file under the cachepilot home directory
//! (`~/.cachepilot` by default, `CACHEPILOT_HOME` overrides). The tier
//! mapping table is the only section without a usable default; everything
//! else falls back to conservative values.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Deserializer};

use crate::error::{EngineError, Result};

/// Default free-space safety margin kept on the cache tier.
pub const DEFAULT_SAFETY_MARGIN: u64 = 10 * 1024 * 1024 * 1024;

/// Default mover worker count. Move I/O is disk-bound; more threads mostly
/// add seek contention on spinning arrays.
pub const DEFAULT_WORKERS: usize = 2;

/// Default per-action deadline in seconds (large files on slow arrays).
pub const DEFAULT_ACTION_TIMEOUT_SECS: u64 = 900;

/// Companion extensions recognized out of the box (subtitle formats).
pub const DEFAULT_COMPANION_EXTENSIONS: &[&str] =
    &["srt", "sub", "idx", "ass", "ssa", "vtt", "smi", "sup"];

/// Get the cachepilot home directory: ~/.cachepilot
///
/// `CACHEPILOT_HOME` overrides, mirroring how tests and containers relocate
/// all state with a single variable.
pub fn cachepilot_home() -> PathBuf {
    if let Ok(override_path) = std::env::var("CACHEPILOT_HOME") {
        return PathBuf::from(override_path);
    }
    dirs::home_dir()
        .expect("Could not determine home directory")
        .join(".cachepilot")
}

/// Default config file path: ~/.cachepilot/config.toml
pub fn default_config_path() -> PathBuf {
    cachepilot_home().join("config.toml")
}

/// Default data directory for engine artifacts: ~/.cachepilot/data
pub fn default_data_dir() -> PathBuf {
    cachepilot_home().join("data")
}

/// One (logical root → cache root, array root) mapping.
///
/// Logical paths are what the media-server feed reports; the cache and
/// array roots are where those files physically live on this host.
#[derive(Debug, Clone, Deserialize)]
pub struct TierMapping {
    pub logical_root: PathBuf,
    pub cache_root: PathBuf,
    pub array_root: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FeedSettings {
    /// JSON document produced by the media-server collaborator.
    pub path: PathBuf,
}

impl Default for FeedSettings {
    fn default() -> Self {
        Self {
            path: default_data_dir().join("feed.json"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    /// Free space to keep untouched on the cache tier ("10GB", "512MB", ...).
    #[serde(deserialize_with = "de_size")]
    pub safety_margin: u64,
    /// Mover worker threads.
    pub workers: usize,
    /// Per-action deadline; exceeding it fails the action and rolls it back.
    pub action_timeout_secs: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            safety_margin: DEFAULT_SAFETY_MARGIN,
            workers: DEFAULT_WORKERS,
            action_timeout_secs: DEFAULT_ACTION_TIMEOUT_SECS,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RetentionSettings {
    /// Days an on-deck item stays cache-eligible after first appearing.
    /// 0 disables retention expiry.
    pub ondeck_days: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CompanionSettings {
    /// Extensions treated as companions of a media file (lowercase, no dot).
    pub extensions: Vec<String>,
}

impl Default for CompanionSettings {
    fn default() -> Self {
        Self {
            extensions: DEFAULT_COMPANION_EXTENSIONS
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ProtectedSettings {
    /// Logical paths that must never be evicted, regardless of the feed.
    pub paths: Vec<PathBuf>,
}

/// Engine settings. Unknown keys are ignored so older binaries keep reading
/// newer config files.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// Tier mapping table; longest logical prefix wins.
    #[serde(default)]
    pub mappings: Vec<TierMapping>,
    /// Override for the artifact directory (timestamps, exclusions, lock).
    pub data_dir: Option<PathBuf>,
    #[serde(default)]
    pub feed: FeedSettings,
    #[serde(default)]
    pub cache: CacheSettings,
    #[serde(default)]
    pub retention: RetentionSettings,
    #[serde(default)]
    pub companions: CompanionSettings,
    #[serde(default)]
    pub protected: ProtectedSettings,
}

impl Settings {
    /// Load settings from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            EngineError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        let settings: Settings = toml::from_str(&raw)
            .map_err(|e| EngineError::Config(format!("cannot parse {}: {e}", path.display())))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Resolved artifact directory.
    pub fn data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(default_data_dir)
    }

    pub fn timestamps_path(&self) -> PathBuf {
        self.data_dir().join("cache_timestamps.json")
    }

    pub fn exclusions_path(&self) -> PathBuf {
        self.data_dir().join("mover_exclude.txt")
    }

    pub fn feed_snapshot_path(&self) -> PathBuf {
        self.data_dir().join("feed_snapshot.json")
    }

    pub fn tracker_path(&self) -> PathBuf {
        self.data_dir().join("retention_tracker.json")
    }

    pub fn lock_path(&self) -> PathBuf {
        self.data_dir().join("run.lock")
    }

    fn validate(&self) -> Result<()> {
        if self.mappings.is_empty() {
            return Err(EngineError::Config(
                "at least one [[mappings]] entry is required".to_string(),
            ));
        }
        for mapping in &self.mappings {
            for (name, root) in [
                ("logical_root", &mapping.logical_root),
                ("cache_root", &mapping.cache_root),
                ("array_root", &mapping.array_root),
            ] {
                if !root.is_absolute() {
                    return Err(EngineError::Config(format!(
                        "{name} must be absolute: {}",
                        root.display()
                    )));
                }
            }
        }
        let mut seen = std::collections::HashSet::new();
        for mapping in &self.mappings {
            if !seen.insert(&mapping.logical_root) {
                return Err(EngineError::Config(format!(
                    "duplicate logical_root: {}",
                    mapping.logical_root.display()
                )));
            }
        }
        if self.cache.workers == 0 {
            return Err(EngineError::Config("cache.workers must be >= 1".to_string()));
        }
        if self.companions.extensions.is_empty() {
            return Err(EngineError::Config(
                "companions.extensions must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Parse a human-readable size string into bytes
///
/// Examples:
/// - "100" -> Ok(100)
/// - "1KB" -> Ok(1024)
/// - "10MB" -> Ok(10485760)
/// - "1.5GB" -> Ok(1610612736)
pub fn parse_size(size_str: &str) -> std::result::Result<u64, String> {
    let size_str = size_str.trim().to_uppercase();

    let (num_part, unit_part) = split_number_unit(&size_str);

    let num: f64 = num_part
        .parse()
        .map_err(|_| format!("Invalid number: '{}'", num_part))?;

    let multiplier: u64 = match unit_part {
        "" | "B" => 1,
        "K" | "KB" => 1024,
        "M" | "MB" => 1024 * 1024,
        "G" | "GB" => 1024 * 1024 * 1024,
        "T" | "TB" => 1024 * 1024 * 1024 * 1024,
        _ => return Err(format!("Unknown unit: '{}'", unit_part)),
    };

    Ok((num * multiplier as f64) as u64)
}

/// Split a size string into number and unit parts
fn split_number_unit(s: &str) -> (&str, &str) {
    let idx = s
        .char_indices()
        .find(|(_, c)| c.is_alphabetic())
        .map(|(i, _)| i)
        .unwrap_or(s.len());

    (&s[..idx], &s[idx..])
}

/// Accepts either a plain byte count or a size string like "10GB".
fn de_size<'de, D>(deserializer: D) -> std::result::Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Bytes(u64),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Bytes(n) => Ok(n),
        Raw::Text(s) => parse_size(&s).map_err(serde::de::Error::custom),
    }
}
