//! Free-space probing for the cache tier

use std::path::Path;

use crate::error::Result;

/// Source of free-space figures. The planner budgets against this; tests
/// substitute a fixed value.
pub trait SpaceProbe: Send + Sync {
    /// Bytes available to unprivileged writes on the filesystem holding
    /// `path`.
    fn available_space(&self, path: &Path) -> Result<u64>;
}

/// Probes the real filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct FsProbe;

impl SpaceProbe for FsProbe {
    fn available_space(&self, path: &Path) -> Result<u64> {
        Ok(fs2::available_space(path)?)
    }
}

/// Reports one fixed figure for every path. Used by tests and dry planning
/// against hypothetical space.
#[derive(Debug, Clone, Copy)]
pub struct FixedSpace(pub u64);

impl SpaceProbe for FixedSpace {
    fn available_space(&self, _path: &Path) -> Result<u64> {
        Ok(self.0)
    }
}
