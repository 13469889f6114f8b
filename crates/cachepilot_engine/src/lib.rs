//! cachepilot engine - two-tier cache residency for a media library
//!
//! The engine keeps watch-relevant media files on a fast cache tier and
//! everything else on the backing array tier. An external feed says what
//! should be cached; the engine plans promotions and evictions under a
//! space budget and executes them with rollback guarantees.
//!
//! Components, leaves first:
//! - [`paths`]: logical feed paths to physical tier paths and back
//! - [`store`]: durable record of what is cached and since when
//! - [`companion`]: subtitle/sidecar discovery
//! - [`planner`]: promote/evict selection under the byte budget
//! - [`mover`]: backup-then-commit move execution
//! - [`exclusions`]: the skip list for the external array mover
//! - [`run`]: the orchestrator tying one run together
//!
//! Around those: [`config`], [`feed`], [`scan`], [`tracker`], [`lock`],
//! [`cancel`], [`disk`], [`maintain`].

pub mod cancel;
pub mod companion;
pub mod config;
pub mod disk;
pub mod error;
pub mod exclusions;
pub mod feed;
pub mod lock;
pub mod maintain;
pub mod mover;
pub mod paths;
pub mod planner;
pub mod run;
pub mod scan;
pub mod store;
pub mod tracker;
pub mod types;

pub use cancel::CancellationToken;
pub use config::Settings;
pub use error::{EngineError, Result};
pub use run::{Orchestrator, RunOptions};
pub use types::{RunStatus, RunSummary};
