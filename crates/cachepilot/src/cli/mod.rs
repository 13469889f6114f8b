//! CLI command implementations.

pub mod maintain;
pub mod output;
pub mod run;
pub mod status;
