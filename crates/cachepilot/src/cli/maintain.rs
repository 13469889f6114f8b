//! `cachepilot audit` and `cachepilot fix` - tier and artifact repair.
//!
//! Every fix previews by default; `--apply` makes it real.

use anyhow::Result;
use clap::{Subcommand, ValueEnum};
use std::path::PathBuf;
use std::process::ExitCode;

use cachepilot_engine::maintain::{self, AuditReport, FixOutcome, KeepTier};
use cachepilot_engine::Settings;

use super::output::print_table;

#[derive(Subcommand, Debug)]
pub enum FixAction {
    /// Restore orphaned backup files to their original names
    RestoreBackups {
        /// Apply the fix (default: preview)
        #[arg(long)]
        apply: bool,
    },

    /// Drop exclusion entries whose file is gone
    CleanExclusions {
        /// Apply the fix (default: preview)
        #[arg(long)]
        apply: bool,
    },

    /// Drop timestamp records whose cache file is gone
    CleanTimestamps {
        /// Apply the fix (default: preview)
        #[arg(long)]
        apply: bool,
    },

    /// Delete one copy of a file present on both tiers
    ResolveDuplicate {
        /// Canonical array-tier path of the duplicate
        path: PathBuf,

        /// Which copy survives
        #[arg(long, value_enum, default_value_t = KeepArg::Cache)]
        keep: KeepArg,

        /// Apply the fix (default: preview)
        #[arg(long)]
        apply: bool,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
pub enum KeepArg {
    Cache,
    Array,
}

impl From<KeepArg> for KeepTier {
    fn from(keep: KeepArg) -> Self {
        match keep {
            KeepArg::Cache => KeepTier::Cache,
            KeepArg::Array => KeepTier::Array,
        }
    }
}

pub fn audit(settings: &Settings, json: bool) -> Result<ExitCode> {
    let report = maintain::run_audit(settings)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(ExitCode::SUCCESS);
    }

    if report.is_clean() {
        println!("No inconsistencies found");
        return Ok(ExitCode::SUCCESS);
    }

    println!("{} finding(s)\n", report.finding_count());
    print_finding_list("Orphaned backups", &report.backups);
    print_finding_list("Interrupted partial copies", &report.partials);
    print_finding_list("Stale exclusion entries", &report.stale_exclusions);
    print_finding_list("Stale timestamp records", &report.stale_records);
    print_finding_list("Unrecorded cache residents", &report.unrecorded);
    print_duplicates(&report);
    println!("Run `cachepilot fix <action>` to repair (preview by default)");
    Ok(ExitCode::SUCCESS)
}

pub fn fix(settings: &Settings, action: FixAction) -> Result<ExitCode> {
    let (outcomes, applied) = match action {
        FixAction::RestoreBackups { apply } => {
            (maintain::restore_backups(settings, !apply)?, apply)
        }
        FixAction::CleanExclusions { apply } => {
            (maintain::clean_exclusions(settings, !apply)?, apply)
        }
        FixAction::CleanTimestamps { apply } => {
            (maintain::clean_records(settings, !apply)?, apply)
        }
        FixAction::ResolveDuplicate { path, keep, apply } => (
            maintain::resolve_duplicate(settings, &path, keep.into(), !apply)?,
            apply,
        ),
    };

    print_outcomes(&outcomes, applied);
    Ok(ExitCode::SUCCESS)
}

fn print_outcomes(outcomes: &[FixOutcome], applied: bool) {
    if outcomes.is_empty() {
        println!("Nothing to do");
        return;
    }
    print_table(
        &["Path", "Applied", "Detail"],
        outcomes
            .iter()
            .map(|o| {
                vec![
                    o.path.display().to_string(),
                    if o.applied { "yes" } else { "no" }.to_string(),
                    o.detail.clone(),
                ]
            })
            .collect(),
    );
    if !applied {
        println!("Preview only; rerun with --apply to make changes");
    }
}

fn print_finding_list(title: &str, paths: &[PathBuf]) {
    if paths.is_empty() {
        return;
    }
    println!("{} ({}):", title, paths.len());
    for path in paths {
        println!("  {}", path.display());
    }
    println!();
}

fn print_duplicates(report: &AuditReport) {
    if report.duplicates.is_empty() {
        return;
    }
    println!("Files on both tiers ({}):", report.duplicates.len());
    for dup in &report.duplicates {
        println!("  {}", dup.canonical_path.display());
    }
    println!();
}
