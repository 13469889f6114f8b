//! `cachepilot run` - execute one residency pass.

use anyhow::{Context, Result};
use std::process::ExitCode;
use std::sync::mpsc;

use cachepilot_engine::mover::MoveProgress;
use cachepilot_engine::types::{MoveOutcome, RunStatus, RunSummary};
use cachepilot_engine::{CancellationToken, Orchestrator, RunOptions, Settings};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::info;

use super::output::{format_size, print_table};

pub struct RunArgs {
    pub dry_run: bool,
    pub skip_refresh: bool,
    pub json: bool,
}

pub fn run(settings: Settings, args: RunArgs) -> Result<ExitCode> {
    let orchestrator = Orchestrator::new(settings);
    install_signal_handler(orchestrator.cancel_token())?;

    let options = RunOptions {
        dry_run: args.dry_run,
        skip_feed_refresh: args.skip_refresh,
    };

    // Progress only makes sense for a live, human-facing run.
    let summary = if args.json || args.dry_run {
        orchestrator.trigger_run(&options, None)?
    } else {
        let (tx, rx) = mpsc::channel::<MoveProgress>();
        let progress = std::thread::spawn(move || drive_progress(rx));
        let result = orchestrator.trigger_run(&options, Some(&tx));
        drop(tx);
        let _ = progress.join();
        result?
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        print_summary(&summary);
    }

    Ok(match summary.status {
        RunStatus::Succeeded => ExitCode::SUCCESS,
        RunStatus::PartiallyFailed => ExitCode::from(2),
        RunStatus::Failed => ExitCode::from(1),
    })
}

#[cfg(unix)]
fn install_signal_handler(token: CancellationToken) -> Result<()> {
    use signal_hook::consts::{SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;

    let mut signals =
        Signals::new([SIGINT, SIGTERM]).context("Failed to install signal handler")?;
    std::thread::spawn(move || {
        if signals.forever().next().is_some() {
            info!("Received signal, stopping after the current action");
            token.cancel();
        }
    });
    Ok(())
}

#[cfg(windows)]
fn install_signal_handler(token: CancellationToken) -> Result<()> {
    ctrlc::set_handler(move || {
        info!("Received Ctrl+C, stopping after the current action");
        token.cancel();
    })
    .context("Failed to install Ctrl+C handler")?;
    Ok(())
}

/// Render mover progress on stderr until the sender hangs up.
fn drive_progress(rx: mpsc::Receiver<MoveProgress>) {
    let mut bar: Option<ProgressBar> = None;
    for update in rx {
        let bar = bar.get_or_insert_with(|| {
            let bar = ProgressBar::new(update.total as u64);
            bar.set_style(
                ProgressStyle::with_template("{spinner} [{bar:30}] {pos}/{len} {msg}")
                    .unwrap_or_else(|_| ProgressStyle::default_bar())
                    .progress_chars("=> "),
            );
            bar
        });
        let name = update
            .canonical_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| update.canonical_path.display().to_string());
        bar.set_position(update.done as u64);
        bar.set_message(format!("{} {}", update.direction, name));
    }
    if let Some(bar) = bar {
        bar.finish_and_clear();
    }
}

fn print_summary(summary: &RunSummary) {
    if summary.dry_run {
        println!(
            "Dry run: {} eviction(s) and {} promotion(s) planned, nothing moved",
            summary.planned_evictions, summary.planned_promotions
        );
    }
    println!("Status:   {}", summary.status);
    println!(
        "Promoted: {} ({})",
        summary.promoted,
        format_size(summary.promoted_bytes)
    );
    println!(
        "Evicted:  {} ({})",
        summary.evicted,
        format_size(summary.evicted_bytes)
    );
    if summary.skipped > 0 {
        println!("Skipped:  {}", summary.skipped);
    }
    if summary.failed > 0 {
        println!("Failed:   {}", summary.failed);
    }
    if summary.unmapped > 0 {
        println!("Unmapped feed paths: {}", summary.unmapped);
    }

    if !summary.skipped_promotions.is_empty() {
        println!();
        print_table(
            &["Did not fit", "Size"],
            summary
                .skipped_promotions
                .iter()
                .map(|s| {
                    vec![
                        s.canonical_path.display().to_string(),
                        format_size(s.bytes),
                    ]
                })
                .collect(),
        );
    }

    if !summary.failures.is_empty() {
        println!();
        print_table(
            &["Action", "File", "Problem"],
            summary
                .failures
                .iter()
                .map(|report| {
                    let problem = match &report.outcome {
                        MoveOutcome::Skipped(reason) => format!("skipped: {reason}"),
                        MoveOutcome::Failed(reason) => reason.to_string(),
                        MoveOutcome::Moved => "moved".to_string(),
                    };
                    vec![
                        report.action.direction.to_string(),
                        report.action.canonical_path.display().to_string(),
                        problem,
                    ]
                })
                .collect(),
        );
    }
}
