//! Move execution - backup-then-commit with rollback
//!
//! One action moves a primary file and its companions between tiers,
//! atomically as a group: either every file lands on the destination tier
//! or the filesystem is restored to the pre-action state. A file already at
//! a destination is renamed aside to `<name>.cpbak` rather than
//! overwritten; the backup is deleted only after the whole action commits
//! and restored on any failure, so a failed action never changes the number
//! of retrievable copies.
//!
//! Cross-filesystem moves (the usual case between tiers) copy to a
//! `<name>.cp_partial` staging file, verify the length, preserve the mtime,
//! rename into place and delete the source.
//!
//! Actions run on a bounded worker pool. Two actions whose path sets
//! intersect never run concurrently; evictions all commit before the first
//! promotion starts, so freed space exists before it is spent.

use std::collections::{HashSet, VecDeque};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use filetime::FileTime;
use tracing::{debug, error, info, warn};

use crate::cancel::CancellationToken;
use crate::store::TimestampStore;
use crate::types::{ActionReport, MoveAction, MoveDirection, MoveFailure, MoveOutcome, MovePlan};

/// Extension of a file renamed aside at a destination (`A.mkv.cpbak`).
pub const BACKUP_EXT: &str = "cpbak";

/// Extension of an in-flight cross-filesystem copy (`A.mkv.cp_partial`).
pub const PARTIAL_EXT: &str = "cp_partial";

/// Mover tuning, from config.
#[derive(Debug, Clone)]
pub struct MoverConfig {
    /// Worker threads. Move I/O is disk-bound; keep this small.
    pub workers: usize,
    /// Per-action deadline, checked between file steps. An action over it
    /// is rolled back and recorded as failed with a Timeout kind.
    pub action_timeout: Duration,
}

/// Progress event for the caller's progress bar.
#[derive(Debug, Clone)]
pub struct MoveProgress {
    pub done: usize,
    pub total: usize,
    pub direction: MoveDirection,
    pub canonical_path: PathBuf,
}

/// Execute a plan: all evictions, then all promotions.
///
/// The store is mutated only for actions that committed; skipped and failed
/// actions leave it untouched. Cancellation is honored between actions;
/// actions not yet started when the token fires are simply not reported.
pub fn execute_plan(
    plan: &MovePlan,
    store: &mut TimestampStore,
    config: &MoverConfig,
    token: &CancellationToken,
    progress_tx: Option<&mpsc::Sender<MoveProgress>>,
) -> Vec<ActionReport> {
    let total = plan.action_count();
    let mut done = 0usize;
    let mut reports = Vec::with_capacity(total);

    run_phase(
        &plan.evictions,
        store,
        config,
        token,
        progress_tx,
        total,
        &mut done,
        &mut reports,
    );
    run_phase(
        &plan.promotions,
        store,
        config,
        token,
        progress_tx,
        total,
        &mut done,
        &mut reports,
    );

    let moved = reports.iter().filter(|r| r.outcome.is_moved()).count();
    info!(
        moved,
        attempted = reports.len(),
        planned = total,
        "Mover finished"
    );
    reports
}

#[allow(clippy::too_many_arguments)]
fn run_phase(
    actions: &[MoveAction],
    store: &mut TimestampStore,
    config: &MoverConfig,
    token: &CancellationToken,
    progress_tx: Option<&mpsc::Sender<MoveProgress>>,
    total: usize,
    done: &mut usize,
    reports: &mut Vec<ActionReport>,
) {
    if actions.is_empty() || token.is_cancelled() {
        return;
    }

    let queue: Mutex<VecDeque<MoveAction>> =
        Mutex::new(actions.iter().cloned().collect());
    let claims = PathClaims::default();
    let workers = config.workers.clamp(1, actions.len());
    let (tx, rx) = mpsc::channel::<(MoveAction, MoveOutcome)>();

    std::thread::scope(|s| {
        for _ in 0..workers {
            let tx = tx.clone();
            let queue = &queue;
            let claims = &claims;
            let timeout = config.action_timeout;
            s.spawn(move || worker_loop(queue, claims, timeout, token, tx));
        }
        drop(tx);

        // Collector: the store is only ever written here, after an action
        // durably committed.
        for (action, outcome) in rx {
            if outcome.is_moved() {
                match action.direction {
                    MoveDirection::Promote => {
                        store.mark_cached(&action.canonical_path, Utc::now());
                    }
                    MoveDirection::Evict => {
                        store.mark_evicted(&action.canonical_path);
                    }
                }
            }
            *done += 1;
            if let Some(tx) = progress_tx {
                let _ = tx.send(MoveProgress {
                    done: *done,
                    total,
                    direction: action.direction,
                    canonical_path: action.canonical_path.clone(),
                });
            }
            reports.push(ActionReport { action, outcome });
        }
    });
}

fn worker_loop(
    queue: &Mutex<VecDeque<MoveAction>>,
    claims: &PathClaims,
    timeout: Duration,
    token: &CancellationToken,
    tx: mpsc::Sender<(MoveAction, MoveOutcome)>,
) {
    loop {
        if token.is_cancelled() {
            debug!("Mover worker stopping on cancellation");
            return;
        }
        let action = {
            let mut queue = queue.lock().unwrap_or_else(|e| e.into_inner());
            queue.pop_front()
        };
        let Some(action) = action else { return };

        let involved: Vec<PathBuf> = action
            .source_paths()
            .chain(action.dest_paths())
            .cloned()
            .collect();
        claims.acquire(&involved);
        let outcome = execute_action(&action, timeout);
        claims.release(&involved);

        if tx.send((action, outcome)).is_err() {
            return;
        }
    }
}

/// Serializes actions on path identity: a worker blocks until no other
/// in-flight action touches any of its paths.
#[derive(Default)]
struct PathClaims {
    held: Mutex<HashSet<PathBuf>>,
    freed: Condvar,
}

impl PathClaims {
    fn acquire(&self, paths: &[PathBuf]) {
        let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        while paths.iter().any(|p| held.contains(p)) {
            held = self
                .freed
                .wait(held)
                .unwrap_or_else(|e| e.into_inner());
        }
        held.extend(paths.iter().cloned());
    }

    fn release(&self, paths: &[PathBuf]) {
        let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        for path in paths {
            held.remove(path);
        }
        drop(held);
        self.freed.notify_all();
    }
}

/// One committed file step, remembered for rollback.
struct StepLog {
    src: PathBuf,
    dest: PathBuf,
    backup: Option<PathBuf>,
}

/// Execute one action: primary first, then each companion. Rollback-or-commit.
fn execute_action(action: &MoveAction, timeout: Duration) -> MoveOutcome {
    if !action.source.exists() {
        debug!(
            "Skipping {}: source {} is missing",
            action.canonical_path.display(),
            action.source.display()
        );
        return MoveOutcome::Skipped(MoveFailure::SourceMissing);
    }

    let deadline = Instant::now() + timeout;
    let mut pairs: Vec<(&Path, &Path)> = vec![(&action.source, &action.dest)];
    for (src, dest) in &action.companions {
        if src.exists() {
            pairs.push((src, dest));
        } else {
            warn!(
                "Companion {} vanished before the move, continuing without it",
                src.display()
            );
        }
    }

    let mut completed: Vec<StepLog> = Vec::new();
    for (src, dest) in pairs {
        if Instant::now() >= deadline {
            warn!(
                "Action for {} exceeded its deadline, rolling back",
                action.canonical_path.display()
            );
            return rollback(&completed, MoveFailure::Timeout);
        }
        match move_one(src, dest) {
            Ok(step) => completed.push(step),
            Err(failure) => return rollback(&completed, failure),
        }
    }

    // Commit: the group is fully on the destination tier, backups can go.
    for step in &completed {
        if let Some(backup) = &step.backup {
            if let Err(err) = fs::remove_file(backup) {
                warn!("Failed to remove backup {}: {}", backup.display(), err);
            }
        }
    }
    debug!(
        "{} {} ({} files)",
        action.direction,
        action.canonical_path.display(),
        completed.len()
    );
    MoveOutcome::Moved
}

/// Move one file, staging any existing destination aside first. On its own
/// failure the step restores the backup itself; earlier steps are the
/// caller's rollback problem.
fn move_one(src: &Path, dest: &Path) -> Result<StepLog, MoveFailure> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).map_err(|e| io_failure(parent, &e))?;
    }

    let mut backup = None;
    if dest.exists() {
        let aside = sibling_with_suffix(dest, BACKUP_EXT);
        if aside.exists() {
            // A leftover from an interrupted run. Clobbering it could lose
            // the only good copy; the audit's restore-backups fix resolves it.
            return Err(MoveFailure::BackupExists { path: aside });
        }
        fs::rename(dest, &aside).map_err(|e| io_failure(dest, &e))?;
        backup = Some(aside);
    }

    if let Err(failure) = transfer(src, dest) {
        if let Some(aside) = &backup {
            if let Err(err) = fs::rename(aside, dest) {
                return Err(MoveFailure::RollbackFailed {
                    path: aside.clone(),
                    message: err.to_string(),
                });
            }
        }
        return Err(failure);
    }

    Ok(StepLog {
        src: src.to_path_buf(),
        dest: dest.to_path_buf(),
        backup,
    })
}

/// Rename, or copy+verify+delete-source when the tiers are different
/// filesystems.
fn transfer(src: &Path, dest: &Path) -> Result<(), MoveFailure> {
    match fs::rename(src, dest) {
        Ok(()) => Ok(()),
        Err(err) if is_cross_device(&err) => copy_across(src, dest),
        Err(err) => Err(io_failure(src, &err)),
    }
}

fn copy_across(src: &Path, dest: &Path) -> Result<(), MoveFailure> {
    let partial = sibling_with_suffix(dest, PARTIAL_EXT);
    let result = (|| -> io::Result<()> {
        if partial.exists() {
            fs::remove_file(&partial)?;
        }
        let src_meta = fs::metadata(src)?;
        fs::copy(src, &partial)?;
        let copied = fs::metadata(&partial)?.len();
        if copied != src_meta.len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("short copy: {} of {} bytes", copied, src_meta.len()),
            ));
        }
        filetime::set_file_mtime(&partial, FileTime::from_last_modification_time(&src_meta))?;
        fs::rename(&partial, dest)?;
        fs::remove_file(src)?;
        Ok(())
    })();

    if let Err(err) = result {
        let _ = fs::remove_file(&partial);
        return Err(io_failure(src, &err));
    }
    Ok(())
}

/// Undo completed steps in reverse order, then restore their backups.
fn rollback(completed: &[StepLog], failure: MoveFailure) -> MoveOutcome {
    if !completed.is_empty() {
        warn!(
            "Rolling back {} completed file moves: {}",
            completed.len(),
            failure
        );
    }
    for step in completed.iter().rev() {
        if let Err(err) = transfer(&step.dest, &step.src) {
            error!(
                "Rollback could not return {} to {}: {}",
                step.dest.display(),
                step.src.display(),
                err
            );
            return MoveOutcome::Failed(MoveFailure::RollbackFailed {
                path: step.dest.clone(),
                message: err.to_string(),
            });
        }
        if let Some(backup) = &step.backup {
            if let Err(err) = fs::rename(backup, &step.dest) {
                return MoveOutcome::Failed(MoveFailure::RollbackFailed {
                    path: backup.clone(),
                    message: err.to_string(),
                });
            }
        }
    }
    MoveOutcome::Failed(failure)
}

/// `/a/b/A.mkv` + `cpbak` -> `/a/b/A.mkv.cpbak`
fn sibling_with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!("{name}.{suffix}"))
}

fn is_cross_device(err: &io::Error) -> bool {
    #[cfg(unix)]
    {
        err.raw_os_error() == Some(libc::EXDEV)
    }
    #[cfg(not(unix))]
    {
        let _ = err;
        true
    }
}

fn io_failure(path: &Path, err: &io::Error) -> MoveFailure {
    MoveFailure::Io {
        path: path.to_path_buf(),
        message: err.to_string(),
    }
}
