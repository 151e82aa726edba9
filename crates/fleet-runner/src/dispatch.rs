use crate::error::pool_error;
use crate::pool::WorkerPool;
use crate::record::RunRecord;
use anyhow::Result;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Progress state of one dispatch. Observers get a snapshot on every
/// completion; a caller driving [`dispatch`] itself may also poll
/// [`DispatchSession::snapshot`] from another thread.
#[derive(Debug)]
pub struct DispatchSession {
    total: usize,
    completed: AtomicUsize,
    failed: AtomicUsize,
    started: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressSnapshot {
    pub completed: usize,
    pub failed: usize,
    pub total: usize,
    pub elapsed: Duration,
}

impl ProgressSnapshot {
    pub fn is_complete(&self) -> bool {
        self.completed >= self.total
    }
}

impl DispatchSession {
    pub fn new(total: usize) -> Self {
        Self {
            total,
            completed: AtomicUsize::new(0),
            failed: AtomicUsize::new(0),
            started: Instant::now(),
        }
    }

    pub fn total(&self) -> usize {
        self.total
    }

    fn record_completion(&self, failed: bool) -> ProgressSnapshot {
        if failed {
            self.failed.fetch_add(1, Ordering::SeqCst);
        }
        self.completed.fetch_add(1, Ordering::SeqCst);
        self.snapshot()
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            completed: self.completed.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
            total: self.total,
            elapsed: self.started.elapsed(),
        }
    }
}

/// Notified on the dispatching thread once per finished run.
pub trait ProgressObserver: Send + Sync {
    fn on_run_complete(&self, record: &RunRecord, progress: &ProgressSnapshot);
}

/// Reports progress through `tracing`, about every 5% of the batch.
#[derive(Debug, Clone)]
pub struct LogProgressObserver {
    step: usize,
    quiet: bool,
}

impl LogProgressObserver {
    pub fn new(total: usize, quiet: bool) -> Self {
        Self {
            step: (total / 20).max(1),
            quiet,
        }
    }
}

impl ProgressObserver for LogProgressObserver {
    fn on_run_complete(&self, record: &RunRecord, progress: &ProgressSnapshot) {
        if let Some(error) = record.status.error() {
            warn!(
                run_index = record.run_index,
                thread_id = record.thread_id,
                error = %error,
                "run failed"
            );
        }
        if self.quiet {
            return;
        }
        if progress.completed % self.step == 0 || progress.is_complete() {
            info!(
                failed = progress.failed,
                "completed {}/{} runs, elapsed {:.1}s",
                progress.completed,
                progress.total,
                progress.elapsed.as_secs_f64()
            );
        }
    }
}

/// Submits every run index to the pool and waits for all of them. Records
/// come back in completion order and are returned sorted by `run_index`.
pub fn dispatch(
    run_indices: &[usize],
    pool: &WorkerPool,
    session: &DispatchSession,
    observer: &dyn ProgressObserver,
) -> Result<Vec<RunRecord>> {
    let expected: BTreeSet<usize> = run_indices.iter().copied().collect();
    if expected.len() != run_indices.len() {
        return Err(pool_error("dispatch received duplicate run indices"));
    }
    for run_index in run_indices {
        pool.submit(*run_index)?;
    }

    let mut committed: BTreeMap<usize, RunRecord> = BTreeMap::new();
    while committed.len() < expected.len() {
        let record = pool.recv()?;
        if !expected.contains(&record.run_index) {
            return Err(pool_error(format!(
                "dispatch protocol fault: record for unscheduled run {}",
                record.run_index
            )));
        }
        if committed.contains_key(&record.run_index) {
            return Err(pool_error(format!(
                "dispatch protocol fault: duplicate record for run {}",
                record.run_index
            )));
        }
        let progress = session.record_completion(record.is_failed());
        observer.on_run_complete(&record, &progress);
        committed.insert(record.run_index, record);
    }
    Ok(committed.into_values().collect())
}
