use crate::error::{config_error, pool_error};
use crate::provision::{Sandbox, SandboxSet};
use crate::record::RunRecord;
use anyhow::Result;
use fleet_core::SIMFLEET_ENV_MAX_THREADS;
use std::any::Any;
use std::env;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Instant;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId {
    pub pid: u32,
    pub ordinal: usize,
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.pid, self.ordinal)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    pub worker: WorkerId,
    pub sandbox: Sandbox,
}

/// Worker to sandbox pairing, fixed for the life of a pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindingTable {
    bindings: Vec<Binding>,
}

impl BindingTable {
    /// Pairs workers `1..=thread_count` (by ordinal) with sandboxes sorted by
    /// ascending `thread_id`, index for index.
    pub fn build(pid: u32, thread_count: usize, sandboxes: &SandboxSet) -> Result<Self> {
        if thread_count == 0 {
            return Err(pool_error("worker pool requires thread_count > 0"));
        }
        if sandboxes.len() != thread_count {
            return Err(pool_error(format!(
                "binding requires one sandbox per worker: workers={} sandboxes={}",
                thread_count,
                sandboxes.len()
            )));
        }
        let mut ordered = sandboxes.sandboxes.clone();
        ordered.sort_by_key(|s| s.thread_id);
        if ordered.windows(2).any(|w| w[0].thread_id == w[1].thread_id) {
            return Err(pool_error("duplicate sandbox thread_id in sandbox set"));
        }
        let bindings = ordered
            .into_iter()
            .enumerate()
            .map(|(idx, sandbox)| Binding {
                worker: WorkerId {
                    pid,
                    ordinal: idx + 1,
                },
                sandbox,
            })
            .collect();
        Ok(Self { bindings })
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Binding> {
        self.bindings.iter()
    }

    pub fn sandbox_for(&self, worker: WorkerId) -> Option<&Sandbox> {
        self.bindings
            .iter()
            .find(|b| b.worker == worker)
            .map(|b| &b.sandbox)
    }

    pub fn worker_for(&self, thread_id: usize) -> Option<WorkerId> {
        self.bindings
            .iter()
            .find(|b| b.sandbox.thread_id == thread_id)
            .map(|b| b.worker)
    }
}

pub fn available_parallelism() -> usize {
    thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Reads the optional worker ceiling from `SIMFLEET_MAX_THREADS`.
pub fn thread_ceiling_from_env() -> Result<Option<usize>> {
    match env::var(SIMFLEET_ENV_MAX_THREADS) {
        Ok(raw) => parse_thread_ceiling(&raw),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(config_error(format!(
            "failed reading {}: {}",
            SIMFLEET_ENV_MAX_THREADS, err
        ))),
    }
}

fn parse_thread_ceiling(raw: &str) -> Result<Option<usize>> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    let parsed = trimmed.parse::<usize>().map_err(|_| {
        config_error(format!(
            "{} must be a positive integer when set (got: {})",
            SIMFLEET_ENV_MAX_THREADS, raw
        ))
    })?;
    if parsed == 0 {
        return Err(config_error(format!(
            "{} must be > 0 when set",
            SIMFLEET_ENV_MAX_THREADS
        )));
    }
    Ok(Some(parsed))
}

/// Effective worker count: `min(requested, available, max(run_count, 1))`,
/// then the optional ceiling, never below 1. Returns a warning when the
/// explicit request was reduced.
pub fn resolve_thread_count(
    requested: Option<usize>,
    run_count: usize,
    available: usize,
    ceiling: Option<usize>,
) -> (usize, Option<String>) {
    let base = requested.unwrap_or(available);
    let effective = ceiling
        .map(|c| base.min(c))
        .unwrap_or(base)
        .min(available.max(1))
        .min(run_count.max(1))
        .max(1);
    match requested {
        Some(requested) if effective < requested => {
            let warning = format!(
                "worker count clamped: requested={} effective={} available_parallelism={} runs={} ceiling={}",
                requested,
                effective,
                available,
                run_count,
                ceiling
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "none".to_string())
            );
            (effective, Some(warning))
        }
        _ => (effective, None),
    }
}

/// Per-run work executed by a worker on its bound sandbox.
pub type RunHandler = dyn Fn(&Binding, usize) -> RunRecord + Send + Sync + 'static;

/// Fixed set of OS threads, each bound to one sandbox, pulling run indices
/// from a shared queue.
pub struct WorkerPool {
    bindings: Arc<BindingTable>,
    jobs_tx: Option<mpsc::Sender<usize>>,
    records_rx: mpsc::Receiver<RunRecord>,
    shutdown: Arc<AtomicBool>,
    handles: Vec<JoinHandle<()>>,
    stopped: bool,
}

impl WorkerPool {
    pub fn start(
        thread_count: usize,
        sandboxes: &SandboxSet,
        handler: Arc<RunHandler>,
    ) -> Result<Self> {
        let bindings = Arc::new(BindingTable::build(
            std::process::id(),
            thread_count,
            sandboxes,
        )?);
        let (jobs_tx, jobs_rx) = mpsc::channel::<usize>();
        let jobs_rx = Arc::new(Mutex::new(jobs_rx));
        let (records_tx, records_rx) = mpsc::channel::<RunRecord>();
        let mut pool = Self {
            bindings: bindings.clone(),
            jobs_tx: Some(jobs_tx),
            records_rx,
            shutdown: Arc::new(AtomicBool::new(false)),
            handles: Vec::with_capacity(thread_count),
            stopped: false,
        };

        for binding in bindings.iter() {
            let binding = binding.clone();
            let ordinal = binding.worker.ordinal;
            let jobs_rx = jobs_rx.clone();
            let records_tx = records_tx.clone();
            let shutdown = pool.shutdown.clone();
            let handler = handler.clone();
            let spawned = thread::Builder::new()
                .name(format!("simfleet-worker-{}", ordinal))
                .spawn(move || worker_loop(binding, jobs_rx, records_tx, shutdown, handler));
            match spawned {
                Ok(handle) => pool.handles.push(handle),
                Err(err) => {
                    let _ = pool.stop();
                    return Err(pool_error(format!(
                        "failed to spawn worker thread {}: {}",
                        ordinal, err
                    )));
                }
            }
        }
        debug!(thread_count, "worker pool started");
        Ok(pool)
    }

    pub fn bindings(&self) -> &BindingTable {
        &self.bindings
    }

    pub fn thread_count(&self) -> usize {
        self.bindings.len()
    }

    pub fn submit(&self, run_index: usize) -> Result<()> {
        let tx = self
            .jobs_tx
            .as_ref()
            .ok_or_else(|| pool_error("worker pool is stopped"))?;
        tx.send(run_index)
            .map_err(|_| pool_error("worker pool job queue disconnected"))
    }

    /// Blocks until some worker reports a finished run.
    pub fn recv(&self) -> Result<RunRecord> {
        self.records_rx
            .recv()
            .map_err(|_| pool_error("all workers exited before every run reported"))
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Closes the queue and joins every worker. Runs already in progress are
    /// finished; queued runs are dropped. Safe to call more than once.
    pub fn stop(&mut self) -> Result<()> {
        if self.stopped {
            return Ok(());
        }
        self.stopped = true;
        self.shutdown.store(true, Ordering::SeqCst);
        self.jobs_tx.take();
        let mut failures = Vec::new();
        for handle in self.handles.drain(..) {
            let name = handle.thread().name().unwrap_or("worker").to_string();
            if handle.join().is_err() {
                failures.push(name);
            }
        }
        if !failures.is_empty() {
            return Err(pool_error(format!(
                "worker threads terminated abnormally: {}",
                failures.join(", ")
            )));
        }
        debug!("worker pool stopped");
        Ok(())
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            warn!(error = %err, "worker pool shutdown reported errors");
        }
    }
}

fn worker_loop(
    binding: Binding,
    jobs_rx: Arc<Mutex<mpsc::Receiver<usize>>>,
    records_tx: mpsc::Sender<RunRecord>,
    shutdown: Arc<AtomicBool>,
    handler: Arc<RunHandler>,
) {
    loop {
        let next = match jobs_rx.lock() {
            Ok(rx) => rx.recv(),
            Err(_) => break,
        };
        let Ok(run_index) = next else {
            break;
        };
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        let started = Instant::now();
        let record = catch_unwind(AssertUnwindSafe(|| handler(&binding, run_index)))
            .unwrap_or_else(|payload| {
                let message = panic_message(payload.as_ref());
                warn!(
                    worker = %binding.worker,
                    run_index,
                    panic = %message,
                    "run panicked"
                );
                RunRecord::failed(
                    run_index,
                    binding.sandbox.thread_id,
                    format!("run panicked: {}", message),
                    started.elapsed().as_millis() as u64,
                )
            });
        if records_tx.send(record).is_err() {
            break;
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        return (*s).to_string();
    }
    if let Some(s) = payload.downcast_ref::<String>() {
        return s.clone();
    }
    "non-string panic payload".to_string()
}
