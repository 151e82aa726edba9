use crate::pool::WorkerPool;
use anyhow::{anyhow, Result};
use fleet_core::remove_dir_if_exists;
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Init,
    Provisioned,
    PoolStarted,
    Dispatching,
    AllComplete,
    Teardown,
    Done,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Provisioned => "provisioned",
            Self::PoolStarted => "pool_started",
            Self::Dispatching => "dispatching",
            Self::AllComplete => "all_complete",
            Self::Teardown => "teardown",
            Self::Done => "done",
        }
    }

    fn can_advance_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Init, Provisioned)
                | (Provisioned, PoolStarted)
                | (PoolStarted, Dispatching)
                | (Dispatching, AllComplete)
                | (Init | Provisioned | PoolStarted | Dispatching | AllComplete, Teardown)
                | (Teardown, Done)
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Owns the pool and the sandbox root of one session. Teardown stops the
/// pool, then removes the sandbox root unless `keep` is set, and runs exactly
/// once: explicitly or on drop.
pub struct SessionGuard {
    sandbox_root: PathBuf,
    keep: bool,
    pool: Option<WorkerPool>,
    state: SessionState,
    history: Vec<SessionState>,
}

impl SessionGuard {
    pub fn new(sandbox_root: &Path, keep: bool) -> Self {
        Self {
            sandbox_root: sandbox_root.to_path_buf(),
            keep,
            pool: None,
            state: SessionState::Init,
            history: vec![SessionState::Init],
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn history(&self) -> &[SessionState] {
        &self.history
    }

    pub fn advance(&mut self, next: SessionState) -> Result<()> {
        if !self.state.can_advance_to(next) {
            return Err(anyhow!(
                "invalid session transition {} -> {}",
                self.state,
                next
            ));
        }
        debug!(from = %self.state, to = %next, "session state");
        self.state = next;
        self.history.push(next);
        Ok(())
    }

    pub fn attach_pool(&mut self, pool: WorkerPool) -> Result<()> {
        self.advance(SessionState::PoolStarted)?;
        self.pool = Some(pool);
        Ok(())
    }

    pub fn pool(&self) -> Result<&WorkerPool> {
        self.pool
            .as_ref()
            .ok_or_else(|| anyhow!("session has no worker pool attached"))
    }

    /// Stops the pool and removes the sandbox root (unless kept). Returns the
    /// first error but always attempts both steps.
    pub fn teardown(&mut self) -> Result<()> {
        if matches!(self.state, SessionState::Teardown | SessionState::Done) {
            return Ok(());
        }
        self.advance(SessionState::Teardown)?;
        let mut first_err: Option<anyhow::Error> = None;

        if let Some(mut pool) = self.pool.take() {
            if let Err(err) = pool.stop() {
                first_err = Some(err);
            }
        }

        if self.keep {
            info!(root = %self.sandbox_root.display(), "keeping sandboxes");
        } else {
            match remove_dir_if_exists(&self.sandbox_root) {
                Ok(true) => info!(root = %self.sandbox_root.display(), "sandboxes removed"),
                Ok(false) => {}
                Err(err) => {
                    first_err.get_or_insert(err);
                }
            }
        }

        self.advance(SessionState::Done)?;
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if let Err(err) = self.teardown() {
            warn!(error = %err, "session teardown failed");
        }
    }
}
