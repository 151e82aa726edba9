use crate::error::config_error;
use crate::output::{OutputExtractor, TableOutputExtractor};
use crate::params::ParameterRow;
use crate::period::SimPeriod;
use anyhow::{anyhow, Context, Result};
use fleet_core::{
    atomic_write_json_pretty, ensure_dir, sandbox_paths, PARAMETERS_FILE, RUN_PERIOD_FILE,
    SIMFLEET_ENV_RUN_INDEX, SIMFLEET_ENV_SANDBOX, SIMFLEET_ENV_THREAD_ID,
};
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use tracing::{debug, warn};

/// Identity of one run on its bound sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSlot {
    pub run_index: usize,
    pub thread_id: usize,
    pub sandbox: PathBuf,
}

/// Writes one run's parameter values into a sandbox. Overwrites whatever the
/// previous run on the same sandbox left behind.
pub trait ParameterInjector: Send + Sync {
    /// Rejects parameter names the project cannot take. Called before any
    /// sandbox exists.
    fn validate_names(&self, _names: &[String]) -> Result<()> {
        Ok(())
    }

    fn inject(&self, sandbox: &Path, row: &ParameterRow) -> Result<()>;
}

/// Writes the simulation period into a sandbox's configuration.
pub trait PeriodWriter: Send + Sync {
    fn write(&self, sandbox: &Path, period: &SimPeriod) -> Result<()>;
}

/// Runs the external program inside a sandbox and blocks until it exits.
pub trait Executor: Send + Sync {
    fn execute(&self, slot: &RunSlot) -> Result<()>;
}

impl<F> Executor for F
where
    F: Fn(&RunSlot) -> Result<()> + Send + Sync,
{
    fn execute(&self, slot: &RunSlot) -> Result<()> {
        self(slot)
    }
}

#[derive(Debug, Clone, Default)]
pub struct JsonParameterInjector {
    file_name: Option<String>,
    known: Option<BTreeSet<String>>,
}

impl JsonParameterInjector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file_name(mut self, file_name: impl Into<String>) -> Self {
        self.file_name = Some(file_name.into());
        self
    }

    pub fn with_known_parameters<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.known = Some(names.into_iter().map(Into::into).collect());
        self
    }
}

impl ParameterInjector for JsonParameterInjector {
    fn validate_names(&self, names: &[String]) -> Result<()> {
        let Some(known) = &self.known else {
            return Ok(());
        };
        let unknown: Vec<&str> = names
            .iter()
            .filter(|name| !known.contains(name.as_str()))
            .map(String::as_str)
            .collect();
        if !unknown.is_empty() {
            return Err(config_error(format!(
                "unknown parameter names: {}",
                unknown.join(", ")
            )));
        }
        Ok(())
    }

    fn inject(&self, sandbox: &Path, row: &ParameterRow) -> Result<()> {
        let path = sandbox.join(self.file_name.as_deref().unwrap_or(PARAMETERS_FILE));
        let payload = json!({
            "run_index": row.run_index,
            "parameters": row.to_json(),
        });
        atomic_write_json_pretty(&path, &payload)
            .with_context(|| format!("failed writing parameters to {}", path.display()))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct JsonPeriodWriter;

impl PeriodWriter for JsonPeriodWriter {
    fn write(&self, sandbox: &Path, period: &SimPeriod) -> Result<()> {
        let path = sandbox.join(RUN_PERIOD_FILE);
        let payload = serde_json::to_value(period)?;
        atomic_write_json_pretty(&path, &payload)
            .with_context(|| format!("failed writing run period to {}", path.display()))
    }
}

/// Spawns `command` with the sandbox as working directory. stdout and stderr
/// go to `.simfleet/stdout.log` and `.simfleet/stderr.log` in the sandbox.
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    command: Vec<String>,
    env: BTreeMap<String, String>,
}

impl CommandExecutor {
    pub fn new(command: Vec<String>) -> Result<Self> {
        if command.is_empty() || command[0].trim().is_empty() {
            return Err(config_error("program command must not be empty"));
        }
        Ok(Self {
            command,
            env: BTreeMap::new(),
        })
    }

    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = env;
        self
    }

    pub fn command(&self) -> &[String] {
        &self.command
    }

    /// Relative program paths with a separator (`./model`) resolve inside the
    /// sandbox; bare names go through `PATH`.
    fn resolve_program(&self, sandbox: &Path) -> PathBuf {
        let program = Path::new(&self.command[0]);
        if program.is_relative() && program.components().count() > 1 {
            sandbox.join(program)
        } else {
            program.to_path_buf()
        }
    }
}

impl Executor for CommandExecutor {
    fn execute(&self, slot: &RunSlot) -> Result<()> {
        let paths = sandbox_paths(&slot.sandbox);
        ensure_dir(&paths.state_dir)?;
        let stdout = fs::File::create(&paths.stdout)
            .with_context(|| format!("failed creating {}", paths.stdout.display()))?;
        let stderr = fs::File::create(&paths.stderr)
            .with_context(|| format!("failed creating {}", paths.stderr.display()))?;

        let program = self.resolve_program(&slot.sandbox);
        let mut cmd = Command::new(&program);
        cmd.args(&self.command[1..])
            .current_dir(&slot.sandbox)
            .envs(&self.env)
            .env(SIMFLEET_ENV_RUN_INDEX, slot.run_index.to_string())
            .env(SIMFLEET_ENV_THREAD_ID, slot.thread_id.to_string())
            .env(SIMFLEET_ENV_SANDBOX, &slot.sandbox)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr));

        let status = cmd
            .status()
            .map_err(|e| anyhow!("failed to start {}: {}", program.display(), e))?;
        if status.success() {
            debug!(run_index = slot.run_index, thread_id = slot.thread_id, "model exited cleanly");
        } else {
            warn!(
                run_index = slot.run_index,
                thread_id = slot.thread_id,
                status = %status,
                "model exited non-zero; outputs decide the run outcome"
            );
        }
        Ok(())
    }
}

/// The opaque adapters one batch is run with.
#[derive(Clone)]
pub struct Collaborators {
    pub injector: Arc<dyn ParameterInjector>,
    pub executor: Arc<dyn Executor>,
    pub extractor: Arc<dyn OutputExtractor>,
    pub period_writer: Arc<dyn PeriodWriter>,
}

impl fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collaborators").finish_non_exhaustive()
    }
}

impl Collaborators {
    /// Default file-based adapters around the given executor.
    pub fn new(executor: Arc<dyn Executor>) -> Self {
        Self {
            injector: Arc::new(JsonParameterInjector::new()),
            executor,
            extractor: Arc::new(TableOutputExtractor),
            period_writer: Arc::new(JsonPeriodWriter),
        }
    }

    pub fn with_injector(mut self, injector: Arc<dyn ParameterInjector>) -> Self {
        self.injector = injector;
        self
    }

    pub fn with_extractor(mut self, extractor: Arc<dyn OutputExtractor>) -> Self {
        self.extractor = extractor;
        self
    }

    pub fn with_period_writer(mut self, period_writer: Arc<dyn PeriodWriter>) -> Self {
        self.period_writer = period_writer;
        self
    }
}
