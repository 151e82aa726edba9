use anyhow::{anyhow, Context, Result};
use fleet_core::{canonical_json_digest, SandboxLayout};
use serde::Serialize;
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

mod aggregate;
mod collaborators;
pub mod config;
mod dispatch;
mod error;
mod lifecycle;
mod output;
mod params;
mod period;
mod pool;
mod provision;
mod record;
pub mod sink;

pub use aggregate::{
    aggregate, column_name, index_width, RunColumn, Simulation, SimulationOutput, VariableTable,
};
pub use collaborators::{
    Collaborators, CommandExecutor, Executor, JsonParameterInjector, JsonPeriodWriter,
    ParameterInjector, PeriodWriter, RunSlot,
};
pub use dispatch::{
    dispatch, DispatchSession, LogProgressObserver, ProgressObserver, ProgressSnapshot,
};
pub use error::{error_kind, FleetError};
pub use lifecycle::{SessionGuard, SessionState};
pub use output::{OutputExtractor, OutputRequest, OutputSpec, TableOutputExtractor};
pub use params::{ParameterRow, ParameterTable, ParameterValues};
pub use period::{OutputInterval, SimPeriod};
pub use pool::{
    available_parallelism, resolve_thread_count, thread_ceiling_from_env, Binding, BindingTable,
    RunHandler, WorkerId, WorkerPool,
};
pub use provision::{provision, provision_with_excludes, Sandbox, SandboxManifest, SandboxSet};
pub use record::{RunRecord, RunStatus};
pub use sink::{SaveFile, SaveHeader, SaveTarget};

use error::{config_error, provisioning_error};

/// Everything one batch needs besides the collaborators.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub project_path: PathBuf,
    pub outputs: OutputRequest,
    pub parameters: Option<ParameterTable>,
    pub period: SimPeriod,
    /// Subset of 1-based run indices to execute; `None` runs every row.
    pub run_index: Option<Vec<usize>>,
    /// Where the sandbox root is created; defaults to `project_path`.
    pub run_path: Option<PathBuf>,
    pub n_thread: Option<usize>,
    pub save: Option<SaveTarget>,
    pub return_output: bool,
    pub add_parameter: bool,
    pub add_date: bool,
    pub refresh: bool,
    pub keep_folder: bool,
    pub quiet: bool,
}

impl RunRequest {
    pub fn new(project_path: impl Into<PathBuf>, outputs: OutputRequest) -> Self {
        Self {
            project_path: project_path.into(),
            outputs,
            parameters: None,
            period: SimPeriod::default(),
            run_index: None,
            run_path: None,
            n_thread: None,
            save: None,
            return_output: true,
            add_parameter: true,
            add_date: true,
            refresh: false,
            keep_folder: false,
            quiet: false,
        }
    }

    pub fn with_parameters(mut self, parameters: ParameterTable) -> Self {
        self.parameters = Some(parameters);
        self
    }

    pub fn with_period(mut self, period: SimPeriod) -> Self {
        self.period = period;
        self
    }

    pub fn with_run_index(mut self, run_index: Vec<usize>) -> Self {
        self.run_index = Some(run_index);
        self
    }

    pub fn with_run_path(mut self, run_path: impl Into<PathBuf>) -> Self {
        self.run_path = Some(run_path.into());
        self
    }

    pub fn with_threads(mut self, n_thread: usize) -> Self {
        self.n_thread = Some(n_thread);
        self
    }

    pub fn with_save(mut self, save: SaveTarget) -> Self {
        self.save = Some(save);
        self
    }

    pub fn keep_folder(mut self, keep: bool) -> Self {
        self.keep_folder = keep;
        self
    }

    pub fn refresh(mut self, refresh: bool) -> Self {
        self.refresh = refresh;
        self
    }

    pub fn quiet(mut self, quiet: bool) -> Self {
        self.quiet = quiet;
        self
    }

    pub fn effective_run_path(&self) -> PathBuf {
        self.run_path
            .clone()
            .unwrap_or_else(|| self.project_path.clone())
    }

    pub fn sandbox_root(&self) -> PathBuf {
        SandboxLayout::new(&self.effective_run_path()).root
    }

    /// Rows in the parameter table, or a single run without parameters.
    pub fn run_count(&self) -> usize {
        self.parameters
            .as_ref()
            .map(ParameterTable::run_count)
            .unwrap_or(1)
    }

    /// Run indices to execute, ascending.
    pub fn executed_runs(&self) -> Result<Vec<usize>> {
        let run_count = self.run_count();
        let Some(subset) = &self.run_index else {
            return Ok((1..=run_count).collect());
        };
        if subset.is_empty() {
            return Err(config_error("run_index must select at least one run"));
        }
        let unique: BTreeSet<usize> = subset.iter().copied().collect();
        if unique.len() != subset.len() {
            return Err(config_error("run_index contains duplicate entries"));
        }
        if let Some(bad) = unique.iter().find(|idx| **idx == 0 || **idx > run_count) {
            return Err(config_error(format!(
                "run_index {} is outside 1..={}",
                bad, run_count
            )));
        }
        Ok(unique.into_iter().collect())
    }

    /// Stable digest of the batch inputs, recorded in the save file.
    pub fn digest(&self) -> Result<String> {
        let value = json!({
            "project_path": self.project_path.display().to_string(),
            "outputs": serde_json::to_value(&self.outputs)?,
            "parameters": serde_json::to_value(&self.parameters)?,
            "period": serde_json::to_value(&self.period)?,
            "run_index": self.run_index,
        });
        Ok(canonical_json_digest(&value))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchSummary {
    pub thread_count: usize,
    pub sandbox_root: PathBuf,
    pub sandboxes_reused: bool,
    pub run_count: usize,
    pub failed_count: usize,
    pub elapsed_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub save_file: Option<PathBuf>,
    pub states: Vec<SessionState>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchResult {
    pub records: Vec<RunRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<SimulationOutput>,
    pub summary: BatchSummary,
}

/// What a batch would do, computed without touching the filesystem.
#[derive(Debug, Clone, Serialize)]
pub struct BatchPlan {
    pub project_path: PathBuf,
    pub sandbox_root: PathBuf,
    pub run_count: usize,
    pub executed_runs: Vec<usize>,
    pub thread_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_warning: Option<String>,
    pub parameter_names: Vec<String>,
    pub output_variables: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub save_file: Option<PathBuf>,
}

/// Validates the request and resolves the worker count. Never writes.
pub fn describe_batch(request: &RunRequest, collaborators: &Collaborators) -> Result<BatchPlan> {
    if !request.project_path.is_dir() {
        return Err(config_error(format!(
            "project_path is not a directory: {}",
            request.project_path.display()
        )));
    }
    request.outputs.validate()?;
    request.period.validate()?;
    let parameter_names = request
        .parameters
        .as_ref()
        .map(|p| p.names().to_vec())
        .unwrap_or_default();
    if !parameter_names.is_empty() {
        collaborators.injector.validate_names(&parameter_names)?;
    }
    let executed_runs = request.executed_runs()?;
    if request.n_thread == Some(0) {
        return Err(config_error("n_thread must be >= 1"));
    }
    let ceiling = thread_ceiling_from_env()?;
    let (thread_count, thread_warning) = resolve_thread_count(
        request.n_thread,
        executed_runs.len(),
        available_parallelism(),
        ceiling,
    );
    let save_file = request.save.as_ref().map(SaveTarget::path);
    if let Some(path) = &save_file {
        SaveFile::check_absent(path)?;
    }
    Ok(BatchPlan {
        project_path: request.project_path.clone(),
        sandbox_root: request.sandbox_root(),
        run_count: request.run_count(),
        executed_runs,
        thread_count,
        thread_warning,
        parameter_names,
        output_variables: request.outputs.names(),
        save_file,
    })
}

/// Runs the batch, reporting progress through `tracing`.
pub fn run_batch(request: &RunRequest, collaborators: Collaborators) -> Result<BatchResult> {
    let total = request.executed_runs()?.len();
    let observer = LogProgressObserver::new(total, request.quiet);
    run_batch_with_observer(request, collaborators, &observer)
}

pub fn run_batch_with_observer(
    request: &RunRequest,
    collaborators: Collaborators,
    observer: &dyn ProgressObserver,
) -> Result<BatchResult> {
    let started = Instant::now();
    let plan = describe_batch(request, &collaborators)?;
    if let Some(warning) = &plan.thread_warning {
        warn!("{}", warning);
    }
    info!(
        runs = plan.executed_runs.len(),
        threads = plan.thread_count,
        project = %plan.project_path.display(),
        "starting batch"
    );

    let mut guard = SessionGuard::new(&plan.sandbox_root, request.keep_folder);
    let excludes: Vec<PathBuf> = plan.save_file.iter().cloned().collect();
    let sandboxes = provision_with_excludes(
        &request.project_path,
        &request.effective_run_path(),
        plan.thread_count,
        request.refresh,
        &excludes,
    )?;
    guard.advance(SessionState::Provisioned)?;

    if !request.period.is_empty() {
        for sandbox in &sandboxes.sandboxes {
            collaborators
                .period_writer
                .write(&sandbox.path, &request.period)
                .with_context(|| format!("failed writing period into sandbox {}", sandbox.thread_id))
                .map_err(provisioning_error)?;
        }
    }

    let save = match &plan.save_file {
        Some(path) => {
            let header = SaveHeader {
                project_path: &request.project_path,
                parameter_names: &plan.parameter_names,
                outputs: &request.outputs,
                period: &request.period,
                request_digest: request.digest()?,
            };
            Some(Arc::new(
                SaveFile::create(path, &header).map_err(provisioning_error)?,
            ))
        }
        None => None,
    };

    let context = Arc::new(RunContext {
        parameters: request.parameters.clone(),
        outputs: request.outputs.clone(),
        collaborators,
        save: save.clone(),
    });
    let handler: Arc<RunHandler> = {
        let context = context.clone();
        Arc::new(move |binding: &Binding, run_index: usize| context.execute_run(binding, run_index))
    };
    let pool = WorkerPool::start(plan.thread_count, &sandboxes, handler)?;
    guard.attach_pool(pool)?;

    guard.advance(SessionState::Dispatching)?;
    let session = DispatchSession::new(plan.executed_runs.len());
    let records = dispatch(&plan.executed_runs, guard.pool()?, &session, observer)?;
    guard.advance(SessionState::AllComplete)?;

    let output = if request.return_output {
        let dates = if request.add_date {
            let dates = request.period.date_index()?;
            if dates.is_none() {
                debug!("start_date/end_date unknown; no date column added");
            }
            dates
        } else {
            None
        };
        let parameters = if request.add_parameter {
            request.parameters.as_ref()
        } else {
            None
        };
        Some(aggregate(&records, &request.outputs, parameters, dates))
    } else {
        None
    };

    guard.teardown()?;
    let failed_count = records.iter().filter(|r| r.is_failed()).count();
    let summary = BatchSummary {
        thread_count: plan.thread_count,
        sandbox_root: sandboxes.root.clone(),
        sandboxes_reused: sandboxes.reused,
        run_count: records.len(),
        failed_count,
        elapsed_ms: started.elapsed().as_millis() as u64,
        save_file: save.as_ref().map(|s| s.path().to_path_buf()),
        states: guard.history().to_vec(),
    };
    info!(
        runs = summary.run_count,
        failed = summary.failed_count,
        elapsed_ms = summary.elapsed_ms,
        "batch finished"
    );
    Ok(BatchResult {
        records,
        output,
        summary,
    })
}

/// Shared, read-only state every worker runs against.
struct RunContext {
    parameters: Option<ParameterTable>,
    outputs: OutputRequest,
    collaborators: Collaborators,
    save: Option<Arc<SaveFile>>,
}

impl RunContext {
    /// One run on the worker's own sandbox. Never fails: errors become a
    /// failed record.
    fn execute_run(&self, binding: &Binding, run_index: usize) -> RunRecord {
        let started = Instant::now();
        let thread_id = binding.sandbox.thread_id;
        let row = self
            .parameters
            .as_ref()
            .and_then(|table| table.row(run_index));
        let result = self.run_steps(&binding.sandbox, run_index, row.as_ref());
        let elapsed_ms = started.elapsed().as_millis() as u64;
        let mut record = match result {
            Ok(output) => RunRecord::succeeded(run_index, thread_id, output, elapsed_ms),
            Err(err) => RunRecord::failed(run_index, thread_id, format!("{:#}", err), elapsed_ms),
        };
        if let Some(save) = &self.save {
            if let Err(err) = save.append(&record, row.as_ref()) {
                warn!(run_index, error = %format!("{:#}", err), "save file append failed");
                record.mark_failed(format!("{:#}", err));
                // A refused output still leaves a failed row behind.
                if let Err(err) = save.append(&record, row.as_ref()) {
                    warn!(run_index, error = %format!("{:#}", err), "failed record not saved");
                }
            }
        }
        record
    }

    fn run_steps(
        &self,
        sandbox: &Sandbox,
        run_index: usize,
        row: Option<&ParameterRow>,
    ) -> Result<BTreeMap<String, Vec<f64>>> {
        self.clear_stale_outputs(&sandbox.path)?;
        if self.parameters.is_some() {
            let row = row.ok_or_else(|| anyhow!("no parameter row for run {}", run_index))?;
            self.collaborators
                .injector
                .inject(&sandbox.path, row)
                .context("parameter injection failed")?;
        }
        let slot = RunSlot {
            run_index,
            thread_id: sandbox.thread_id,
            sandbox: sandbox.path.clone(),
        };
        self.collaborators
            .executor
            .execute(&slot)
            .context("model execution failed")?;
        let mut output = BTreeMap::new();
        for (name, spec) in self.outputs.iter() {
            let values = self
                .collaborators
                .extractor
                .extract(spec, &sandbox.path)
                .with_context(|| format!("extracting '{}' failed", name))?;
            output.insert(name.clone(), values);
        }
        Ok(output)
    }

    /// Output files left by the previous run on this sandbox must not be
    /// read as this run's results.
    fn clear_stale_outputs(&self, sandbox: &Path) -> Result<()> {
        for (_, spec) in self.outputs.iter() {
            let path = sandbox.join(&spec.file);
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(anyhow!(
                        "failed clearing previous output {}: {}",
                        path.display(),
                        e
                    ))
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, Utc};
    use fleet_core::{ensure_dir, PARAMETERS_FILE};
    use serde_json::Value;
    use std::sync::Mutex;
    use std::thread;
    use std::time::Duration;

    struct TempDirGuard {
        path: PathBuf,
    }

    impl TempDirGuard {
        fn new(prefix: &str) -> Self {
            let path = std::env::temp_dir().join(format!(
                "{}_{}_{}",
                prefix,
                std::process::id(),
                Utc::now().timestamp_micros()
            ));
            ensure_dir(&path).expect("temp dir");
            Self { path }
        }
    }

    impl Drop for TempDirGuard {
        fn drop(&mut self) {
            let _ = fs::remove_dir_all(&self.path);
        }
    }

    fn make_project(root: &Path) -> PathBuf {
        let project = root.join("project");
        ensure_dir(&project).expect("project");
        fs::write(project.join("model.cfg"), "steps 3\n").expect("cfg");
        project
    }

    fn flow_request(project: &Path) -> RunRequest {
        RunRequest::new(
            project,
            OutputRequest::single("flow", OutputSpec::new("out.txt", "flow")),
        )
        .quiet(true)
    }

    fn cn2_table(values: &[f64]) -> ParameterTable {
        ParameterTable::from_rows(
            vec!["cn2".to_string()],
            values.iter().map(|v| vec![*v]).collect(),
        )
        .expect("parameters")
    }

    /// Fake model: reads the injected parameters, sleeps a little (later runs
    /// sleep less so completion order inverts), writes a three-row table.
    fn fake_model(fail_on: Option<usize>) -> Collaborators {
        Collaborators::new(Arc::new(move |slot: &RunSlot| -> Result<()> {
            thread::sleep(Duration::from_millis(((10 - slot.run_index.min(10)) * 3) as u64));
            if Some(slot.run_index) == fail_on {
                return Ok(());
            }
            let params: Value = serde_json::from_str(&fs::read_to_string(
                slot.sandbox.join(PARAMETERS_FILE),
            )?)?;
            let cn2 = params["parameters"]["cn2"]
                .as_f64()
                .ok_or_else(|| anyhow!("cn2 missing"))?;
            let body = format!("flow\n{}\n{}\n{}\n", cn2, cn2 + 1.0, cn2 + 2.0);
            fs::write(slot.sandbox.join("out.txt"), body)?;
            Ok(())
        }))
    }

    fn flow_table(result: &BatchResult) -> VariableTable {
        result
            .output
            .as_ref()
            .expect("output")
            .simulation
            .single()
            .expect("single variable")
            .clone()
    }

    #[test]
    fn three_rows_two_threads_give_ordered_columns() {
        let tmp = TempDirGuard::new("simfleet_batch_three");
        let project = make_project(&tmp.path);
        let request = flow_request(&project)
            .with_parameters(cn2_table(&[10.0, 20.0, 30.0]))
            .with_threads(2);
        let result = run_batch(&request, fake_model(None)).expect("batch");
        assert_eq!(result.summary.thread_count, 2.min(available_parallelism()));
        assert_eq!(result.summary.failed_count, 0);
        let table = flow_table(&result);
        let order: Vec<usize> = table.runs.iter().map(|c| c.run_index).collect();
        assert_eq!(order, vec![1, 2, 3]);
        assert_eq!(table.runs[2].values, Some(vec![30.0, 31.0, 32.0]));
        let params = result.output.as_ref().expect("output").parameter.as_ref().expect("params");
        assert_eq!(params.len(), 3);
        assert!(!project.join(".sim_run").exists(), "sandboxes removed");
        assert_eq!(
            result.summary.states,
            vec![
                SessionState::Init,
                SessionState::Provisioned,
                SessionState::PoolStarted,
                SessionState::Dispatching,
                SessionState::AllComplete,
                SessionState::Teardown,
                SessionState::Done
            ]
        );
    }

    #[test]
    fn one_failed_run_among_five_leaves_an_empty_column() {
        let tmp = TempDirGuard::new("simfleet_batch_failure");
        let project = make_project(&tmp.path);
        let request = flow_request(&project)
            .with_parameters(cn2_table(&[1.0, 2.0, 3.0, 4.0, 5.0]))
            .with_threads(3);
        let result = run_batch(&request, fake_model(Some(4))).expect("batch");
        assert_eq!(result.summary.failed_count, 1);
        let table = flow_table(&result);
        assert_eq!(table.runs.len(), 5);
        assert_eq!(table.runs[3].values, None);
        assert!(result.records[3]
            .status
            .error()
            .expect("error")
            .contains("out.txt"));
        for idx in [0, 1, 2, 4] {
            let expected = (idx + 1) as f64;
            assert_eq!(
                table.runs[idx].values,
                Some(vec![expected, expected + 1.0, expected + 2.0])
            );
        }
    }

    #[test]
    fn keep_folder_leaves_expected_sandboxes() {
        let tmp = TempDirGuard::new("simfleet_batch_keep");
        let project = make_project(&tmp.path);
        let run_path = tmp.path.join("runs");
        let request = flow_request(&project)
            .with_parameters(cn2_table(&[1.0, 2.0, 3.0, 4.0]))
            .with_threads(2)
            .with_run_path(&run_path)
            .keep_folder(true);
        let result = run_batch(&request, fake_model(None)).expect("batch");
        let threads = result.summary.thread_count;
        assert_eq!(threads, 2.min(available_parallelism()));
        let root = run_path.join(".sim_run");
        for thread_id in 1..=threads {
            assert!(root.join(format!("thread_{}", thread_id)).is_dir());
        }
        assert!(!root.join(format!("thread_{}", threads + 1)).exists());
        assert!(!project.join(".sim_run").exists());

        let again = run_batch(&request, fake_model(None)).expect("reuse");
        assert!(again.summary.sandboxes_reused);
        assert_eq!(flow_table(&again), flow_table(&result));
    }

    #[test]
    fn existing_save_file_fails_before_touching_run_path() {
        let tmp = TempDirGuard::new("simfleet_batch_save_exists");
        let project = make_project(&tmp.path);
        let run_path = tmp.path.join("runs");
        let save_dir = tmp.path.join("saves");
        ensure_dir(&save_dir).expect("save dir");
        fs::write(save_dir.join("batch.db"), "taken").expect("occupy");
        let request = flow_request(&project)
            .with_parameters(cn2_table(&[1.0, 2.0]))
            .with_run_path(&run_path)
            .with_save(SaveTarget::new(&save_dir, "batch.db"));
        let err = run_batch(&request, fake_model(None)).expect_err("save exists");
        assert_eq!(error_kind(&err), Some("configuration"));
        assert!(!run_path.exists());
    }

    #[test]
    fn save_file_receives_every_run() {
        let tmp = TempDirGuard::new("simfleet_batch_save");
        let project = make_project(&tmp.path);
        let request = flow_request(&project)
            .with_parameters(cn2_table(&[1.0, 2.0, 3.0]))
            .with_threads(2)
            .with_save(SaveTarget::new(&project, "batch.db"));
        let result = run_batch(&request, fake_model(Some(2))).expect("batch");
        let save_path = result.summary.save_file.clone().expect("save path");
        assert_eq!(save_path, project.join("batch.db"));
        let conn = rusqlite::Connection::open(&save_path).expect("open");
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM runs", [], |r| r.get(0))
            .expect("count");
        assert_eq!(count, 3);
        let failed: i64 = conn
            .query_row("SELECT COUNT(*) FROM runs WHERE status = 'failed'", [], |r| {
                r.get(0)
            })
            .expect("failed");
        assert_eq!(failed, 1);
    }

    #[test]
    fn subset_and_configuration_errors() {
        let tmp = TempDirGuard::new("simfleet_batch_subset");
        let project = make_project(&tmp.path);
        let request = flow_request(&project)
            .with_parameters(cn2_table(&[1.0, 2.0, 3.0]))
            .with_run_index(vec![3, 1]);
        let result = run_batch(&request, fake_model(None)).expect("subset");
        let table = flow_table(&result);
        let order: Vec<usize> = table.runs.iter().map(|c| c.run_index).collect();
        assert_eq!(order, vec![1, 3]);

        let bad = flow_request(&project)
            .with_parameters(cn2_table(&[1.0]))
            .with_run_index(vec![2]);
        let err = run_batch(&bad, fake_model(None)).expect_err("out of range");
        assert_eq!(error_kind(&err), Some("configuration"));

        let strict = fake_model(None)
            .with_injector(Arc::new(JsonParameterInjector::new().with_known_parameters(["esco"])));
        let err = run_batch(&flow_request(&project).with_parameters(cn2_table(&[1.0])), strict)
            .expect_err("unknown name");
        assert!(err.to_string().contains("cn2"));
        assert!(!project.join(".sim_run").exists());
    }

    #[test]
    fn period_is_written_and_dates_attached() {
        let tmp = TempDirGuard::new("simfleet_batch_period");
        let project = make_project(&tmp.path);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_by_model = seen.clone();
        let collaborators = Collaborators::new(Arc::new(move |slot: &RunSlot| -> Result<()> {
            let period = fs::read_to_string(slot.sandbox.join(fleet_core::RUN_PERIOD_FILE))?;
            seen_by_model.lock().map_err(|_| anyhow!("lock"))?.push(period);
            fs::write(slot.sandbox.join("out.txt"), "flow\n1\n2\n3\n")?;
            Ok(())
        }));
        let request = flow_request(&project).with_period(SimPeriod {
            start_date: NaiveDate::from_ymd_opt(2001, 1, 1),
            end_date: NaiveDate::from_ymd_opt(2001, 1, 3),
            output_interval: Some(OutputInterval::Daily),
            years_skip: None,
        });
        let result = run_batch(&request, collaborators).expect("batch");
        let table = flow_table(&result);
        assert_eq!(table.date.as_ref().map(Vec::len), Some(3));
        assert!(result.output.as_ref().expect("output").parameter.is_none());
        let seen = seen.lock().expect("lock");
        assert_eq!(seen.len(), 1);
        assert!(seen[0].contains("2001-01-01"));
    }

    struct RefusingPeriodWriter;

    impl PeriodWriter for RefusingPeriodWriter {
        fn write(&self, _sandbox: &Path, _period: &SimPeriod) -> Result<()> {
            Err(anyhow!("read-only model configuration"))
        }
    }

    fn monthly_period() -> SimPeriod {
        SimPeriod {
            start_date: NaiveDate::from_ymd_opt(2001, 1, 1),
            end_date: NaiveDate::from_ymd_opt(2001, 6, 30),
            output_interval: Some(OutputInterval::Monthly),
            years_skip: None,
        }
    }

    #[test]
    fn fatal_error_after_provisioning_removes_sandbox_root() {
        let tmp = TempDirGuard::new("simfleet_batch_fatal");
        let project = make_project(&tmp.path);
        let request = flow_request(&project)
            .with_parameters(cn2_table(&[1.0, 2.0]))
            .with_period(monthly_period());
        let collaborators =
            fake_model(None).with_period_writer(Arc::new(RefusingPeriodWriter));
        let err = run_batch(&request, collaborators).expect_err("period write fails");
        assert_eq!(error_kind(&err), Some("provisioning"));
        assert!(format!("{:#}", err).contains("read-only model configuration"));
        assert!(!project.join(".sim_run").exists());
    }

    #[test]
    fn fatal_error_with_keep_folder_leaves_sandboxes() {
        let tmp = TempDirGuard::new("simfleet_batch_fatal_keep");
        let project = make_project(&tmp.path);
        let request = flow_request(&project)
            .with_parameters(cn2_table(&[1.0, 2.0]))
            .with_threads(1)
            .with_period(monthly_period())
            .keep_folder(true);
        let collaborators =
            fake_model(None).with_period_writer(Arc::new(RefusingPeriodWriter));
        let err = run_batch(&request, collaborators).expect_err("period write fails");
        assert_eq!(error_kind(&err), Some("provisioning"));
        assert!(project.join(".sim_run").join("thread_1").is_dir());
    }

    #[test]
    fn non_finite_output_fails_the_run_and_is_saved_as_failed() {
        let tmp = TempDirGuard::new("simfleet_batch_nan");
        let project = make_project(&tmp.path);
        let collaborators = Collaborators::new(Arc::new(|slot: &RunSlot| -> Result<()> {
            let body = if slot.run_index == 2 {
                "flow\n1\nnan\n"
            } else {
                "flow\n1\n2\n"
            };
            fs::write(slot.sandbox.join("out.txt"), body)?;
            Ok(())
        }));
        let request = flow_request(&project)
            .with_parameters(cn2_table(&[1.0, 2.0]))
            .with_save(SaveTarget::new(&tmp.path, "batch.db"));
        let result = run_batch(&request, collaborators).expect("batch");
        assert_eq!(result.summary.failed_count, 1);
        assert!(result.records[1]
            .status
            .error()
            .expect("error")
            .contains("not finite"));
        let conn = rusqlite::Connection::open(tmp.path.join("batch.db")).expect("open");
        let status: String = conn
            .query_row("SELECT status FROM runs WHERE run_index = 2", [], |r| r.get(0))
            .expect("row 2");
        assert_eq!(status, "failed");
    }

    #[test]
    fn describe_has_no_side_effects() {
        let tmp = TempDirGuard::new("simfleet_batch_describe");
        let project = make_project(&tmp.path);
        let request = flow_request(&project)
            .with_parameters(cn2_table(&[1.0, 2.0, 3.0]))
            .with_threads(64);
        let plan = describe_batch(&request, &fake_model(None)).expect("plan");
        assert!(plan.thread_count <= 3);
        assert_eq!(plan.executed_runs, vec![1, 2, 3]);
        assert!(!project.join(".sim_run").exists());
    }
}
