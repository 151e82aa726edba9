use anyhow::{anyhow, Result};
use clap::{Args, Parser, Subcommand};
use fleet_analysis::{
    load_save_file, parameter_query_table, scan_save_file, variable_query_table, LoadFilter,
    QueryTable, SaveScan,
};
use fleet_core::{atomic_write_json_pretty, remove_dir_if_exists, SandboxLayout};
use fleet_runner::config::load_run_config;
use fleet_runner::{
    describe_batch, error_kind, run_batch, BatchPlan, BatchSummary, Collaborators, RunRequest,
    SimulationOutput,
};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "fleet", version = "0.3.0", about = "Sandboxed parallel simulation batches")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Flags that override values from the config file.
#[derive(Args, Debug, Clone, Default)]
struct BatchOverrides {
    #[arg(long)]
    n_thread: Option<usize>,
    #[arg(long)]
    run_path: Option<PathBuf>,
    #[arg(long)]
    refresh: bool,
    #[arg(long)]
    keep_folder: bool,
    #[arg(long)]
    quiet: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a batch described by a YAML or JSON config.
    Run {
        config: PathBuf,
        #[command(flatten)]
        overrides: BatchOverrides,
        /// Write the aggregated output tables as JSON to this file.
        #[arg(long)]
        out: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    /// Validate a config and show the resolved plan without running it.
    Describe {
        config: PathBuf,
        #[command(flatten)]
        overrides: BatchOverrides,
        #[arg(long)]
        json: bool,
    },
    Scan {
        save_file: PathBuf,
        #[arg(long)]
        json: bool,
    },
    Load {
        save_file: PathBuf,
        #[arg(long = "variable")]
        variables: Vec<String>,
        #[arg(long = "run")]
        runs: Vec<usize>,
        #[arg(long)]
        parameters: bool,
        #[arg(long)]
        json: bool,
        #[arg(long)]
        csv: bool,
    },
    /// Remove a leftover sandbox root under `run_path`.
    Clean { run_path: PathBuf },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(command_quiet(&cli.command));
    let json_mode = command_json_mode(&cli.command);
    let result = run_command(cli.command);
    match result {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                let code = error_kind(&err).unwrap_or("command_failed");
                emit_json(&json_error(code, format!("{:#}", err), json!({})));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn init_logging(quiet: bool) {
    let default_level = if quiet { "warn" } else { "info" };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false),
        )
        .init();
}

fn run_command(command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::Run {
            config,
            overrides,
            out,
            json,
        } => {
            let (request, collaborators) = load_request(&config, &overrides)?;
            install_interrupt_handler(&request)?;
            let result = run_batch(&request, collaborators)?;
            if let (Some(path), Some(output)) = (&out, &result.output) {
                atomic_write_json_pretty(path, &serde_json::to_value(output)?)?;
                info!(path = %path.display(), "wrote output tables");
            }
            if json {
                // With --out the tables already went to disk.
                let output = match (&out, &result.output) {
                    (None, Some(output)) => serde_json::to_value(output)?,
                    _ => Value::Null,
                };
                return Ok(Some(json!({
                    "ok": true,
                    "command": "run",
                    "summary": batch_summary_to_json(&result.summary),
                    "failed_runs": failed_runs_to_json(&result.records),
                    "output": output,
                })));
            }
            print_batch_summary(&result.summary);
            for record in result.records.iter().filter(|r| r.is_failed()) {
                println!(
                    "  run {} failed: {}",
                    record.run_index,
                    record.status.error().unwrap_or("")
                );
            }
            if let Some(path) = &out {
                println!("output: {}", path.display());
            }
        }
        Commands::Describe {
            config,
            overrides,
            json,
        } => {
            let (request, collaborators) = load_request(&config, &overrides)?;
            let plan = describe_batch(&request, &collaborators)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "describe",
                    "plan": serde_json::to_value(&plan)?,
                })));
            }
            print_plan(&plan);
        }
        Commands::Scan { save_file, json } => {
            let scan = scan_save_file(&save_file)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "scan",
                    "scan": serde_json::to_value(&scan)?,
                })));
            }
            print_scan(&scan);
        }
        Commands::Load {
            save_file,
            variables,
            runs,
            parameters,
            json,
            csv,
        } => {
            let filter = LoadFilter {
                variables: (!variables.is_empty()).then_some(variables),
                runs: (!runs.is_empty()).then_some(runs),
            };
            let output = load_save_file(&save_file, &filter)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "load",
                    "tables": output_tables_to_json(&output, parameters),
                })));
            }
            let tables = output_tables(&output, parameters);
            if csv {
                let [(_, table)] = tables.as_slice() else {
                    return Err(anyhow!(
                        "--csv prints one table; select a single --variable ({} tables loaded)",
                        tables.len()
                    ));
                };
                print_query_table_csv(table);
                return Ok(None);
            }
            for (idx, (name, table)) in tables.iter().enumerate() {
                if idx > 0 {
                    println!();
                }
                println!("[{}]", name);
                print_query_table(table);
            }
        }
        Commands::Clean { run_path } => {
            let root = SandboxLayout::new(&run_path).root;
            if remove_dir_if_exists(&root)? {
                println!("removed: {}", root.display());
            } else {
                println!("nothing to clean at {}", root.display());
            }
        }
    }
    Ok(None)
}

fn load_request(config: &Path, overrides: &BatchOverrides) -> Result<(RunRequest, Collaborators)> {
    let (config, base_dir) = load_run_config(config)?;
    let (mut request, collaborators) = config.into_request(&base_dir)?;
    apply_overrides(&mut request, overrides);
    Ok((request, collaborators))
}

fn apply_overrides(request: &mut RunRequest, overrides: &BatchOverrides) {
    if let Some(n) = overrides.n_thread {
        request.n_thread = Some(n);
    }
    if let Some(path) = &overrides.run_path {
        request.run_path = Some(path.clone());
    }
    request.refresh |= overrides.refresh;
    request.keep_folder |= overrides.keep_folder;
    request.quiet |= overrides.quiet;
}

/// On Ctrl-C the sandbox root is removed (unless kept) and the process exits
/// with 130. Worker threads are not joined.
fn install_interrupt_handler(request: &RunRequest) -> Result<()> {
    let root = request.sandbox_root();
    let keep = request.keep_folder;
    ctrlc::set_handler(move || {
        warn!("interrupted");
        if !keep {
            match remove_dir_if_exists(&root) {
                Ok(true) => warn!(path = %root.display(), "removed sandbox root"),
                Ok(false) => {}
                Err(err) => warn!(error = %err, "failed removing sandbox root"),
            }
        }
        std::process::exit(130);
    })
    .map_err(|e| anyhow!("failed installing interrupt handler: {}", e))
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Run { json, .. }
        | Commands::Describe { json, .. }
        | Commands::Scan { json, .. }
        | Commands::Load { json, .. } => *json,
        Commands::Clean { .. } => false,
    }
}

fn command_quiet(command: &Commands) -> bool {
    match command {
        Commands::Run { overrides, .. } | Commands::Describe { overrides, .. } => overrides.quiet,
        _ => false,
    }
}

fn batch_summary_to_json(summary: &BatchSummary) -> Value {
    json!({
        "thread_count": summary.thread_count,
        "sandbox_root": summary.sandbox_root.display().to_string(),
        "sandboxes_reused": summary.sandboxes_reused,
        "run_count": summary.run_count,
        "failed_count": summary.failed_count,
        "elapsed_ms": summary.elapsed_ms,
        "save_file": summary.save_file.as_ref().map(|p| p.display().to_string()),
        "states": summary.states.iter().map(|s| s.as_str()).collect::<Vec<_>>(),
    })
}

fn failed_runs_to_json(records: &[fleet_runner::RunRecord]) -> Value {
    Value::Array(
        records
            .iter()
            .filter(|r| r.is_failed())
            .map(|r| {
                json!({
                    "run_index": r.run_index,
                    "thread_id": r.thread_id,
                    "error": r.status.error(),
                })
            })
            .collect(),
    )
}

fn print_batch_summary(summary: &BatchSummary) {
    println!("runs: {}", summary.run_count);
    println!("failed: {}", summary.failed_count);
    println!("threads: {}", summary.thread_count);
    println!(
        "sandboxes: {}{}",
        summary.sandbox_root.display(),
        if summary.sandboxes_reused {
            " (reused)"
        } else {
            ""
        }
    );
    if let Some(path) = &summary.save_file {
        println!("save_file: {}", path.display());
    }
    println!("elapsed: {:.1}s", summary.elapsed_ms as f64 / 1000.0);
}

fn print_plan(plan: &BatchPlan) {
    println!("project: {}", plan.project_path.display());
    println!("sandbox_root: {}", plan.sandbox_root.display());
    println!("run_count: {}", plan.run_count);
    println!("executed_runs: {}", plan.executed_runs.len());
    println!("threads: {}", plan.thread_count);
    if let Some(warning) = &plan.thread_warning {
        println!("thread_warning: {}", warning);
    }
    if !plan.parameter_names.is_empty() {
        println!("parameters: {}", plan.parameter_names.join(", "));
    }
    println!("outputs: {}", plan.output_variables.join(", "));
    if let Some(path) = &plan.save_file {
        println!("save_file: {}", path.display());
    }
}

fn print_scan(scan: &SaveScan) {
    println!("save_file: {}", scan.path.display());
    println!("schema: {}", scan.schema_version);
    if let Some(created_at) = &scan.created_at {
        println!("created_at: {}", created_at);
    }
    if let Some(project) = &scan.project_path {
        println!("project: {}", project);
    }
    println!("runs: {}", scan.run_count);
    println!("succeeded: {}", scan.succeeded);
    if !scan.failed_runs.is_empty() {
        let failed: Vec<String> = scan.failed_runs.iter().map(|i| i.to_string()).collect();
        println!("failed_runs: {}", failed.join(", "));
    }
    if !scan.parameter_names.is_empty() {
        println!("parameters: {}", scan.parameter_names.join(", "));
    }
    println!("outputs: {}", scan.output_variables.join(", "));
}

fn output_tables(output: &SimulationOutput, with_parameters: bool) -> Vec<(String, QueryTable)> {
    let mut tables = Vec::new();
    if with_parameters {
        if let Some(rows) = &output.parameter {
            tables.push(("parameter".to_string(), parameter_query_table(rows)));
        }
    }
    match &output.simulation {
        fleet_runner::Simulation::Single(table) => {
            tables.push((table.variable.clone(), variable_query_table(table)));
        }
        fleet_runner::Simulation::Multiple(named) => {
            for (name, table) in named {
                tables.push((name.clone(), variable_query_table(table)));
            }
        }
    }
    tables
}

fn output_tables_to_json(output: &SimulationOutput, with_parameters: bool) -> Value {
    let mut obj = serde_json::Map::new();
    for (name, table) in output_tables(output, with_parameters) {
        obj.insert(name, query_table_to_json(&table));
    }
    Value::Object(obj)
}

fn query_table_to_json(table: &QueryTable) -> Value {
    let mut objects = Vec::with_capacity(table.rows.len());
    for row in &table.rows {
        let mut obj = serde_json::Map::new();
        for (idx, column) in table.columns.iter().enumerate() {
            obj.insert(column.clone(), row.get(idx).cloned().unwrap_or(Value::Null));
        }
        objects.push(Value::Object(obj));
    }
    json!({
        "columns": table.columns,
        "rows": objects,
        "row_count": table.rows.len()
    })
}

fn print_query_table(table: &QueryTable) {
    if table.columns.is_empty() {
        println!("(empty)");
        return;
    }
    for line in format_run_table(table) {
        println!("{}", line);
    }
    println!("({} rows)", table.rows.len());
}

/// Lays out a run table: `date` stays left-aligned, every other column is
/// numeric and right-aligned. Failed runs leave blank cells.
fn format_run_table(table: &QueryTable) -> Vec<String> {
    let cells: Vec<Vec<String>> = table
        .rows
        .iter()
        .map(|row| row.iter().map(render_cell).collect())
        .collect();
    let widths: Vec<usize> = table
        .columns
        .iter()
        .enumerate()
        .map(|(idx, column)| {
            cells
                .iter()
                .filter_map(|row| row.get(idx))
                .map(|cell| cell.chars().count())
                .fold(column.chars().count(), usize::max)
        })
        .collect();
    let layout = |values: &[String]| -> String {
        values
            .iter()
            .zip(table.columns.iter().zip(&widths))
            .map(|(value, (column, width))| align_cell(value, *width, column != "date"))
            .collect::<Vec<_>>()
            .join("  ")
            .trim_end()
            .to_string()
    };

    let mut lines = Vec::with_capacity(cells.len() + 2);
    lines.push(layout(&table.columns));
    lines.push(
        widths
            .iter()
            .map(|w| "-".repeat(*w))
            .collect::<Vec<_>>()
            .join("  "),
    );
    lines.extend(cells.iter().map(|row| layout(row)));
    lines
}

fn render_cell(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Number(n) => n
            .as_f64()
            .map(format_number)
            .unwrap_or_else(|| n.to_string()),
        Value::String(v) => v.clone(),
        other => other.to_string(),
    }
}

/// Integral values print without a fraction, the rest with up to six
/// decimals; magnitudes outside that range fall back to exponent form.
fn format_number(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        return format!("{}", value as i64);
    }
    if value.abs() < 1e-4 || value.abs() >= 1e15 {
        return format!("{:e}", value);
    }
    let fixed = format!("{:.6}", value);
    fixed.trim_end_matches('0').trim_end_matches('.').to_string()
}

fn align_cell(value: &str, width: usize, right_align: bool) -> String {
    if right_align {
        format!("{:>width$}", value, width = width)
    } else {
        format!("{:<width$}", value, width = width)
    }
}

fn csv_escape(value: &str) -> String {
    if value.contains(',') || value.contains('"') || value.contains('\n') || value.contains('\r') {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

fn print_query_table_csv(table: &QueryTable) {
    println!("{}", csv_header(table));
    for row in &table.rows {
        println!("{}", csv_line(row));
    }
}

fn csv_header(table: &QueryTable) -> String {
    table
        .columns
        .iter()
        .map(|c| csv_escape(c))
        .collect::<Vec<_>>()
        .join(",")
}

/// Full precision; missing values render as empty fields.
fn csv_line(row: &[Value]) -> String {
    row.iter()
        .map(|v| match v {
            Value::Null => String::new(),
            Value::Number(n) => n.to_string(),
            Value::String(text) => csv_escape(text),
            other => csv_escape(&other.to_string()),
        })
        .collect::<Vec<_>>()
        .join(",")
}
