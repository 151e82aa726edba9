use anyhow::{anyhow, Context, Result};
use fleet_runner::sink::{parse_json_column, SAVE_SCHEMA_VERSION};
use fleet_runner::{
    aggregate, OutputRequest, OutputSpec, ParameterRow, RunRecord, RunStatus, SimPeriod,
    SimulationOutput, VariableTable,
};
use rusqlite::{Connection, OpenFlags};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct QueryTable {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

/// Summary of a save file without rebuilding any tables.
#[derive(Debug, Clone, Serialize)]
pub struct SaveScan {
    pub path: PathBuf,
    pub schema_version: String,
    pub created_at: Option<String>,
    pub project_path: Option<String>,
    pub request_digest: Option<String>,
    pub parameter_names: Vec<String>,
    pub output_variables: Vec<String>,
    pub run_count: usize,
    pub succeeded: usize,
    pub failed_runs: Vec<usize>,
}

/// Restricts what [`load_save_file`] rebuilds. `None` keeps everything.
#[derive(Debug, Clone, Default)]
pub struct LoadFilter {
    pub variables: Option<Vec<String>>,
    pub runs: Option<Vec<usize>>,
}

struct SavedRun {
    record: RunRecord,
    parameters: Option<Value>,
}

fn open_read_only(path: &Path) -> Result<Connection> {
    if !path.is_file() {
        return Err(anyhow!("save file not found: {}", path.display()));
    }
    let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)
        .with_context(|| format!("failed opening save file {}", path.display()))?;
    let version = read_meta(&conn, "schema_version")?
        .ok_or_else(|| anyhow!("{} is not a simfleet save file", path.display()))?;
    if version != SAVE_SCHEMA_VERSION {
        return Err(anyhow!(
            "unsupported save file schema '{}' (expected {})",
            version,
            SAVE_SCHEMA_VERSION
        ));
    }
    Ok(conn)
}

fn read_meta(conn: &Connection, key: &str) -> Result<Option<String>> {
    let mut stmt = conn
        .prepare("SELECT value FROM meta WHERE key = ?1")
        .context("save file has no meta table")?;
    let mut rows = stmt.query([key])?;
    match rows.next()? {
        Some(row) => Ok(Some(row.get(0)?)),
        None => Ok(None),
    }
}

fn read_parameter_names(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt = conn.prepare("SELECT name FROM parameter_names ORDER BY position")?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(names)
}

fn read_outputs(conn: &Connection) -> Result<OutputRequest> {
    let mut stmt = conn.prepare("SELECT name, spec FROM output_variables ORDER BY name")?;
    let rows = stmt
        .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    let mut request = OutputRequest::default();
    for (name, spec) in rows {
        let spec: OutputSpec = serde_json::from_str(&spec)
            .with_context(|| format!("corrupt output spec for '{}'", name))?;
        request.insert(name, spec);
    }
    Ok(request)
}

fn read_runs(conn: &Connection) -> Result<Vec<SavedRun>> {
    let mut stmt = conn.prepare(
        "SELECT run_index, thread_id, status, error, parameters, outputs, elapsed_ms
         FROM runs ORDER BY run_index",
    )?;
    let raw = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, Option<String>>(4)?,
                row.get::<_, Option<String>>(5)?,
                row.get::<_, i64>(6)?,
            ))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut runs = Vec::with_capacity(raw.len());
    for (run_index, thread_id, status, error, parameters, outputs, elapsed_ms) in raw {
        let status = match status.as_str() {
            "succeeded" => RunStatus::Succeeded,
            "failed" => RunStatus::Failed {
                error: error.unwrap_or_default(),
            },
            other => return Err(anyhow!("run {} has unknown status '{}'", run_index, other)),
        };
        let output = match parse_json_column(outputs)? {
            Some(value) => Some(
                serde_json::from_value::<BTreeMap<String, Vec<f64>>>(value)
                    .with_context(|| format!("corrupt outputs for run {}", run_index))?,
            ),
            None => None,
        };
        runs.push(SavedRun {
            record: RunRecord {
                run_index: run_index as usize,
                thread_id: thread_id as usize,
                status,
                output,
                elapsed_ms: elapsed_ms as u64,
            },
            parameters: parse_json_column(parameters)?,
        });
    }
    Ok(runs)
}

pub fn scan_save_file(path: &Path) -> Result<SaveScan> {
    let conn = open_read_only(path)?;
    let runs = read_runs(&conn)?;
    let failed_runs: Vec<usize> = runs
        .iter()
        .filter(|r| r.record.is_failed())
        .map(|r| r.record.run_index)
        .collect();
    Ok(SaveScan {
        path: path.to_path_buf(),
        schema_version: SAVE_SCHEMA_VERSION.to_string(),
        created_at: read_meta(&conn, "created_at")?,
        project_path: read_meta(&conn, "project_path")?,
        request_digest: read_meta(&conn, "request_digest")?,
        parameter_names: read_parameter_names(&conn)?,
        output_variables: read_outputs(&conn)?.names(),
        run_count: runs.len(),
        succeeded: runs.len() - failed_runs.len(),
        failed_runs,
    })
}

/// Rebuilds the ordered result tables from a save file, as a batch run would
/// have returned them.
pub fn load_save_file(path: &Path, filter: &LoadFilter) -> Result<SimulationOutput> {
    let conn = open_read_only(path)?;
    let names = read_parameter_names(&conn)?;
    let mut outputs = read_outputs(&conn)?;
    let mut runs = read_runs(&conn)?;

    if let Some(wanted) = &filter.variables {
        let mut selected = OutputRequest::default();
        for name in wanted {
            let spec = outputs.get(name).cloned().ok_or_else(|| {
                anyhow!(
                    "variable '{}' is not in the save file (available: {})",
                    name,
                    outputs.names().join(", ")
                )
            })?;
            selected.insert(name.clone(), spec);
        }
        outputs = selected;
    }
    if let Some(wanted) = &filter.runs {
        let saved: BTreeSet<usize> = runs.iter().map(|r| r.record.run_index).collect();
        if let Some(missing) = wanted.iter().find(|idx| !saved.contains(idx)) {
            return Err(anyhow!("run {} is not in the save file", missing));
        }
        let wanted: BTreeSet<usize> = wanted.iter().copied().collect();
        runs.retain(|r| wanted.contains(&r.record.run_index));
    }

    let period: SimPeriod = match read_meta(&conn, "period")? {
        Some(raw) => serde_json::from_str(&raw).context("corrupt period in save file")?,
        None => SimPeriod::default(),
    };
    let dates = period.date_index()?;

    let parameter = if names.is_empty() {
        None
    } else {
        Some(
            runs.iter()
                .map(|run| parameter_row(run.record.run_index, &names, run.parameters.as_ref()))
                .collect(),
        )
    };
    let records: Vec<RunRecord> = runs.into_iter().map(|r| r.record).collect();
    let mut output = aggregate(&records, &outputs, None, dates);
    output.parameter = parameter;
    Ok(output)
}

fn parameter_row(run_index: usize, names: &[String], values: Option<&Value>) -> ParameterRow {
    let values = names
        .iter()
        .filter_map(|name| {
            values
                .and_then(|v| v.get(name))
                .and_then(Value::as_f64)
                .map(|v| (name.clone(), v))
        })
        .collect();
    ParameterRow { run_index, values }
}

/// One row per time step: optional `date`, then one column per run.
pub fn variable_query_table(table: &VariableTable) -> QueryTable {
    let mut columns = Vec::new();
    if table.date.is_some() {
        columns.push("date".to_string());
    }
    columns.extend(table.column_names());
    let rows = (0..table.row_count())
        .map(|step| {
            let mut row = Vec::with_capacity(columns.len());
            if let Some(dates) = &table.date {
                row.push(
                    dates
                        .get(step)
                        .map(|d| Value::String(d.to_string()))
                        .unwrap_or(Value::Null),
                );
            }
            for run in &table.runs {
                row.push(
                    run.values
                        .as_ref()
                        .and_then(|v| v.get(step))
                        .map(|v| json!(v))
                        .unwrap_or(Value::Null),
                );
            }
            row
        })
        .collect();
    QueryTable { columns, rows }
}

pub fn parameter_query_table(rows: &[ParameterRow]) -> QueryTable {
    let mut columns = vec!["run_index".to_string()];
    for row in rows {
        for (name, _) in &row.values {
            if !columns.contains(name) {
                columns.push(name.clone());
            }
        }
    }
    let rows = rows
        .iter()
        .map(|row| {
            columns
                .iter()
                .map(|column| {
                    if column == "run_index" {
                        json!(row.run_index)
                    } else {
                        row.get(column).map(|v| json!(v)).unwrap_or(Value::Null)
                    }
                })
                .collect()
        })
        .collect();
    QueryTable { columns, rows }
}
