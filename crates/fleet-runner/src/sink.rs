use crate::error::config_error;
use crate::output::OutputRequest;
use crate::params::ParameterRow;
use crate::period::SimPeriod;
use crate::record::RunRecord;
use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use fleet_core::ensure_dir;
use rusqlite::{params, Connection};
use serde_json::Value;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub const SAVE_SCHEMA_VERSION: &str = "simfleet_save_v1";

const SAVE_FILE_DDL: &str = "
CREATE TABLE meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
CREATE TABLE parameter_names (
    position INTEGER PRIMARY KEY,
    name TEXT NOT NULL UNIQUE
);
CREATE TABLE output_variables (
    name TEXT PRIMARY KEY,
    spec TEXT NOT NULL
);
CREATE TABLE runs (
    run_index INTEGER PRIMARY KEY,
    thread_id INTEGER NOT NULL,
    status TEXT NOT NULL,
    error TEXT,
    parameters TEXT,
    outputs TEXT,
    elapsed_ms INTEGER NOT NULL,
    completed_at TEXT NOT NULL
);
";

/// Location of the save file: `dir/file`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveTarget {
    pub dir: PathBuf,
    pub file: String,
}

impl SaveTarget {
    pub fn new(dir: impl Into<PathBuf>, file: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            file: file.into(),
        }
    }

    pub fn path(&self) -> PathBuf {
        self.dir.join(&self.file)
    }
}

/// Batch-level facts written once when the save file is created.
#[derive(Debug, Clone)]
pub struct SaveHeader<'a> {
    pub project_path: &'a Path,
    pub parameter_names: &'a [String],
    pub outputs: &'a OutputRequest,
    pub period: &'a SimPeriod,
    pub request_digest: String,
}

/// Append-only SQLite store of finished runs. Appends from concurrent
/// workers are serialized by the connection mutex.
#[derive(Debug)]
pub struct SaveFile {
    path: PathBuf,
    conn: Mutex<Connection>,
}

impl SaveFile {
    /// Fails with a configuration error if anything exists at `path`.
    pub fn check_absent(path: &Path) -> Result<()> {
        if path.exists() {
            return Err(config_error(format!(
                "save file already exists: {}",
                path.display()
            )));
        }
        Ok(())
    }

    pub fn create(path: &Path, header: &SaveHeader<'_>) -> Result<Self> {
        if let Some(parent) = path.parent() {
            ensure_dir(parent)?;
        }
        OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::AlreadyExists {
                    config_error(format!("save file already exists: {}", path.display()))
                } else {
                    anyhow!("failed creating save file {}: {}", path.display(), e)
                }
            })?;
        let mut conn = Connection::open(path)
            .with_context(|| format!("failed opening save file {}", path.display()))?;
        conn.execute_batch(SAVE_FILE_DDL)
            .context("failed creating save file schema")?;

        let tx = conn.transaction()?;
        {
            let mut meta = tx.prepare("INSERT INTO meta (key, value) VALUES (?1, ?2)")?;
            meta.execute(params!["schema_version", SAVE_SCHEMA_VERSION])?;
            meta.execute(params!["created_at", Utc::now().to_rfc3339()])?;
            meta.execute(params![
                "project_path",
                header.project_path.display().to_string()
            ])?;
            meta.execute(params!["request_digest", header.request_digest])?;
            meta.execute(params!["period", serde_json::to_string(header.period)?])?;

            let mut names =
                tx.prepare("INSERT INTO parameter_names (position, name) VALUES (?1, ?2)")?;
            for (position, name) in header.parameter_names.iter().enumerate() {
                names.execute(params![position as i64, name])?;
            }

            let mut outputs =
                tx.prepare("INSERT INTO output_variables (name, spec) VALUES (?1, ?2)")?;
            for (name, spec) in header.outputs.iter() {
                outputs.execute(params![name, serde_json::to_string(spec)?])?;
            }
        }
        tx.commit()?;

        Ok(Self {
            path: path.to_path_buf(),
            conn: Mutex::new(conn),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, record: &RunRecord, parameters: Option<&ParameterRow>) -> Result<()> {
        let parameters_json = parameters.map(|row| row.to_json().to_string());
        let outputs_json = match &record.output {
            Some(output) => {
                if let Some((name, _)) = output
                    .iter()
                    .find(|(_, values)| values.iter().any(|v| !v.is_finite()))
                {
                    return Err(anyhow!(
                        "run {} output '{}' has non-finite values",
                        record.run_index,
                        name
                    ));
                }
                Some(serde_json::to_string(output)?)
            }
            None => None,
        };
        let conn = self
            .conn
            .lock()
            .map_err(|_| anyhow!("save file connection lock poisoned"))?;
        conn.execute(
            "INSERT INTO runs (run_index, thread_id, status, error, parameters, outputs, elapsed_ms, completed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                record.run_index as i64,
                record.thread_id as i64,
                record.status.as_str(),
                record.status.error(),
                parameters_json,
                outputs_json,
                record.elapsed_ms as i64,
                Utc::now().to_rfc3339(),
            ],
        )
        .with_context(|| {
            format!(
                "failed appending run {} to {}",
                record.run_index,
                self.path.display()
            )
        })?;
        Ok(())
    }

    pub fn run_count(&self) -> Result<usize> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| anyhow!("save file connection lock poisoned"))?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM runs", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}

/// Parses a JSON column written by [`SaveFile::append`].
pub fn parse_json_column(raw: Option<String>) -> Result<Option<Value>> {
    raw.map(|text| serde_json::from_str(&text).context("corrupt json column in save file"))
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::error_kind;
    use crate::output::OutputSpec;
    use std::collections::BTreeMap;
    use std::fs;
    use std::sync::Arc;
    use std::thread;

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

    fn create(path: &Path) -> Result<SaveFile> {
        let names = vec!["cn2".to_string()];
        let outputs = OutputRequest::single("flow", OutputSpec::new("out.txt", "flo_out"));
        let period = SimPeriod::default();
        SaveFile::create(
            path,
            &SaveHeader {
                project_path: Path::new("/tmp/project"),
                parameter_names: &names,
                outputs: &outputs,
                period: &period,
                request_digest: "sha256:test".to_string(),
            },
        )
    }

    fn row(run_index: usize) -> ParameterRow {
        ParameterRow {
            run_index,
            values: vec![("cn2".to_string(), 60.0 + run_index as f64)],
        }
    }

    #[test]
    fn existing_file_is_a_configuration_error() {
        let tmp = TempDirGuard::new("simfleet_save_exists");
        let path = tmp.path.join("batch.db");
        SaveFile::check_absent(&path).expect("absent");
        fs::write(&path, "not a db").expect("occupy");
        let err = SaveFile::check_absent(&path).expect_err("exists");
        assert_eq!(error_kind(&err), Some("configuration"));
        let err = create(&path).expect_err("create_new");
        assert_eq!(error_kind(&err), Some("configuration"));
        assert_eq!(fs::read_to_string(&path).expect("untouched"), "not a db");
    }

    #[test]
    fn concurrent_appends_are_all_persisted() {
        let tmp = TempDirGuard::new("simfleet_save_concurrent");
        let path = tmp.path.join("nested").join("batch.db");
        let save = Arc::new(create(&path).expect("create"));
        let handles: Vec<_> = (1..=8)
            .map(|run_index| {
                let save = save.clone();
                thread::spawn(move || {
                    let record = if run_index == 4 {
                        RunRecord::failed(run_index, 1, "missing output", 3)
                    } else {
                        let mut output = BTreeMap::new();
                        output.insert("flow".to_string(), vec![run_index as f64, 1.5]);
                        RunRecord::succeeded(run_index, 2, output, 3)
                    };
                    save.append(&record, Some(&row(run_index))).expect("append");
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("join");
        }
        assert_eq!(save.run_count().expect("count"), 8);

        let conn = Connection::open(&path).expect("open");
        let (status, error, outputs): (String, Option<String>, Option<String>) = conn
            .query_row(
                "SELECT status, error, outputs FROM runs WHERE run_index = 4",
                [],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
            )
            .expect("row 4");
        assert_eq!(status, "failed");
        assert_eq!(error.as_deref(), Some("missing output"));
        assert!(outputs.is_none());

        let params: Option<String> = conn
            .query_row("SELECT parameters FROM runs WHERE run_index = 2", [], |r| {
                r.get(0)
            })
            .expect("row 2");
        assert_eq!(
            parse_json_column(params).expect("json"),
            Some(serde_json::json!({"cn2": 62.0}))
        );
        let version: String = conn
            .query_row(
                "SELECT value FROM meta WHERE key = 'schema_version'",
                [],
                |r| r.get(0),
            )
            .expect("meta");
        assert_eq!(version, SAVE_SCHEMA_VERSION);
    }

    #[test]
    fn non_finite_outputs_are_refused_and_run_can_be_stored_as_failed() {
        let tmp = TempDirGuard::new("simfleet_save_nan");
        let save = create(&tmp.path.join("batch.db")).expect("create");
        let mut output = BTreeMap::new();
        output.insert("flow".to_string(), vec![1.0, f64::NAN, 3.0]);
        let mut record = RunRecord::succeeded(1, 1, output, 2);
        let err = save.append(&record, Some(&row(1))).expect_err("nan");
        assert!(err.to_string().contains("non-finite"), "{}", err);
        assert_eq!(save.run_count().expect("count"), 0);

        record.mark_failed(err.to_string());
        save.append(&record, Some(&row(1))).expect("failed record");
        assert_eq!(save.run_count().expect("count"), 1);
    }

    #[test]
    fn duplicate_run_index_is_rejected() {
        let tmp = TempDirGuard::new("simfleet_save_duplicate");
        let save = create(&tmp.path.join("batch.db")).expect("create");
        let record = RunRecord::failed(1, 1, "x", 0);
        save.append(&record, None).expect("first");
        assert!(save.append(&record, None).is_err());
    }
}
