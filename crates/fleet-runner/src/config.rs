use crate::collaborators::{Collaborators, CommandExecutor, JsonParameterInjector};
use crate::error::config_error;
use crate::output::OutputRequest;
use crate::params::{ParameterTable, ParameterValues};
use crate::period::{OutputInterval, SimPeriod};
use crate::sink::SaveTarget;
use crate::RunRequest;
use anyhow::{Context, Result};
use chrono::NaiveDate;
use fleet_schemas::{validate_value, RUN_CONFIG_SCHEMA};
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProgramConfig {
    pub command: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// On-disk batch description (`run_config_v1`). Relative paths resolve
/// against the directory holding the config file.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunConfig {
    pub project_path: PathBuf,
    pub program: ProgramConfig,
    pub outputs: OutputRequest,
    #[serde(default)]
    pub parameters: Option<BTreeMap<String, ParameterValues>>,
    #[serde(default)]
    pub known_parameters: Option<Vec<String>>,
    #[serde(default)]
    pub start_date: Option<NaiveDate>,
    #[serde(default)]
    pub end_date: Option<NaiveDate>,
    #[serde(default)]
    pub output_interval: Option<OutputInterval>,
    #[serde(default)]
    pub years_skip: Option<u32>,
    #[serde(default)]
    pub run_index: Option<Vec<usize>>,
    #[serde(default)]
    pub run_path: Option<PathBuf>,
    #[serde(default)]
    pub n_thread: Option<usize>,
    #[serde(default)]
    pub save_path: Option<PathBuf>,
    #[serde(default)]
    pub save_file: Option<String>,
    #[serde(default = "default_true")]
    pub return_output: bool,
    #[serde(default = "default_true")]
    pub add_parameter: bool,
    #[serde(default = "default_true")]
    pub add_date: bool,
    #[serde(default)]
    pub refresh: bool,
    #[serde(default)]
    pub keep_folder: bool,
    #[serde(default)]
    pub quiet: bool,
}

fn default_true() -> bool {
    true
}

/// Loads a YAML (`.yaml`/`.yml`) or JSON config and validates it against the
/// bundled schema before deserializing.
pub fn load_run_config(path: &Path) -> Result<(RunConfig, PathBuf)> {
    let data = fs::read_to_string(path)
        .with_context(|| format!("failed reading config {}", path.display()))?;
    let is_yaml = matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    );
    let value: Value = if is_yaml {
        serde_yaml::from_str(&data)
            .map_err(|e| config_error(format!("invalid yaml in {}: {}", path.display(), e)))?
    } else {
        serde_json::from_str(&data)
            .map_err(|e| config_error(format!("invalid json in {}: {}", path.display(), e)))?
    };
    let config = parse_run_config(value)?;
    let base_dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    Ok((config, base_dir))
}

pub fn parse_run_config(value: Value) -> Result<RunConfig> {
    validate_value(RUN_CONFIG_SCHEMA, &value).map_err(|e| config_error(e.to_string()))?;
    serde_json::from_value(value).map_err(|e| config_error(format!("invalid run config: {}", e)))
}

impl RunConfig {
    pub fn period(&self) -> SimPeriod {
        SimPeriod {
            start_date: self.start_date,
            end_date: self.end_date,
            output_interval: self.output_interval,
            years_skip: self.years_skip,
        }
    }

    /// Builds the request and default collaborators, resolving relative paths
    /// against `base_dir`.
    pub fn into_request(self, base_dir: &Path) -> Result<(RunRequest, Collaborators)> {
        let period = self.period();
        let resolve = |p: &Path| -> PathBuf {
            if p.is_absolute() {
                p.to_path_buf()
            } else {
                base_dir.join(p)
            }
        };
        let project_path = resolve(&self.project_path);
        let run_path = self.run_path.as_deref().map(&resolve);
        let save = match (self.save_path.as_deref(), self.save_file) {
            (_, Some(file)) => {
                let dir = self
                    .save_path
                    .as_deref()
                    .map(&resolve)
                    .or_else(|| run_path.clone())
                    .unwrap_or_else(|| project_path.clone());
                Some(SaveTarget::new(dir, file))
            }
            (Some(_), None) => {
                return Err(config_error("save_path is set but save_file is missing"));
            }
            (None, None) => None,
        };
        let parameters = self
            .parameters
            .as_ref()
            .map(ParameterTable::from_spec)
            .transpose()?;

        let mut injector = JsonParameterInjector::new();
        if let Some(known) = self.known_parameters {
            injector = injector.with_known_parameters(known);
        }
        let executor = CommandExecutor::new(self.program.command)?.with_env(self.program.env);
        let collaborators =
            Collaborators::new(Arc::new(executor)).with_injector(Arc::new(injector));

        let request = RunRequest {
            project_path,
            outputs: self.outputs,
            parameters,
            period,
            run_index: self.run_index,
            run_path,
            n_thread: self.n_thread,
            save,
            return_output: self.return_output,
            add_parameter: self.add_parameter,
            add_date: self.add_date,
            refresh: self.refresh,
            keep_folder: self.keep_folder,
            quiet: self.quiet,
        };
        Ok((request, collaborators))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::error_kind;
    use serde_json::json;

    fn base_config() -> Value {
        json!({
            "project_path": "model",
            "program": {"command": ["./run.sh"]},
            "outputs": {"flow": {"file": "out.txt", "variable": "flo_out"}}
        })
    }

    #[test]
    fn defaults_and_relative_paths() {
        let config = parse_run_config(base_config()).expect("config");
        assert!(config.return_output && config.add_parameter && config.add_date);
        assert!(!config.refresh && !config.keep_folder && !config.quiet);
        let (request, _) = config.into_request(Path::new("/work")).expect("request");
        assert_eq!(request.project_path, PathBuf::from("/work/model"));
        assert_eq!(request.effective_run_path(), PathBuf::from("/work/model"));
        assert!(request.save.is_none());
        assert!(request.parameters.is_none());
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let mut value = base_config();
        value["n_threads"] = json!(4);
        let err = parse_run_config(value).expect_err("unknown key");
        assert_eq!(error_kind(&err), Some("configuration"));

        let mut value = base_config();
        value["outputs"]["flow"]["colour"] = json!("red");
        assert!(parse_run_config(value).is_err());
    }

    #[test]
    fn yaml_parameters_period_and_save_target() {
        let yaml = r#"
project_path: /abs/model
program:
  command: ["sh", "-c", "./model"]
  env: {OMP_NUM_THREADS: "1"}
outputs:
  flow: {file: output.txt, variable: flo_out, key_column: unit, keys: ["1"]}
parameters:
  cn2: [60, 70, 80]
  alpha: 0.5
start_date: 2000-01-01
end_date: 2000-12-31
output_interval: m
years_skip: 0
run_index: [1, 3]
n_thread: 2
save_file: batch.db
"#;
        let value: Value = serde_yaml::from_str(yaml).expect("yaml");
        let config = parse_run_config(value).expect("config");
        let (request, _) = config.into_request(Path::new("/cfg")).expect("request");
        let params = request.parameters.as_ref().expect("parameters");
        assert_eq!(params.run_count(), 3);
        assert_eq!(params.row(3).expect("row").get("cn2"), Some(80.0));
        assert_eq!(params.row(3).expect("row").get("alpha"), Some(0.5));
        assert_eq!(request.period.output_interval, Some(OutputInterval::Monthly));
        assert_eq!(request.run_index, Some(vec![1, 3]));
        assert_eq!(
            request.save.as_ref().expect("save").path(),
            PathBuf::from("/abs/model/batch.db")
        );
    }

    #[test]
    fn save_path_without_file_is_rejected() {
        let mut value = base_config();
        value["save_path"] = json!("results");
        let config = parse_run_config(value).expect("config");
        let err = config.into_request(Path::new("/work")).expect_err("no file");
        assert!(err.to_string().contains("save_file is missing"));
    }
}
