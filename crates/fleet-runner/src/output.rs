use crate::error::config_error;
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Component, Path};

/// Where one output variable lives in a sandbox after the model has run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OutputSpec {
    /// Output file, relative to the sandbox.
    pub file: String,
    /// Column holding the requested values.
    pub variable: String,
    /// Optional key column used to select rows (for example a spatial unit).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_column: Option<String>,
    /// Accepted key values; empty means every row.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub keys: Vec<String>,
    /// Lines to skip before the header row.
    #[serde(default)]
    pub skip_lines: usize,
}

impl OutputSpec {
    pub fn new(file: impl Into<String>, variable: impl Into<String>) -> Self {
        Self {
            file: file.into(),
            variable: variable.into(),
            key_column: None,
            keys: Vec::new(),
            skip_lines: 0,
        }
    }

    pub fn with_keys<I, S>(mut self, key_column: impl Into<String>, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.key_column = Some(key_column.into());
        self.keys = keys.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_skip_lines(mut self, skip_lines: usize) -> Self {
        self.skip_lines = skip_lines;
        self
    }
}

/// Requested outputs, always keyed by variable name, even for a single one.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OutputRequest {
    specs: BTreeMap<String, OutputSpec>,
}

impl OutputRequest {
    pub fn single(name: impl Into<String>, spec: OutputSpec) -> Self {
        let mut request = Self::default();
        request.insert(name, spec);
        request
    }

    pub fn insert(&mut self, name: impl Into<String>, spec: OutputSpec) -> Option<OutputSpec> {
        self.specs.insert(name.into(), spec)
    }

    pub fn with(mut self, name: impl Into<String>, spec: OutputSpec) -> Self {
        self.insert(name, spec);
        self
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        self.specs.keys().cloned().collect()
    }

    pub fn get(&self, name: &str) -> Option<&OutputSpec> {
        self.specs.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &OutputSpec)> {
        self.specs.iter()
    }

    pub fn validate(&self) -> Result<()> {
        if self.specs.is_empty() {
            return Err(config_error("at least one output variable must be requested"));
        }
        for (name, spec) in &self.specs {
            if name.trim().is_empty() {
                return Err(config_error("output variable names must be non-empty"));
            }
            validate_sandbox_relative_path(&spec.file).map_err(|reason| {
                config_error(format!(
                    "output '{}' has invalid file '{}': {}",
                    name, spec.file, reason
                ))
            })?;
            if spec.variable.trim().is_empty() {
                return Err(config_error(format!(
                    "output '{}' must name a value column",
                    name
                )));
            }
            if !spec.keys.is_empty() && spec.key_column.is_none() {
                return Err(config_error(format!(
                    "output '{}' lists keys without a key_column",
                    name
                )));
            }
        }
        Ok(())
    }
}

fn validate_sandbox_relative_path(raw: &str) -> std::result::Result<(), &'static str> {
    if raw.trim().is_empty() {
        return Err("path is empty");
    }
    let path = Path::new(raw);
    for component in path.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            Component::ParentDir => return Err("path must not contain '..'"),
            Component::RootDir | Component::Prefix(_) => {
                return Err("path must be relative to the sandbox")
            }
        }
    }
    Ok(())
}

/// Reads one output variable of a finished run from its sandbox.
pub trait OutputExtractor: Send + Sync {
    fn extract(&self, spec: &OutputSpec, sandbox: &Path) -> Result<Vec<f64>>;
}

/// Whitespace-delimited table with a header row of column names.
#[derive(Debug, Clone, Copy, Default)]
pub struct TableOutputExtractor;

impl OutputExtractor for TableOutputExtractor {
    fn extract(&self, spec: &OutputSpec, sandbox: &Path) -> Result<Vec<f64>> {
        let path = sandbox.join(&spec.file);
        let data = fs::read_to_string(&path)
            .with_context(|| format!("output file missing or unreadable: {}", path.display()))?;
        extract_from_table(&data, spec).with_context(|| format!("malformed output {}", path.display()))
    }
}

fn extract_from_table(data: &str, spec: &OutputSpec) -> Result<Vec<f64>> {
    let mut lines = data
        .lines()
        .enumerate()
        .skip(spec.skip_lines)
        .filter(|(_, line)| !line.trim().is_empty());
    let (_, header_line) = lines
        .next()
        .ok_or_else(|| anyhow!("no header row after {} skipped lines", spec.skip_lines))?;
    let header: Vec<&str> = header_line.split_whitespace().collect();
    let value_idx = column_index(&header, &spec.variable)?;
    let key_idx = spec
        .key_column
        .as_deref()
        .map(|name| column_index(&header, name))
        .transpose()?;

    let mut values = Vec::new();
    for (line_idx, line) in lines {
        let cells: Vec<&str> = line.split_whitespace().collect();
        if cells.len() != header.len() {
            return Err(anyhow!(
                "line {} has {} cells, header has {}",
                line_idx + 1,
                cells.len(),
                header.len()
            ));
        }
        if let Some(key_idx) = key_idx {
            if !spec.keys.is_empty() && !spec.keys.iter().any(|k| k == cells[key_idx]) {
                continue;
            }
        }
        let raw = cells[value_idx];
        let value = raw.parse::<f64>().map_err(|_| {
            anyhow!(
                "line {} column '{}' is not numeric: {}",
                line_idx + 1,
                spec.variable,
                raw
            )
        })?;
        if !value.is_finite() {
            return Err(anyhow!(
                "line {} column '{}' is not finite: {}",
                line_idx + 1,
                spec.variable,
                raw
            ));
        }
        values.push(value);
    }
    Ok(values)
}

fn column_index(header: &[&str], name: &str) -> Result<usize> {
    header
        .iter()
        .position(|col| *col == name)
        .ok_or_else(|| anyhow!("column '{}' not found in header [{}]", name, header.join(" ")))
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHANNEL_TABLE: &str = "\
channel output, daily
day unit flo_out sed_out
1 1 10.5 0.1
1 2 3.0 0.2
2 1 11.5 0.3
2 2 4.0 0.4
";

    #[test]
    fn extracts_value_column_filtered_by_key() {
        let spec = OutputSpec::new("channel.txt", "flo_out")
            .with_keys("unit", ["1"])
            .with_skip_lines(1);
        let values = extract_from_table(CHANNEL_TABLE, &spec).expect("values");
        assert_eq!(values, vec![10.5, 11.5]);
    }

    #[test]
    fn without_keys_every_row_is_returned() {
        let spec = OutputSpec::new("channel.txt", "sed_out").with_skip_lines(1);
        let values = extract_from_table(CHANNEL_TABLE, &spec).expect("values");
        assert_eq!(values, vec![0.1, 0.2, 0.3, 0.4]);
    }

    #[test]
    fn unknown_column_and_bad_cells_are_errors() {
        let spec = OutputSpec::new("channel.txt", "missing").with_skip_lines(1);
        let err = extract_from_table(CHANNEL_TABLE, &spec).expect_err("missing column");
        assert!(err.to_string().contains("column 'missing' not found"));

        let spec = OutputSpec::new("t.txt", "v");
        let err = extract_from_table("v\n1.0\nNaN?\n", &spec).expect_err("bad cell");
        assert!(err.to_string().contains("not numeric"), "{}", err);

        let err = extract_from_table("a v\n1 2 3\n", &spec).expect_err("ragged");
        assert!(err.to_string().contains("has 3 cells"), "{}", err);
    }

    #[test]
    fn non_finite_cells_fail_the_extraction() {
        let spec = OutputSpec::new("t.txt", "v");
        for table in ["v\n1.0\nNaN\n", "v\ninf\n", "v\n-infinity\n"] {
            let err = extract_from_table(table, &spec).expect_err("non-finite");
            assert!(err.to_string().contains("not finite"), "{}", err);
        }
    }

    #[test]
    fn header_only_table_is_legitimately_empty() {
        let spec = OutputSpec::new("t.txt", "v");
        assert_eq!(extract_from_table("v\n", &spec).expect("empty"), Vec::<f64>::new());
    }

    #[test]
    fn request_validation_rejects_escaping_paths() {
        let request = OutputRequest::single("flow", OutputSpec::new("../outside.txt", "flow"));
        assert!(request.validate().is_err());
        let request = OutputRequest::single("flow", OutputSpec::new("/abs.txt", "flow"));
        assert!(request.validate().is_err());
        let request = OutputRequest::single("flow", OutputSpec::new("out/flow.txt", "flow"));
        request.validate().expect("relative path is fine");
        assert!(OutputRequest::default().validate().is_err());
    }

    #[test]
    fn request_serializes_as_plain_map() {
        let request = OutputRequest::single("flow", OutputSpec::new("out.txt", "flo_out"));
        let value = serde_json::to_value(&request).expect("json");
        assert_eq!(
            value,
            serde_json::json!({"flow": {"file": "out.txt", "variable": "flo_out", "skip_lines": 0}})
        );
    }
}
