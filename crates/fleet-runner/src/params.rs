use crate::error::config_error;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};

/// Parameter values as written in a config file: a scalar applies to every
/// run, a vector defines one run per element.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParameterValues {
    Scalar(f64),
    Vector(Vec<f64>),
}

/// Ordered table of parameter sets, one row per run. Row `i` (0-based) is
/// run index `i + 1`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterTable {
    names: Vec<String>,
    rows: Vec<Vec<f64>>,
}

/// One run's parameter values, in table column order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterRow {
    pub run_index: usize,
    pub values: Vec<(String, f64)>,
}

impl ParameterRow {
    pub fn get(&self, name: &str) -> Option<f64> {
        self.values
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| *v)
    }

    pub fn to_json(&self) -> Value {
        let mut map = Map::new();
        for (name, value) in &self.values {
            map.insert(name.clone(), json_number(*value));
        }
        Value::Object(map)
    }
}

fn json_number(value: f64) -> Value {
    serde_json::Number::from_f64(value)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

impl ParameterTable {
    pub fn from_rows(names: Vec<String>, rows: Vec<Vec<f64>>) -> Result<Self> {
        validate_names(&names)?;
        if rows.is_empty() {
            return Err(config_error("parameter table must contain at least one row"));
        }
        for (idx, row) in rows.iter().enumerate() {
            if row.len() != names.len() {
                return Err(config_error(format!(
                    "parameter row {} has {} values but {} parameter names were given",
                    idx + 1,
                    row.len(),
                    names.len()
                )));
            }
        }
        Ok(Self { names, rows })
    }

    /// A named vector: a single run.
    pub fn from_named_values(values: Vec<(String, f64)>) -> Result<Self> {
        let (names, row): (Vec<String>, Vec<f64>) = values.into_iter().unzip();
        Self::from_rows(names, vec![row])
    }

    pub fn from_columns(columns: Vec<(String, Vec<f64>)>) -> Result<Self> {
        let names: Vec<String> = columns.iter().map(|(n, _)| n.clone()).collect();
        validate_names(&names)?;
        let run_count = columns.first().map(|(_, c)| c.len()).unwrap_or(0);
        for (name, column) in &columns {
            if column.len() != run_count {
                return Err(config_error(format!(
                    "parameter '{}' has {} values, expected {} (all parameters need the same number of values)",
                    name,
                    column.len(),
                    run_count
                )));
            }
        }
        let rows = (0..run_count)
            .map(|i| columns.iter().map(|(_, c)| c[i]).collect())
            .collect();
        Self::from_rows(names, rows)
    }

    /// Builds the table from config-file parameters. Scalars are broadcast to
    /// the common vector length; all vectors must agree on length.
    pub fn from_spec(spec: &BTreeMap<String, ParameterValues>) -> Result<Self> {
        let mut run_count: Option<(usize, &str)> = None;
        for (name, values) in spec {
            if let ParameterValues::Vector(v) = values {
                match run_count {
                    None => run_count = Some((v.len(), name.as_str())),
                    Some((expected, first)) if expected != v.len() => {
                        return Err(config_error(format!(
                            "parameter '{}' has {} values but '{}' has {}",
                            name,
                            v.len(),
                            first,
                            expected
                        )));
                    }
                    Some(_) => {}
                }
            }
        }
        let run_count = run_count.map(|(n, _)| n).unwrap_or(1);
        let columns = spec
            .iter()
            .map(|(name, values)| {
                let column = match values {
                    ParameterValues::Scalar(v) => vec![*v; run_count],
                    ParameterValues::Vector(v) => v.clone(),
                };
                (name.clone(), column)
            })
            .collect();
        Self::from_columns(columns)
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn run_count(&self) -> usize {
        self.rows.len()
    }

    /// Row for a 1-based run index.
    pub fn row(&self, run_index: usize) -> Option<ParameterRow> {
        let values = self.rows.get(run_index.checked_sub(1)?)?;
        Some(ParameterRow {
            run_index,
            values: self.names.iter().cloned().zip(values.iter().copied()).collect(),
        })
    }

    pub fn select(&self, run_indices: &[usize]) -> Vec<ParameterRow> {
        run_indices
            .iter()
            .filter_map(|idx| self.row(*idx))
            .collect()
    }
}

fn validate_names(names: &[String]) -> Result<()> {
    if names.is_empty() {
        return Err(config_error("parameter table must name at least one parameter"));
    }
    let mut seen = BTreeSet::new();
    for name in names {
        if name.trim().is_empty() {
            return Err(config_error("parameter names must be non-empty"));
        }
        if !seen.insert(name.as_str()) {
            return Err(config_error(format!("duplicate parameter name '{}'", name)));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::error_kind;

    #[test]
    fn rows_are_addressed_by_one_based_run_index() {
        let table = ParameterTable::from_rows(
            vec!["cn2".to_string(), "alpha".to_string()],
            vec![vec![60.0, 0.1], vec![70.0, 0.2], vec![80.0, 0.3]],
        )
        .expect("table");
        assert_eq!(table.run_count(), 3);
        assert!(table.row(0).is_none());
        assert!(table.row(4).is_none());
        let row = table.row(2).expect("row 2");
        assert_eq!(row.run_index, 2);
        assert_eq!(row.get("cn2"), Some(70.0));
        assert_eq!(row.get("alpha"), Some(0.2));
        assert_eq!(row.to_json(), serde_json::json!({"cn2": 70.0, "alpha": 0.2}));
    }

    #[test]
    fn ragged_rows_are_configuration_errors() {
        let err = ParameterTable::from_rows(
            vec!["a".to_string(), "b".to_string()],
            vec![vec![1.0, 2.0], vec![3.0]],
        )
        .expect_err("ragged");
        assert_eq!(error_kind(&err), Some("configuration"));
        assert!(err.to_string().contains("row 2"));
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let err = ParameterTable::from_named_values(vec![
            ("a".to_string(), 1.0),
            ("a".to_string(), 2.0),
        ])
        .expect_err("duplicate");
        assert!(err.to_string().contains("duplicate parameter name 'a'"));
    }

    #[test]
    fn spec_broadcasts_scalars_across_vector_runs() {
        let mut spec = BTreeMap::new();
        spec.insert("alpha".to_string(), ParameterValues::Scalar(0.5));
        spec.insert("cn2".to_string(), ParameterValues::Vector(vec![60.0, 70.0]));
        let table = ParameterTable::from_spec(&spec).expect("table");
        assert_eq!(table.run_count(), 2);
        assert_eq!(table.row(2).expect("row").get("alpha"), Some(0.5));
        assert_eq!(table.row(2).expect("row").get("cn2"), Some(70.0));
    }

    #[test]
    fn spec_with_only_scalars_is_a_single_run() {
        let mut spec = BTreeMap::new();
        spec.insert("alpha".to_string(), ParameterValues::Scalar(0.5));
        let table = ParameterTable::from_spec(&spec).expect("table");
        assert_eq!(table.run_count(), 1);
    }

    #[test]
    fn spec_rejects_mismatched_vector_lengths() {
        let mut spec = BTreeMap::new();
        spec.insert("a".to_string(), ParameterValues::Vector(vec![1.0, 2.0]));
        spec.insert("b".to_string(), ParameterValues::Vector(vec![1.0]));
        assert!(ParameterTable::from_spec(&spec).is_err());
    }

    #[test]
    fn untagged_values_deserialize_from_yaml() {
        let spec: BTreeMap<String, ParameterValues> =
            serde_yaml::from_str("alpha: 0.5\ncn2: [60, 70]\n").expect("yaml");
        assert_eq!(spec["alpha"], ParameterValues::Scalar(0.5));
        assert_eq!(spec["cn2"], ParameterValues::Vector(vec![60.0, 70.0]));
    }
}
