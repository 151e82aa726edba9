use crate::output::OutputRequest;
use crate::params::{ParameterRow, ParameterTable};
use crate::record::RunRecord;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunColumn {
    pub run_index: usize,
    /// `None` when the run failed.
    pub values: Option<Vec<f64>>,
}

/// One output variable across every executed run, columns ordered by
/// ascending `run_index`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableTable {
    pub variable: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<Vec<NaiveDate>>,
    pub runs: Vec<RunColumn>,
}

impl VariableTable {
    pub fn column(&self, run_index: usize) -> Option<&RunColumn> {
        self.runs.iter().find(|c| c.run_index == run_index)
    }

    /// `run_01`, `run_02`, ... zero-padded to the widest index in the table.
    pub fn column_names(&self) -> Vec<String> {
        let width = index_width(self.runs.iter().map(|c| c.run_index));
        self.runs
            .iter()
            .map(|c| column_name(c.run_index, width))
            .collect()
    }

    /// Longest column; failed runs count as zero rows.
    pub fn row_count(&self) -> usize {
        let longest = self
            .runs
            .iter()
            .filter_map(|c| c.values.as_ref().map(Vec::len))
            .max()
            .unwrap_or(0);
        longest.max(self.date.as_ref().map(Vec::len).unwrap_or(0))
    }
}

pub fn column_name(run_index: usize, width: usize) -> String {
    format!("run_{:0width$}", run_index, width = width)
}

pub fn index_width(indices: impl Iterator<Item = usize>) -> usize {
    indices.max().unwrap_or(1).to_string().len()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Simulation {
    Single(VariableTable),
    Multiple(BTreeMap<String, VariableTable>),
}

impl Simulation {
    /// Collapses to [`Simulation::Single`] when exactly one variable exists.
    pub fn from_tables(mut tables: BTreeMap<String, VariableTable>) -> Self {
        if tables.len() == 1 {
            if let Some((_, table)) = tables.pop_first() {
                return Self::Single(table);
            }
        }
        Self::Multiple(tables)
    }

    pub fn single(&self) -> Option<&VariableTable> {
        match self {
            Self::Single(table) => Some(table),
            Self::Multiple(_) => None,
        }
    }

    pub fn variable(&self, name: &str) -> Option<&VariableTable> {
        match self {
            Self::Single(table) => (table.variable == name).then_some(table),
            Self::Multiple(tables) => tables.get(name),
        }
    }

    pub fn tables(&self) -> Vec<&VariableTable> {
        match self {
            Self::Single(table) => vec![table],
            Self::Multiple(tables) => tables.values().collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationOutput {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameter: Option<Vec<ParameterRow>>,
    pub simulation: Simulation,
}

/// Builds the ordered per-variable tables from finished run records.
pub fn aggregate(
    records: &[RunRecord],
    outputs: &OutputRequest,
    parameters: Option<&ParameterTable>,
    dates: Option<Vec<NaiveDate>>,
) -> SimulationOutput {
    let mut ordered: Vec<&RunRecord> = records.iter().collect();
    ordered.sort_by_key(|r| r.run_index);

    let mut tables = BTreeMap::new();
    for name in outputs.names() {
        let runs: Vec<RunColumn> = ordered
            .iter()
            .map(|record| RunColumn {
                run_index: record.run_index,
                values: record
                    .output
                    .as_ref()
                    .and_then(|output| output.get(&name))
                    .cloned(),
            })
            .collect();
        if let Some(dates) = &dates {
            if let Some(column) = runs
                .iter()
                .find(|c| c.values.as_ref().is_some_and(|v| v.len() != dates.len()))
            {
                warn!(
                    variable = %name,
                    run_index = column.run_index,
                    dates = dates.len(),
                    "output length does not match the date index"
                );
            }
        }
        tables.insert(
            name.clone(),
            VariableTable {
                variable: name,
                date: dates.clone(),
                runs,
            },
        );
    }

    let run_indices: Vec<usize> = ordered.iter().map(|r| r.run_index).collect();
    SimulationOutput {
        parameter: parameters.map(|table| table.select(&run_indices)),
        simulation: Simulation::from_tables(tables),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::OutputSpec;

    fn record(run_index: usize, flow: Option<Vec<f64>>) -> RunRecord {
        match flow {
            Some(values) => {
                let mut output = BTreeMap::new();
                output.insert("flow".to_string(), values.clone());
                output.insert("sed".to_string(), values.iter().map(|v| v / 10.0).collect());
                RunRecord::succeeded(run_index, 1, output, 0)
            }
            None => RunRecord::failed(run_index, 1, "boom", 0),
        }
    }

    #[test]
    fn single_variable_collapses_and_orders_columns() {
        let outputs = OutputRequest::single("flow", OutputSpec::new("o.txt", "flo_out"));
        let records = vec![
            record(3, Some(vec![3.0])),
            record(1, Some(vec![1.0])),
            record(2, None),
        ];
        let result = aggregate(&records, &outputs, None, None);
        let table = result.simulation.single().expect("single");
        let order: Vec<usize> = table.runs.iter().map(|c| c.run_index).collect();
        assert_eq!(order, vec![1, 2, 3]);
        assert_eq!(table.column(2).expect("run 2").values, None);
        assert_eq!(table.column(3).expect("run 3").values, Some(vec![3.0]));
        assert!(result.parameter.is_none());
        assert!(table.date.is_none());
        assert_eq!(result.simulation.variable("flow"), Some(table));
        assert!(result.simulation.variable("sed").is_none());
    }

    #[test]
    fn multiple_variables_stay_keyed_and_carry_parameters_and_dates() {
        let outputs = OutputRequest::single("flow", OutputSpec::new("o.txt", "flo_out"))
            .with("sed", OutputSpec::new("o.txt", "sed_out"));
        let params = ParameterTable::from_rows(
            vec!["cn2".to_string()],
            vec![vec![60.0], vec![70.0], vec![80.0]],
        )
        .expect("params");
        let dates = vec![
            NaiveDate::from_ymd_opt(2000, 1, 1).expect("date"),
            NaiveDate::from_ymd_opt(2000, 1, 2).expect("date"),
        ];
        let records = vec![record(3, Some(vec![3.0, 30.0])), record(1, Some(vec![1.0, 10.0]))];
        let result = aggregate(&records, &outputs, Some(&params), Some(dates.clone()));
        let sed = result.simulation.variable("sed").expect("sed");
        assert_eq!(sed.date.as_ref(), Some(&dates));
        assert_eq!(sed.column(3).expect("run 3").values, Some(vec![0.3, 3.0]));
        let param_runs: Vec<usize> = result
            .parameter
            .expect("parameters")
            .iter()
            .map(|r| r.run_index)
            .collect();
        assert_eq!(param_runs, vec![1, 3]);
    }

    #[test]
    fn column_names_are_zero_padded() {
        let table = VariableTable {
            variable: "flow".to_string(),
            date: None,
            runs: vec![
                RunColumn {
                    run_index: 2,
                    values: None,
                },
                RunColumn {
                    run_index: 10,
                    values: Some(vec![1.0, 2.0]),
                },
            ],
        };
        assert_eq!(table.column_names(), vec!["run_02", "run_10"]);
        assert_eq!(table.row_count(), 2);
    }
}
