use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunStatus {
    Succeeded,
    Failed { error: String },
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Succeeded => "succeeded",
            Self::Failed { .. } => "failed",
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            Self::Succeeded => None,
            Self::Failed { error } => Some(error.as_str()),
        }
    }
}

/// Outcome of one run. `output` holds every requested variable when the run
/// succeeded and is `None` otherwise.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_index: usize,
    pub thread_id: usize,
    #[serde(flatten)]
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<BTreeMap<String, Vec<f64>>>,
    pub elapsed_ms: u64,
}

impl RunRecord {
    pub fn succeeded(
        run_index: usize,
        thread_id: usize,
        output: BTreeMap<String, Vec<f64>>,
        elapsed_ms: u64,
    ) -> Self {
        Self {
            run_index,
            thread_id,
            status: RunStatus::Succeeded,
            output: Some(output),
            elapsed_ms,
        }
    }

    pub fn failed(
        run_index: usize,
        thread_id: usize,
        error: impl Into<String>,
        elapsed_ms: u64,
    ) -> Self {
        Self {
            run_index,
            thread_id,
            status: RunStatus::Failed {
                error: error.into(),
            },
            output: None,
            elapsed_ms,
        }
    }

    /// Downgrades a finished record after a post-run step (e.g. persistence)
    /// failed. Extracted output is dropped so the run reads as empty.
    pub fn mark_failed(&mut self, error: impl Into<String>) {
        self.status = RunStatus::Failed {
            error: error.into(),
        };
        self.output = None;
    }

    pub fn is_failed(&self) -> bool {
        self.status.is_failed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn record_serializes_status_inline() {
        let mut output = BTreeMap::new();
        output.insert("flow".to_string(), vec![1.0, 2.0]);
        let ok = RunRecord::succeeded(3, 1, output, 12);
        assert_eq!(
            serde_json::to_value(&ok).expect("json"),
            json!({
                "run_index": 3,
                "thread_id": 1,
                "status": "succeeded",
                "output": {"flow": [1.0, 2.0]},
                "elapsed_ms": 12
            })
        );

        let failed = RunRecord::failed(4, 2, "missing output", 7);
        let value = serde_json::to_value(&failed).expect("json");
        assert_eq!(value["status"], "failed");
        assert_eq!(value["error"], "missing output");
        assert!(value.get("output").is_none());
        let back: RunRecord = serde_json::from_value(value).expect("round trip");
        assert_eq!(back, failed);
    }

    #[test]
    fn mark_failed_drops_output() {
        let mut record = RunRecord::succeeded(1, 1, BTreeMap::new(), 0);
        record.mark_failed("save file append failed");
        assert!(record.is_failed());
        assert_eq!(record.status.error(), Some("save file append failed"));
        assert!(record.output.is_none());
    }
}
