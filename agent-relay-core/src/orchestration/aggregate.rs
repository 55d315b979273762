//! Keyed aggregation of step outcomes

use crate::task::{TaskResult, TaskStatus};
use indexmap::IndexMap;
use serde::ser::{Serialize, SerializeMap, Serializer};
use serde::Deserialize;
use serde_json::{json, Map, Value};

/// What happened at one slot of the aggregate
#[derive(Debug, Clone, PartialEq)]
pub enum SectionOutcome {
    Completed(TaskResult),
    /// Dispatched but failed, timed out, or the dispatch itself errored
    Failed {
        error: String,
        result: Option<TaskResult>,
    },
    /// Never dispatched because an earlier required phase failed
    Skipped { reason: String },
}

impl SectionOutcome {
    pub fn from_result(result: TaskResult) -> Self {
        if result.success {
            SectionOutcome::Completed(result)
        } else {
            let error = result
                .error
                .clone()
                .unwrap_or_else(|| "unknown error".to_string());
            SectionOutcome::Failed {
                error,
                result: Some(result),
            }
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, SectionOutcome::Completed(_))
    }

    /// The task result, when a dispatch produced one
    pub fn task_result(&self) -> Option<&TaskResult> {
        match self {
            SectionOutcome::Completed(result) => Some(result),
            SectionOutcome::Failed { result, .. } => result.as_ref(),
            SectionOutcome::Skipped { .. } => None,
        }
    }

    /// Status of the child task from the orchestrator's point of view
    pub fn child_status(&self) -> Option<TaskStatus> {
        match self {
            SectionOutcome::Completed(_) => Some(TaskStatus::Completed),
            SectionOutcome::Failed { result, .. } => Some(
                result
                    .as_ref()
                    .map(TaskResult::terminal_status)
                    .unwrap_or(TaskStatus::Failed),
            ),
            SectionOutcome::Skipped { .. } => None,
        }
    }

    /// Section value: the handler output, or `{"error": message}`
    pub fn to_value(&self) -> Value {
        match self {
            SectionOutcome::Completed(result) => result.data.clone().unwrap_or(Value::Null),
            SectionOutcome::Failed { error, .. } => json!({ "error": error }),
            SectionOutcome::Skipped { reason } => json!({ "error": format!("skipped: {}", reason) }),
        }
    }
}

/// Counters over an aggregate
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, Deserialize)]
pub struct AggregationSummary {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
}

/// Sections in the order they were requested
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AggregatedResults {
    sections: IndexMap<String, SectionOutcome>,
}

impl AggregatedResults {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a section. A repeated key keeps its original position.
    pub fn insert<S: Into<String>>(&mut self, key: S, outcome: SectionOutcome) {
        self.sections.insert(key.into(), outcome);
    }

    pub fn get(&self, key: &str) -> Option<&SectionOutcome> {
        self.sections.get(key)
    }

    /// Handler output of a successful section
    pub fn data(&self, key: &str) -> Option<&Value> {
        match self.sections.get(key) {
            Some(SectionOutcome::Completed(result)) => result.data.as_ref(),
            _ => None,
        }
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.sections.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &SectionOutcome)> {
        self.sections.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.sections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sections.is_empty()
    }

    pub fn summary(&self) -> AggregationSummary {
        let successful = self.sections.values().filter(|s| s.is_success()).count();
        AggregationSummary {
            total: self.sections.len(),
            successful,
            failed: self.sections.len() - successful,
        }
    }

    /// Section values keyed in request order
    pub fn to_value(&self) -> Value {
        let mut map = Map::with_capacity(self.sections.len());
        for (key, outcome) in &self.sections {
            map.insert(key.clone(), outcome.to_value());
        }
        Value::Object(map)
    }
}

impl Serialize for AggregatedResults {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.sections.len()))?;
        for (key, outcome) in &self.sections {
            map.serialize_entry(key, &outcome.to_value())?;
        }
        map.end()
    }
}
