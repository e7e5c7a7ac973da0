//! Run tree structure and the shared run-assembly arena

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Category of the unit of work a run records.
///
/// Event names in both stream protocols derive from this
/// (`on_<type>_<phase>`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunType {
    /// Composed pipeline execution
    Chain,
    /// Model completion
    Llm,
    /// Tool execution
    Tool,
    /// Document retrieval
    Retriever,
    /// Prompt rendering
    Prompt,
    /// Output parsing
    Parser,
}

impl RunType {
    /// Lowercase name used in event names and log entries.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            RunType::Chain => "chain",
            RunType::Llm => "llm",
            RunType::Tool => "tool",
            RunType::Retriever => "retriever",
            RunType::Prompt => "prompt",
            RunType::Parser => "parser",
        }
    }

    /// Parse a lowercase name back into a run type.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "chain" => Some(RunType::Chain),
            "llm" => Some(RunType::Llm),
            "tool" => Some(RunType::Tool),
            "retriever" => Some(RunType::Retriever),
            "prompt" => Some(RunType::Prompt),
            "parser" => Some(RunType::Parser),
            _ => None,
        }
    }
}

/// One recorded execution of a runnable.
///
/// Created on `on_run_start`, closed exactly once by either `on_run_end` or
/// `on_run_error`, immutable afterwards. Children are the runs opened by
/// nested invocations under this run's callback manager, in start order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunTree {
    /// Unique run identifier
    pub id: Uuid,

    /// Display name of the component being run
    pub name: String,

    /// Category of the run
    pub run_type: RunType,

    /// When the run started
    pub start_time: DateTime<Utc>,

    /// When the run ended (if closed)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,

    /// Parent run ID (if this is a child run)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_run_id: Option<Uuid>,

    /// Input snapshot
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inputs: Option<serde_json::Value>,

    /// Output snapshot (absent until closed successfully)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outputs: Option<serde_json::Value>,

    /// Error if the run failed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Tags for categorization
    pub tags: Vec<String>,

    /// Additional metadata
    pub metadata: HashMap<String, serde_json::Value>,

    /// Identifiers of child runs, in start order
    pub child_run_ids: Vec<Uuid>,
}

impl RunTree {
    /// Create an open run.
    #[must_use]
    pub fn new(id: Uuid, name: impl Into<String>, run_type: RunType) -> Self {
        Self {
            id,
            name: name.into(),
            run_type,
            start_time: Utc::now(),
            end_time: None,
            parent_run_id: None,
            inputs: None,
            outputs: None,
            error: None,
            tags: Vec::new(),
            metadata: HashMap::new(),
            child_run_ids: Vec::new(),
        }
    }

    /// Set the parent run ID.
    #[must_use]
    pub fn with_parent(mut self, parent_run_id: Option<Uuid>) -> Self {
        self.parent_run_id = parent_run_id;
        self
    }

    /// Set the input snapshot.
    #[must_use]
    pub fn with_inputs(mut self, inputs: serde_json::Value) -> Self {
        self.inputs = Some(inputs);
        self
    }

    /// Set the tags.
    #[must_use]
    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    /// Set the metadata.
    #[must_use]
    pub fn with_metadata(mut self, metadata: HashMap<String, serde_json::Value>) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Arena of in-flight runs, shared by the tracer handlers.
///
/// Flat callbacks arrive one run at a time; the tracker reassembles them into
/// trees by id, appending each started run to its parent's ordered child
/// list. Closed runs are removed from the arena and handed back to the
/// caller.
#[derive(Debug, Default)]
pub struct RunTracker {
    runs: Mutex<HashMap<Uuid, RunTree>>,
}

impl RunTracker {
    /// Create an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a run and register it with its parent.
    #[allow(clippy::too_many_arguments)]
    pub fn start_run(
        &self,
        run_type: RunType,
        name: &str,
        inputs: &serde_json::Value,
        run_id: Uuid,
        parent_run_id: Option<Uuid>,
        tags: &[String],
        metadata: &HashMap<String, serde_json::Value>,
    ) -> RunTree {
        let run = RunTree::new(run_id, name, run_type)
            .with_parent(parent_run_id)
            .with_inputs(inputs.clone())
            .with_tags(tags.to_vec())
            .with_metadata(metadata.clone());

        let mut runs = self.runs.lock();
        if let Some(parent_id) = parent_run_id {
            if let Some(parent) = runs.get_mut(&parent_id) {
                parent.child_run_ids.push(run_id);
            }
        }
        runs.insert(run_id, run.clone());
        run
    }

    /// Snapshot an in-flight run.
    #[must_use]
    pub fn get(&self, run_id: Uuid) -> Option<RunTree> {
        self.runs.lock().get(&run_id).cloned()
    }

    /// Close a run successfully and remove it from the arena.
    pub fn end_run(&self, run_id: Uuid, outputs: &serde_json::Value) -> Option<RunTree> {
        let mut run = self.runs.lock().remove(&run_id)?;
        run.outputs = Some(outputs.clone());
        run.end_time = Some(Utc::now());
        Some(run)
    }

    /// Close a run with an error and remove it from the arena.
    pub fn error_run(&self, run_id: Uuid, error: &str) -> Option<RunTree> {
        let mut run = self.runs.lock().remove(&run_id)?;
        run.error = Some(error.to_string());
        run.end_time = Some(Utc::now());
        Some(run)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_run_type_names_round_trip() {
        for run_type in [
            RunType::Chain,
            RunType::Llm,
            RunType::Tool,
            RunType::Retriever,
            RunType::Prompt,
            RunType::Parser,
        ] {
            assert_eq!(RunType::from_name(run_type.as_str()), Some(run_type));
        }
        assert_eq!(RunType::from_name("unknown"), None);
    }

    #[test]
    fn test_tracker_assembles_parent_child_order() {
        let tracker = RunTracker::new();
        let root_id = Uuid::new_v4();
        let child_a = Uuid::new_v4();
        let child_b = Uuid::new_v4();

        tracker.start_run(
            RunType::Chain,
            "root",
            &json!(1),
            root_id,
            None,
            &[],
            &HashMap::new(),
        );
        tracker.start_run(
            RunType::Chain,
            "a",
            &json!(1),
            child_a,
            Some(root_id),
            &[],
            &HashMap::new(),
        );
        tracker.start_run(
            RunType::Chain,
            "b",
            &json!(2),
            child_b,
            Some(root_id),
            &[],
            &HashMap::new(),
        );

        let root = tracker.get(root_id).unwrap();
        assert_eq!(root.child_run_ids, vec![child_a, child_b]);
    }

    #[test]
    fn test_run_closed_exactly_once() {
        let tracker = RunTracker::new();
        let run_id = Uuid::new_v4();
        tracker.start_run(
            RunType::Tool,
            "t",
            &json!(null),
            run_id,
            None,
            &[],
            &HashMap::new(),
        );

        let closed = tracker.end_run(run_id, &json!("done")).unwrap();
        assert!(closed.end_time.is_some());
        assert_eq!(closed.outputs, Some(json!("done")));
        // Second close finds nothing: the run left the arena.
        assert!(tracker.end_run(run_id, &json!("again")).is_none());
        assert!(tracker.error_run(run_id, "late").is_none());
    }
}
