//! Event-stream types shared by both observability protocols
//!
//! [`stream_events`](crate::runnable::Runnable::stream_events) projects one
//! execution's run tree into a flat event stream. Two wire protocols exist:
//! v1 derives events from the patch-log (see
//! [`crate::tracers::log_stream`]), v2 re-emits trace callbacks directly
//! (see [`crate::tracers::event_stream`]). Both yield [`StreamEvent`]s and
//! honor the same [`StreamEventsOptions`] filters.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::tracers::RunType;

/// Protocol version for `stream_events`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StreamEventsVersion {
    /// Patch-log derived events.
    V1,
    /// Flat events emitted as runs execute.
    #[default]
    V2,
}

/// Payload of a [`StreamEvent`].
///
/// Which fields are present depends on the phase: start events may carry
/// `input`, stream events carry exactly one `chunk`, end events carry
/// `output`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamEventData {
    /// Input snapshot, on start events.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input: Option<serde_json::Value>,

    /// Output snapshot, on end events.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,

    /// One streamed chunk, on stream events.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunk: Option<serde_json::Value>,
}

/// One observability event for a run phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEvent {
    /// Event name, `on_<run type>_<phase>` (e.g. `on_chain_start`,
    /// `on_chain_stream`, `on_chain_end`).
    pub event: String,

    /// Display name of the component the run belongs to.
    pub name: String,

    /// Identifier of the run this event describes.
    pub run_id: Uuid,

    /// Tags of the run.
    pub tags: Vec<String>,

    /// Metadata of the run.
    pub metadata: HashMap<String, serde_json::Value>,

    /// Phase payload.
    pub data: StreamEventData,
}

impl StreamEvent {
    /// Build the event name for a run type and phase.
    #[must_use]
    pub fn event_name(run_type: RunType, phase: &str) -> String {
        format!("on_{}_{phase}", run_type.as_str())
    }
}

/// Filters and protocol selection for `stream_events` / `stream_log`.
///
/// Include filters admit a run when ANY include list matches (all empty
/// lists admit everything); exclude filters then drop it on any match.
/// Filters apply to every run, the root included.
#[derive(Debug, Clone, Default)]
pub struct StreamEventsOptions {
    /// Protocol version.
    pub version: StreamEventsVersion,
    /// Admit runs with one of these display names.
    pub include_names: Vec<String>,
    /// Admit runs with one of these run types.
    pub include_types: Vec<RunType>,
    /// Admit runs carrying one of these tags.
    pub include_tags: Vec<String>,
    /// Drop runs with one of these display names.
    pub exclude_names: Vec<String>,
    /// Drop runs with one of these run types.
    pub exclude_types: Vec<RunType>,
    /// Drop runs carrying one of these tags.
    pub exclude_tags: Vec<String>,
}

impl StreamEventsOptions {
    /// Default options: v2, no filters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Select the v1 protocol.
    #[must_use]
    pub fn v1() -> Self {
        Self {
            version: StreamEventsVersion::V1,
            ..Self::default()
        }
    }

    /// Set the include-names filter.
    #[must_use]
    pub fn with_include_names(mut self, names: Vec<String>) -> Self {
        self.include_names = names;
        self
    }

    /// Set the include-types filter.
    #[must_use]
    pub fn with_include_types(mut self, types: Vec<RunType>) -> Self {
        self.include_types = types;
        self
    }

    /// Set the include-tags filter.
    #[must_use]
    pub fn with_include_tags(mut self, tags: Vec<String>) -> Self {
        self.include_tags = tags;
        self
    }

    /// Set the exclude-names filter.
    #[must_use]
    pub fn with_exclude_names(mut self, names: Vec<String>) -> Self {
        self.exclude_names = names;
        self
    }

    /// Set the exclude-types filter.
    #[must_use]
    pub fn with_exclude_types(mut self, types: Vec<RunType>) -> Self {
        self.exclude_types = types;
        self
    }

    /// Set the exclude-tags filter.
    #[must_use]
    pub fn with_exclude_tags(mut self, tags: Vec<String>) -> Self {
        self.exclude_tags = tags;
        self
    }

    /// Whether a run with the given identity passes the filters.
    #[must_use]
    pub fn admits(&self, name: &str, run_type: RunType, tags: &[String]) -> bool {
        let mut included = self.include_names.is_empty()
            && self.include_types.is_empty()
            && self.include_tags.is_empty();
        included |= self.include_names.iter().any(|n| n == name);
        included |= self.include_types.contains(&run_type);
        included |= self.include_tags.iter().any(|t| tags.contains(t));
        if !included {
            return false;
        }
        if self.exclude_names.iter().any(|n| n == name) {
            return false;
        }
        if self.exclude_types.contains(&run_type) {
            return false;
        }
        if self.exclude_tags.iter().any(|t| tags.contains(t)) {
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_name_derives_from_run_type() {
        assert_eq!(StreamEvent::event_name(RunType::Chain, "start"), "on_chain_start");
        assert_eq!(StreamEvent::event_name(RunType::Llm, "stream"), "on_llm_stream");
        assert_eq!(StreamEvent::event_name(RunType::Tool, "end"), "on_tool_end");
    }

    #[test]
    fn test_no_filters_admit_everything() {
        let options = StreamEventsOptions::new();
        assert!(options.admits("anything", RunType::Chain, &[]));
    }

    #[test]
    fn test_include_filters_union() {
        let options = StreamEventsOptions::new()
            .with_include_names(vec!["step".into()])
            .with_include_tags(vec!["keep".into()]);
        assert!(options.admits("step", RunType::Chain, &[]));
        assert!(options.admits("other", RunType::Chain, &["keep".into()]));
        assert!(!options.admits("other", RunType::Chain, &[]));
    }

    #[test]
    fn test_exclude_wins_over_include() {
        let options = StreamEventsOptions::new()
            .with_include_types(vec![RunType::Chain])
            .with_exclude_names(vec!["noisy".into()]);
        assert!(options.admits("quiet", RunType::Chain, &[]));
        assert!(!options.admits("noisy", RunType::Chain, &[]));
    }

    #[test]
    fn test_include_filters_bind_every_run() {
        let options = StreamEventsOptions::new().with_include_names(vec!["only-this".into()]);
        assert!(!options.admits("root", RunType::Chain, &[]));
        assert!(options.admits("only-this", RunType::Chain, &[]));
    }

    #[test]
    fn test_event_data_serializes_sparsely() {
        let data = StreamEventData {
            chunk: Some(serde_json::json!("he")),
            ..Default::default()
        };
        let value = serde_json::to_value(&data).unwrap();
        assert_eq!(value, serde_json::json!({"chunk": "he"}));
    }
}
