//! A tracer that collects all finished runs in a list.
//!
//! Useful for inspection and tests that assert on run-tree shape.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::callbacks::CallbackHandler;
use crate::error::Result;
use crate::tracers::base::{RunTracker, RunTree, RunType};

/// Tracer that collects every finished run, in close order.
#[derive(Debug, Clone, Default)]
pub struct RunCollectorCallbackHandler {
    tracker: Arc<RunTracker>,
    collected: Arc<Mutex<Vec<RunTree>>>,
}

impl RunCollectorCallbackHandler {
    /// Create a new collector.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All finished runs collected so far.
    #[must_use]
    pub fn traced_runs(&self) -> Vec<RunTree> {
        self.collected.lock().clone()
    }

    /// Find a finished run by display name.
    #[must_use]
    pub fn find_run(&self, name: &str) -> Option<RunTree> {
        self.collected.lock().iter().find(|r| r.name == name).cloned()
    }

    /// Clear all collected runs.
    pub fn clear(&self) {
        self.collected.lock().clear();
    }

    /// Number of collected runs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.collected.lock().len()
    }

    /// Whether no runs have finished yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.collected.lock().is_empty()
    }
}

#[async_trait]
impl CallbackHandler for RunCollectorCallbackHandler {
    async fn on_run_start(
        &self,
        run_type: RunType,
        name: &str,
        inputs: &serde_json::Value,
        run_id: Uuid,
        parent_run_id: Option<Uuid>,
        tags: &[String],
        metadata: &HashMap<String, serde_json::Value>,
    ) -> Result<()> {
        self.tracker
            .start_run(run_type, name, inputs, run_id, parent_run_id, tags, metadata);
        Ok(())
    }

    async fn on_run_end(
        &self,
        outputs: &serde_json::Value,
        run_id: Uuid,
        _parent_run_id: Option<Uuid>,
    ) -> Result<()> {
        if let Some(run) = self.tracker.end_run(run_id, outputs) {
            self.collected.lock().push(run);
        }
        Ok(())
    }

    async fn on_run_error(
        &self,
        error: &str,
        run_id: Uuid,
        _parent_run_id: Option<Uuid>,
    ) -> Result<()> {
        if let Some(run) = self.tracker.error_run(run_id, error) {
            self.collected.lock().push(run);
        }
        Ok(())
    }
}
