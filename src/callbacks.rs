//! Callback system for observability and debugging
//!
//! This module provides the trace-handler infrastructure for tracking
//! execution of runnel pipelines. Every run opened by a runnable reports its
//! lifecycle (start, streamed chunks, end or error) to the handlers registered
//! on its config, scoped to the parent run by a child [`CallbackManager`].
//!
//! # Overview
//!
//! - [`CallbackHandler`] - Trait for implementing custom trace handlers
//! - [`CallbackManager`] - Dispatches one run's notifications to all handlers
//! - [`TracingCallbackHandler`] - Forwards run lifecycle to `tracing`
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use runnel::callbacks::TracingCallbackHandler;
//! use runnel::config::RunnableConfig;
//!
//! let config = RunnableConfig::default()
//!     .with_callback(Arc::new(TracingCallbackHandler::new()));
//! let result = chain.invoke(input, Some(config)).await?;
//! ```

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::Result;
use crate::tracers::RunType;

/// Trace handler notified of run lifecycle events.
///
/// All methods default to no-ops so implementors only override the
/// notifications they care about. Handlers must tolerate concurrent dispatch:
/// independent branches of a parallel map report through the same handler
/// list.
#[async_trait]
pub trait CallbackHandler: Send + Sync {
    /// Whether dispatch errors from this handler abort the run.
    ///
    /// Defaults to false: failures are logged and the run continues, so that
    /// tracing stays best-effort and never masks the run's own error.
    fn raise_error(&self) -> bool {
        false
    }

    /// Whether this handler wants no notifications at all.
    fn ignore_runs(&self) -> bool {
        false
    }

    /// Called when a run starts.
    #[allow(clippy::too_many_arguments)]
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
        let _ = (run_type, name, inputs, run_id, parent_run_id, tags, metadata);
        Ok(())
    }

    /// Called once per chunk a run streams.
    async fn on_run_stream(
        &self,
        chunk: &serde_json::Value,
        run_id: Uuid,
        parent_run_id: Option<Uuid>,
    ) -> Result<()> {
        let _ = (chunk, run_id, parent_run_id);
        Ok(())
    }

    /// Called when a run ends successfully.
    async fn on_run_end(
        &self,
        outputs: &serde_json::Value,
        run_id: Uuid,
        parent_run_id: Option<Uuid>,
    ) -> Result<()> {
        let _ = (outputs, run_id, parent_run_id);
        Ok(())
    }

    /// Called when a run fails.
    async fn on_run_error(
        &self,
        error: &str,
        run_id: Uuid,
        parent_run_id: Option<Uuid>,
    ) -> Result<()> {
        let _ = (error, run_id, parent_run_id);
        Ok(())
    }

    /// Called before each re-attempt of a retried run.
    async fn on_retry(
        &self,
        attempt: usize,
        error: &str,
        run_id: Uuid,
        parent_run_id: Option<Uuid>,
    ) -> Result<()> {
        let _ = (attempt, error, run_id, parent_run_id);
        Ok(())
    }
}

/// Dispatches one run's notifications to an ordered list of handlers.
///
/// Cloning a manager is cheap: handlers are shared `Arc`s, not copied. A
/// [`child`](CallbackManager::child) manager carries the same handler list
/// scoped to a new parent run id; combinators only extend the list when a
/// lifecycle listener is explicitly attached.
#[derive(Clone, Default)]
pub struct CallbackManager {
    handlers: Vec<Arc<dyn CallbackHandler>>,
    parent_run_id: Option<Uuid>,
}

impl CallbackManager {
    /// Create a manager with no handlers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a manager with the given handlers.
    #[must_use]
    pub fn with_handlers(handlers: Vec<Arc<dyn CallbackHandler>>) -> Self {
        Self {
            handlers,
            parent_run_id: None,
        }
    }

    /// Scope this manager to a parent run.
    #[must_use]
    pub fn with_parent(mut self, parent_run_id: Option<Uuid>) -> Self {
        self.parent_run_id = parent_run_id;
        self
    }

    /// Derive a manager for runs nested under `run_id`.
    ///
    /// The handler list is shared with this manager, not copied.
    #[must_use]
    pub fn child(&self, run_id: Uuid) -> CallbackManager {
        CallbackManager {
            handlers: self.handlers.clone(),
            parent_run_id: Some(run_id),
        }
    }

    /// Add a handler to the manager.
    pub fn add_handler(&mut self, handler: Arc<dyn CallbackHandler>) {
        self.handlers.push(handler);
    }

    /// Number of registered handlers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Whether no handlers are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Dispatch a notification to every handler in registration order.
    ///
    /// A handler error propagates only if that handler has `raise_error()`
    /// set; otherwise it is logged and dispatch continues.
    async fn execute<'a, F, Fut>(&'a self, f: F) -> Result<()>
    where
        F: Fn(&'a dyn CallbackHandler) -> Fut,
        Fut: std::future::Future<Output = Result<()>> + 'a,
    {
        for handler in &self.handlers {
            if handler.ignore_runs() {
                continue;
            }
            if let Err(e) = f(handler.as_ref()).await {
                if handler.raise_error() {
                    return Err(e);
                }
                tracing::warn!(error = %e, "Callback error (ignored)");
            }
        }
        Ok(())
    }

    /// Report a run start.
    pub async fn on_run_start(
        &self,
        run_type: RunType,
        name: &str,
        inputs: &serde_json::Value,
        run_id: Uuid,
        tags: &[String],
        metadata: &HashMap<String, serde_json::Value>,
    ) -> Result<()> {
        self.execute(|handler| {
            handler.on_run_start(
                run_type,
                name,
                inputs,
                run_id,
                self.parent_run_id,
                tags,
                metadata,
            )
        })
        .await
    }

    /// Report one streamed chunk.
    pub async fn on_run_stream(&self, chunk: &serde_json::Value, run_id: Uuid) -> Result<()> {
        self.execute(|handler| handler.on_run_stream(chunk, run_id, self.parent_run_id))
            .await
    }

    /// Report a successful run end.
    pub async fn on_run_end(&self, outputs: &serde_json::Value, run_id: Uuid) -> Result<()> {
        self.execute(|handler| handler.on_run_end(outputs, run_id, self.parent_run_id))
            .await
    }

    /// Report a failed run.
    ///
    /// Handler failures here are always swallowed: the run's own error is
    /// already propagating and must not be masked.
    pub async fn on_run_error(&self, error: &str, run_id: Uuid) {
        let result = self
            .execute(|handler| handler.on_run_error(error, run_id, self.parent_run_id))
            .await;
        if let Err(e) = result {
            tracing::warn!(run_id = %run_id, error = %e, "Failed to dispatch on_run_error callback");
        }
    }

    /// Report an upcoming retry attempt.
    pub async fn on_retry(&self, attempt: usize, error: &str, run_id: Uuid) -> Result<()> {
        self.execute(|handler| handler.on_retry(attempt, error, run_id, self.parent_run_id))
            .await
    }
}

impl std::fmt::Debug for CallbackManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackManager")
            .field("handlers", &self.handlers.len())
            .field("parent_run_id", &self.parent_run_id)
            .finish()
    }
}

/// Handler that forwards run lifecycle to the `tracing` subscriber.
#[derive(Debug, Clone, Default)]
pub struct TracingCallbackHandler;

impl TracingCallbackHandler {
    /// Create a new tracing handler.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CallbackHandler for TracingCallbackHandler {
    async fn on_run_start(
        &self,
        run_type: RunType,
        name: &str,
        _inputs: &serde_json::Value,
        run_id: Uuid,
        parent_run_id: Option<Uuid>,
        tags: &[String],
        _metadata: &HashMap<String, serde_json::Value>,
    ) -> Result<()> {
        tracing::debug!(
            run_id = %run_id,
            parent_run_id = ?parent_run_id,
            run_type = ?run_type,
            name = %name,
            tags = ?tags,
            "run started"
        );
        Ok(())
    }

    async fn on_run_end(
        &self,
        _outputs: &serde_json::Value,
        run_id: Uuid,
        _parent_run_id: Option<Uuid>,
    ) -> Result<()> {
        tracing::debug!(run_id = %run_id, "run finished");
        Ok(())
    }

    async fn on_run_error(
        &self,
        error: &str,
        run_id: Uuid,
        _parent_run_id: Option<Uuid>,
    ) -> Result<()> {
        tracing::error!(run_id = %run_id, error = %error, "run failed");
        Ok(())
    }
}
