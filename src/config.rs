//! Runtime configuration for runnable execution
//!
//! [`RunnableConfig`] is the cross-cutting parameter bag that flows alongside
//! every call: trace handlers, tags, metadata, run identity, and the recursion
//! and concurrency budgets. Configs are value types: a fresh one is produced
//! per top-level call and derived (never mutated in place) for every nested
//! call via [`RunnableConfig::child`].

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::callbacks::{CallbackHandler, CallbackManager};
use crate::error::{Error, Result};

/// Default recursion budget for nested runnable dispatch.
pub const DEFAULT_RECURSION_LIMIT: usize = 25;

/// Configuration for a single runnable call.
///
/// # Merging
///
/// [`merge`](RunnableConfig::merge) combines a base config with overrides:
/// tags concatenate (append-only across composition boundaries), metadata and
/// the configurable map shallow-merge with the override winning per key,
/// callback handler lists concatenate, and the recursion/concurrency budgets
/// take the more restrictive of the two when both are present.
///
/// # Example
///
/// ```rust,ignore
/// use runnel::config::RunnableConfig;
///
/// let config = RunnableConfig::default()
///     .with_tags(["experiment-7"])
///     .with_max_concurrency(4);
/// let result = chain.invoke(input, Some(config)).await?;
/// ```
#[derive(Clone, Default)]
pub struct RunnableConfig {
    /// Trace handlers notified of run start/stream/end/error.
    pub callbacks: Vec<Arc<dyn CallbackHandler>>,
    /// Ordered tags, appended to (never replaced) at composition boundaries.
    pub tags: Vec<String>,
    /// Metadata attached to every run opened under this config.
    pub metadata: HashMap<String, serde_json::Value>,
    /// Display name override for the next run opened with this config.
    pub run_name: Option<String>,
    /// Run identifier for the next run. Consumed at most once per call.
    pub run_id: Option<Uuid>,
    /// Remaining nested-dispatch budget. `None` means the default budget.
    pub recursion_limit: Option<usize>,
    /// Cap on concurrent branch executions in `batch`/parallel fan-out.
    pub max_concurrency: Option<usize>,
    /// Opaque key/value passthrough for caller-defined parameters.
    pub configurable: HashMap<String, serde_json::Value>,
    /// Cancellation signal raced against the in-flight call.
    pub cancellation: Option<CancellationToken>,
    /// Identifier of the run this call is nested under, if any.
    ///
    /// Set by combinators when deriving child configs; callers normally leave
    /// it empty.
    pub parent_run_id: Option<Uuid>,
}

impl RunnableConfig {
    /// Append tags to the config.
    #[must_use]
    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    /// Insert a metadata entry.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Set the display name for the next run.
    #[must_use]
    pub fn with_run_name(mut self, name: impl Into<String>) -> Self {
        self.run_name = Some(name.into());
        self
    }

    /// Set the run identifier for the next run.
    #[must_use]
    pub fn with_run_id(mut self, run_id: Uuid) -> Self {
        self.run_id = Some(run_id);
        self
    }

    /// Set the recursion budget.
    #[must_use]
    pub fn with_recursion_limit(mut self, limit: usize) -> Self {
        self.recursion_limit = Some(limit);
        self
    }

    /// Set the fan-out concurrency cap.
    #[must_use]
    pub fn with_max_concurrency(mut self, limit: usize) -> Self {
        self.max_concurrency = Some(limit);
        self
    }

    /// Register a trace handler.
    #[must_use]
    pub fn with_callback(mut self, handler: Arc<dyn CallbackHandler>) -> Self {
        self.callbacks.push(handler);
        self
    }

    /// Insert a configurable passthrough entry.
    #[must_use]
    pub fn with_configurable(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.configurable.insert(key.into(), value);
        self
    }

    /// Attach a cancellation token raced against the call.
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    /// Merge `overrides` onto this config, returning the combined config.
    #[must_use]
    pub fn merge(mut self, overrides: RunnableConfig) -> RunnableConfig {
        self.callbacks.extend(overrides.callbacks);
        self.tags.extend(overrides.tags);
        self.metadata.extend(overrides.metadata);
        self.configurable.extend(overrides.configurable);
        if overrides.run_name.is_some() {
            self.run_name = overrides.run_name;
        }
        if overrides.run_id.is_some() {
            self.run_id = overrides.run_id;
        }
        self.recursion_limit = match (self.recursion_limit, overrides.recursion_limit) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => b.or(a),
        };
        self.max_concurrency = match (self.max_concurrency, overrides.max_concurrency) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => b.or(a),
        };
        if overrides.cancellation.is_some() {
            self.cancellation = overrides.cancellation;
        }
        if overrides.parent_run_id.is_some() {
            self.parent_run_id = overrides.parent_run_id;
        }
        self
    }

    /// Take the configured run id or generate a fresh one.
    ///
    /// The configured id is consumed so that nested calls sharing this config
    /// cannot accidentally reuse it.
    pub fn ensure_run_id(&mut self) -> Uuid {
        match self.run_id.take() {
            Some(id) => id,
            None => Uuid::new_v4(),
        }
    }

    /// Take the run name override, if any.
    pub fn take_run_name(&mut self) -> Option<String> {
        self.run_name.take()
    }

    /// Build the callback manager for a run opened with this config.
    #[must_use]
    pub fn get_callback_manager(&self) -> CallbackManager {
        CallbackManager::with_handlers(self.callbacks.clone()).with_parent(self.parent_run_id)
    }

    /// Derive the config for a call nested under `parent_run_id`.
    ///
    /// Decrements the recursion budget; exhausting the budget is a fatal
    /// control error, distinct from cancellation.
    pub fn child(&self, parent_run_id: Uuid) -> Result<RunnableConfig> {
        let remaining = self.recursion_limit.unwrap_or(DEFAULT_RECURSION_LIMIT);
        if remaining == 0 {
            return Err(Error::RecursionLimit);
        }
        let mut child = self.clone();
        child.run_id = None;
        child.run_name = None;
        child.parent_run_id = Some(parent_run_id);
        child.recursion_limit = Some(remaining - 1);
        Ok(child)
    }

    /// Derive a child config with one extra tag (e.g. `seq:step:2`).
    pub fn child_with_tag(&self, parent_run_id: Uuid, tag: impl Into<String>) -> Result<RunnableConfig> {
        let mut child = self.child(parent_run_id)?;
        child.tags.push(tag.into());
        Ok(child)
    }

    /// Race `fut` against this config's cancellation token, if any.
    ///
    /// On cancellation the call resolves to [`Error::Cancelled`]; retry and
    /// fallback policies treat that as non-retryable.
    pub async fn cancellable<T>(&self, fut: impl Future<Output = Result<T>> + Send) -> Result<T> {
        match &self.cancellation {
            Some(token) => {
                tokio::select! {
                    biased;
                    () = token.cancelled() => Err(Error::Cancelled),
                    res = fut => res,
                }
            }
            None => fut.await,
        }
    }
}

impl std::fmt::Debug for RunnableConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunnableConfig")
            .field("callbacks", &self.callbacks.len())
            .field("tags", &self.tags)
            .field("metadata", &self.metadata)
            .field("run_name", &self.run_name)
            .field("run_id", &self.run_id)
            .field("recursion_limit", &self.recursion_limit)
            .field("max_concurrency", &self.max_concurrency)
            .field("parent_run_id", &self.parent_run_id)
            .finish_non_exhaustive()
    }
}
