//! Config binding: pre-attached configuration and lifecycle listeners
//!
//! A binding is a transparent wrapper: it opens no run of its own. Per call
//! it merges its bound config delta under the caller's config (caller wins
//! per key, tags and callbacks concatenate), applies any config factories,
//! and delegates to the wrapped runnable. Chained `with_config` calls merge
//! into one delta instead of nesting wrappers.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::callbacks::CallbackHandler;
use crate::config::RunnableConfig;
use crate::error::Result;
use crate::runnable::{BatchOptions, Runnable};
use crate::stream::{ChunkConcat, OutputStream};
use crate::tracers::{RunTracker, RunTree, RunType};

/// Computes an extra config delta from the effective config of a call.
pub type ConfigFactory = Arc<dyn Fn(&RunnableConfig) -> RunnableConfig + Send + Sync>;

/// Hook invoked with a run snapshot.
pub type RunListener = Arc<dyn Fn(&RunTree) + Send + Sync>;

/// Lifecycle hooks for the runs a binding's calls open at its own scope.
#[derive(Clone, Default)]
pub struct RunListeners {
    /// Invoked when a run starts.
    pub on_start: Option<RunListener>,
    /// Invoked when a run ends successfully, with outputs filled in.
    pub on_end: Option<RunListener>,
    /// Invoked when a run fails, with the error filled in.
    pub on_error: Option<RunListener>,
}

impl RunListeners {
    /// Listeners with no hooks.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the start hook.
    #[must_use]
    pub fn on_start(mut self, hook: impl Fn(&RunTree) + Send + Sync + 'static) -> Self {
        self.on_start = Some(Arc::new(hook));
        self
    }

    /// Set the success hook.
    #[must_use]
    pub fn on_end(mut self, hook: impl Fn(&RunTree) + Send + Sync + 'static) -> Self {
        self.on_end = Some(Arc::new(hook));
        self
    }

    /// Set the failure hook.
    #[must_use]
    pub fn on_error(mut self, hook: impl Fn(&RunTree) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(hook));
        self
    }
}

impl std::fmt::Debug for RunListeners {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunListeners")
            .field("on_start", &self.on_start.is_some())
            .field("on_end", &self.on_end.is_some())
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}

/// Trace handler that fires listener hooks for runs opened at one nesting
/// scope (runs whose parent is the scope the binding was called under).
struct ListenerCallbackHandler {
    scope_parent: Option<Uuid>,
    tracker: RunTracker,
    listeners: RunListeners,
}

#[async_trait]
impl CallbackHandler for ListenerCallbackHandler {
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
        if parent_run_id != self.scope_parent {
            return Ok(());
        }
        let run = self
            .tracker
            .start_run(run_type, name, inputs, run_id, parent_run_id, tags, metadata);
        if let Some(hook) = &self.listeners.on_start {
            hook(&run);
        }
        Ok(())
    }

    async fn on_run_end(
        &self,
        outputs: &serde_json::Value,
        run_id: Uuid,
        _parent_run_id: Option<Uuid>,
    ) -> Result<()> {
        if let Some(run) = self.tracker.end_run(run_id, outputs) {
            if let Some(hook) = &self.listeners.on_end {
                hook(&run);
            }
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
            if let Some(hook) = &self.listeners.on_error {
                hook(&run);
            }
        }
        Ok(())
    }
}

/// A runnable with configuration bound ahead of time.
///
/// Built with [`Runnable::with_config`] / [`Runnable::with_listeners`].
pub struct RunnableBinding<R> {
    inner: Arc<R>,
    config: RunnableConfig,
    config_factories: Vec<ConfigFactory>,
    listeners: Option<RunListeners>,
}

impl<R> RunnableBinding<R> {
    /// Wrap a runnable with an empty config delta.
    pub fn new(inner: R) -> Self {
        Self {
            inner: Arc::new(inner),
            config: RunnableConfig::default(),
            config_factories: Vec::new(),
            listeners: None,
        }
    }

    /// Merge another config delta into the binding.
    ///
    /// Shadows [`Runnable::with_config`] so repeated binding flattens into
    /// one wrapper.
    #[must_use]
    pub fn with_config(mut self, config: RunnableConfig) -> Self {
        self.config = self.config.merge(config);
        self
    }

    /// Add a config factory evaluated against each call's effective config.
    #[must_use]
    pub fn with_config_factory(
        mut self,
        factory: impl Fn(&RunnableConfig) -> RunnableConfig + Send + Sync + 'static,
    ) -> Self {
        self.config_factories.push(Arc::new(factory));
        self
    }

    /// Attach lifecycle listeners.
    ///
    /// Shadows [`Runnable::with_listeners`]; later hooks replace earlier
    /// ones per phase.
    #[must_use]
    pub fn with_listeners(mut self, listeners: RunListeners) -> Self {
        self.listeners = Some(listeners);
        self
    }

    /// Effective config for one call: bound delta under caller overrides,
    /// then factories, then the listener handler.
    fn prepare(&self, config: Option<RunnableConfig>) -> RunnableConfig {
        let caller = config.unwrap_or_default();
        let mut merged = self.config.clone().merge(caller);
        for factory in &self.config_factories {
            let delta = factory(&merged);
            merged = merged.merge(delta);
        }
        if let Some(listeners) = &self.listeners {
            merged.callbacks.push(Arc::new(ListenerCallbackHandler {
                scope_parent: merged.parent_run_id,
                tracker: RunTracker::new(),
                listeners: listeners.clone(),
            }));
        }
        merged
    }
}

impl<R> Clone for RunnableBinding<R> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            config: self.config.clone(),
            config_factories: self.config_factories.clone(),
            listeners: self.listeners.clone(),
        }
    }
}

impl<R> std::fmt::Debug for RunnableBinding<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunnableBinding")
            .field("config", &self.config)
            .field("config_factories", &self.config_factories.len())
            .field("listeners", &self.listeners)
            .finish()
    }
}

#[async_trait]
impl<R> Runnable for RunnableBinding<R>
where
    R: Runnable + 'static,
{
    type Input = R::Input;
    type Output = R::Output;

    fn name(&self) -> String {
        self.inner.name()
    }

    fn run_type(&self) -> RunType {
        self.inner.run_type()
    }

    async fn invoke(&self, input: R::Input, config: Option<RunnableConfig>) -> Result<R::Output> {
        self.inner.invoke(input, Some(self.prepare(config))).await
    }

    async fn batch(
        &self,
        inputs: Vec<R::Input>,
        config: Option<RunnableConfig>,
    ) -> Result<Vec<R::Output>> {
        self.inner.batch(inputs, Some(self.prepare(config))).await
    }

    async fn batch_with_options(
        &self,
        inputs: Vec<R::Input>,
        configs: Option<Vec<RunnableConfig>>,
        options: &BatchOptions,
    ) -> Result<Vec<Result<R::Output>>> {
        let configs = match configs {
            Some(configs) => Some(configs.into_iter().map(|c| self.prepare(Some(c))).collect()),
            None => Some(vec![self.prepare(None); inputs.len()]),
        };
        self.inner.batch_with_options(inputs, configs, options).await
    }

    async fn stream(
        &self,
        input: R::Input,
        config: Option<RunnableConfig>,
    ) -> Result<OutputStream<R::Output>> {
        self.inner.stream(input, Some(self.prepare(config))).await
    }

    async fn transform(
        &self,
        input: OutputStream<R::Input>,
        config: Option<RunnableConfig>,
    ) -> Result<OutputStream<R::Output>>
    where
        R::Input: ChunkConcat,
    {
        self.inner.transform(input, Some(self.prepare(config))).await
    }
}

// Bindings are transparent for composition too.
impl<R, Next> std::ops::BitOr<Next> for RunnableBinding<R>
where
    R: Runnable + 'static,
    R::Input: Serialize + DeserializeOwned + ChunkConcat + Clone,
    R::Output: Serialize + DeserializeOwned + ChunkConcat + Clone,
    Next: Runnable<Input = R::Output> + 'static,
    Next::Output: Serialize + DeserializeOwned + ChunkConcat + Clone,
{
    type Output = crate::runnable::RunnableSequence<R::Input, Next::Output>;

    fn bitor(self, rhs: Next) -> Self::Output {
        self.pipe(rhs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runnable::lambda::{RunnableLambda, RunnableTryLambda};
    use crate::tracers::RunCollectorCallbackHandler;
    use parking_lot::Mutex;

    // ==================== Config Binding Tests ====================

    #[tokio::test]
    async fn test_bound_tags_apply_to_runs() {
        let collector = Arc::new(RunCollectorCallbackHandler::new());

        let double = RunnableLambda::new(|x: i32| x * 2)
            .with_name("double")
            .with_config(
                RunnableConfig::default()
                    .with_tags(["bound"])
                    .with_callback(collector.clone()),
            );
        double.invoke(2, None).await.unwrap();

        let run = collector.find_run("double").unwrap();
        assert!(run.tags.contains(&"bound".to_string()));
    }

    #[tokio::test]
    async fn test_caller_config_wins_over_bound() {
        let collector = Arc::new(RunCollectorCallbackHandler::new());

        let double = RunnableLambda::new(|x: i32| x * 2).with_config(
            RunnableConfig::default()
                .with_run_name("bound-name")
                .with_metadata("k", serde_json::json!("bound")),
        );
        let caller = RunnableConfig::default()
            .with_run_name("caller-name")
            .with_metadata("k", serde_json::json!("caller"))
            .with_callback(collector.clone());
        double.invoke(2, Some(caller)).await.unwrap();

        let run = collector.find_run("caller-name").unwrap();
        assert_eq!(run.metadata["k"], serde_json::json!("caller"));
    }

    #[tokio::test]
    async fn test_chained_with_config_flattens() {
        let bound = RunnableLambda::new(|x: i32| x + 1)
            .with_config(RunnableConfig::default().with_tags(["a"]))
            .with_config(RunnableConfig::default().with_tags(["b"]));
        // One wrapper, both tag deltas.
        assert_eq!(bound.config.tags, vec!["a", "b"]);
        assert_eq!(bound.invoke(1, None).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_config_factory_sees_effective_config() {
        let collector = Arc::new(RunCollectorCallbackHandler::new());

        let echo = RunnableLambda::new(|x: i32| x)
            .with_name("echo")
            .with_config(RunnableConfig::default().with_tags(["base"]))
            .with_config_factory(|effective| {
                let mut delta = RunnableConfig::default();
                if effective.tags.iter().any(|t| t == "base") {
                    delta = delta.with_tags(["derived"]);
                }
                delta
            });
        let caller = RunnableConfig::default().with_callback(collector.clone());
        echo.invoke(1, Some(caller)).await.unwrap();

        let run = collector.find_run("echo").unwrap();
        assert!(run.tags.contains(&"derived".to_string()));
    }

    // ==================== Listener Tests ====================

    #[tokio::test]
    async fn test_listeners_fire_with_run_snapshots() {
        let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let on_start = seen.clone();
        let on_end = seen.clone();

        let double = RunnableLambda::new(|x: i32| x * 2)
            .with_name("double")
            .with_listeners(
                RunListeners::new()
                    .on_start(move |run| on_start.lock().push(format!("start:{}", run.name)))
                    .on_end(move |run| {
                        on_end
                            .lock()
                            .push(format!("end:{:?}", run.outputs.as_ref().unwrap()))
                    }),
            );
        double.invoke(4, None).await.unwrap();

        assert_eq!(seen.lock().clone(), vec!["start:double", "end:Number(8)"]);
    }

    #[tokio::test]
    async fn test_error_listener_fires_on_failure() {
        let errors: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = errors.clone();

        let fail = RunnableTryLambda::new(|_: i32| -> Result<i32> {
            Err(crate::error::Error::work("kaboom"))
        })
        .with_listeners(
            RunListeners::new().on_error(move |run| {
                sink.lock().push(run.error.clone().unwrap_or_default());
            }),
        );
        fail.invoke(1, None).await.unwrap_err();

        assert_eq!(errors.lock().clone(), vec!["kaboom"]);
    }

    #[tokio::test]
    async fn test_listeners_ignore_nested_runs() {
        let names: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = names.clone();

        let chain = RunnableLambda::new(|x: i32| x * 2)
            .with_name("double")
            .pipe(RunnableLambda::new(|x: i32| x + 1).with_name("inc"))
            .with_name("chain")
            .with_listeners(
                RunListeners::new().on_start(move |run| sink.lock().push(run.name.clone())),
            );
        chain.invoke(1, None).await.unwrap();

        // Only the sequence's own run fires, not its steps.
        assert_eq!(names.lock().clone(), vec!["chain"]);
    }
}
