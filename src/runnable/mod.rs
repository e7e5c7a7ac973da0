//! Core trait for composable units of deferred work
//!
//! The [`Runnable`] trait is the foundation of runnel. A runnable maps one
//! input to one output and can be called three ways: single-shot
//! ([`invoke`](Runnable::invoke)), batched ([`batch`](Runnable::batch)), and
//! incrementally streamed ([`stream`](Runnable::stream) /
//! [`transform`](Runnable::transform)). Combinators compose runnables into
//! pipelines:
//!
//! - [`RunnableSequence`] - sequential composition (via [`pipe`](Runnable::pipe))
//! - [`RunnableParallel`] - named fan-out/fan-in over a shared input
//! - [`RunnableBinding`] - config binding (via [`with_config`](Runnable::with_config))
//! - [`RunnableRetry`] - retry with backoff (via [`with_retry`](Runnable::with_retry))
//! - [`RunnableWithFallbacks`] - fallback chain (via [`with_fallbacks`](Runnable::with_fallbacks))
//! - [`RunnableEach`] - per-item mapping over list inputs (via [`map`](Runnable::map))
//! - [`RunnableLambda`] / [`RunnableTryLambda`] - closures as leaf runnables
//!
//! Every call opens exactly one run, reports it to the trace handlers on its
//! config, and closes it with the output or the first error. Errors propagate
//! unchanged so outer combinators can apply their own retry/fallback policy.
//!
//! # Example
//!
//! ```rust,ignore
//! use runnel::runnable::{Runnable, RunnableLambda};
//!
//! let double = RunnableLambda::new(|x: i32| x * 2);
//! let inc = RunnableLambda::new(|x: i32| x + 1);
//! let chain = double.pipe(inc);
//! assert_eq!(chain.invoke(3, None).await?, 7);
//! assert_eq!(chain.batch(vec![1, 2, 3], None).await?, vec![3, 5, 7]);
//! ```

pub mod binding;
pub mod each;
pub mod fallbacks;
pub mod lambda;
pub mod parallel;
pub mod passthrough;
pub mod retry;
pub mod sequence;
pub mod stream_events;

pub use binding::{ConfigFactory, RunListeners, RunnableBinding};
pub use each::RunnableEach;
pub use fallbacks::RunnableWithFallbacks;
pub use lambda::{RunnableLambda, RunnableTryLambda};
pub use parallel::RunnableParallel;
pub use passthrough::RunnablePassthrough;
pub use retry::{RetryPolicy, RunnableRetry};
pub use sequence::RunnableSequence;
pub use stream_events::{StreamEvent, StreamEventData, StreamEventsOptions, StreamEventsVersion};

use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::any::Any;
use std::sync::Arc;
use uuid::Uuid;

use crate::callbacks::CallbackManager;
use crate::config::RunnableConfig;
use crate::error::{Error, Result};
use crate::stream::{ChunkConcat, OutputStream};
use crate::tracers::log_stream::RunLogPatch;
use crate::tracers::RunType;

/// Shared handle to a runnable with fixed input/output types.
pub type DynRunnable<I, O> = Arc<dyn Runnable<Input = I, Output = O>>;

/// Options controlling `batch_with_options`.
#[derive(Debug, Clone, Default)]
pub struct BatchOptions {
    /// Capture per-item work errors in-slot instead of failing the whole
    /// batch. Composition errors (e.g. a bad config-list length) still fail
    /// the call immediately.
    pub return_exceptions: bool,
}

/// A unit of deferred work: single input, single output, three calling
/// conventions, observable through the run-tracking callbacks.
#[async_trait]
pub trait Runnable: Send + Sync {
    /// Input type of this runnable.
    type Input: Send + Sync + 'static;
    /// Output type of this runnable.
    type Output: Send + Sync + 'static;

    /// Display name used for runs and trace events.
    fn name(&self) -> String {
        short_type_name::<Self>()
    }

    /// Run category reported to trace handlers.
    fn run_type(&self) -> RunType {
        RunType::Chain
    }

    /// Single-shot evaluation.
    ///
    /// Opens exactly one run; any error is reported to the run and then
    /// re-raised unchanged.
    async fn invoke(
        &self,
        input: Self::Input,
        config: Option<RunnableConfig>,
    ) -> Result<Self::Output>;

    /// Invoke each input independently with bounded concurrency, failing the
    /// whole batch on the first error (in input order).
    ///
    /// Result order always matches input order regardless of completion
    /// order.
    async fn batch(
        &self,
        inputs: Vec<Self::Input>,
        config: Option<RunnableConfig>,
    ) -> Result<Vec<Self::Output>> {
        let config = config.unwrap_or_default();
        let limit = effective_concurrency(&config, inputs.len());
        futures::stream::iter(inputs.into_iter().enumerate().map(|(pos, input)| {
            let mut item_config = config.clone();
            if pos > 0 {
                // Only the first item may consume a caller-provided run identity.
                item_config.run_id = None;
                item_config.run_name = None;
            }
            self.invoke(input, Some(item_config))
        }))
        .buffered(limit)
        .try_collect()
        .await
    }

    /// Batch with per-item configs and error capture.
    ///
    /// With `return_exceptions` set, a per-item work error is returned
    /// in-slot; otherwise the first error (in input order) is raised after
    /// all items settle. A config list of the wrong length is a composition
    /// error and fails immediately.
    async fn batch_with_options(
        &self,
        inputs: Vec<Self::Input>,
        configs: Option<Vec<RunnableConfig>>,
        options: &BatchOptions,
    ) -> Result<Vec<Result<Self::Output>>> {
        let configs = broadcast_configs(configs, inputs.len())?;
        let limit = match configs.first() {
            Some(first) => effective_concurrency(first, inputs.len()),
            None => 1,
        };
        let results: Vec<Result<Self::Output>> = futures::stream::iter(
            inputs
                .into_iter()
                .zip(configs)
                .map(|(input, cfg)| self.invoke(input, Some(cfg))),
        )
        .buffered(limit)
        .collect()
        .await;

        if !options.return_exceptions {
            let mut settled = Vec::with_capacity(results.len());
            for result in results {
                settled.push(Ok(result?));
            }
            return Ok(settled);
        }
        Ok(results)
    }

    /// Lazy streamed evaluation.
    ///
    /// The default performs one `invoke` and yields the result as a single
    /// chunk. Implementations must surface setup errors from this call
    /// itself, not from the first chunk pull.
    async fn stream(
        &self,
        input: Self::Input,
        config: Option<RunnableConfig>,
    ) -> Result<OutputStream<Self::Output>> {
        let output = self.invoke(input, config).await?;
        Ok(Box::pin(futures::stream::once(async move { Ok(output) })))
    }

    /// Map an input chunk stream to an output chunk stream.
    ///
    /// The default buffers the whole input (concatenating chunks where the
    /// type supports it, otherwise keeping the latest chunk) and delegates to
    /// [`stream`](Runnable::stream).
    async fn transform(
        &self,
        input: OutputStream<Self::Input>,
        config: Option<RunnableConfig>,
    ) -> Result<OutputStream<Self::Output>>
    where
        Self::Input: ChunkConcat,
    {
        let mut input = input;
        let mut running: Option<Self::Input> = None;
        while let Some(chunk) = input.next().await {
            let chunk = chunk?;
            running = Some(match running {
                None => chunk,
                Some(acc) => acc.concat(&chunk).unwrap_or(chunk),
            });
        }
        let final_input = running.ok_or_else(|| {
            Error::InvalidInput("transform received an empty input stream".into())
        })?;
        self.stream(final_input, config).await
    }

    /// Chain this runnable into `next`, returning a flat sequence.
    ///
    /// Piping onto or into an existing sequence merges step lists instead of
    /// nesting, so composition is associative.
    fn pipe<R>(self, next: R) -> RunnableSequence<Self::Input, R::Output>
    where
        Self: Sized + 'static,
        Self::Input: Serialize + DeserializeOwned + ChunkConcat + Clone,
        Self::Output: Serialize + DeserializeOwned + ChunkConcat + Clone,
        R: Runnable<Input = Self::Output> + 'static,
        R::Output: Serialize + DeserializeOwned + ChunkConcat + Clone,
    {
        let mut steps = into_steps(self);
        steps.extend(into_steps(next));
        RunnableSequence::from_steps(steps)
    }

    /// Bind a config delta applied to every call.
    fn with_config(self, config: RunnableConfig) -> RunnableBinding<Self>
    where
        Self: Sized + 'static,
    {
        RunnableBinding::new(self).with_config(config)
    }

    /// Wrap with a retry policy.
    fn with_retry(self, policy: RetryPolicy) -> RunnableRetry<Self>
    where
        Self: Sized + 'static,
    {
        RunnableRetry::new(self, policy)
    }

    /// Wrap with an ordered fallback chain.
    fn with_fallbacks(
        self,
        fallbacks: Vec<DynRunnable<Self::Input, Self::Output>>,
    ) -> RunnableWithFallbacks<Self>
    where
        Self: Sized + 'static,
    {
        RunnableWithFallbacks::new(self, fallbacks)
    }

    /// Attach lifecycle listeners, invoked with the finished run snapshots.
    fn with_listeners(self, listeners: RunListeners) -> RunnableBinding<Self>
    where
        Self: Sized + 'static,
    {
        RunnableBinding::new(self).with_listeners(listeners)
    }

    /// Promote batching to the primary calling convention: the returned
    /// runnable takes a list of inputs and dispatches one inner batch.
    fn map(self) -> RunnableEach<Self>
    where
        Self: Sized + 'static,
    {
        RunnableEach::new(self)
    }

    /// Stream the v1 patch-log protocol for one execution.
    ///
    /// Yields [`RunLogPatch`]es that fold into a
    /// [`RunLog`](crate::tracers::log_stream::RunLog) mirroring the run tree;
    /// see [`crate::tracers::log_stream`].
    async fn stream_log(
        &self,
        input: Self::Input,
        config: Option<RunnableConfig>,
        options: StreamEventsOptions,
    ) -> Result<OutputStream<RunLogPatch>>
    where
        Self: Clone + Sized + 'static,
        Self::Input: Serialize,
        Self::Output: Serialize,
    {
        crate::tracers::log_stream::stream_log(self.clone(), input, config, options).await
    }

    /// Stream observability events for one execution.
    ///
    /// `options.version` selects the v1 (patch-log derived) or v2 (flat
    /// event) projection; both report the same logical run tree.
    async fn stream_events(
        &self,
        input: Self::Input,
        config: Option<RunnableConfig>,
        options: StreamEventsOptions,
    ) -> Result<OutputStream<StreamEvent>>
    where
        Self: Clone + Sized + 'static,
        Self::Input: Serialize,
        Self::Output: Serialize,
    {
        match options.version {
            StreamEventsVersion::V1 => {
                crate::tracers::log_stream::stream_events_v1(self.clone(), input, config, options)
                    .await
            }
            StreamEventsVersion::V2 => {
                crate::tracers::event_stream::stream_events_v2(self.clone(), input, config, options)
                    .await
            }
        }
    }
}

/// Object-safe, JSON-valued view of a runnable, used as the step type inside
/// sequences and parallel maps.
///
/// Coercion happens once at composition-build time (`pipe`, parallel
/// constructors); per-call dispatch never re-inspects what a step is.
#[async_trait]
pub trait ErasedRunnable: Send + Sync {
    /// Display name of the underlying runnable.
    fn name(&self) -> String;

    /// Run category of the underlying runnable.
    fn run_type(&self) -> RunType;

    /// `invoke` through the JSON boundary.
    async fn invoke_erased(
        &self,
        input: serde_json::Value,
        config: Option<RunnableConfig>,
    ) -> Result<serde_json::Value>;

    /// `batch` through the JSON boundary.
    async fn batch_erased(
        &self,
        inputs: Vec<serde_json::Value>,
        config: Option<RunnableConfig>,
    ) -> Result<Vec<serde_json::Value>>;

    /// `transform` through the JSON boundary.
    async fn transform_erased(
        &self,
        input: OutputStream<serde_json::Value>,
        config: Option<RunnableConfig>,
    ) -> Result<OutputStream<serde_json::Value>>;
}

#[async_trait]
impl<R> ErasedRunnable for R
where
    R: Runnable + 'static,
    R::Input: Serialize + DeserializeOwned + ChunkConcat + Clone,
    R::Output: Serialize + DeserializeOwned + Clone,
{
    fn name(&self) -> String {
        Runnable::name(self)
    }

    fn run_type(&self) -> RunType {
        Runnable::run_type(self)
    }

    async fn invoke_erased(
        &self,
        input: serde_json::Value,
        config: Option<RunnableConfig>,
    ) -> Result<serde_json::Value> {
        let input: R::Input = serde_json::from_value(input)?;
        let output = self.invoke(input, config).await?;
        Ok(serde_json::to_value(output)?)
    }

    async fn batch_erased(
        &self,
        inputs: Vec<serde_json::Value>,
        config: Option<RunnableConfig>,
    ) -> Result<Vec<serde_json::Value>> {
        let inputs: Vec<R::Input> = inputs
            .into_iter()
            .map(|v| serde_json::from_value(v).map_err(Error::from))
            .collect::<Result<_>>()?;
        let outputs = self.batch(inputs, config).await?;
        outputs
            .into_iter()
            .map(|o| serde_json::to_value(o).map_err(Error::from))
            .collect()
    }

    async fn transform_erased(
        &self,
        input: OutputStream<serde_json::Value>,
        config: Option<RunnableConfig>,
    ) -> Result<OutputStream<serde_json::Value>> {
        let typed: OutputStream<R::Input> = Box::pin(
            input.map(|item| item.and_then(|v| serde_json::from_value(v).map_err(Error::from))),
        );
        let output = self.transform(typed, config).await?;
        Ok(Box::pin(output.map(|item| {
            item.and_then(|o| serde_json::to_value(o).map_err(Error::from))
        })))
    }
}

/// Resolve a runnable into its flat step list.
///
/// A sequence contributes its own steps (so piping sequences together merges
/// rather than nests); anything else contributes itself as one step.
pub(crate) fn into_steps<R>(runnable: R) -> Vec<Arc<dyn ErasedRunnable>>
where
    R: Runnable + 'static,
    R::Input: Serialize + DeserializeOwned + ChunkConcat + Clone,
    R::Output: Serialize + DeserializeOwned + ChunkConcat + Clone,
{
    let boxed: Box<dyn Any> = Box::new(runnable);
    match boxed.downcast::<RunnableSequence<R::Input, R::Output>>() {
        Ok(sequence) => sequence.into_step_list(),
        Err(boxed) => {
            let runnable = *boxed
                .downcast::<R>()
                .unwrap_or_else(|_| unreachable!("downcast back to the original type"));
            vec![Arc::new(runnable)]
        }
    }
}

/// Short display name for a type: `RunnableLambda<..>` -> `RunnableLambda`.
pub(crate) fn short_type_name<T: ?Sized>() -> String {
    let full = std::any::type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base).to_string()
}

/// Effective fan-out bound for `n` items under `config`.
fn effective_concurrency(config: &RunnableConfig, n: usize) -> usize {
    config.max_concurrency.unwrap_or(n).clamp(1, n.max(1))
}

/// Validate and broadcast a per-item config list.
fn broadcast_configs(
    configs: Option<Vec<RunnableConfig>>,
    n: usize,
) -> Result<Vec<RunnableConfig>> {
    match configs {
        Some(configs) if configs.len() != n => Err(Error::InvalidInput(format!(
            "config list length {} does not match input length {n}",
            configs.len()
        ))),
        Some(configs) => Ok(configs),
        None => Ok(vec![RunnableConfig::default(); n]),
    }
}

/// Bookkeeping for one opened run: consume the config's run identity, build
/// the scoped callback manager, and report the start notification.
pub(crate) async fn open_run(
    run_type: RunType,
    default_name: &str,
    config: Option<RunnableConfig>,
    input_snapshot: serde_json::Value,
) -> Result<(RunnableConfig, Uuid, CallbackManager)> {
    let mut config = config.unwrap_or_default();
    let run_id = config.ensure_run_id();
    let name = config.take_run_name().unwrap_or_else(|| default_name.to_string());
    let callback_manager = config.get_callback_manager();
    callback_manager
        .on_run_start(
            run_type,
            &name,
            &input_snapshot,
            run_id,
            &config.tags,
            &config.metadata,
        )
        .await?;
    Ok((config, run_id, callback_manager))
}

/// Close a run with the outcome of its work, preserving the work's error over
/// any callback failure.
pub(crate) async fn close_run<T: Serialize>(
    callback_manager: &CallbackManager,
    run_id: Uuid,
    result: Result<T>,
) -> Result<T> {
    match result {
        Ok(output) => {
            let snapshot = serde_json::to_value(&output).unwrap_or(serde_json::Value::Null);
            callback_manager.on_run_end(&snapshot, run_id).await?;
            Ok(output)
        }
        Err(e) => {
            callback_manager.on_run_error(&e.to_string(), run_id).await;
            Err(e)
        }
    }
}
