//! Sequential composition, built with `pipe` or the `|` operator
//!
//! A sequence holds a flat, ordered list of erased steps; piping sequences
//! together merges their step lists, so `a.pipe(b.pipe(c))` and
//! `a.pipe(b).pipe(c)` build the same three-step pipeline. The flat shape is
//! fixed when the sequence is built; per-call dispatch just walks the list.
//!
//! Streaming chains each step's `transform`, so chunks flow end to end when
//! every step is incremental; a step that only implements `invoke` acts as a
//! buffering barrier at its position.

use async_trait::async_trait;
use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;
use std::sync::Arc;
use uuid::Uuid;

use crate::callbacks::CallbackManager;
use crate::config::RunnableConfig;
use crate::error::{Error, Result};
use crate::runnable::{close_run, open_run, ErasedRunnable, Runnable};
use crate::stream::{buffer_first, trace_output_stream, ChunkConcat, OutputStream};

/// Sequential composition of runnables: the output of each step feeds the
/// next.
///
/// Build with [`Runnable::pipe`] or `|`; the type parameters are the input of
/// the first step and the output of the last.
pub struct RunnableSequence<I, O> {
    pub(crate) steps: Vec<Arc<dyn ErasedRunnable>>,
    name: String,
    _marker: PhantomData<fn(I) -> O>,
}

impl<I, O> RunnableSequence<I, O> {
    /// Build a sequence from an already-erased step list.
    pub(crate) fn from_steps(steps: Vec<Arc<dyn ErasedRunnable>>) -> Self {
        Self {
            steps,
            name: "RunnableSequence".to_string(),
            _marker: PhantomData,
        }
    }

    /// Surrender the step list for merging into a longer sequence.
    pub(crate) fn into_step_list(self) -> Vec<Arc<dyn ErasedRunnable>> {
        self.steps
    }

    /// Number of steps in the flat pipeline.
    #[must_use]
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Whether the sequence has no steps.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Display names of the steps, in pipeline order.
    #[must_use]
    pub fn step_names(&self) -> Vec<String> {
        self.steps.iter().map(|s| s.name()).collect()
    }

    /// Set the display name used for runs.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Tag attached to the child run of step `idx` (zero-based).
    fn step_tag(idx: usize) -> String {
        format!("seq:step:{}", idx + 1)
    }

    /// Chain every step's `transform` over `input`, lazily.
    ///
    /// Each link defers its setup until first poll, so no step runs before
    /// the consumer pulls.
    fn chain_transforms(
        &self,
        input: OutputStream<serde_json::Value>,
        config: &RunnableConfig,
        run_id: Uuid,
    ) -> Result<OutputStream<serde_json::Value>> {
        let mut value_stream = input;
        for (idx, step) in self.steps.iter().enumerate() {
            let child = config.child_with_tag(run_id, Self::step_tag(idx))?;
            let step = step.clone();
            let prev = value_stream;
            value_stream = Box::pin(async_stream::stream! {
                match step.transform_erased(prev, Some(child)).await {
                    Ok(mut out) => {
                        while let Some(item) = out.next().await {
                            yield item;
                        }
                    }
                    Err(e) => yield Err(e),
                }
            });
        }
        Ok(value_stream)
    }
}

impl<I, O> Clone for RunnableSequence<I, O> {
    fn clone(&self) -> Self {
        Self {
            steps: self.steps.clone(),
            name: self.name.clone(),
            _marker: PhantomData,
        }
    }
}

impl<I, O> std::fmt::Debug for RunnableSequence<I, O> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunnableSequence")
            .field("name", &self.name)
            .field("steps", &self.steps.iter().map(|s| s.name()).collect::<Vec<_>>())
            .finish()
    }
}

#[async_trait]
impl<I, O> Runnable for RunnableSequence<I, O>
where
    I: Serialize + DeserializeOwned + ChunkConcat + Clone + Send + Sync + 'static,
    O: Serialize + DeserializeOwned + ChunkConcat + Clone + Send + Sync + 'static,
{
    type Input = I;
    type Output = O;

    fn name(&self) -> String {
        self.name.clone()
    }

    async fn invoke(&self, input: I, config: Option<RunnableConfig>) -> Result<O> {
        let snapshot = serde_json::to_value(&input).unwrap_or(serde_json::Value::Null);
        let (config, run_id, callback_manager) =
            open_run(Runnable::run_type(self), &self.name, config, snapshot).await?;

        let result = async {
            let mut value = serde_json::to_value(input)?;
            for (idx, step) in self.steps.iter().enumerate() {
                let child = config.child_with_tag(run_id, Self::step_tag(idx))?;
                value = step.invoke_erased(value, Some(child)).await?;
            }
            Ok(serde_json::from_value(value)?)
        }
        .await;

        close_run(&callback_manager, run_id, result).await
    }

    /// Stage-wise batch: every input finishes step `k` before any input
    /// starts step `k + 1`. One run per input, in input order.
    async fn batch(&self, inputs: Vec<I>, config: Option<RunnableConfig>) -> Result<Vec<O>> {
        let base = config.unwrap_or_default();
        let n = inputs.len();
        let limit = base.max_concurrency.unwrap_or(n).clamp(1, n.max(1));

        struct ItemRun {
            config: RunnableConfig,
            run_id: Uuid,
            callback_manager: CallbackManager,
        }

        let mut items = Vec::with_capacity(n);
        let mut values = Vec::with_capacity(n);
        for (pos, input) in inputs.into_iter().enumerate() {
            let mut item_config = base.clone();
            if pos > 0 {
                // A caller-provided run identity names the first run only.
                item_config.run_id = None;
                item_config.run_name = None;
            }
            let snapshot = serde_json::to_value(&input).unwrap_or(serde_json::Value::Null);
            let (item_config, run_id, callback_manager) =
                open_run(Runnable::run_type(self), &self.name, Some(item_config), snapshot).await?;
            items.push(ItemRun {
                config: item_config,
                run_id,
                callback_manager,
            });
            values.push(serde_json::to_value(input)?);
        }

        let stage_result: Result<Vec<serde_json::Value>> = async {
            for (idx, step) in self.steps.iter().enumerate() {
                let mut calls = Vec::with_capacity(items.len());
                for (value, item) in values.drain(..).zip(items.iter()) {
                    let child = item.config.child_with_tag(item.run_id, Self::step_tag(idx))?;
                    let step = step.clone();
                    calls.push(async move { step.invoke_erased(value, Some(child)).await });
                }
                let stage: Vec<Result<serde_json::Value>> = futures::stream::iter(calls)
                    .buffered(limit)
                    .collect()
                    .await;
                for result in stage {
                    values.push(result?);
                }
            }
            Ok(values)
        }
        .await;

        match stage_result {
            Ok(values) => {
                let mut outputs = Vec::with_capacity(n);
                for (value, item) in values.into_iter().zip(&items) {
                    item.callback_manager.on_run_end(&value, item.run_id).await?;
                    outputs.push(serde_json::from_value(value)?);
                }
                Ok(outputs)
            }
            Err(e) => {
                let message = e.to_string();
                for item in &items {
                    item.callback_manager.on_run_error(&message, item.run_id).await;
                }
                Err(e)
            }
        }
    }

    async fn stream(
        &self,
        input: I,
        config: Option<RunnableConfig>,
    ) -> Result<OutputStream<O>> {
        let snapshot = serde_json::to_value(&input).unwrap_or(serde_json::Value::Null);
        let (config, run_id, callback_manager) =
            open_run(Runnable::run_type(self), &self.name, config, snapshot).await?;

        let setup = serde_json::to_value(input)
            .map_err(Error::from)
            .and_then(|value| {
                let source: OutputStream<serde_json::Value> =
                    Box::pin(futures::stream::once(async move { Ok(value) }));
                self.chain_transforms(source, &config, run_id)
            });
        let value_stream = match setup {
            Ok(stream) => stream,
            Err(e) => {
                callback_manager.on_run_error(&e.to_string(), run_id).await;
                return Err(e);
            }
        };

        let typed: OutputStream<O> = Box::pin(
            value_stream
                .map(|item| item.and_then(|v| serde_json::from_value(v).map_err(Error::from))),
        );
        buffer_first(trace_output_stream(typed, callback_manager, run_id)).await
    }

    async fn transform(
        &self,
        input: OutputStream<I>,
        config: Option<RunnableConfig>,
    ) -> Result<OutputStream<O>>
    where
        I: ChunkConcat,
    {
        let (config, run_id, callback_manager) =
            open_run(Runnable::run_type(self), &self.name, config, serde_json::Value::Null).await?;

        let source: OutputStream<serde_json::Value> = Box::pin(
            input.map(|item| item.and_then(|i| serde_json::to_value(i).map_err(Error::from))),
        );
        let value_stream = match self.chain_transforms(source, &config, run_id) {
            Ok(stream) => stream,
            Err(e) => {
                callback_manager.on_run_error(&e.to_string(), run_id).await;
                return Err(e);
            }
        };

        let typed: OutputStream<O> = Box::pin(
            value_stream
                .map(|item| item.and_then(|v| serde_json::from_value(v).map_err(Error::from))),
        );
        Ok(trace_output_stream(typed, callback_manager, run_id))
    }
}

impl<I, O, R> std::ops::BitOr<R> for RunnableSequence<I, O>
where
    I: Serialize + DeserializeOwned + ChunkConcat + Clone + Send + Sync + 'static,
    O: Serialize + DeserializeOwned + ChunkConcat + Clone + Send + Sync + 'static,
    R: Runnable<Input = O> + 'static,
    R::Output: Serialize + DeserializeOwned + ChunkConcat + Clone,
{
    type Output = RunnableSequence<I, R::Output>;

    fn bitor(self, rhs: R) -> Self::Output {
        self.pipe(rhs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runnable::lambda::{RunnableLambda, RunnableTryLambda};
    use crate::tracers::RunCollectorCallbackHandler;

    fn double() -> RunnableLambda<impl Fn(i32) -> i32 + Send + Sync, i32, i32> {
        RunnableLambda::new(|x: i32| x * 2).with_name("double")
    }

    fn inc() -> RunnableLambda<impl Fn(i32) -> i32 + Send + Sync, i32, i32> {
        RunnableLambda::new(|x: i32| x + 1).with_name("inc")
    }

    /// A step with real incremental streaming: splits its input string into
    /// per-character chunks and uppercases chunks in transform.
    #[derive(Clone)]
    struct Exploder;

    #[async_trait]
    impl Runnable for Exploder {
        type Input = String;
        type Output = String;

        fn name(&self) -> String {
            "exploder".to_string()
        }

        async fn invoke(&self, input: String, _config: Option<RunnableConfig>) -> Result<String> {
            Ok(input)
        }

        async fn stream(
            &self,
            input: String,
            _config: Option<RunnableConfig>,
        ) -> Result<OutputStream<String>> {
            let chunks: Vec<Result<String>> =
                input.chars().map(|c| Ok(c.to_string())).collect();
            Ok(Box::pin(futures::stream::iter(chunks)))
        }
    }

    #[derive(Clone)]
    struct Upper;

    #[async_trait]
    impl Runnable for Upper {
        type Input = String;
        type Output = String;

        fn name(&self) -> String {
            "upper".to_string()
        }

        async fn invoke(&self, input: String, _config: Option<RunnableConfig>) -> Result<String> {
            Ok(input.to_uppercase())
        }

        async fn transform(
            &self,
            input: OutputStream<String>,
            _config: Option<RunnableConfig>,
        ) -> Result<OutputStream<String>> {
            Ok(Box::pin(input.map(|item| item.map(|s| s.to_uppercase()))))
        }
    }

    // ==================== Invoke Tests ====================

    #[tokio::test]
    async fn test_pipe_threads_output_to_input() {
        let chain = double().pipe(inc());
        assert_eq!(chain.invoke(3, None).await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_step_error_propagates_unchanged() {
        let fail = RunnableTryLambda::new(|_: i32| -> Result<i32> {
            Err(Error::work("step two exploded"))
        });
        let chain = double().pipe(fail).pipe(inc());
        let err = chain.invoke(1, None).await.unwrap_err();
        assert_eq!(err.to_string(), "step two exploded");
    }

    // ==================== Flattening Tests ====================

    #[tokio::test]
    async fn test_pipe_is_associative() {
        let left = double().pipe(inc()).pipe(double());
        let right = double().pipe(inc().pipe(double()));
        assert_eq!(left.len(), 3);
        assert_eq!(right.len(), 3);
        assert_eq!(left.step_names(), right.step_names());
        assert_eq!(left.invoke(3, None).await.unwrap(), 14);
        assert_eq!(right.invoke(3, None).await.unwrap(), 14);
    }

    #[tokio::test]
    async fn test_piping_two_sequences_merges_step_lists() {
        let front = double().pipe(inc());
        let back = double().pipe(inc());
        let merged = front.pipe(back);
        assert_eq!(merged.len(), 4);
        // ((3 * 2) + 1) * 2 + 1
        assert_eq!(merged.invoke(3, None).await.unwrap(), 15);
    }

    // ==================== Batch Tests ====================

    #[tokio::test]
    async fn test_batch_in_input_order() {
        let chain = double().pipe(inc());
        let outputs = chain.batch(vec![1, 2, 3], None).await.unwrap();
        assert_eq!(outputs, vec![3, 5, 7]);
    }

    #[tokio::test]
    async fn test_batch_with_bounded_concurrency() {
        let chain = double().pipe(inc());
        let config = RunnableConfig::default().with_max_concurrency(1);
        let outputs = chain.batch(vec![4, 5], Some(config)).await.unwrap();
        assert_eq!(outputs, vec![9, 11]);
    }

    // ==================== Tracing Tests ====================

    #[tokio::test]
    async fn test_child_runs_carry_step_tags() {
        let collector = Arc::new(RunCollectorCallbackHandler::new());
        let config = RunnableConfig::default().with_callback(collector.clone());

        let chain = double().pipe(inc()).with_name("math");
        chain.invoke(3, Some(config)).await.unwrap();

        let parent = collector.find_run("math").unwrap();
        assert_eq!(parent.child_run_ids.len(), 2);
        let first = collector.find_run("double").unwrap();
        assert!(first.tags.contains(&"seq:step:1".to_string()));
        assert_eq!(first.parent_run_id, Some(parent.id));
        let second = collector.find_run("inc").unwrap();
        assert!(second.tags.contains(&"seq:step:2".to_string()));
    }

    #[tokio::test]
    async fn test_failed_sequence_closes_run_with_error() {
        let collector = Arc::new(RunCollectorCallbackHandler::new());
        let config = RunnableConfig::default().with_callback(collector.clone());

        let fail =
            RunnableTryLambda::new(|_: i32| -> Result<i32> { Err(Error::work("bad")) });
        let chain = double().pipe(fail).with_name("doomed");
        chain.invoke(1, Some(config)).await.unwrap_err();

        let run = collector.find_run("doomed").unwrap();
        assert_eq!(run.error.as_deref(), Some("bad"));
    }

    #[tokio::test]
    async fn test_recursion_budget_exhaustion_is_fatal() {
        let chain = double().pipe(inc());
        let config = RunnableConfig::default().with_recursion_limit(0);
        let err = chain.invoke(1, Some(config)).await.unwrap_err();
        assert!(matches!(err, Error::RecursionLimit));
    }

    // ==================== Streaming Tests ====================

    #[tokio::test]
    async fn test_stream_flows_chunks_through_incremental_steps() {
        let chain = Exploder.pipe(Upper);
        let stream = chain.stream("abc".to_string(), None).await.unwrap();
        let chunks: Vec<String> = stream.map(|r| r.unwrap()).collect().await;
        assert_eq!(chunks, vec!["A", "B", "C"]);
    }

    #[tokio::test]
    async fn test_non_incremental_step_buffers() {
        // `inc`-style lambdas only implement invoke, so the exploded chunks
        // collapse back into one value at the barrier.
        let join = RunnableLambda::new(|s: String| format!("[{s}]"));
        let chain = Exploder.pipe(Upper).pipe(join);
        let stream = chain.stream("hi".to_string(), None).await.unwrap();
        let chunks: Vec<String> = stream.map(|r| r.unwrap()).collect().await;
        assert_eq!(chunks, vec!["[HI]"]);
    }

    #[tokio::test]
    async fn test_stream_reports_chunks_and_final_output() {
        let collector = Arc::new(RunCollectorCallbackHandler::new());
        let config = RunnableConfig::default().with_callback(collector.clone());

        let chain = Exploder.pipe(Upper).with_name("stream-chain");
        let stream = chain
            .stream("ab".to_string(), Some(config))
            .await
            .unwrap();
        let _chunks: Vec<String> = stream.map(|r| r.unwrap()).collect().await;

        let run = collector.find_run("stream-chain").unwrap();
        // The run's final output is the concatenation of its chunks.
        assert_eq!(run.outputs, Some(serde_json::json!("AB")));
    }

    #[tokio::test]
    async fn test_transform_accepts_upstream_chunks() {
        let chain = Upper.pipe(Exploder);
        let source: OutputStream<String> = Box::pin(futures::stream::iter(vec![
            Ok("a".to_string()),
            Ok("b".to_string()),
        ]));
        let out = chain.transform(source, None).await.unwrap();
        let chunks: Vec<String> = out.map(|r| r.unwrap()).collect().await;
        // Upper maps chunk-wise, Exploder buffers (invoke-only path splits
        // the final value back into characters via its stream override).
        assert_eq!(chunks, vec!["A", "B"]);
    }
}
