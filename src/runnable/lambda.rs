//! Closures as leaf runnables
//!
//! [`RunnableLambda`] wraps a pure function, [`RunnableTryLambda`] a fallible
//! one. Both open a run per call like every other runnable, so plain
//! functions participate fully in tracing, batching, and streaming.
//!
//! # Example
//!
//! ```rust,ignore
//! use runnel::runnable::{Runnable, RunnableLambda};
//!
//! let double = RunnableLambda::new(|x: i32| x * 2);
//! let inc = RunnableLambda::new(|x: i32| x + 1);
//! let chain = double | inc;
//! assert_eq!(chain.invoke(3, None).await?, 7);
//! ```

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::config::RunnableConfig;
use crate::error::Result;
use crate::runnable::sequence::RunnableSequence;
use crate::runnable::{close_run, open_run, Runnable};
use crate::stream::ChunkConcat;

/// A pure function lifted into a runnable.
pub struct RunnableLambda<F, I, O> {
    func: Arc<F>,
    name: String,
    _marker: PhantomData<fn(I) -> O>,
}

impl<F, I, O> RunnableLambda<F, I, O>
where
    F: Fn(I) -> O + Send + Sync,
{
    /// Wrap a function.
    pub fn new(func: F) -> Self {
        Self {
            func: Arc::new(func),
            name: "RunnableLambda".to_string(),
            _marker: PhantomData,
        }
    }

    /// Set the display name used for runs.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

impl<F, I, O> Clone for RunnableLambda<F, I, O> {
    fn clone(&self) -> Self {
        Self {
            func: self.func.clone(),
            name: self.name.clone(),
            _marker: PhantomData,
        }
    }
}

impl<F, I, O> std::fmt::Debug for RunnableLambda<F, I, O> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunnableLambda").field("name", &self.name).finish()
    }
}

#[async_trait]
impl<F, I, O> Runnable for RunnableLambda<F, I, O>
where
    F: Fn(I) -> O + Send + Sync,
    I: Serialize + Send + Sync + 'static,
    O: Serialize + Send + Sync + 'static,
{
    type Input = I;
    type Output = O;

    fn name(&self) -> String {
        self.name.clone()
    }

    async fn invoke(&self, input: I, config: Option<RunnableConfig>) -> Result<O> {
        let snapshot = serde_json::to_value(&input).unwrap_or(serde_json::Value::Null);
        let (config, run_id, callback_manager) =
            open_run(self.run_type(), &self.name, config, snapshot).await?;
        let func = self.func.clone();
        let result = config.cancellable(async move { Ok(func(input)) }).await;
        close_run(&callback_manager, run_id, result).await
    }
}

/// A fallible function lifted into a runnable.
///
/// The closure's error is reported to the run and then propagated unchanged,
/// so outer retry and fallback combinators see the original failure.
pub struct RunnableTryLambda<F, I, O> {
    func: Arc<F>,
    name: String,
    _marker: PhantomData<fn(I) -> O>,
}

impl<F, I, O> RunnableTryLambda<F, I, O>
where
    F: Fn(I) -> Result<O> + Send + Sync,
{
    /// Wrap a fallible function.
    pub fn new(func: F) -> Self {
        Self {
            func: Arc::new(func),
            name: "RunnableTryLambda".to_string(),
            _marker: PhantomData,
        }
    }

    /// Set the display name used for runs.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

impl<F, I, O> Clone for RunnableTryLambda<F, I, O> {
    fn clone(&self) -> Self {
        Self {
            func: self.func.clone(),
            name: self.name.clone(),
            _marker: PhantomData,
        }
    }
}

impl<F, I, O> std::fmt::Debug for RunnableTryLambda<F, I, O> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunnableTryLambda").field("name", &self.name).finish()
    }
}

#[async_trait]
impl<F, I, O> Runnable for RunnableTryLambda<F, I, O>
where
    F: Fn(I) -> Result<O> + Send + Sync,
    I: Serialize + Send + Sync + 'static,
    O: Serialize + Send + Sync + 'static,
{
    type Input = I;
    type Output = O;

    fn name(&self) -> String {
        self.name.clone()
    }

    async fn invoke(&self, input: I, config: Option<RunnableConfig>) -> Result<O> {
        let snapshot = serde_json::to_value(&input).unwrap_or(serde_json::Value::Null);
        let (config, run_id, callback_manager) =
            open_run(self.run_type(), &self.name, config, snapshot).await?;
        let func = self.func.clone();
        let result = config.cancellable(async move { func(input) }).await;
        close_run(&callback_manager, run_id, result).await
    }
}

impl<F, I, O, R> std::ops::BitOr<R> for RunnableLambda<F, I, O>
where
    F: Fn(I) -> O + Send + Sync + 'static,
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

impl<F, I, O, R> std::ops::BitOr<R> for RunnableTryLambda<F, I, O>
where
    F: Fn(I) -> Result<O> + Send + Sync + 'static,
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
    use crate::error::Error;
    use crate::tracers::RunCollectorCallbackHandler;
    use futures::StreamExt;
    use std::sync::Arc;

    // ==================== Invoke Tests ====================

    #[tokio::test]
    async fn test_lambda_invoke() {
        let double = RunnableLambda::new(|x: i32| x * 2);
        assert_eq!(double.invoke(21, None).await.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_try_lambda_propagates_work_error() {
        let parse = RunnableTryLambda::new(|s: String| {
            s.parse::<i32>().map_err(|e| Error::work(e.to_string()))
        });
        assert_eq!(parse.invoke("7".into(), None).await.unwrap(), 7);
        let err = parse.invoke("nope".into(), None).await.unwrap_err();
        assert!(matches!(err, Error::Work(_)));
    }

    #[tokio::test]
    async fn test_lambda_run_is_traced() {
        let collector = Arc::new(RunCollectorCallbackHandler::new());
        let config = RunnableConfig::default().with_callback(collector.clone());

        let double = RunnableLambda::new(|x: i32| x * 2).with_name("double");
        double.invoke(3, Some(config)).await.unwrap();

        let run = collector.find_run("double").unwrap();
        assert_eq!(run.inputs, Some(serde_json::json!(3)));
        assert_eq!(run.outputs, Some(serde_json::json!(6)));
        assert!(run.error.is_none());
    }

    #[tokio::test]
    async fn test_failed_run_records_error() {
        let collector = Arc::new(RunCollectorCallbackHandler::new());
        let config = RunnableConfig::default().with_callback(collector.clone());

        let fail = RunnableTryLambda::new(|_: i32| -> Result<i32> {
            Err(Error::work("boom"))
        })
        .with_name("fail");
        fail.invoke(1, Some(config)).await.unwrap_err();

        let run = collector.find_run("fail").unwrap();
        assert_eq!(run.error.as_deref(), Some("boom"));
        assert!(run.outputs.is_none());
    }

    // ==================== Batch Tests ====================

    #[tokio::test]
    async fn test_batch_preserves_input_order() {
        let double = RunnableLambda::new(|x: i32| x * 2);
        let outputs = double.batch(vec![1, 2, 3, 4], None).await.unwrap();
        assert_eq!(outputs, vec![2, 4, 6, 8]);
    }

    #[tokio::test]
    async fn test_batch_fails_on_first_error() {
        let parse = RunnableTryLambda::new(|s: String| {
            s.parse::<i32>().map_err(|e| Error::work(e.to_string()))
        });
        let result = parse
            .batch(vec!["1".into(), "bad".into(), "3".into()], None)
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_batch_with_return_exceptions_captures_in_slot() {
        use crate::runnable::BatchOptions;

        let parse = RunnableTryLambda::new(|s: String| {
            s.parse::<i32>().map_err(|e| Error::work(e.to_string()))
        });
        let results = parse
            .batch_with_options(
                vec!["1".into(), "bad".into(), "3".into()],
                None,
                &BatchOptions {
                    return_exceptions: true,
                },
            )
            .await
            .unwrap();
        assert_eq!(results.len(), 3);
        assert_eq!(*results[0].as_ref().unwrap(), 1);
        assert!(results[1].is_err());
        assert_eq!(*results[2].as_ref().unwrap(), 3);
    }

    // ==================== Stream Tests ====================

    #[tokio::test]
    async fn test_default_stream_yields_single_chunk() {
        let double = RunnableLambda::new(|x: i32| x * 2);
        let stream = double.stream(5, None).await.unwrap();
        let chunks: Vec<i32> = stream.map(|r| r.unwrap()).collect().await;
        assert_eq!(chunks, vec![10]);
    }

    // ==================== Pipe Tests ====================

    #[tokio::test]
    async fn test_bitor_pipes() {
        let double = RunnableLambda::new(|x: i32| x * 2);
        let inc = RunnableLambda::new(|x: i32| x + 1);
        let chain = double | inc;
        assert_eq!(chain.invoke(3, None).await.unwrap(), 7);
    }

    // ==================== Cancellation Tests ====================

    #[tokio::test]
    async fn test_cancelled_token_aborts_invoke() {
        use tokio_util::sync::CancellationToken;

        let token = CancellationToken::new();
        token.cancel();
        let config = RunnableConfig::default().with_cancellation(token);

        let double = RunnableLambda::new(|x: i32| x * 2);
        let err = double.invoke(1, Some(config)).await.unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }
}
