//! Ordered fallback chains
//!
//! A fallback chain tries its primary runnable, then each fallback in order,
//! until one succeeds. The first success wins; if everything fails, the
//! FIRST error is raised (the primary's failure is the meaningful one, later
//! failures are collateral). Control errors abort the chain immediately.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;

use crate::config::RunnableConfig;
use crate::error::Result;
use crate::runnable::{close_run, open_run, DynRunnable, Runnable};
use crate::stream::ChunkConcat;

/// A runnable with an ordered list of alternatives tried on failure.
///
/// Built with [`Runnable::with_fallbacks`]. Opens one run; each candidate's
/// run is a child of it.
pub struct RunnableWithFallbacks<R: Runnable> {
    primary: Arc<R>,
    fallbacks: Vec<DynRunnable<R::Input, R::Output>>,
    name: String,
}

impl<R: Runnable> RunnableWithFallbacks<R> {
    /// Wrap a runnable with its fallbacks, tried in order.
    pub fn new(primary: R, fallbacks: Vec<DynRunnable<R::Input, R::Output>>) -> Self {
        Self {
            primary: Arc::new(primary),
            fallbacks,
            name: "RunnableWithFallbacks".to_string(),
        }
    }

    /// Set the display name used for runs.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Number of candidates (primary plus fallbacks).
    #[must_use]
    pub fn len(&self) -> usize {
        1 + self.fallbacks.len()
    }

    /// Always false: there is at least the primary.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        false
    }
}

impl<R: Runnable> Clone for RunnableWithFallbacks<R> {
    fn clone(&self) -> Self {
        Self {
            primary: self.primary.clone(),
            fallbacks: self.fallbacks.clone(),
            name: self.name.clone(),
        }
    }
}

impl<R: Runnable> std::fmt::Debug for RunnableWithFallbacks<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunnableWithFallbacks")
            .field("name", &self.name)
            .field("fallbacks", &self.fallbacks.len())
            .finish()
    }
}

#[async_trait]
impl<R> Runnable for RunnableWithFallbacks<R>
where
    R: Runnable + 'static,
    R::Input: Serialize + Clone,
    R::Output: Serialize,
{
    type Input = R::Input;
    type Output = R::Output;

    fn name(&self) -> String {
        self.name.clone()
    }

    async fn invoke(&self, input: R::Input, config: Option<RunnableConfig>) -> Result<R::Output> {
        let snapshot = serde_json::to_value(&input).unwrap_or(serde_json::Value::Null);
        let (config, run_id, callback_manager) =
            open_run(self.run_type(), &self.name, config, snapshot).await?;

        let result = async {
            let child = config.child(run_id)?;
            let first_error = match self.primary.invoke(input.clone(), Some(child)).await {
                Ok(output) => return Ok(output),
                Err(e) if e.is_control() => return Err(e),
                Err(e) => e,
            };

            for fallback in &self.fallbacks {
                let child = config.child(run_id)?;
                match fallback.invoke(input.clone(), Some(child)).await {
                    Ok(output) => return Ok(output),
                    Err(e) if e.is_control() => return Err(e),
                    Err(_) => {}
                }
            }

            Err(first_error)
        }
        .await;

        close_run(&callback_manager, run_id, result).await
    }

    /// Whole-batch fallback: alternatives engage only when a candidate's
    /// entire batch call fails, never per item.
    async fn batch(
        &self,
        inputs: Vec<R::Input>,
        config: Option<RunnableConfig>,
    ) -> Result<Vec<R::Output>> {
        let config = config.unwrap_or_default();
        let first_error = match self.primary.batch(inputs.clone(), Some(config.clone())).await {
            Ok(outputs) => return Ok(outputs),
            Err(e) if e.is_control() => return Err(e),
            Err(e) => e,
        };

        for fallback in &self.fallbacks {
            match fallback.batch(inputs.clone(), Some(config.clone())).await {
                Ok(outputs) => return Ok(outputs),
                Err(e) if e.is_control() => return Err(e),
                Err(_) => {}
            }
        }

        Err(first_error)
    }
}

impl<R, Next> std::ops::BitOr<Next> for RunnableWithFallbacks<R>
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
    use crate::error::Error;
    use crate::runnable::lambda::{RunnableLambda, RunnableTryLambda};
    use crate::tracers::RunCollectorCallbackHandler;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn failing(message: &'static str) -> DynRunnable<i32, i32> {
        Arc::new(RunnableTryLambda::new(move |_: i32| -> Result<i32> {
            Err(Error::work(message))
        }))
    }

    // ==================== Fallback Order Tests ====================

    #[tokio::test]
    async fn test_primary_success_skips_fallbacks() {
        let touched = Arc::new(AtomicUsize::new(0));
        let counter = touched.clone();
        let fallback: DynRunnable<i32, i32> = Arc::new(RunnableLambda::new(move |x: i32| {
            counter.fetch_add(1, Ordering::SeqCst);
            x
        }));

        let chain = RunnableLambda::new(|x: i32| x * 2).with_fallbacks(vec![fallback]);
        assert_eq!(chain.invoke(3, None).await.unwrap(), 6);
        assert_eq!(touched.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_first_successful_fallback_wins() {
        let second: DynRunnable<i32, i32> = Arc::new(RunnableLambda::new(|x: i32| x + 100));
        let third: DynRunnable<i32, i32> = Arc::new(RunnableLambda::new(|x: i32| x + 200));

        let chain = RunnableTryLambda::new(|_: i32| -> Result<i32> { Err(Error::work("primary down")) })
            .with_fallbacks(vec![failing("also down"), second, third]);
        assert_eq!(chain.invoke(1, None).await.unwrap(), 101);
    }

    #[tokio::test]
    async fn test_all_failed_raises_first_error() {
        let chain = RunnableTryLambda::new(|_: i32| -> Result<i32> { Err(Error::work("primary down")) })
            .with_fallbacks(vec![failing("fallback one down"), failing("fallback two down")]);
        let err = chain.invoke(1, None).await.unwrap_err();
        assert_eq!(err.to_string(), "primary down");
    }

    #[tokio::test]
    async fn test_control_error_aborts_chain() {
        let touched = Arc::new(AtomicUsize::new(0));
        let counter = touched.clone();
        let fallback: DynRunnable<i32, i32> = Arc::new(RunnableLambda::new(move |x: i32| {
            counter.fetch_add(1, Ordering::SeqCst);
            x
        }));

        let chain = RunnableTryLambda::new(|_: i32| -> Result<i32> { Err(Error::Cancelled) })
            .with_fallbacks(vec![fallback]);
        let err = chain.invoke(1, None).await.unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert_eq!(touched.load(Ordering::SeqCst), 0);
    }

    // ==================== Batch Tests ====================

    #[tokio::test]
    async fn test_batch_falls_back_as_a_whole() {
        let fallback_calls = Arc::new(AtomicUsize::new(0));
        let counter = fallback_calls.clone();
        let backup: DynRunnable<i32, i32> = Arc::new(RunnableLambda::new(move |x: i32| {
            counter.fetch_add(1, Ordering::SeqCst);
            x + 100
        }));

        // One bad element fails the primary's whole batch, so every element
        // is re-dispatched to the fallback.
        let chain = RunnableTryLambda::new(|x: i32| {
            if x == 2 {
                Err(Error::work("two rejected"))
            } else {
                Ok(x)
            }
        })
        .with_fallbacks(vec![backup]);
        let outputs = chain.batch(vec![1, 2, 3], None).await.unwrap();
        assert_eq!(outputs, vec![101, 102, 103]);
        assert_eq!(fallback_calls.load(Ordering::SeqCst), 3);
    }

    // ==================== Tracing Tests ====================

    #[tokio::test]
    async fn test_candidate_runs_are_children() {
        let collector = Arc::new(RunCollectorCallbackHandler::new());
        let config = RunnableConfig::default().with_callback(collector.clone());

        let fallback: DynRunnable<i32, i32> =
            Arc::new(RunnableLambda::new(|x: i32| x + 1).with_name("backup"));
        let chain = RunnableTryLambda::new(|_: i32| -> Result<i32> { Err(Error::work("down")) })
            .with_name("primary")
            .with_fallbacks(vec![fallback])
            .with_name("guarded");
        assert_eq!(chain.invoke(1, Some(config)).await.unwrap(), 2);

        let parent = collector.find_run("guarded").unwrap();
        assert_eq!(parent.child_run_ids.len(), 2);
        assert!(parent.error.is_none());
        let primary = collector.find_run("primary").unwrap();
        assert_eq!(primary.error.as_deref(), Some("down"));
        assert_eq!(primary.parent_run_id, Some(parent.id));
    }
}
