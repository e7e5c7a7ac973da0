//! Named fan-out/fan-in over a shared input
//!
//! A parallel map runs every branch concurrently on a clone of the same
//! input and collects the results under the branch names. Branch failures
//! race: the first error (in declaration order among the settled results)
//! fails the whole map.
//!
//! Streaming interleaves: one pump task broadcasts each input chunk to every
//! branch, and each branch's output chunks are re-keyed as single-entry maps
//! `{name: chunk}` in whatever order branches produce them. Within one
//! branch, chunk order is preserved.

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::{StreamExt, TryStreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::config::RunnableConfig;
use crate::error::{Error, Result};
use crate::runnable::{close_run, open_run, ErasedRunnable, Runnable};
use crate::stream::{buffer_first, trace_output_stream, ChunkConcat, OutputStream};

/// Concurrent map of named branches over one input.
///
/// The output is a JSON map keyed by branch name, so branches may produce
/// heterogeneous types.
///
/// # Example
///
/// ```rust,ignore
/// use runnel::runnable::{Runnable, RunnableLambda, RunnableParallel};
///
/// let map = RunnableParallel::new()
///     .add("double", RunnableLambda::new(|x: i32| x * 2))
///     .add("square", RunnableLambda::new(|x: i32| x * x));
/// let out = map.invoke(3, None).await?;
/// assert_eq!(out["double"], serde_json::json!(6));
/// assert_eq!(out["square"], serde_json::json!(9));
/// ```
pub struct RunnableParallel<I> {
    branches: Vec<(String, Arc<dyn ErasedRunnable>)>,
    name: String,
    _marker: PhantomData<fn(I)>,
}

impl<I> RunnableParallel<I> {
    /// Create a map with no branches.
    #[must_use]
    pub fn new() -> Self {
        Self {
            branches: Vec::new(),
            name: "RunnableParallel".to_string(),
            _marker: PhantomData,
        }
    }

    /// Add a named branch.
    #[must_use]
    pub fn add<R>(mut self, name: impl Into<String>, runnable: R) -> Self
    where
        R: Runnable<Input = I> + 'static,
        R::Input: Serialize + DeserializeOwned + ChunkConcat + Clone,
        R::Output: Serialize + DeserializeOwned + Clone,
    {
        self.branches.push((name.into(), Arc::new(runnable)));
        self
    }

    /// Set the display name used for runs.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Branch names in declaration order.
    #[must_use]
    pub fn keys(&self) -> Vec<&str> {
        self.branches.iter().map(|(k, _)| k.as_str()).collect()
    }

    /// Tag attached to the child run of branch `key`.
    fn branch_tag(key: &str) -> String {
        format!("map:key:{key}")
    }

    /// Fan the input chunk stream out to every branch and merge the branch
    /// output chunks into one stream of single-entry maps.
    fn fan_out(
        &self,
        input: OutputStream<serde_json::Value>,
        config: &RunnableConfig,
        run_id: Uuid,
    ) -> Result<OutputStream<HashMap<String, serde_json::Value>>> {
        let (out_tx, mut out_rx) =
            mpsc::unbounded_channel::<Result<HashMap<String, serde_json::Value>>>();
        let mut branch_txs = Vec::with_capacity(self.branches.len());

        for (key, step) in &self.branches {
            let (tx, mut rx) = mpsc::unbounded_channel::<Result<serde_json::Value>>();
            branch_txs.push(tx);
            let child = config.child_with_tag(run_id, Self::branch_tag(key))?;
            let key = key.clone();
            let step = step.clone();
            let out_tx = out_tx.clone();
            tokio::spawn(async move {
                let rx_stream: OutputStream<serde_json::Value> =
                    Box::pin(async_stream::stream! {
                        while let Some(item) = rx.recv().await {
                            yield item;
                        }
                    });
                match step.transform_erased(rx_stream, Some(child)).await {
                    Ok(mut out) => {
                        while let Some(item) = out.next().await {
                            let keyed = item
                                .map(|v| HashMap::from([(key.clone(), v)]));
                            if out_tx.send(keyed).is_err() {
                                return;
                            }
                        }
                    }
                    Err(e) => {
                        let _ = out_tx.send(Err(e));
                    }
                }
            });
        }
        drop(out_tx);

        // Pump: broadcast each input chunk to every branch. An upstream
        // error is surfaced once on the merged stream, not per branch.
        let (err_tx, mut err_rx) = mpsc::unbounded_channel::<Error>();
        tokio::spawn(async move {
            let mut input = input;
            while let Some(item) = input.next().await {
                match item {
                    Ok(chunk) => {
                        for tx in &branch_txs {
                            let _ = tx.send(Ok(chunk.clone()));
                        }
                    }
                    Err(e) => {
                        let _ = err_tx.send(e);
                        break;
                    }
                }
            }
        });

        Ok(Box::pin(async_stream::stream! {
            loop {
                tokio::select! {
                    biased;
                    Some(e) = err_rx.recv() => {
                        yield Err(e);
                        return;
                    }
                    item = out_rx.recv() => {
                        match item {
                            Some(item) => yield item,
                            None => return,
                        }
                    }
                }
            }
        }))
    }
}

impl<I> Default for RunnableParallel<I> {
    fn default() -> Self {
        Self::new()
    }
}

impl<I> Clone for RunnableParallel<I> {
    fn clone(&self) -> Self {
        Self {
            branches: self.branches.clone(),
            name: self.name.clone(),
            _marker: PhantomData,
        }
    }
}

impl<I> std::fmt::Debug for RunnableParallel<I> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunnableParallel")
            .field("name", &self.name)
            .field("keys", &self.keys())
            .finish()
    }
}

#[async_trait]
impl<I> Runnable for RunnableParallel<I>
where
    I: Serialize + DeserializeOwned + ChunkConcat + Clone + Send + Sync + 'static,
{
    type Input = I;
    type Output = HashMap<String, serde_json::Value>;

    fn name(&self) -> String {
        self.name.clone()
    }

    async fn invoke(
        &self,
        input: I,
        config: Option<RunnableConfig>,
    ) -> Result<HashMap<String, serde_json::Value>> {
        let snapshot = serde_json::to_value(&input).unwrap_or(serde_json::Value::Null);
        let (config, run_id, callback_manager) =
            open_run(Runnable::run_type(self), &self.name, config, snapshot).await?;

        let result = async {
            let input_value = serde_json::to_value(input)?;
            let n = self.branches.len();
            let limit = config.max_concurrency.unwrap_or(n).clamp(1, n.max(1));
            let mut calls: Vec<BoxFuture<'static, Result<(String, serde_json::Value)>>> =
                Vec::with_capacity(n);
            for (key, step) in &self.branches {
                let child = config.child_with_tag(run_id, Self::branch_tag(key))?;
                let key = key.clone();
                let step = step.clone();
                let input_value = input_value.clone();
                calls.push(Box::pin(async move {
                    let output = step.invoke_erased(input_value, Some(child)).await?;
                    Ok((key, output))
                }));
            }
            let entries: Vec<(String, serde_json::Value)> = futures::stream::iter(calls)
                .buffered(limit)
                .try_collect()
                .await?;
            Ok(entries.into_iter().collect())
        }
        .await;

        close_run(&callback_manager, run_id, result).await
    }

    async fn stream(
        &self,
        input: I,
        config: Option<RunnableConfig>,
    ) -> Result<OutputStream<HashMap<String, serde_json::Value>>> {
        let snapshot = serde_json::to_value(&input).unwrap_or(serde_json::Value::Null);
        let (config, run_id, callback_manager) =
            open_run(Runnable::run_type(self), &self.name, config, snapshot).await?;

        let setup = serde_json::to_value(input)
            .map_err(Error::from)
            .and_then(|value| {
                let source: OutputStream<serde_json::Value> =
                    Box::pin(futures::stream::once(async move { Ok(value) }));
                self.fan_out(source, &config, run_id)
            });
        let merged = match setup {
            Ok(stream) => stream,
            Err(e) => {
                callback_manager.on_run_error(&e.to_string(), run_id).await;
                return Err(e);
            }
        };

        buffer_first(trace_output_stream(merged, callback_manager, run_id)).await
    }

    async fn transform(
        &self,
        input: OutputStream<I>,
        config: Option<RunnableConfig>,
    ) -> Result<OutputStream<HashMap<String, serde_json::Value>>>
    where
        I: ChunkConcat,
    {
        let (config, run_id, callback_manager) =
            open_run(Runnable::run_type(self), &self.name, config, serde_json::Value::Null).await?;

        let source: OutputStream<serde_json::Value> = Box::pin(
            input.map(|item| item.and_then(|i| serde_json::to_value(i).map_err(Error::from))),
        );
        let merged = match self.fan_out(source, &config, run_id) {
            Ok(stream) => stream,
            Err(e) => {
                callback_manager.on_run_error(&e.to_string(), run_id).await;
                return Err(e);
            }
        };

        Ok(trace_output_stream(merged, callback_manager, run_id))
    }
}
