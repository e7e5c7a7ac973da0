//! Identity runnable
//!
//! Passes its input through unchanged. Mostly useful inside a
//! [`RunnableParallel`](crate::runnable::RunnableParallel) to carry the
//! original input alongside derived branches. Fully incremental: transform
//! echoes chunks as they arrive.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;

use crate::config::RunnableConfig;
use crate::error::Result;
use crate::runnable::{close_run, open_run, Runnable};
use crate::stream::{trace_output_stream, ChunkConcat, OutputStream};

/// Identity: output equals input.
pub struct RunnablePassthrough<T> {
    name: String,
    _marker: PhantomData<fn(T) -> T>,
}

impl<T> RunnablePassthrough<T> {
    /// Create a passthrough.
    #[must_use]
    pub fn new() -> Self {
        Self {
            name: "RunnablePassthrough".to_string(),
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

impl<T> Default for RunnablePassthrough<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for RunnablePassthrough<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> std::fmt::Debug for RunnablePassthrough<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunnablePassthrough").field("name", &self.name).finish()
    }
}

#[async_trait]
impl<T> Runnable for RunnablePassthrough<T>
where
    T: Serialize + Send + Sync + 'static,
{
    type Input = T;
    type Output = T;

    fn name(&self) -> String {
        self.name.clone()
    }

    async fn invoke(&self, input: T, config: Option<RunnableConfig>) -> Result<T> {
        let snapshot = serde_json::to_value(&input).unwrap_or(serde_json::Value::Null);
        let (_config, run_id, callback_manager) =
            open_run(self.run_type(), &self.name, config, snapshot).await?;
        close_run(&callback_manager, run_id, Ok(input)).await
    }

    async fn transform(
        &self,
        input: OutputStream<T>,
        config: Option<RunnableConfig>,
    ) -> Result<OutputStream<T>>
    where
        T: ChunkConcat,
    {
        let (_config, run_id, callback_manager) =
            open_run(self.run_type(), &self.name, config, serde_json::Value::Null).await?;
        Ok(trace_output_stream(input, callback_manager, run_id))
    }
}

impl<T, Next> std::ops::BitOr<Next> for RunnablePassthrough<T>
where
    T: Serialize + DeserializeOwned + ChunkConcat + Clone + Send + Sync + 'static,
    Next: Runnable<Input = T> + 'static,
    Next::Output: Serialize + DeserializeOwned + ChunkConcat + Clone,
{
    type Output = crate::runnable::RunnableSequence<T, Next::Output>;

    fn bitor(self, rhs: Next) -> Self::Output {
        self.pipe(rhs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::runnable::lambda::RunnableLambda;
    use crate::runnable::parallel::RunnableParallel;
    use futures::StreamExt;
    use serde_json::json;

    #[tokio::test]
    async fn test_identity() {
        let pass: RunnablePassthrough<String> = RunnablePassthrough::new();
        assert_eq!(pass.invoke("hi".to_string(), None).await.unwrap(), "hi");
    }

    #[tokio::test]
    async fn test_transform_echoes_chunks() {
        let pass: RunnablePassthrough<String> = RunnablePassthrough::new();
        let source: OutputStream<String> = Box::pin(futures::stream::iter(vec![
            Ok("a".to_string()),
            Ok("b".to_string()),
        ]));
        let out = pass.transform(source, None).await.unwrap();
        let chunks: Vec<String> = out.map(|r| r.unwrap()).collect().await;
        assert_eq!(chunks, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_carries_input_alongside_derived_branch() {
        let map = RunnableParallel::new()
            .add("original", RunnablePassthrough::new())
            .add("doubled", RunnableLambda::new(|x: i32| x * 2));
        let out = map.invoke(5, None).await.unwrap();
        assert_eq!(out["original"], json!(5));
        assert_eq!(out["doubled"], json!(10));
    }

    #[tokio::test]
    async fn test_input_error_propagates_through_transform() {
        let pass: RunnablePassthrough<String> = RunnablePassthrough::new();
        let source: OutputStream<String> = Box::pin(futures::stream::iter(vec![
            Ok("a".to_string()),
            Err(Error::work("upstream died")),
        ]));
        let out = pass.transform(source, None).await.unwrap();
        let items: Vec<Result<String>> = out.collect().await;
        assert_eq!(items.len(), 2);
        assert!(items[1].is_err());
    }
}
