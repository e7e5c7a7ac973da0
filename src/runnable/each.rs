//! Per-item mapping over list inputs
//!
//! [`RunnableEach`] turns a runnable over `T` into a runnable over `Vec<T>`:
//! one outer run wraps an inner batch, so each element's run is a child of
//! the mapping run. Built with [`Runnable::map`].

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;

use crate::config::RunnableConfig;
use crate::error::Result;
use crate::runnable::{close_run, open_run, Runnable};
use crate::stream::ChunkConcat;

/// Applies a bound runnable to every element of a list input.
pub struct RunnableEach<R> {
    bound: Arc<R>,
    name: String,
}

impl<R> RunnableEach<R> {
    /// Wrap a runnable for element-wise application.
    pub fn new(bound: R) -> Self {
        Self {
            bound: Arc::new(bound),
            name: "RunnableEach".to_string(),
        }
    }

    /// Set the display name used for runs.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

impl<R> Clone for RunnableEach<R> {
    fn clone(&self) -> Self {
        Self {
            bound: self.bound.clone(),
            name: self.name.clone(),
        }
    }
}

impl<R> std::fmt::Debug for RunnableEach<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunnableEach").field("name", &self.name).finish()
    }
}

#[async_trait]
impl<R> Runnable for RunnableEach<R>
where
    R: Runnable + 'static,
    R::Input: Serialize,
    R::Output: Serialize,
{
    type Input = Vec<R::Input>;
    type Output = Vec<R::Output>;

    fn name(&self) -> String {
        self.name.clone()
    }

    async fn invoke(
        &self,
        inputs: Vec<R::Input>,
        config: Option<RunnableConfig>,
    ) -> Result<Vec<R::Output>> {
        let snapshot = serde_json::to_value(&inputs).unwrap_or(serde_json::Value::Null);
        let (config, run_id, callback_manager) =
            open_run(self.run_type(), &self.name, config, snapshot).await?;

        let result = async {
            let child = config.child(run_id)?;
            self.bound.batch(inputs, Some(child)).await
        }
        .await;

        close_run(&callback_manager, run_id, result).await
    }
}

impl<R, Next> std::ops::BitOr<Next> for RunnableEach<R>
where
    R: Runnable + 'static,
    R::Input: Serialize + DeserializeOwned + ChunkConcat + Clone,
    R::Output: Serialize + DeserializeOwned + ChunkConcat + Clone,
    Next: Runnable<Input = Vec<R::Output>> + 'static,
    Next::Output: Serialize + DeserializeOwned + ChunkConcat + Clone,
{
    type Output = crate::runnable::RunnableSequence<Vec<R::Input>, Next::Output>;

    fn bitor(self, rhs: Next) -> Self::Output {
        self.pipe(rhs)
    }
}
