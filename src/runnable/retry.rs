//! Retry with randomized exponential backoff
//!
//! A retried runnable re-invokes its inner runnable on work errors, up to a
//! bounded number of attempts. Control errors (cancellation, recursion-budget
//! exhaustion) are never retried. Each re-attempt's run carries a
//! `retry:attempt:N` tag so traces distinguish attempts, and batch retries
//! re-dispatch only the slots that failed.

use async_trait::async_trait;
use rand::Rng;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::config::RunnableConfig;
use crate::error::{Error, Result};
use crate::runnable::{BatchOptions, Runnable};
use crate::stream::ChunkConcat;

/// Hook invoked after every retryable failed attempt, the last included,
/// before any backoff sleep.
///
/// Returning an error aborts the retry loop with that error.
pub type FailedAttemptHandler = Arc<dyn Fn(&Error, usize) -> Result<()> + Send + Sync>;

/// Backoff and attempt budget for [`RunnableRetry`].
#[derive(Clone)]
pub struct RetryPolicy {
    /// Total attempt budget, including the first call.
    pub max_attempts: usize,
    /// Delay before the second attempt; doubles per attempt after that.
    pub base_delay: Duration,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
    /// Randomize each delay by a factor in `[1.0, 2.0)`.
    pub jitter: bool,
    /// Inspect failures between attempts; may abort the loop.
    pub on_failed_attempt: Option<FailedAttemptHandler>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            jitter: true,
            on_failed_attempt: None,
        }
    }
}

impl RetryPolicy {
    /// Default policy (3 attempts, exponential backoff with jitter).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Policy with an explicit attempt budget.
    #[must_use]
    pub fn stop_after_attempt(max_attempts: usize) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Self::default()
        }
    }

    /// Set the initial backoff delay.
    #[must_use]
    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Set the backoff delay cap.
    #[must_use]
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Enable or disable delay randomization.
    #[must_use]
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Set the failed-attempt hook.
    #[must_use]
    pub fn with_on_failed_attempt(
        mut self,
        hook: impl Fn(&Error, usize) -> Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.on_failed_attempt = Some(Arc::new(hook));
        self
    }

    /// Backoff before attempt `next_attempt` (2-based).
    fn delay_before(&self, next_attempt: usize) -> Duration {
        let doublings = next_attempt.saturating_sub(2).min(16) as u32;
        let mut delay = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(doublings))
            .min(self.max_delay);
        if self.jitter {
            let factor = rand::thread_rng().gen_range(1.0..2.0);
            delay = delay.mul_f64(factor).min(self.max_delay);
        }
        delay
    }

    /// Whether `error` is worth another attempt.
    fn retryable(&self, error: &Error) -> bool {
        !error.is_control()
    }
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("base_delay", &self.base_delay)
            .field("max_delay", &self.max_delay)
            .field("jitter", &self.jitter)
            .field("on_failed_attempt", &self.on_failed_attempt.is_some())
            .finish()
    }
}

/// A runnable re-attempted on work errors.
///
/// Built with [`Runnable::with_retry`]. The wrapper opens no run of its own;
/// each attempt opens the inner runnable's run, re-attempts tagged
/// `retry:attempt:N`.
pub struct RunnableRetry<R> {
    inner: Arc<R>,
    policy: RetryPolicy,
}

impl<R> RunnableRetry<R> {
    /// Wrap a runnable with a retry policy.
    pub fn new(inner: R, policy: RetryPolicy) -> Self {
        Self {
            inner: Arc::new(inner),
            policy,
        }
    }

    /// Config for attempt `attempt` (1-based): re-attempts get the tag and a
    /// fresh pre-assigned run id so `on_retry` can reference the failed run.
    fn attempt_config(base: &RunnableConfig, attempt: usize) -> (RunnableConfig, Uuid) {
        let mut config = base.clone();
        if attempt > 1 {
            config.run_id = None;
            config.tags.push(format!("retry:attempt:{attempt}"));
        }
        let run_id = config.run_id.unwrap_or_else(Uuid::new_v4);
        config.run_id = Some(run_id);
        (config, run_id)
    }
}

impl<R> Clone for RunnableRetry<R> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            policy: self.policy.clone(),
        }
    }
}

impl<R> std::fmt::Debug for RunnableRetry<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunnableRetry")
            .field("policy", &self.policy)
            .finish()
    }
}

#[async_trait]
impl<R> Runnable for RunnableRetry<R>
where
    R: Runnable + 'static,
    R::Input: Clone,
{
    type Input = R::Input;
    type Output = R::Output;

    fn name(&self) -> String {
        self.inner.name()
    }

    fn run_type(&self) -> crate::tracers::RunType {
        self.inner.run_type()
    }

    async fn invoke(&self, input: R::Input, config: Option<RunnableConfig>) -> Result<R::Output> {
        let base = config.unwrap_or_default();
        let callback_manager = base.get_callback_manager();
        let mut attempt = 1;
        loop {
            let (attempt_config, run_id) = Self::attempt_config(&base, attempt);
            match self.inner.invoke(input.clone(), Some(attempt_config)).await {
                Ok(output) => return Ok(output),
                Err(e) if self.policy.retryable(&e) => {
                    if let Some(hook) = &self.policy.on_failed_attempt {
                        hook(&e, attempt)?;
                    }
                    if attempt >= self.policy.max_attempts {
                        return Err(e);
                    }
                    callback_manager
                        .on_retry(attempt + 1, &e.to_string(), run_id)
                        .await?;
                    tokio::time::sleep(self.policy.delay_before(attempt + 1)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Batch with partial retry: only the slots that failed are re-dispatched
    /// on the next attempt; settled outputs keep their original slots.
    async fn batch(
        &self,
        inputs: Vec<R::Input>,
        config: Option<RunnableConfig>,
    ) -> Result<Vec<R::Output>> {
        let base = config.unwrap_or_default();
        let n = inputs.len();
        let mut slots: Vec<Option<R::Output>> = Vec::with_capacity(n);
        slots.resize_with(n, || None);
        let mut pending: Vec<(usize, R::Input)> = inputs.into_iter().enumerate().collect();
        let mut attempt = 1;

        loop {
            // Unlike invoke, never pin a run id: every slot opens its own run.
            let mut attempt_config = base.clone();
            attempt_config.run_id = None;
            if attempt > 1 {
                attempt_config.tags.push(format!("retry:attempt:{attempt}"));
            }
            let attempt_inputs: Vec<R::Input> =
                pending.iter().map(|(_, input)| input.clone()).collect();
            let results = self
                .inner
                .batch_with_options(
                    attempt_inputs,
                    Some(vec![attempt_config; pending.len()]),
                    &BatchOptions {
                        return_exceptions: true,
                    },
                )
                .await?;

            let mut still_pending = Vec::new();
            let mut first_error: Option<Error> = None;
            for ((slot, input), result) in pending.into_iter().zip(results) {
                match result {
                    Ok(output) => slots[slot] = Some(output),
                    Err(e) => {
                        if !self.policy.retryable(&e) {
                            return Err(e);
                        }
                        if first_error.is_none() {
                            first_error = Some(e);
                        }
                        still_pending.push((slot, input));
                    }
                }
            }
            pending = still_pending;

            match first_error {
                None => break,
                Some(e) => {
                    if let Some(hook) = &self.policy.on_failed_attempt {
                        hook(&e, attempt)?;
                    }
                    if attempt >= self.policy.max_attempts {
                        return Err(e);
                    }
                    tokio::time::sleep(self.policy.delay_before(attempt + 1)).await;
                    attempt += 1;
                }
            }
        }

        Ok(slots
            .into_iter()
            .map(|slot| slot.unwrap_or_else(|| unreachable!("all slots settled")))
            .collect())
    }
}

impl<R, Next> std::ops::BitOr<Next> for RunnableRetry<R>
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
