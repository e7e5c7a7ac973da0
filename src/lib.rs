//! # runnel
//!
//! Composable pipeline execution: a small core for building, configuring,
//! and observing units of deferred work.
//!
//! The central abstraction is the [`Runnable`](runnable::Runnable) trait -
//! one input, one output, callable single-shot (`invoke`), batched
//! (`batch`), or incrementally (`stream` / `transform`). Combinators compose
//! runnables into pipelines while preserving all three calling conventions:
//!
//! ```rust,ignore
//! use runnel::prelude::*;
//!
//! let chain = RunnableLambda::new(|x: i32| x * 2)
//!     | RunnableLambda::new(|x: i32| x + 1);
//! assert_eq!(chain.invoke(3, None).await?, 7);
//! assert_eq!(chain.batch(vec![1, 2, 3], None).await?, vec![3, 5, 7]);
//! ```
//!
//! Every call carries an optional [`RunnableConfig`](config::RunnableConfig)
//! with trace handlers, tags, metadata, and recursion/concurrency budgets.
//! Executions report a tree of runs through the
//! [`callbacks`](crate::callbacks) layer, observable live through two event
//! protocols: the v1 patch log ([`stream_log`](runnable::Runnable::stream_log))
//! and v2 flat events ([`stream_events`](runnable::Runnable::stream_events)).

pub mod callbacks;
pub mod config;
pub mod error;
pub mod runnable;
pub mod stream;
pub mod tracers;

pub use config::RunnableConfig;
pub use error::{Error, ErrorCategory, Result};

/// Commonly used types, for glob import.
pub mod prelude {
    pub use crate::callbacks::{CallbackHandler, CallbackManager, TracingCallbackHandler};
    pub use crate::config::RunnableConfig;
    pub use crate::error::{Error, ErrorCategory, Result};
    pub use crate::runnable::{
        BatchOptions, DynRunnable, RetryPolicy, RunListeners, Runnable, RunnableBinding,
        RunnableEach, RunnableLambda, RunnableParallel, RunnablePassthrough, RunnableRetry,
        RunnableSequence, RunnableTryLambda, RunnableWithFallbacks, StreamEvent,
        StreamEventsOptions, StreamEventsVersion,
    };
    pub use crate::stream::{ChunkConcat, OutputStream};
    pub use crate::tracers::{
        RunCollectorCallbackHandler, RunLog, RunLogPatch, RunTree, RunType,
    };
}
