//! Run-tree assembly and the two event-stream protocols
//!
//! Trace callbacks arrive flat, one run at a time; these modules reassemble
//! them into trees and project them onto observable surfaces:
//!
//! - [`base`] - [`RunTree`] and the shared [`RunTracker`] arena
//! - [`run_collector`] - collect finished runs for inspection and tests
//! - [`log_stream`] - the v1 patch-log protocol (`stream_log`)
//! - [`event_stream`] - the v2 flat-event protocol (`stream_events`)

pub mod base;
pub mod event_stream;
pub mod log_stream;
pub mod run_collector;

pub use base::{RunTracker, RunTree, RunType};
pub use event_stream::EventStreamCallbackHandler;
pub use log_stream::{LogEntry, LogStreamCallbackHandler, RunLog, RunLogPatch};
pub use run_collector::RunCollectorCallbackHandler;
