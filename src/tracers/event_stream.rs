//! The v2 flat-event protocol (`stream_events`)
//!
//! v2 re-emits trace callbacks as [`StreamEvent`]s while the execution runs,
//! instead of deriving them from the patch log. When the root run passes the
//! filters, its start event (carrying the input) comes first and its end
//! event (carrying the output, not the input) comes last. Root output chunks
//! are emitted by the driver as it pulls the execution's stream, so
//! invoke-only roots still produce stream events.

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::callbacks::CallbackHandler;
use crate::config::RunnableConfig;
use crate::error::Result;
use crate::runnable::{Runnable, StreamEvent, StreamEventData, StreamEventsOptions};
use crate::stream::OutputStream;
use crate::tracers::RunType;

struct RunIdentity {
    event_type: &'static str,
    name: String,
    tags: Vec<String>,
    metadata: HashMap<String, serde_json::Value>,
}

impl RunIdentity {
    fn event(&self, run_id: Uuid, phase: &str, data: StreamEventData) -> StreamEvent {
        StreamEvent {
            event: format!("on_{}_{phase}", self.event_type),
            name: self.name.clone(),
            run_id,
            tags: self.tags.clone(),
            metadata: self.metadata.clone(),
            data,
        }
    }
}

struct EventStreamState {
    root_id: Option<Uuid>,
    runs: HashMap<Uuid, RunIdentity>,
    pending_root_end: Option<StreamEvent>,
}

/// Trace handler that re-emits run lifecycle as v2 [`StreamEvent`]s.
///
/// The root run's end event is held back for the driver to emit after the
/// last output chunk, so consumers always see `start .. stream .. end`.
pub struct EventStreamCallbackHandler {
    tx: mpsc::UnboundedSender<Result<StreamEvent>>,
    options: StreamEventsOptions,
    inner: Mutex<EventStreamState>,
}

impl EventStreamCallbackHandler {
    /// Create a handler writing events into `tx`.
    pub fn new(tx: mpsc::UnboundedSender<Result<StreamEvent>>, options: StreamEventsOptions) -> Self {
        Self {
            tx,
            options,
            inner: Mutex::new(EventStreamState {
                root_id: None,
                runs: HashMap::new(),
                pending_root_end: None,
            }),
        }
    }

    fn send(&self, event: StreamEvent) {
        let _ = self.tx.send(Ok(event));
    }

    /// Build the root's stream event for one output chunk the driver pulled.
    pub(crate) fn root_chunk(&self, chunk: &serde_json::Value) -> Option<StreamEvent> {
        let inner = self.inner.lock();
        let root_id = inner.root_id?;
        let identity = inner.runs.get(&root_id)?;
        Some(identity.event(
            root_id,
            "stream",
            StreamEventData {
                chunk: Some(chunk.clone()),
                ..Default::default()
            },
        ))
    }

    /// The held-back root end event, if the root has closed.
    pub(crate) fn take_root_end(&self) -> Option<StreamEvent> {
        self.inner.lock().pending_root_end.take()
    }
}

#[async_trait]
impl CallbackHandler for EventStreamCallbackHandler {
    async fn on_run_start(
        &self,
        run_type: RunType,
        name: &str,
        inputs: &serde_json::Value,
        run_id: Uuid,
        _parent_run_id: Option<Uuid>,
        tags: &[String],
        metadata: &HashMap<String, serde_json::Value>,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        let is_root = inner.root_id.is_none();
        if is_root {
            inner.root_id = Some(run_id);
        }
        if !self.options.admits(name, run_type, tags) {
            return Ok(());
        }

        let identity = RunIdentity {
            event_type: run_type.as_str(),
            name: name.to_string(),
            tags: tags.to_vec(),
            metadata: metadata.clone(),
        };
        let input = (!inputs.is_null()).then(|| inputs.clone());
        let event = identity.event(
            run_id,
            "start",
            StreamEventData {
                input,
                ..Default::default()
            },
        );
        inner.runs.insert(run_id, identity);
        drop(inner);
        self.send(event);
        Ok(())
    }

    async fn on_run_stream(
        &self,
        chunk: &serde_json::Value,
        run_id: Uuid,
        _parent_run_id: Option<Uuid>,
    ) -> Result<()> {
        let inner = self.inner.lock();
        if inner.root_id == Some(run_id) {
            // Root chunks are emitted by the driver.
            return Ok(());
        }
        if let Some(identity) = inner.runs.get(&run_id) {
            let event = identity.event(
                run_id,
                "stream",
                StreamEventData {
                    chunk: Some(chunk.clone()),
                    ..Default::default()
                },
            );
            drop(inner);
            self.send(event);
        }
        Ok(())
    }

    async fn on_run_end(
        &self,
        outputs: &serde_json::Value,
        run_id: Uuid,
        _parent_run_id: Option<Uuid>,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        let is_root = inner.root_id == Some(run_id);
        if let Some(identity) = inner.runs.get(&run_id) {
            let event = identity.event(
                run_id,
                "end",
                StreamEventData {
                    output: Some(outputs.clone()),
                    ..Default::default()
                },
            );
            if is_root {
                inner.pending_root_end = Some(event);
            } else {
                drop(inner);
                self.send(event);
            }
        }
        Ok(())
    }
}

/// Drive one execution and stream its v2 events.
pub async fn stream_events_v2<R>(
    runnable: R,
    input: R::Input,
    config: Option<RunnableConfig>,
    options: StreamEventsOptions,
) -> Result<OutputStream<StreamEvent>>
where
    R: Runnable + 'static,
    R::Input: Serialize,
    R::Output: Serialize,
{
    let (tx, mut rx) = mpsc::unbounded_channel::<Result<StreamEvent>>();
    let handler = Arc::new(EventStreamCallbackHandler::new(tx.clone(), options));
    let config = config.unwrap_or_default().with_callback(handler.clone());

    tokio::spawn(async move {
        match runnable.stream(input, Some(config)).await {
            Ok(mut stream) => {
                while let Some(item) = stream.next().await {
                    match item {
                        Ok(chunk) => {
                            if let Ok(value) = serde_json::to_value(&chunk) {
                                if let Some(event) = handler.root_chunk(&value) {
                                    let _ = tx.send(Ok(event));
                                }
                            }
                        }
                        Err(e) => {
                            let _ = tx.send(Err(e));
                            break;
                        }
                    }
                }
                if let Some(event) = handler.take_root_end() {
                    let _ = tx.send(Ok(event));
                }
            }
            Err(e) => {
                let _ = tx.send(Err(e));
            }
        }
    });

    Ok(Box::pin(async_stream::stream! {
        while let Some(item) = rx.recv().await {
            yield item;
        }
    }))
}
