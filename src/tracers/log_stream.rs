//! The v1 patch-log protocol (`stream_log`)
//!
//! `stream_log` projects one execution onto a stream of JSON-Patch deltas
//! ([`RunLogPatch`]) over a run-log document:
//!
//! ```json
//! {
//!   "id": "...",            // root run id
//!   "name": "...",
//!   "type": "chain",
//!   "streamed_output": [],  // root output chunks
//!   "final_output": null,
//!   "logs": {}              // admitted child runs, keyed by display name
//! }
//! ```
//!
//! Folding every patch in order with [`RunLog::concat`] reproduces the full
//! document; consumers that only need the deltas can forward them as-is.
//! Child runs that collide on display name get `name:2`, `name:3`, ...
//! keys.
//!
//! v1 `stream_events` is derived on top: each patch is folded and its ops
//! are mapped to start/stream/end events. A single patch carrying more than
//! one output chunk for the same run violates the protocol and fails the
//! event stream with [`Error::Protocol`].

use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::callbacks::CallbackHandler;
use crate::config::RunnableConfig;
use crate::error::{Error, Result};
use crate::runnable::{Runnable, StreamEvent, StreamEventData, StreamEventsOptions};
use crate::stream::OutputStream;
use crate::tracers::RunType;

/// One child run's record inside the run-log document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    /// Run identifier.
    pub id: Uuid,
    /// Display name of the run.
    pub name: String,
    /// Run type, lowercase.
    #[serde(rename = "type")]
    pub run_type: String,
    /// Tags of the run.
    pub tags: Vec<String>,
    /// Metadata of the run.
    pub metadata: HashMap<String, serde_json::Value>,
    /// RFC 3339 start timestamp.
    pub start_time: String,
    /// Output chunks streamed by the run, in order.
    pub streamed_output: Vec<serde_json::Value>,
    /// Final output, absent until the run closes successfully.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_output: Option<serde_json::Value>,
    /// Error message, present when the run failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// RFC 3339 end timestamp, absent until the run closes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<String>,
}

/// One JSON-Patch delta over the run-log document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunLogPatch {
    /// The patch operations, applied in order.
    pub ops: json_patch::Patch,
}

impl RunLogPatch {
    fn from_ops(ops: serde_json::Value) -> Result<Self> {
        Ok(Self {
            ops: serde_json::from_value(ops)?,
        })
    }

    /// View the ops as plain JSON (`[{"op", "path", "value"}, ...]`).
    pub fn ops_json(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(&self.ops)?)
    }
}

/// The run-log document, folded from a patch stream.
#[derive(Debug, Clone, Default)]
pub struct RunLog {
    /// Current document state.
    pub state: serde_json::Value,
}

impl RunLog {
    /// An empty log; the first patch replaces the whole document.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one patch into the document.
    pub fn concat(mut self, patch: &RunLogPatch) -> Result<RunLog> {
        json_patch::patch(&mut self.state, &patch.ops)
            .map_err(|e| Error::Protocol(format!("invalid run log patch: {e}")))?;
        Ok(self)
    }
}

/// Escape a log key for use inside a JSON pointer.
fn escape_pointer_token(token: &str) -> String {
    token.replace('~', "~0").replace('/', "~1")
}

struct LogStreamState {
    root_id: Option<Uuid>,
    counters: HashMap<String, usize>,
    keys: HashMap<Uuid, String>,
}

/// Trace handler that renders run lifecycle into [`RunLogPatch`]es.
///
/// The root run becomes the document itself; admitted child runs become
/// `/logs/<key>` entries. Root output chunks are appended by the
/// `stream_log` driver, not here, so invoke-only roots still produce
/// `streamed_output`.
pub struct LogStreamCallbackHandler {
    tx: mpsc::UnboundedSender<Result<RunLogPatch>>,
    options: StreamEventsOptions,
    inner: Mutex<LogStreamState>,
}

impl LogStreamCallbackHandler {
    /// Create a handler writing patches into `tx`.
    pub fn new(tx: mpsc::UnboundedSender<Result<RunLogPatch>>, options: StreamEventsOptions) -> Self {
        Self {
            tx,
            options,
            inner: Mutex::new(LogStreamState {
                root_id: None,
                counters: HashMap::new(),
                keys: HashMap::new(),
            }),
        }
    }

    fn send(&self, patch: Result<RunLogPatch>) {
        let _ = self.tx.send(patch);
    }
}

#[async_trait]
impl CallbackHandler for LogStreamCallbackHandler {
    async fn on_run_start(
        &self,
        run_type: RunType,
        name: &str,
        _inputs: &serde_json::Value,
        run_id: Uuid,
        _parent_run_id: Option<Uuid>,
        tags: &[String],
        metadata: &HashMap<String, serde_json::Value>,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.root_id.is_none() {
            inner.root_id = Some(run_id);
            self.send(RunLogPatch::from_ops(json!([{
                "op": "replace",
                "path": "",
                "value": {
                    "id": run_id,
                    "name": name,
                    "type": run_type.as_str(),
                    "streamed_output": [],
                    "final_output": null,
                    "logs": {},
                },
            }])));
            return Ok(());
        }

        if !self.options.admits(name, run_type, tags) {
            return Ok(());
        }
        let count = inner
            .counters
            .entry(name.to_string())
            .and_modify(|c| *c += 1)
            .or_insert(1);
        let key = if *count == 1 {
            name.to_string()
        } else {
            format!("{name}:{count}")
        };
        inner.keys.insert(run_id, key.clone());

        let entry = LogEntry {
            id: run_id,
            name: name.to_string(),
            run_type: run_type.as_str().to_string(),
            tags: tags.to_vec(),
            metadata: metadata.clone(),
            start_time: Utc::now().to_rfc3339(),
            streamed_output: Vec::new(),
            final_output: None,
            error: None,
            end_time: None,
        };
        self.send(RunLogPatch::from_ops(json!([{
            "op": "add",
            "path": format!("/logs/{}", escape_pointer_token(&key)),
            "value": entry,
        }])));
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
            return Ok(());
        }
        if let Some(key) = inner.keys.get(&run_id) {
            self.send(RunLogPatch::from_ops(json!([{
                "op": "add",
                "path": format!("/logs/{}/streamed_output/-", escape_pointer_token(key)),
                "value": chunk,
            }])));
        }
        Ok(())
    }

    async fn on_run_end(
        &self,
        outputs: &serde_json::Value,
        run_id: Uuid,
        _parent_run_id: Option<Uuid>,
    ) -> Result<()> {
        let inner = self.inner.lock();
        if inner.root_id == Some(run_id) {
            self.send(RunLogPatch::from_ops(json!([{
                "op": "replace",
                "path": "/final_output",
                "value": outputs,
            }])));
            return Ok(());
        }
        if let Some(key) = inner.keys.get(&run_id) {
            let key = escape_pointer_token(key);
            self.send(RunLogPatch::from_ops(json!([
                {
                    "op": "add",
                    "path": format!("/logs/{key}/final_output"),
                    "value": outputs,
                },
                {
                    "op": "add",
                    "path": format!("/logs/{key}/end_time"),
                    "value": Utc::now().to_rfc3339(),
                },
            ])));
        }
        Ok(())
    }

    async fn on_run_error(
        &self,
        error: &str,
        run_id: Uuid,
        _parent_run_id: Option<Uuid>,
    ) -> Result<()> {
        let inner = self.inner.lock();
        if inner.root_id == Some(run_id) {
            // The driver surfaces the root error on the patch stream itself.
            return Ok(());
        }
        if let Some(key) = inner.keys.get(&run_id) {
            let key = escape_pointer_token(key);
            self.send(RunLogPatch::from_ops(json!([
                {
                    "op": "add",
                    "path": format!("/logs/{key}/error"),
                    "value": error,
                },
                {
                    "op": "add",
                    "path": format!("/logs/{key}/end_time"),
                    "value": Utc::now().to_rfc3339(),
                },
            ])));
        }
        Ok(())
    }
}

/// Drive one execution and stream its patch log.
///
/// The runnable is executed via `stream`; its output chunks become root
/// `streamed_output` patches and its error, if any, terminates the patch
/// stream with that error.
pub async fn stream_log<R>(
    runnable: R,
    input: R::Input,
    config: Option<RunnableConfig>,
    options: StreamEventsOptions,
) -> Result<OutputStream<RunLogPatch>>
where
    R: Runnable + 'static,
    R::Input: Serialize,
    R::Output: Serialize,
{
    let (tx, mut rx) = mpsc::unbounded_channel::<Result<RunLogPatch>>();
    let handler = Arc::new(LogStreamCallbackHandler::new(tx.clone(), options));
    let config = config.unwrap_or_default().with_callback(handler);

    tokio::spawn(async move {
        match runnable.stream(input, Some(config)).await {
            Ok(mut stream) => {
                while let Some(item) = stream.next().await {
                    match item {
                        Ok(chunk) => {
                            let patch = serde_json::to_value(&chunk)
                                .map_err(Error::from)
                                .and_then(|value| {
                                    RunLogPatch::from_ops(json!([{
                                        "op": "add",
                                        "path": "/streamed_output/-",
                                        "value": value,
                                    }]))
                                });
                            let _ = tx.send(patch);
                        }
                        Err(e) => {
                            let _ = tx.send(Err(e));
                            break;
                        }
                    }
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

/// Identity of a run as recorded in the log, cached for event synthesis.
#[derive(Clone)]
struct EventIdentity {
    event_type: String,
    name: String,
    run_id: Uuid,
    tags: Vec<String>,
    metadata: HashMap<String, serde_json::Value>,
}

impl EventIdentity {
    fn event(&self, phase: &str, data: StreamEventData) -> StreamEvent {
        StreamEvent {
            event: format!("on_{}_{phase}", self.event_type),
            name: self.name.clone(),
            run_id: self.run_id,
            tags: self.tags.clone(),
            metadata: self.metadata.clone(),
            data,
        }
    }
}

fn identity_from_entry(value: &serde_json::Value) -> Result<EventIdentity> {
    let entry: LogEntry = serde_json::from_value(value.clone())?;
    Ok(EventIdentity {
        event_type: entry.run_type,
        name: entry.name,
        run_id: entry.id,
        tags: entry.tags,
        metadata: entry.metadata,
    })
}

/// Derive v1 `stream_events` from the patch log.
///
/// Each patch is folded into the log; its ops are mapped to events. The
/// root's end event is held back and emitted last, after every streamed
/// chunk.
pub async fn stream_events_v1<R>(
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
    let input_snapshot = serde_json::to_value(&input).unwrap_or(serde_json::Value::Null);
    let filter = options.clone();
    let patches = stream_log(runnable, input, config, options).await?;
    Ok(derive_events(patches, input_snapshot, filter))
}

/// Map a patch stream onto v1 events, folding each patch as it arrives.
fn derive_events(
    mut patches: OutputStream<RunLogPatch>,
    input_snapshot: serde_json::Value,
    options: StreamEventsOptions,
) -> OutputStream<StreamEvent> {
    Box::pin(async_stream::stream! {
        let mut log = RunLog::new();
        let mut root: Option<EventIdentity> = None;
        let mut root_admitted = true;
        let mut root_output: Option<serde_json::Value> = None;
        let mut identities: HashMap<String, EventIdentity> = HashMap::new();

        while let Some(item) = patches.next().await {
            let patch = match item {
                Ok(patch) => patch,
                Err(e) => {
                    yield Err(e);
                    return;
                }
            };
            let ops = match patch.ops_json() {
                Ok(serde_json::Value::Array(ops)) => ops,
                Ok(_) => {
                    yield Err(Error::Protocol("patch ops are not a list".into()));
                    return;
                }
                Err(e) => {
                    yield Err(e);
                    return;
                }
            };
            log = match log.concat(&patch) {
                Ok(log) => log,
                Err(e) => {
                    yield Err(e);
                    return;
                }
            };

            let mut chunk_counts: HashMap<String, usize> = HashMap::new();
            for op in &ops {
                let path = op["path"].as_str().unwrap_or_default();
                if let Some(key) = path
                    .strip_prefix("/logs/")
                    .and_then(|rest| rest.strip_suffix("/streamed_output/-"))
                {
                    *chunk_counts.entry(key.to_string()).or_insert(0) += 1;
                } else if path == "/streamed_output/-" {
                    *chunk_counts.entry(String::new()).or_insert(0) += 1;
                }
            }
            if chunk_counts.values().any(|&count| count > 1) {
                yield Err(Error::Protocol(
                    "expected exactly one streamed output chunk per patch".into(),
                ));
                return;
            }

            for op in ops {
                let path = op["path"].as_str().unwrap_or_default().to_string();
                if path.is_empty() {
                    // Root start: the whole document was replaced.
                    let identity = EventIdentity {
                        event_type: op["value"]["type"].as_str().unwrap_or("chain").to_string(),
                        name: op["value"]["name"].as_str().unwrap_or_default().to_string(),
                        run_id: op["value"]["id"]
                            .as_str()
                            .and_then(|s| Uuid::parse_str(s).ok())
                            .unwrap_or_default(),
                        tags: Vec::new(),
                        metadata: HashMap::new(),
                    };
                    root_admitted = RunType::from_name(&identity.event_type)
                        .map_or(true, |rt| options.admits(&identity.name, rt, &[]));
                    if root_admitted {
                        yield Ok(identity.event(
                            "start",
                            StreamEventData {
                                input: Some(input_snapshot.clone()),
                                ..Default::default()
                            },
                        ));
                    }
                    root = Some(identity);
                } else if path == "/streamed_output/-" {
                    if let Some(root) = &root {
                        if root_admitted {
                            yield Ok(root.event(
                                "stream",
                                StreamEventData {
                                    chunk: Some(op["value"].clone()),
                                    ..Default::default()
                                },
                            ));
                        }
                    }
                } else if path == "/final_output" {
                    root_output = Some(op["value"].clone());
                } else if let Some(rest) = path.strip_prefix("/logs/") {
                    if let Some(key) = rest.strip_suffix("/streamed_output/-") {
                        if let Some(identity) = identities.get(key) {
                            yield Ok(identity.event(
                                "stream",
                                StreamEventData {
                                    chunk: Some(op["value"].clone()),
                                    ..Default::default()
                                },
                            ));
                        }
                    } else if let Some(key) = rest.strip_suffix("/final_output") {
                        if let Some(identity) = identities.get(key) {
                            yield Ok(identity.event(
                                "end",
                                StreamEventData {
                                    output: Some(op["value"].clone()),
                                    ..Default::default()
                                },
                            ));
                        }
                    } else if !rest.contains('/') {
                        // New child entry.
                        match identity_from_entry(&op["value"]) {
                            Ok(identity) => {
                                yield Ok(identity.event("start", StreamEventData::default()));
                                identities.insert(rest.to_string(), identity);
                            }
                            Err(e) => {
                                yield Err(e);
                                return;
                            }
                        }
                    }
                }
            }
        }

        if let Some(root) = root {
            if root_admitted {
                yield Ok(root.event(
                    "end",
                    StreamEventData {
                        output: root_output,
                        ..Default::default()
                    },
                ));
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runnable::RunnableLambda;

    fn chain() -> crate::runnable::RunnableSequence<i32, i32> {
        RunnableLambda::new(|x: i32| x * 2)
            .with_name("double")
            .pipe(RunnableLambda::new(|x: i32| x + 1).with_name("inc"))
            .with_name("math")
    }

    async fn collect_patches(
        stream: OutputStream<RunLogPatch>,
    ) -> Vec<RunLogPatch> {
        stream.map(|r| r.unwrap()).collect().await
    }

    // ==================== Patch Log Tests ====================

    #[tokio::test]
    async fn test_patches_fold_into_full_document() {
        let patches = stream_log(chain(), 3, None, StreamEventsOptions::v1())
            .await
            .unwrap();
        let patches = collect_patches(patches).await;
        assert!(!patches.is_empty());

        let mut log = RunLog::new();
        for patch in &patches {
            log = log.concat(patch).unwrap();
        }
        let state = log.state;
        assert_eq!(state["name"], json!("math"));
        assert_eq!(state["type"], json!("chain"));
        assert_eq!(state["final_output"], json!(7));
        assert_eq!(state["streamed_output"], json!([7]));
        assert_eq!(state["logs"]["double"]["final_output"], json!(6));
        assert_eq!(state["logs"]["inc"]["final_output"], json!(7));
        assert!(state["logs"]["inc"]["end_time"].is_string());
    }

    #[tokio::test]
    async fn test_duplicate_names_get_numbered_keys() {
        let twice = RunnableLambda::new(|x: i32| x + 1)
            .with_name("step")
            .pipe(RunnableLambda::new(|x: i32| x + 1).with_name("step"));
        let patches = stream_log(twice, 0, None, StreamEventsOptions::v1())
            .await
            .unwrap();
        let patches = collect_patches(patches).await;

        let mut log = RunLog::new();
        for patch in &patches {
            log = log.concat(patch).unwrap();
        }
        assert!(log.state["logs"]["step"].is_object());
        assert!(log.state["logs"]["step:2"].is_object());
    }

    #[tokio::test]
    async fn test_include_names_filters_entries() {
        let options = StreamEventsOptions::v1().with_include_names(vec!["inc".into()]);
        let patches = stream_log(chain(), 3, None, options).await.unwrap();
        let patches = collect_patches(patches).await;

        let mut log = RunLog::new();
        for patch in &patches {
            log = log.concat(patch).unwrap();
        }
        assert!(log.state["logs"]["inc"].is_object());
        assert!(log.state["logs"].get("double").is_none());
        // The root document is always present.
        assert_eq!(log.state["name"], json!("math"));
    }

    #[tokio::test]
    async fn test_execution_error_terminates_patch_stream() {
        let failing = crate::runnable::RunnableTryLambda::new(|_: i32| -> Result<i32> {
            Err(Error::work("dead"))
        });
        let mut patches = stream_log(failing, 1, None, StreamEventsOptions::v1())
            .await
            .unwrap();

        let mut saw_error = false;
        while let Some(item) = patches.next().await {
            if let Err(e) = item {
                assert_eq!(e.to_string(), "dead");
                saw_error = true;
            }
        }
        assert!(saw_error);
    }

    // ==================== v1 Event Tests ====================

    #[tokio::test]
    async fn test_v1_events_for_two_step_sequence() {
        let events = stream_events_v1(chain(), 3, None, StreamEventsOptions::v1())
            .await
            .unwrap();
        let events: Vec<StreamEvent> = events.map(|r| r.unwrap()).collect().await;
        let names: Vec<(&str, &str)> = events
            .iter()
            .map(|e| (e.event.as_str(), e.name.as_str()))
            .collect();

        assert_eq!(
            names,
            vec![
                ("on_chain_start", "math"),
                ("on_chain_start", "double"),
                ("on_chain_end", "double"),
                ("on_chain_start", "inc"),
                ("on_chain_end", "inc"),
                ("on_chain_stream", "math"),
                ("on_chain_end", "math"),
            ]
        );

        assert_eq!(events[0].data.input, Some(json!(3)));
        assert_eq!(events[2].data.output, Some(json!(6)));
        assert_eq!(events[5].data.chunk, Some(json!(7)));
        let last = events.last().unwrap();
        assert_eq!(last.data.output, Some(json!(7)));
        // The root end event carries the output only.
        assert_eq!(last.data.input, None);
    }

    #[tokio::test]
    async fn test_v1_multi_chunk_patch_is_protocol_error() {
        let root_id = Uuid::new_v4();
        let open = RunLogPatch::from_ops(json!([{
            "op": "replace",
            "path": "",
            "value": {
                "id": root_id,
                "name": "root",
                "type": "chain",
                "streamed_output": [],
                "final_output": null,
                "logs": {},
            },
        }]))
        .unwrap();
        // Two chunks for the same run in one patch violate the protocol.
        let doubled = RunLogPatch::from_ops(json!([
            {"op": "add", "path": "/streamed_output/-", "value": "a"},
            {"op": "add", "path": "/streamed_output/-", "value": "b"},
        ]))
        .unwrap();
        let patches: OutputStream<RunLogPatch> =
            Box::pin(futures::stream::iter(vec![Ok(open), Ok(doubled)]));

        let mut events = derive_events(patches, json!(null), StreamEventsOptions::v1());
        let first = events.next().await.unwrap().unwrap();
        assert_eq!(first.event, "on_chain_start");
        let err = loop {
            match events.next().await {
                Some(Err(e)) => break e,
                Some(Ok(_)) => {}
                None => panic!("event stream ended without a protocol error"),
            }
        };
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[tokio::test]
    async fn test_v1_filters_can_suppress_root_events() {
        let options = StreamEventsOptions::v1().with_exclude_names(vec!["math".into()]);
        let events = stream_events_v1(chain(), 3, None, options).await.unwrap();
        let events: Vec<StreamEvent> = events.map(|r| r.unwrap()).collect().await;

        assert!(events.iter().all(|e| e.name != "math"));
        assert!(events.iter().any(|e| e.name == "double"));
        assert!(events.iter().any(|e| e.name == "inc"));
    }

    #[tokio::test]
    async fn test_failed_child_run_is_closed_in_the_log() {
        let backup: crate::runnable::DynRunnable<i32, i32> =
            Arc::new(RunnableLambda::new(|x: i32| x + 1).with_name("backup"));
        let guarded = crate::runnable::RunnableTryLambda::new(|_: i32| -> Result<i32> {
            Err(Error::work("down"))
        })
        .with_name("flaky")
        .with_fallbacks(vec![backup]);

        let patches = stream_log(guarded, 1, None, StreamEventsOptions::v1())
            .await
            .unwrap();
        let patches = collect_patches(patches).await;

        let mut log = RunLog::new();
        for patch in &patches {
            log = log.concat(patch).unwrap();
        }
        assert_eq!(log.state["logs"]["flaky"]["error"], json!("down"));
        assert!(log.state["logs"]["flaky"]["end_time"].is_string());
        assert!(log.state["logs"]["flaky"].get("final_output").is_none());
        assert_eq!(log.state["logs"]["backup"]["final_output"], json!(2));
        assert_eq!(log.state["final_output"], json!(2));
    }
}
