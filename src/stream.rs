//! Streaming and chunk-concatenation engine
//!
//! Lazy-sequence plumbing shared by every streaming code path:
//!
//! - [`ChunkConcat`] and [`concat_json`] define the best-effort merge of
//!   successive chunks into one accumulated final value (string concatenation,
//!   array append, recursive object merge). Concatenation is used for trace
//!   and event payloads only; the chunk stream itself never depends on it.
//! - [`buffer_first`] eagerly advances a stream to its first yield point so a
//!   setup error surfaces from the `stream()` call itself rather than from the
//!   first chunk pull.
//! - [`trace_output_stream`] wraps a run's output stream, reporting each chunk
//!   to the callback manager and closing the run when the stream is exhausted
//!   or fails.

use std::collections::HashMap;
use std::pin::Pin;

use futures::stream::Stream;
use futures::StreamExt;
use serde::Serialize;
use uuid::Uuid;

use crate::callbacks::CallbackManager;
use crate::error::Result;

/// Boxed fallible output stream, the crate's lazy-sequence primitive.
pub type OutputStream<T> = Pin<Box<dyn Stream<Item = Result<T>> + Send>>;

/// Best-effort merge of two chunks of the same type.
///
/// Returns `None` when the two values cannot be merged; callers decide whether
/// that means "stop tracking" (trace payloads) or "keep the later chunk"
/// (default transform buffering).
pub trait ChunkConcat: Sized {
    /// Merge `next` onto `self`, if the type supports it.
    fn concat(&self, next: &Self) -> Option<Self>;
}

impl ChunkConcat for String {
    fn concat(&self, next: &Self) -> Option<Self> {
        let mut merged = self.clone();
        merged.push_str(next);
        Some(merged)
    }
}

impl<T: Clone> ChunkConcat for Vec<T> {
    fn concat(&self, next: &Self) -> Option<Self> {
        let mut merged = self.clone();
        merged.extend(next.iter().cloned());
        Some(merged)
    }
}

impl ChunkConcat for serde_json::Value {
    fn concat(&self, next: &Self) -> Option<Self> {
        concat_json(self, next)
    }
}

impl<V: ChunkConcat + Clone> ChunkConcat for HashMap<String, V> {
    fn concat(&self, next: &Self) -> Option<Self> {
        let mut merged = self.clone();
        for (key, value) in next {
            match merged.get(key) {
                Some(existing) => {
                    let combined = existing.concat(value).unwrap_or_else(|| value.clone());
                    merged.insert(key.clone(), combined);
                }
                None => {
                    merged.insert(key.clone(), value.clone());
                }
            }
        }
        Some(merged)
    }
}

macro_rules! not_concatenable {
    ($($ty:ty),*) => {
        $(impl ChunkConcat for $ty {
            fn concat(&self, _next: &Self) -> Option<Self> {
                None
            }
        })*
    };
}

not_concatenable!(i32, i64, u32, u64, usize, f32, f64, bool, ());

/// Merge two JSON chunks: strings concatenate, arrays append, objects merge
/// recursively with the later value winning where keys collide on
/// non-mergeable values. Other combinations are not concatenable.
#[must_use]
pub fn concat_json(acc: &serde_json::Value, next: &serde_json::Value) -> Option<serde_json::Value> {
    use serde_json::Value;
    match (acc, next) {
        (Value::Null, other) => Some(other.clone()),
        (Value::String(a), Value::String(b)) => {
            let mut merged = a.clone();
            merged.push_str(b);
            Some(Value::String(merged))
        }
        (Value::Array(a), Value::Array(b)) => {
            let mut merged = a.clone();
            merged.extend(b.iter().cloned());
            Some(Value::Array(merged))
        }
        (Value::Object(a), Value::Object(b)) => {
            let mut merged = a.clone();
            for (key, value) in b {
                let combined = match merged.get(key) {
                    Some(existing) => concat_json(existing, value).unwrap_or_else(|| value.clone()),
                    None => value.clone(),
                };
                merged.insert(key.clone(), combined);
            }
            Some(Value::Object(merged))
        }
        _ => None,
    }
}

/// Running best-effort accumulation of streamed chunks into one final value.
///
/// Once a chunk fails to concatenate, tracking is abandoned for the rest of
/// the stream and [`finish`](ChunkAggregator::finish) returns `None`.
#[derive(Debug, Default)]
pub struct ChunkAggregator {
    value: Option<serde_json::Value>,
    abandoned: bool,
}

impl ChunkAggregator {
    /// Create an empty aggregator.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one chunk into the running value.
    pub fn push(&mut self, chunk: &serde_json::Value) {
        if self.abandoned {
            return;
        }
        match self.value.take() {
            None => self.value = Some(chunk.clone()),
            Some(running) => match concat_json(&running, chunk) {
                Some(merged) => self.value = Some(merged),
                None => self.abandoned = true,
            },
        }
    }

    /// The accumulated final value, if tracking survived the whole stream.
    #[must_use]
    pub fn finish(self) -> Option<serde_json::Value> {
        self.value
    }
}

/// Eagerly advance `stream` to its first yield point.
///
/// An error produced while the stream sets up (before its first chunk) is
/// returned here; otherwise the buffered first item is stitched back onto the
/// front of the stream.
pub async fn buffer_first<T: Send + 'static>(mut stream: OutputStream<T>) -> Result<OutputStream<T>> {
    match stream.next().await {
        None => Ok(futures::stream::empty().boxed()),
        Some(Err(e)) => Err(e),
        Some(Ok(first)) => Ok(futures::stream::once(async move { Ok(first) })
            .chain(stream)
            .boxed()),
    }
}

/// Wrap a run's output stream with callback bookkeeping.
///
/// Each chunk is reported via `on_run_stream` before being yielded; the run is
/// closed with `on_run_end` (carrying the aggregated final value) when the
/// stream is exhausted, or with `on_run_error` if any item fails. The error
/// case ends the stream: nothing is yielded after the first failure.
pub(crate) fn trace_output_stream<T>(
    inner: OutputStream<T>,
    callback_manager: CallbackManager,
    run_id: Uuid,
) -> OutputStream<T>
where
    T: Serialize + Send + 'static,
{
    Box::pin(async_stream::stream! {
        let mut aggregator = ChunkAggregator::new();
        let mut inner = inner;
        while let Some(item) = inner.next().await {
            match item {
                Ok(chunk) => {
                    if let Ok(value) = serde_json::to_value(&chunk) {
                        aggregator.push(&value);
                        if let Err(e) = callback_manager.on_run_stream(&value, run_id).await {
                            callback_manager.on_run_error(&e.to_string(), run_id).await;
                            yield Err(e);
                            return;
                        }
                    }
                    yield Ok(chunk);
                }
                Err(e) => {
                    callback_manager.on_run_error(&e.to_string(), run_id).await;
                    yield Err(e);
                    return;
                }
            }
        }
        let final_output = aggregator.finish().unwrap_or(serde_json::Value::Null);
        if let Err(e) = callback_manager.on_run_end(&final_output, run_id).await {
            tracing::warn!(run_id = %run_id, error = %e, "Failed to dispatch on_run_end callback");
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use serde_json::json;

    // ==================== Concatenation Tests ====================

    #[test]
    fn test_concat_json_strings() {
        assert_eq!(
            concat_json(&json!("Hello, "), &json!("world")),
            Some(json!("Hello, world"))
        );
    }

    #[test]
    fn test_concat_json_arrays_append() {
        assert_eq!(
            concat_json(&json!([1, 2]), &json!([3])),
            Some(json!([1, 2, 3]))
        );
    }

    #[test]
    fn test_concat_json_objects_merge_recursively() {
        let merged = concat_json(
            &json!({"text": "Hel", "meta": {"a": 1}}),
            &json!({"text": "lo", "meta": {"b": 2}}),
        )
        .unwrap();
        assert_eq!(merged, json!({"text": "Hello", "meta": {"a": 1, "b": 2}}));
    }

    #[test]
    fn test_concat_json_numbers_not_concatenable() {
        assert_eq!(concat_json(&json!(1), &json!(2)), None);
    }

    #[test]
    fn test_aggregator_abandons_after_unsupported_chunk() {
        let mut agg = ChunkAggregator::new();
        agg.push(&json!("a"));
        agg.push(&json!(1));
        agg.push(&json!("b"));
        assert_eq!(agg.finish(), None);
    }

    #[test]
    fn test_typed_chunk_concat() {
        assert_eq!(
            "foo".to_string().concat(&"bar".to_string()),
            Some("foobar".to_string())
        );
        assert_eq!(vec![1].concat(&vec![2, 3]), Some(vec![1, 2, 3]));
        assert_eq!(7i32.concat(&8), None);
    }

    // ==================== Buffering Tests ====================

    #[tokio::test]
    async fn test_buffer_first_surfaces_setup_error() {
        let stream: OutputStream<i32> = Box::pin(futures::stream::once(async {
            Err(Error::InvalidInput("bad input".into()))
        }));
        let result = buffer_first(stream).await;
        assert!(matches!(result, Err(Error::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_buffer_first_preserves_items() {
        let stream: OutputStream<i32> =
            Box::pin(futures::stream::iter(vec![Ok(1), Ok(2), Ok(3)]));
        let buffered = buffer_first(stream).await.unwrap();
        let items: Vec<i32> = buffered.map(|r| r.unwrap()).collect().await;
        assert_eq!(items, vec![1, 2, 3]);
    }
}
