//! Caller-visible result stream.
//!
//! Wraps the pipeline's row channel. Rows come out one at a time, in
//! server order, bounded by the query deadline; trailing metadata is
//! only observable once the stream has fully drained. Cancelling is
//! idempotent and routes through the query's composite abort signal.

use std::marker::PhantomData;

use serde::Deserialize;
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;

use crate::cancel::AbortSignal;
use crate::duration::parse_duration;
use crate::error::{Error, Result};
use crate::query::classify::classify_server_errors;
use crate::query::context::{SharedContext, decorate};
use crate::query::retry::Deadline;

/// Pipeline-to-stream events. The pump task produces them; the
/// attempt executor peeks the first one, the [`QueryResult`] consumes
/// the rest.
#[derive(Debug)]
pub(crate) enum RowEvent {
    /// One standalone row fragment.
    Row(String),
    /// The response's `errors` array, non-empty, as raw fragments.
    Errors(Vec<String>),
    /// Clean end of stream with the parsed trailing metadata.
    End(Box<QueryMetadata>),
    Failed(PipelineFailure),
}

/// Failures the pump can hit while the body is streaming.
#[derive(Debug, Clone)]
pub(crate) enum PipelineFailure {
    /// Reading the response body failed.
    Transport(String),
    /// The body was not well-formed JSON.
    Parse(String),
    Aborted,
}

/// Trailing query metadata, parsed from the residual document once the
/// row stream ends.
#[derive(Debug, Clone)]
pub struct QueryMetadata {
    pub request_id: String,
    pub status: Option<String>,
    pub warnings: Vec<QueryWarning>,
    pub metrics: QueryMetrics,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct QueryWarning {
    #[serde(default)]
    pub code: i32,
    #[serde(default)]
    pub message: String,
}

/// Server-side execution metrics. Durations are in fractional
/// milliseconds.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryMetrics {
    pub elapsed_time: f64,
    pub execution_time: f64,
    pub compile_time: f64,
    pub queue_wait_time: f64,
    pub result_count: u64,
    pub result_size: u64,
    pub processed_objects: u64,
}

#[derive(Deserialize)]
struct RawMetadata {
    #[serde(rename = "requestID")]
    request_id: Option<String>,
    status: Option<String>,
    #[serde(default)]
    warnings: Vec<QueryWarning>,
    metrics: Option<RawMetrics>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawMetrics {
    elapsed_time: Option<String>,
    execution_time: Option<String>,
    compile_time: Option<String>,
    queue_wait_time: Option<String>,
    result_count: Option<u64>,
    result_size: Option<u64>,
    processed_objects: Option<u64>,
}

impl QueryMetadata {
    /// Parse the parser's residual document.
    pub(crate) fn from_residual(residual: &str) -> Result<Self> {
        let raw: RawMetadata = serde_json::from_str(residual)
            .map_err(|e| Error::Analytics(format!("invalid query metadata: {e}")))?;
        let request_id = raw
            .request_id
            .ok_or_else(|| Error::Analytics("query metadata is missing requestID".into()))?;
        let metrics = match raw.metrics {
            Some(raw_metrics) => QueryMetrics::from_raw(raw_metrics)?,
            None => QueryMetrics::default(),
        };
        Ok(Self {
            request_id,
            status: raw.status,
            warnings: raw.warnings,
            metrics,
        })
    }
}

impl QueryMetrics {
    fn from_raw(raw: RawMetrics) -> Result<Self> {
        Ok(Self {
            elapsed_time: parse_metric_duration(raw.elapsed_time)?,
            execution_time: parse_metric_duration(raw.execution_time)?,
            compile_time: parse_metric_duration(raw.compile_time)?,
            queue_wait_time: parse_metric_duration(raw.queue_wait_time)?,
            result_count: raw.result_count.unwrap_or_default(),
            result_size: raw.result_size.unwrap_or_default(),
            processed_objects: raw.processed_objects.unwrap_or_default(),
        })
    }
}

fn parse_metric_duration(value: Option<String>) -> Result<f64> {
    match value {
        Some(text) => parse_duration(&text)
            .map_err(|e| Error::Analytics(format!("invalid duration in query metrics: {e}"))),
        None => Ok(0.0),
    }
}

/// Turns raw row fragments into caller values. The serde-backed
/// implementations cover the common cases; anything else plugs in at
/// this seam.
pub trait RowDeserializer {
    type Output;
    fn deserialize_row(&self, fragment: &str) -> Result<Self::Output>;
}

/// Deserialize rows into `serde_json::Value`.
pub struct JsonRowDeserializer;

impl RowDeserializer for JsonRowDeserializer {
    type Output = serde_json::Value;

    fn deserialize_row(&self, fragment: &str) -> Result<serde_json::Value> {
        serde_json::from_str(fragment)
            .map_err(|e| Error::Analytics(format!("failed to deserialize row: {e}")))
    }
}

/// Deserialize rows into any `serde`-deserializable type.
pub struct TypedRowDeserializer<T> {
    marker: PhantomData<T>,
}

impl<T> TypedRowDeserializer<T> {
    pub fn new() -> Self {
        Self {
            marker: PhantomData,
        }
    }
}

impl<T> Default for TypedRowDeserializer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: DeserializeOwned> RowDeserializer for TypedRowDeserializer<T> {
    type Output = T;

    fn deserialize_row(&self, fragment: &str) -> Result<T> {
        serde_json::from_str(fragment)
            .map_err(|e| Error::Analytics(format!("failed to deserialize row: {e}")))
    }
}

/// Handle to one executed query: the row stream, cancellation, and the
/// trailing metadata.
pub struct QueryResult {
    rx: mpsc::Receiver<RowEvent>,
    /// The row the executor peeked to establish readability.
    pending: Option<String>,
    metadata: Option<QueryMetadata>,
    finished: bool,
    ctx: SharedContext,
    deadline: Deadline,
    abort: AbortSignal,
}

impl std::fmt::Debug for QueryResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryResult")
            .field("pending", &self.pending)
            .field("metadata", &self.metadata)
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

impl QueryResult {
    pub(crate) fn new(
        rx: mpsc::Receiver<RowEvent>,
        pending: Option<String>,
        metadata: Option<QueryMetadata>,
        ctx: SharedContext,
        deadline: Deadline,
        abort: AbortSignal,
    ) -> Self {
        let finished = metadata.is_some();
        Self {
            rx,
            pending,
            metadata,
            finished,
            ctx,
            deadline,
            abort,
        }
    }

    /// Next row fragment, in server order. `None` once the stream has
    /// ended; a terminal error ends the stream too.
    pub async fn next_row(&mut self) -> Option<Result<String>> {
        if let Some(row) = self.pending.take() {
            return Some(Ok(row));
        }
        if self.finished {
            return None;
        }

        let received = tokio::time::timeout_at(self.deadline.instant(), self.rx.recv()).await;
        let event = match received {
            Err(_elapsed) => {
                self.finished = true;
                self.abort.abort();
                let error = Error::Timeout("analytics query timed out while streaming".into());
                return Some(Err(self.decorated(error)));
            }
            Ok(event) => event,
        };

        match event {
            Some(RowEvent::Row(fragment)) => Some(Ok(fragment)),
            Some(RowEvent::End(metadata)) => {
                self.metadata = Some(*metadata);
                self.finished = true;
                None
            }
            Some(RowEvent::Errors(entries)) => {
                self.finished = true;
                let behaviour = {
                    let mut guard = self.ctx.lock().unwrap();
                    classify_server_errors(
                        entries.into_iter().map(serde_json::Value::String).collect(),
                        &mut guard,
                    )
                };
                Some(Err(self.decorated(behaviour.error)))
            }
            Some(RowEvent::Failed(failure)) => {
                self.finished = true;
                Some(Err(self.pipeline_error(failure)))
            }
            None => {
                self.finished = true;
                let error = Error::Analytics("row stream ended unexpectedly".into());
                Some(Err(self.decorated(error)))
            }
        }
    }

    /// Next row run through `deserializer`.
    pub async fn next_row_with<D: RowDeserializer>(
        &mut self,
        deserializer: &D,
    ) -> Option<Result<D::Output>> {
        let fragment = match self.next_row().await? {
            Ok(fragment) => fragment,
            Err(e) => return Some(Err(e)),
        };
        Some(deserializer.deserialize_row(&fragment))
    }

    /// Next row deserialized into `T`.
    pub async fn next_row_as<T: DeserializeOwned>(&mut self) -> Option<Result<T>> {
        self.next_row_with(&TypedRowDeserializer::<T>::new()).await
    }

    /// Cancel the query. Idempotent; the in-flight request and the
    /// pipeline tear down with [`Error::Aborted`].
    pub fn cancel(&self) {
        self.abort.abort();
    }

    /// Trailing metadata. Fails until the row stream has fully
    /// drained; after a mid-stream failure it keeps failing, since the
    /// stream never reached its end.
    pub fn metadata(&self) -> Result<&QueryMetadata> {
        self.metadata.as_ref().ok_or_else(|| {
            Error::Analytics("metadata is only available once all rows have been streamed".into())
        })
    }

    fn decorated(&self, error: Error) -> Error {
        let guard = self.ctx.lock().unwrap();
        decorate(error, &guard)
    }

    fn pipeline_error(&self, failure: PipelineFailure) -> Error {
        match failure {
            PipelineFailure::Aborted => Error::Aborted,
            PipelineFailure::Transport(message) => {
                self.decorated(Error::Analytics(format!("response stream failed: {message}")))
            }
            PipelineFailure::Parse(message) => {
                self.decorated(Error::Analytics(message))
            }
        }
    }
}
