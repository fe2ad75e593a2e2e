//! One HTTP POST attempt against one resolved address.
//!
//! An attempt covers: obtain an address from the DNS pool, dispatch
//! the request, inspect the response headers, and bind the body to the
//! tokenizer → parser → row-channel pipeline. The attempt resolves as
//! soon as the stream is readable — the first row has arrived, or the
//! stream ended with zero rows — and rejects with a classifiable
//! [`AttemptFailure`] otherwise. A non-empty `errors` array observed
//! before the handoff fails the attempt; afterwards it fails the row
//! iterator instead.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::Credential;
use crate::cancel::AbortSignal;
use crate::http::Transport;
use crate::http::dns::{DnsError, DnsPool};
use crate::query::classify::AttemptFailure;
use crate::query::context::SharedContext;
use crate::query::retry::Deadline;
use crate::stream::parser::{ParseEmit, StreamParser};
use crate::stream::result::{PipelineFailure, QueryMetadata, QueryResult, RowEvent};
use crate::stream::tokenizer::JsonTokenizer;

/// Row buffering between the pump task and the caller. Small: rows are
/// delivered eagerly, backpressure reaches the socket quickly.
const ROW_CHANNEL_CAPACITY: usize = 16;

/// Cap on response-body text quoted into diagnostics.
const BODY_SNIPPET_LIMIT: usize = 512;

#[allow(clippy::too_many_arguments)]
pub(crate) async fn execute_attempt(
    transport: Arc<Transport>,
    pool: Arc<tokio::sync::Mutex<DnsPool>>,
    body: Arc<String>,
    credential: Credential,
    priority: bool,
    deadline: Deadline,
    ctx: SharedContext,
    abort: AbortSignal,
) -> std::result::Result<QueryResult, AttemptFailure> {
    let address = {
        let mut pool = pool.lock().await;
        let address = match pool.maybe_update_and_get().await {
            Ok(address) => address,
            Err(DnsError::Resolve { hostname, message }) => {
                return Err(AttemptFailure::Resolution { hostname, message });
            }
            Err(DnsError::Exhausted { hostname }) => {
                return Err(AttemptFailure::DnsExhausted { hostname });
            }
        };
        pool.mark_used(address);
        address
    };
    ctx.lock().unwrap().last_dispatched_to = Some(address.to_string());

    let client = transport
        .client_for(address)
        .map_err(|e| AttemptFailure::Other(e.to_string()))?;

    debug!(%address, url = %transport.query_url(), "dispatching analytics attempt");
    trace!(bytes = body.len(), "request payload size");

    let mut request = client
        .post(transport.query_url())
        .basic_auth(&credential.username, Some(&credential.password))
        .header(reqwest::header::CONTENT_TYPE, "application/json")
        .body(body.as_str().to_owned());
    if priority {
        request = request.header("Analytics-Priority", "-1");
    }

    let response = tokio::select! {
        _ = abort.fired() => return Err(AttemptFailure::Aborted),
        sent = request.send() => sent.map_err(|e| map_send_error(e, address))?,
    };

    let status = response.status();
    {
        let mut guard = ctx.lock().unwrap();
        guard.status_code = Some(status.as_u16());
        if let Some(remote) = response.remote_addr() {
            guard.last_dispatched_to = Some(remote.to_string());
        }
    }
    debug!(status = status.as_u16(), "analytics response headers");

    if status == reqwest::StatusCode::UNAUTHORIZED {
        let text = buffered_body(response, &abort).await;
        return Err(AttemptFailure::HttpStatus {
            status: 401,
            body: truncate_snippet(&text),
        });
    }
    if !status.is_success() {
        // Buffer the failed response whole: it may carry a server
        // errors array, which classifies more precisely than the bare
        // status. Only the diagnostic fallback gets truncated.
        let text = buffered_body(response, &abort).await;
        if let Ok(document) = serde_json::from_str::<serde_json::Value>(&text)
            && let Some(entries) = document.get("errors").and_then(|e| e.as_array())
            && !entries.is_empty()
        {
            return Err(AttemptFailure::ServerErrors(entries.clone()));
        }
        return Err(AttemptFailure::HttpStatus {
            status: status.as_u16(),
            body: truncate_snippet(&text),
        });
    }

    let (tx, mut rx) = mpsc::channel(ROW_CHANNEL_CAPACITY);
    tokio::spawn(pump(response, tx, abort.clone()));

    // The attempt resolves once the stream signals readable: a first
    // row, a clean zero-row end, or a failure to hand to the
    // classifier.
    match rx.recv().await {
        Some(RowEvent::Row(fragment)) => Ok(QueryResult::new(
            rx,
            Some(fragment),
            None,
            ctx,
            deadline,
            abort,
        )),
        Some(RowEvent::End(metadata)) => Ok(QueryResult::new(
            rx,
            None,
            Some(*metadata),
            ctx,
            deadline,
            abort,
        )),
        Some(RowEvent::Errors(entries)) => Err(AttemptFailure::ServerErrors(
            entries.into_iter().map(serde_json::Value::String).collect(),
        )),
        Some(RowEvent::Failed(PipelineFailure::Aborted)) => Err(AttemptFailure::Aborted),
        Some(RowEvent::Failed(PipelineFailure::Transport(message))) => {
            Err(AttemptFailure::Transport {
                cause_chain: message.clone(),
                message,
            })
        }
        Some(RowEvent::Failed(PipelineFailure::Parse(message))) => {
            Err(AttemptFailure::Other(message))
        }
        None => Err(AttemptFailure::Other(
            "response pipeline closed unexpectedly".into(),
        )),
    }
}

/// Read the response body chunk-by-chunk through the JSON pipeline,
/// emitting events on the row channel. Ends with `End`, `Errors`, or
/// `Failed`; tears down silently when the receiver is gone.
async fn pump(mut response: reqwest::Response, tx: mpsc::Sender<RowEvent>, abort: AbortSignal) {
    let mut tokenizer = JsonTokenizer::new();
    let mut parser = StreamParser::new();

    let outcome = async {
        loop {
            let chunk = tokio::select! {
                _ = abort.fired() => return Err(PipelineFailure::Aborted),
                chunk = response.chunk() => {
                    chunk.map_err(|e| PipelineFailure::Transport(error_chain(&e)))?
                }
            };
            let Some(chunk) = chunk else {
                break;
            };
            tokenizer.push(&chunk);
            if !drain_tokens(&mut tokenizer, &mut parser, &tx, &abort).await? {
                return Ok(None);
            }
        }

        tokenizer.end_of_input();
        if !drain_tokens(&mut tokenizer, &mut parser, &tx, &abort).await? {
            return Ok(None);
        }
        tokenizer
            .ensure_complete()
            .map_err(|e| PipelineFailure::Parse(e.to_string()))?;
        let residual = parser
            .finish()
            .map_err(|e| PipelineFailure::Parse(e.to_string()))?;
        trace!(bytes = residual.len(), "response residual document");
        let metadata = QueryMetadata::from_residual(&residual)
            .map_err(|e| PipelineFailure::Parse(e.to_string()))?;
        Ok(Some(metadata))
    }
    .await;

    match outcome {
        Ok(Some(metadata)) => {
            let _ = tx.send(RowEvent::End(Box::new(metadata))).await;
        }
        // Errors were already signalled, or the receiver is gone.
        Ok(None) => {}
        Err(failure) => {
            let _ = tx.send(RowEvent::Failed(failure)).await;
        }
    }
}

/// Feed buffered tokens through the parser. Returns `Ok(false)` when
/// pumping should stop: a non-empty errors array was signalled, or the
/// receiver went away.
async fn drain_tokens(
    tokenizer: &mut JsonTokenizer,
    parser: &mut StreamParser,
    tx: &mpsc::Sender<RowEvent>,
    abort: &AbortSignal,
) -> std::result::Result<bool, PipelineFailure> {
    loop {
        let token = tokenizer
            .next_token()
            .map_err(|e| PipelineFailure::Parse(e.to_string()))?;
        let Some(token) = token else {
            return Ok(true);
        };
        let emit = parser
            .accept(token)
            .map_err(|e| PipelineFailure::Parse(e.to_string()))?;
        match emit {
            Some(ParseEmit::Row(fragment)) => {
                if !send_event(tx, abort, RowEvent::Row(fragment)).await {
                    return Ok(false);
                }
            }
            Some(ParseEmit::ErrorsComplete(entries)) if !entries.is_empty() => {
                send_event(tx, abort, RowEvent::Errors(entries)).await;
                return Ok(false);
            }
            // An empty errors array is not a failure.
            Some(ParseEmit::ErrorsComplete(_)) | None => {}
        }
    }
}

/// Bounded send that gives up when the query is aborted or the
/// receiver is dropped.
async fn send_event(tx: &mpsc::Sender<RowEvent>, abort: &AbortSignal, event: RowEvent) -> bool {
    tokio::select! {
        _ = abort.fired() => false,
        sent = tx.send(event) => sent.is_ok(),
    }
}

/// Buffer a failed response body in full, so the errors-array probe
/// sees the complete document.
async fn buffered_body(response: reqwest::Response, abort: &AbortSignal) -> String {
    tokio::select! {
        _ = abort.fired() => String::new(),
        text = response.text() => text.unwrap_or_default(),
    }
}

/// Cap body text quoted into diagnostics, cutting on a char boundary.
fn truncate_snippet(text: &str) -> String {
    if text.len() <= BODY_SNIPPET_LIMIT {
        return text.to_string();
    }
    let mut end = BODY_SNIPPET_LIMIT;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    text[..end].to_string()
}

fn map_send_error(error: reqwest::Error, address: SocketAddr) -> AttemptFailure {
    let chain = error_chain(&error);
    if error.is_connect() && (error.is_timeout() || chain.contains("timed out")) {
        return AttemptFailure::ConnectTimeout {
            address: address.to_string(),
        };
    }
    AttemptFailure::Transport {
        message: error.to_string(),
        cause_chain: chain,
    }
}

/// Render an error with its full source chain; the classifier's
/// deny-list matches against this.
fn error_chain(error: &dyn std::error::Error) -> String {
    let mut rendered = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        rendered.push_str(": ");
        rendered.push_str(&cause.to_string());
        source = cause.source();
    }
    rendered
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_chain_renders_all_causes() {
        let leaf = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset by peer");
        let wrapped = std::io::Error::other(leaf);
        let rendered = error_chain(&wrapped);
        assert!(rendered.contains("reset by peer"));
    }

    #[test]
    fn short_snippets_pass_through_untruncated() {
        let text = "a".repeat(BODY_SNIPPET_LIMIT);
        assert_eq!(truncate_snippet(&text), text);
    }

    #[test]
    fn oversized_snippets_truncate_on_a_char_boundary() {
        // 'é' is two bytes, so the limit lands mid-char.
        let text = "é".repeat(BODY_SNIPPET_LIMIT);
        let snippet = truncate_snippet(&text);
        assert!(snippet.len() < BODY_SNIPPET_LIMIT + 1);
        assert!(snippet.chars().all(|c| c == 'é'));
    }
}
