//! Attempt-failure classification.
//!
//! Every way an attempt can fail funnels into [`AttemptFailure`]; the
//! classifier maps it to a retry-or-fail [`RequestBehaviour`] with a
//! typed error, updating the request context's diagnostics along the
//! way. Transport causes are judged by their rendered error chain, the
//! same way the corpus classifies transient HTTP failures: everything
//! is retriable except a fixed deny-list of permanent causes.

use tracing::debug;

use super::context::RequestContext;
use crate::error::Error;

/// One attempt's failure, before classification.
#[derive(Debug, Clone, thiserror::Error)]
pub enum AttemptFailure {
    #[error("HTTP {status}: {body}")]
    HttpStatus { status: u16, body: String },

    /// The socket did not reach the connected state (post-TLS for
    /// HTTPS) within the configured connect timeout.
    #[error("connect timeout dialing {address}")]
    ConnectTimeout { address: String },

    /// Transport-level failure from the HTTP client. `cause_chain` is
    /// the rendered source chain used for the retriability decision.
    #[error("{message}")]
    Transport { message: String, cause_chain: String },

    /// The response carried a non-empty `errors` array. Entries are
    /// raw JSON strings from the streamer, or already-parsed objects
    /// from a buffered body.
    #[error("server reported {} error(s)", .0.len())]
    ServerErrors(Vec<serde_json::Value>),

    /// The pool's hostname resolution failed. Retriable: a later
    /// attempt may hit a recovered resolver. Connect-phase DNS causes
    /// are judged by the deny-list instead.
    #[error("failed to resolve {hostname}: {message}")]
    Resolution { hostname: String, message: String },

    /// Every resolved address has been used by a prior attempt.
    #[error("no unused DNS records remain for {hostname}")]
    DnsExhausted { hostname: String },

    /// An already-typed timeout; passes through the classifier as-is.
    #[error("{0}")]
    Timeout(Error),

    #[error("aborted")]
    Aborted,

    #[error("{0}")]
    Other(String),
}

/// The classifier's verdict.
#[derive(Debug, Clone)]
pub struct RequestBehaviour {
    pub retry: bool,
    pub error: Error,
}

impl RequestBehaviour {
    fn fail(error: Error) -> Self {
        Self { retry: false, error }
    }

    fn retry(error: Error) -> Self {
        Self { retry: true, error }
    }
}

/// Causes that are never worth another attempt: the same hostname,
/// certificate chain, or memory pressure will fail again.
const NON_RETRIABLE_CAUSES: [&str; 10] = [
    "dns error",
    "failed to lookup address",
    "name or service not known",
    "no address associated with hostname",
    "certificate",
    "unknown issuer",
    "invalid peer",
    "hostname mismatch",
    "not valid for name",
    "out of memory",
];

/// Map an attempt failure to retry-or-fail. Pure apart from appending
/// secondary server errors to the context.
pub fn classify(failure: AttemptFailure, ctx: &mut RequestContext) -> RequestBehaviour {
    let behaviour = match failure {
        AttemptFailure::HttpStatus { status: 401, .. } => RequestBehaviour::fail(
            Error::InvalidCredential("server rejected the provided credentials (HTTP 401)".into()),
        ),
        AttemptFailure::HttpStatus { status: 503, body } => RequestBehaviour::retry(
            Error::Analytics(format!("503 received from the analytics service: {body}")),
        ),
        AttemptFailure::HttpStatus { status, body } => {
            RequestBehaviour::fail(Error::Analytics(format!("HTTP {status}: {body}")))
        }
        AttemptFailure::Timeout(error) => RequestBehaviour::fail(error),
        AttemptFailure::ConnectTimeout { address } => RequestBehaviour::retry(Error::Timeout(
            format!("connect timeout dialing {address}"),
        )),
        AttemptFailure::Transport {
            message,
            cause_chain,
        } => {
            if is_retriable_cause(&cause_chain) {
                RequestBehaviour::retry(Error::Analytics(message))
            } else {
                RequestBehaviour::fail(Error::Analytics(message))
            }
        }
        AttemptFailure::Aborted => RequestBehaviour::fail(Error::Aborted),
        AttemptFailure::ServerErrors(entries) => classify_server_errors(entries, ctx),
        AttemptFailure::Resolution { hostname, message } => RequestBehaviour::retry(
            Error::Analytics(format!("failed to resolve {hostname}: {message}")),
        ),
        AttemptFailure::DnsExhausted { hostname } => RequestBehaviour::fail(Error::Analytics(
            format!("no unused DNS records remain for {hostname}"),
        )),
        AttemptFailure::Other(message) => RequestBehaviour::fail(Error::Analytics(format!(
            "Unknown error during analytics query: {message}"
        ))),
    };
    debug!(
        retry = behaviour.retry,
        error = %behaviour.error,
        "classified attempt failure"
    );
    behaviour
}

/// A cause is non-retriable iff it matches the deny-list; every other
/// platform failure gets another attempt.
fn is_retriable_cause(cause_chain: &str) -> bool {
    let lower = cause_chain.to_lowercase();
    !NON_RETRIABLE_CAUSES
        .iter()
        .any(|pattern| lower.contains(pattern))
}

/// A parsed server error entry.
struct ServerError {
    code: i64,
    message: String,
    retriable: bool,
    raw: String,
}

/// Select a primary error from the server's `errors` array and decide
/// retriability. Secondary entries are appended to
/// `ctx.other_server_errors`.
pub fn classify_server_errors(
    entries: Vec<serde_json::Value>,
    ctx: &mut RequestContext,
) -> RequestBehaviour {
    let parsed: Vec<ServerError> = entries.iter().map(parse_entry).collect();
    if parsed.is_empty() {
        return RequestBehaviour::fail(Error::Analytics("empty error array".into()));
    }

    let any_non_retriable = parsed.iter().any(|e| !e.retriable);
    // First non-retriable entry wins; otherwise the first entry.
    let primary_index = parsed
        .iter()
        .position(|e| !e.retriable)
        .unwrap_or(0);

    for (i, entry) in parsed.iter().enumerate() {
        if i != primary_index {
            ctx.other_server_errors.push(entry.raw.clone());
        }
    }

    let primary = &parsed[primary_index];
    match primary.code {
        20000 => RequestBehaviour::fail(Error::InvalidCredential(primary.message.clone())),
        21002 => RequestBehaviour::fail(Error::Timeout(primary.message.clone())),
        code => {
            let error = Error::Query {
                message: primary.message.clone(),
                code,
            };
            if primary.retriable && !any_non_retriable {
                RequestBehaviour::retry(error)
            } else {
                RequestBehaviour::fail(error)
            }
        }
    }
}

/// Accept both forms the executor produces: raw JSON text from the
/// streamer, and already-parsed objects from a buffered body. An
/// unparseable entry degrades to code 0 with the raw text as message.
fn parse_entry(entry: &serde_json::Value) -> ServerError {
    let (object, raw) = match entry {
        serde_json::Value::String(text) => match serde_json::from_str::<serde_json::Value>(text) {
            Ok(parsed) => (parsed, text.clone()),
            Err(_) => {
                return ServerError {
                    code: 0,
                    message: text.clone(),
                    retriable: false,
                    raw: text.clone(),
                };
            }
        },
        other => (other.clone(), other.to_string()),
    };
    let code = object["code"].as_i64().unwrap_or(0);
    let message = object["msg"]
        .as_str()
        .or_else(|| object["message"].as_str())
        .unwrap_or_default()
        .to_string();
    let retriable = is_truthy(&object["retriable"]);
    ServerError {
        code,
        message,
        retriable,
        raw,
    }
}

/// JS-style truthiness for the optional `retriable` field.
fn is_truthy(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Bool(b) => *b,
        serde_json::Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        serde_json::Value::String(s) => !s.is_empty(),
        serde_json::Value::Array(_) | serde_json::Value::Object(_) => true,
        serde_json::Value::Null => false,
    }
}
