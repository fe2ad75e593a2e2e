//! Async client core for executing SQL++ analytics queries against a
//! remote columnar query service over HTTP(S).
//!
//! `columnar-rs` is the transport-and-retry heart of an analytics
//! client: it submits a statement, streams the server's JSON response
//! while emitting result rows as they arrive, exposes trailing query
//! metadata once the stream completes, and transparently retries
//! failed attempts against alternate DNS addresses until the caller's
//! deadline elapses or a non-retriable error occurs.
//!
//! The connection-string surface and the `Cluster`/`Database`/`Scope`
//! façade live above this crate; they hand the core ready-made
//! [`ClusterOptions`], [`QueryOptions`], and [`Credential`] values.
//!
//! # Getting started
//!
//! ```ignore
//! use columnar_rs::{AnalyticsClient, ClusterOptions, Credential, QueryOptions};
//!
//! #[tokio::main]
//! async fn main() -> columnar_rs::Result<()> {
//!     let client = AnalyticsClient::new(
//!         "analytics.example.com",
//!         443,
//!         true,
//!         Credential::new("reader", "secret"),
//!         ClusterOptions::default(),
//!     )?;
//!
//!     let mut result = client
//!         .execute_query("SELECT airline, count(*) FROM routes GROUP BY airline", QueryOptions::default())
//!         .await?;
//!
//!     while let Some(row) = result.next_row().await {
//!         println!("{}", row?);
//!     }
//!     println!("request {}", result.metadata()?.request_id);
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`query`] | retry driver, request context, error classifier |
//! | [`http`] | shared transport, DNS rotation pool, attempt executor |
//! | [`stream`] | incremental JSON pipeline and the [`QueryResult`] façade |
//! | [`config`] | option types the core consumes |
//! | [`duration`] | Go-syntax duration strings (metrics, body `timeout`) |
//!
//! # Design notes
//!
//! - Rows are delivered eagerly, in server order, with backpressure;
//!   the `errors` array and trailing metadata are buffered in full
//!   before they surface.
//! - Every logical query owns its own DNS pool, request context, and
//!   abort signal; only the HTTP transport is shared across queries.
//! - All surfaced errors carry the request context's diagnostic render
//!   as a message suffix, except [`Error::Aborted`], which always
//!   passes through verbatim.

pub mod cancel;
pub mod config;
pub mod duration;
pub mod error;
pub mod http;
pub mod query;
pub mod stream;

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::duration::format_ms;
use crate::http::Transport;
use crate::http::attempt::execute_attempt;
use crate::http::dns::DnsPool;
use crate::query::classify;
use crate::query::context::RequestContext;
use crate::query::retry::{Deadline, RetryConfig, run_with_retry};

pub use cancel::AbortSignal;
pub use config::{
    ClusterOptions, QueryOptions, QueryParameters, ScanConsistency, SecurityOptions,
};
pub use error::{Error, Result};
pub use stream::result::{
    JsonRowDeserializer, QueryMetadata, QueryMetrics, QueryResult, QueryWarning, RowDeserializer,
    TypedRowDeserializer,
};

// ── Constants ──────────────────────────────────────────────────────

/// Path of the query service endpoint.
pub const QUERY_PATH: &str = "/api/v1/request";

/// Margin added to the caller's budget for the body's `timeout` field,
/// so server-side cancellation trails the client deadline instead of
/// racing it.
pub(crate) const SERVER_TIMEOUT_MARGIN_MS: u64 = 5_000;

// ── Credential ─────────────────────────────────────────────────────

/// Basic-auth credential for the query service.
#[derive(Clone)]
pub struct Credential {
    pub username: String,
    pub password: String,
}

impl Credential {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

// ── Client ─────────────────────────────────────────────────────────

/// Cluster-level query client: shared transport plus defaults.
///
/// Cheap to share behind an `Arc`; every
/// [`execute_query`](Self::execute_query) call owns its private
/// attempt state.
pub struct AnalyticsClient {
    transport: Arc<Transport>,
    credential: Credential,
    options: ClusterOptions,
}

impl AnalyticsClient {
    /// Build a client for `hostname:port`, speaking HTTPS when `tls`
    /// is set. Validates the cluster options up front.
    pub fn new(
        hostname: impl Into<String>,
        port: u16,
        tls: bool,
        credential: Credential,
        options: ClusterOptions,
    ) -> Result<Self> {
        options.validate()?;
        let transport = Transport::new(
            tls,
            hostname,
            port,
            options.connect_timeout,
            options.security.clone(),
        )?;
        Ok(Self {
            transport: Arc::new(transport),
            credential,
            options,
        })
    }

    /// Execute one logical query: all retries, backoffs, and the row
    /// stream run under a single deadline of the per-call timeout (or
    /// the cluster default).
    pub async fn execute_query(
        &self,
        statement: &str,
        options: QueryOptions,
    ) -> Result<QueryResult> {
        options.validate()?;

        let budget = options.timeout.unwrap_or(self.options.query_timeout);
        let deadline = Deadline::after(budget);
        let ctx = RequestContext::new(statement, self.options.max_retry_attempts).shared();
        let body = Arc::new(build_request_body(statement, &options, budget));
        let pool = Arc::new(tokio::sync::Mutex::new(DnsPool::new(
            self.transport.hostname(),
            self.transport.port(),
        )));
        let abort = AbortSignal::new().merged_with(options.abort_signal.as_ref());
        let priority = options.priority;

        debug!(
            statement,
            budget_ms = budget.as_millis() as u64,
            "executing analytics query"
        );

        let retry_config = RetryConfig {
            max_retry_attempts: self.options.max_retry_attempts,
            ..RetryConfig::default()
        };
        let transport = self.transport.clone();
        let credential = self.credential.clone();
        let attempt_ctx = ctx.clone();

        run_with_retry(&retry_config, deadline, &ctx, classify::classify, move || {
            execute_attempt(
                transport.clone(),
                pool.clone(),
                body.clone(),
                credential.clone(),
                priority,
                deadline,
                attempt_ctx.clone(),
                abort.clone(),
            )
        })
        .await
    }
}

// ── Request body ───────────────────────────────────────────────────

/// Assemble the request body: statement, context id, parameters,
/// consistency, the padded `timeout`, and raw pass-through fields
/// (applied last).
fn build_request_body(statement: &str, options: &QueryOptions, budget: Duration) -> String {
    let mut body = serde_json::Map::new();
    body.insert("statement".into(), statement.into());

    let context_id = options
        .client_context_id
        .clone()
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    body.insert("client_context_id".into(), context_id.into());

    if let (Some(database), Some(scope)) = (&options.database, &options.scope) {
        body.insert(
            "query_context".into(),
            format!("default:`{database}`.`{scope}`").into(),
        );
    }

    match &options.parameters {
        Some(QueryParameters::Positional(args)) => {
            body.insert("args".into(), serde_json::Value::Array(args.clone()));
        }
        Some(QueryParameters::Named(named)) => {
            for (key, value) in named {
                let key = if key.starts_with('$') {
                    key.clone()
                } else {
                    format!("${key}")
                };
                body.insert(key, value.clone());
            }
        }
        None => {}
    }

    if let Some(readonly) = options.readonly {
        body.insert("readonly".into(), readonly.into());
    }
    if let Some(consistency) = options.scan_consistency {
        body.insert("scan_consistency".into(), consistency.wire_name().into());
    }

    let timeout_ms = budget.as_millis() as u64 + SERVER_TIMEOUT_MARGIN_MS;
    body.insert("timeout".into(), format_ms(timeout_ms).into());

    if let Some(raw) = &options.raw {
        for (key, value) in raw {
            body.insert(key.clone(), value.clone());
        }
    }

    serde_json::Value::Object(body).to_string()
}
