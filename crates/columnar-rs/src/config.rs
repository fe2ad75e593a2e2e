//! Option types the query core consumes.
//!
//! Connection-string parsing and the cluster façade live outside this
//! crate; they hand the core ready-made values of these types. All
//! validation that can fail a query before it reaches the wire
//! (mutually exclusive trust sources, unusable timeouts) happens here.

use std::path::PathBuf;
use std::time::Duration;

use crate::cancel::AbortSignal;
use crate::error::{Error, Result};

/// Cluster-level defaults applied to every query that does not
/// override them.
#[derive(Debug, Clone)]
pub struct ClusterOptions {
    /// Budget for one logical query: all attempts, backoffs, and row
    /// streaming.
    pub query_timeout: Duration,
    /// Per-attempt socket connect budget (post-TLS-handshake for
    /// HTTPS).
    pub connect_timeout: Duration,
    /// Retries after the initial attempt. The attempt count is at most
    /// `max_retry_attempts + 1`.
    pub max_retry_attempts: u32,
    pub security: SecurityOptions,
}

impl Default for ClusterOptions {
    fn default() -> Self {
        Self {
            query_timeout: Duration::from_secs(600),
            connect_timeout: Duration::from_secs(10),
            max_retry_attempts: 7,
            security: SecurityOptions::default(),
        }
    }
}

impl ClusterOptions {
    pub fn with_query_timeout(mut self, timeout: Duration) -> Self {
        self.query_timeout = timeout;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_max_retry_attempts(mut self, attempts: u32) -> Self {
        self.max_retry_attempts = attempts;
        self
    }

    pub fn with_security(mut self, security: SecurityOptions) -> Self {
        self.security = security;
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.query_timeout.is_zero() {
            return Err(Error::InvalidArgument(
                "query_timeout must be positive".into(),
            ));
        }
        if self.connect_timeout.is_zero() {
            return Err(Error::InvalidArgument(
                "connect_timeout must be positive".into(),
            ));
        }
        self.security.validate()
    }
}

/// Certificate trust configuration for HTTPS endpoints.
///
/// At most one of the four trust sources may be set; combining them is
/// an [`Error::InvalidArgument`]. With none set the platform's
/// built-in roots are trusted.
#[derive(Debug, Clone, Default)]
pub struct SecurityOptions {
    /// Trust only the CA set shipped with the hosted service bundle
    /// (realized as the built-in webpki root store).
    pub trust_only_capella: bool,
    /// Trust only the certificates in this PEM file.
    pub trust_only_pem_file: Option<PathBuf>,
    /// Trust only the certificates in this PEM string.
    pub trust_only_pem_string: Option<String>,
    /// Trust only this explicit list of PEM-encoded certificates.
    pub trust_only_certificates: Option<Vec<String>>,
    /// Development escape hatch: skip server certificate verification
    /// entirely.
    pub disable_server_certificate_verification: bool,
}

impl SecurityOptions {
    pub(crate) fn validate(&self) -> Result<()> {
        let sources = [
            self.trust_only_capella,
            self.trust_only_pem_file.is_some(),
            self.trust_only_pem_string.is_some(),
            self.trust_only_certificates.is_some(),
        ];
        if sources.iter().filter(|set| **set).count() > 1 {
            return Err(Error::InvalidArgument(
                "only one certificate trust source may be configured".into(),
            ));
        }
        Ok(())
    }
}

/// Consistency requirement sent as `scan_consistency`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanConsistency {
    NotBounded,
    RequestPlus,
}

impl ScanConsistency {
    pub(crate) fn wire_name(self) -> &'static str {
        match self {
            ScanConsistency::NotBounded => "not_bounded",
            ScanConsistency::RequestPlus => "request_plus",
        }
    }
}

/// Statement parameters: positional `args` or named `$key` values.
#[derive(Debug, Clone)]
pub enum QueryParameters {
    Positional(Vec<serde_json::Value>),
    Named(serde_json::Map<String, serde_json::Value>),
}

/// Per-query options.
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    pub parameters: Option<QueryParameters>,
    pub readonly: Option<bool>,
    pub scan_consistency: Option<ScanConsistency>,
    /// Ask the service to prioritize this query
    /// (`Analytics-Priority: -1`).
    pub priority: bool,
    /// Override of the cluster `query_timeout` for this call.
    pub timeout: Option<Duration>,
    /// Override of the generated v4 UUID `client_context_id`.
    pub client_context_id: Option<String>,
    /// Database half of `query_context`; only sent when `scope` is
    /// also set.
    pub database: Option<String>,
    /// Scope half of `query_context`; only sent when `database` is
    /// also set.
    pub scope: Option<String>,
    /// Pass-through body fields, applied last.
    pub raw: Option<serde_json::Map<String, serde_json::Value>>,
    /// External cancellation, combined with the query's own signal.
    pub abort_signal: Option<AbortSignal>,
}

impl QueryOptions {
    pub fn with_positional_parameters(mut self, args: Vec<serde_json::Value>) -> Self {
        self.parameters = Some(QueryParameters::Positional(args));
        self
    }

    pub fn with_named_parameters(
        mut self,
        named: serde_json::Map<String, serde_json::Value>,
    ) -> Self {
        self.parameters = Some(QueryParameters::Named(named));
        self
    }

    pub fn with_readonly(mut self, readonly: bool) -> Self {
        self.readonly = Some(readonly);
        self
    }

    pub fn with_scan_consistency(mut self, consistency: ScanConsistency) -> Self {
        self.scan_consistency = Some(consistency);
        self
    }

    pub fn with_priority(mut self, priority: bool) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_context(mut self, database: impl Into<String>, scope: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self.scope = Some(scope.into());
        self
    }

    pub fn with_raw(mut self, raw: serde_json::Map<String, serde_json::Value>) -> Self {
        self.raw = Some(raw);
        self
    }

    pub fn with_abort_signal(mut self, signal: AbortSignal) -> Self {
        self.abort_signal = Some(signal);
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if let Some(timeout) = self.timeout
            && timeout.is_zero()
        {
            return Err(Error::InvalidArgument("timeout must be positive".into()));
        }
        Ok(())
    }
}
