//! Public error taxonomy for the analytics client.
//!
//! Every failure that escapes [`execute_query`](crate::AnalyticsClient::execute_query)
//! is one of these variants. Internal attempt-level failures (transport
//! errors, raw server error arrays, connect timeouts) never surface
//! directly — they pass through the classifier in
//! [`crate::query::classify`] first.

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Typed errors surfaced to callers.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// Generic wrapper for anything not covered by a more specific kind.
    #[error("analytics error: {0}")]
    Analytics(String),

    /// HTTP 401 from the service, or server error code 20000.
    #[error("invalid credential: {0}")]
    InvalidCredential(String),

    /// The caller deadline elapsed, an attempt outran its remaining
    /// budget, the connect timeout fired, or the server reported
    /// code 21002.
    #[error("timeout: {0}")]
    Timeout(String),

    /// A server-side query failure, carrying the server's message and
    /// error code verbatim.
    #[error("query error (code {code}): {message}")]
    Query { message: String, code: i64 },

    /// The caller supplied an unusable option (zero timeout, combined
    /// mutually exclusive trust sources).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The query was cancelled. Propagated verbatim: never retried,
    /// never wrapped, never decorated with request context.
    #[error("query aborted")]
    Aborted,
}

impl Error {
    /// Replace the message while keeping the variant. Used to suffix
    /// surfaced errors with the request context's rendered form.
    /// `Aborted` carries no message and is returned unchanged.
    pub(crate) fn with_message(self, message: String) -> Error {
        match self {
            Error::Analytics(_) => Error::Analytics(message),
            Error::InvalidCredential(_) => Error::InvalidCredential(message),
            Error::Timeout(_) => Error::Timeout(message),
            Error::Query { code, .. } => Error::Query { message, code },
            Error::InvalidArgument(_) => Error::InvalidArgument(message),
            Error::Aborted => Error::Aborted,
        }
    }

    /// The bare message carried by this error, without the variant label.
    pub(crate) fn message(&self) -> String {
        match self {
            Error::Analytics(m)
            | Error::InvalidCredential(m)
            | Error::Timeout(m)
            | Error::InvalidArgument(m) => m.clone(),
            Error::Query { message, .. } => message.clone(),
            Error::Aborted => "query aborted".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn with_message_keeps_variant() {
        let e = Error::Query {
            message: "old".into(),
            code: 23000,
        };
        let e = e.with_message("new".into());
        match e {
            Error::Query { message, code } => {
                assert_eq!(message, "new");
                assert_eq!(code, 23000);
            }
            other => panic!("variant changed: {other:?}"),
        }
    }

    #[test]
    fn aborted_is_never_rewritten() {
        let e = Error::Aborted.with_message("decorated".into());
        assert!(matches!(e, Error::Aborted));
    }
}
