//! Per-query diagnostic context.
//!
//! A cheap value object shared by the retry driver, the attempt
//! executor, and the classifier. Fields are either last-write-wins
//! (addresses, status code, previous attempt error) or append-only
//! (secondary server errors); `num_attempts` only grows.

use std::sync::{Arc, Mutex};

use crate::QUERY_PATH;
use crate::error::Error;

/// Context handle shared across one logical query.
pub type SharedContext = Arc<Mutex<RequestContext>>;

#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub num_attempts: u32,
    pub max_retry_attempts: u32,
    pub last_dispatched_to: Option<String>,
    pub last_dispatched_from: Option<String>,
    pub path: String,
    pub method: String,
    pub statement: String,
    pub status_code: Option<u16>,
    /// The classified error of the previous attempt, overwritten on
    /// each retry.
    pub previous_attempt_errors: Option<Error>,
    /// Server-reported errors that were not selected as the primary.
    pub other_server_errors: Vec<String>,
}

impl RequestContext {
    pub fn new(statement: impl Into<String>, max_retry_attempts: u32) -> Self {
        Self {
            max_retry_attempts,
            path: QUERY_PATH.to_string(),
            method: "POST".to_string(),
            statement: statement.into(),
            ..Default::default()
        }
    }

    pub fn shared(self) -> SharedContext {
        Arc::new(Mutex::new(self))
    }

    pub fn increment_attempt(&mut self) {
        self.num_attempts += 1;
    }

    /// Render `"<msg>. ErrorContext: <k=v>, …"` from the populated
    /// fields, in a fixed order.
    pub fn attach_error_context(&self, msg: &str) -> String {
        let mut fields: Vec<String> = Vec::new();
        if let Some(to) = &self.last_dispatched_to {
            fields.push(format!("last_dispatched_to={to}"));
        }
        if let Some(from) = &self.last_dispatched_from {
            fields.push(format!("last_dispatched_from={from}"));
        }
        if !self.method.is_empty() {
            fields.push(format!("method={}", self.method));
        }
        if !self.path.is_empty() {
            fields.push(format!("path={}", self.path));
        }
        if let Some(status) = self.status_code {
            fields.push(format!("status_code={status}"));
        }
        if !self.statement.is_empty() {
            fields.push(format!("statement={}", self.statement));
        }
        if let Some(previous) = &self.previous_attempt_errors {
            fields.push(format!("previous_attempt_errors={previous}"));
        }
        fields.push(format!("num_attempts={}", self.num_attempts));
        if !self.other_server_errors.is_empty() {
            fields.push(format!(
                "other_server_errors=[{}]",
                self.other_server_errors.join(", ")
            ));
        }
        format!("{msg}. ErrorContext: {}", fields.join(", "))
    }
}

/// Suffix a surfaced error's message with the context's rendered form.
/// `Aborted` passes through untouched.
pub(crate) fn decorate(error: Error, ctx: &RequestContext) -> Error {
    if matches!(error, Error::Aborted) {
        return error;
    }
    let message = ctx.attach_error_context(&error.message());
    error.with_message(message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_only_populated_fields_in_order() {
        let mut ctx = RequestContext::new("SELECT 1", 7);
        ctx.num_attempts = 2;
        ctx.last_dispatched_to = Some("10.0.0.1:443".into());
        ctx.status_code = Some(503);

        let rendered = ctx.attach_error_context("boom");
        assert_eq!(
            rendered,
            "boom. ErrorContext: last_dispatched_to=10.0.0.1:443, method=POST, \
             path=/api/v1/request, status_code=503, statement=SELECT 1, num_attempts=2"
        );
    }

    #[test]
    fn includes_previous_attempt_and_other_server_errors() {
        let mut ctx = RequestContext::new("SELECT 1", 3);
        ctx.num_attempts = 4;
        ctx.previous_attempt_errors = Some(Error::Analytics("temporary".into()));
        ctx.other_server_errors.push(r#"{"code":1}"#.into());

        let rendered = ctx.attach_error_context("gave up");
        assert!(rendered.contains("previous_attempt_errors=analytics error: temporary"));
        assert!(rendered.ends_with(r#"other_server_errors=[{"code":1}]"#));
    }

    #[test]
    fn decorate_leaves_aborted_untouched() {
        let ctx = RequestContext::new("SELECT 1", 0);
        assert!(matches!(decorate(Error::Aborted, &ctx), Error::Aborted));
    }
}
