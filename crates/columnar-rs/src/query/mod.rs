//! Query execution machinery: retry driver, request context, and the
//! error classifier.
//!
//! One logical query owns one [`RequestContext`](context::RequestContext)
//! and runs zero or more attempts through
//! [`retry::run_with_retry`] under a single [`retry::Deadline`]. Every
//! attempt failure passes through [`classify::classify`], which decides
//! retry-or-fail and keeps the context's diagnostic fields current.

pub mod classify;
pub mod context;
pub mod retry;

pub use classify::{AttemptFailure, RequestBehaviour};
pub use context::{RequestContext, SharedContext};
pub use retry::{Deadline, RetryConfig};
