//! Cooperative cancellation for in-flight queries.
//!
//! A query watches one composite [`AbortSignal`]: the internal signal
//! owned by the query plus, optionally, a caller-supplied external
//! signal. Firing either tears down the current attempt, the JSON
//! pipeline, and the row stream with a terminal
//! [`Error::Aborted`](crate::Error::Aborted). Firing is idempotent.

use std::sync::Arc;
use tokio::sync::watch;

/// A cloneable cancellation flag.
///
/// Clones share the underlying flag, so any holder can abort and all
/// observers see it.
#[derive(Clone, Debug)]
pub struct AbortSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl AbortSignal {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Fire the signal. Safe to call any number of times.
    pub fn abort(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_aborted(&self) -> bool {
        *self.tx.subscribe().borrow()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    /// Derive a signal that fires when `self` fires or when `external`
    /// (if present) fires. The forwarding watcher task exits once
    /// either side resolves.
    pub(crate) fn merged_with(&self, external: Option<&AbortSignal>) -> AbortSignal {
        let Some(external) = external else {
            return self.clone();
        };
        let merged = self.clone();
        let mut rx = external.subscribe();
        let forward = merged.clone();
        tokio::spawn(async move {
            if rx.wait_for(|fired| *fired).await.is_ok() {
                forward.abort();
            }
        });
        merged
    }

    /// Resolve once the signal fires. Used as a `select!` arm against
    /// transport I/O.
    pub(crate) async fn fired(&self) {
        let mut rx = self.subscribe();
        // A closed channel means the signal owner is gone and the query
        // can never be aborted through it; park forever in that case.
        if rx.wait_for(|fired| *fired).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

impl Default for AbortSignal {
    fn default() -> Self {
        Self::new()
    }
}
