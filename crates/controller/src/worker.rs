//! Worker loop draining the shared work queue.

use std::sync::Arc;

use podtime_core::ObjectKey;
use podtime_queue::WorkQueue;
use tracing::{debug, error, info, warn};

use crate::reconcile::{AnnotationPatcher, Reconciler};

/// Result of one dispatch attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Reconciled,
    /// Failed; requeued with backoff. `retries` counts earlier requeues.
    Requeued { retries: u32 },
    /// Failed past the retry ceiling; key abandoned until a new trigger.
    Dropped { retries: u32 },
    /// The pod no longer exists.
    Gone,
    /// Queue key could not be parsed back into a pod identity.
    Malformed,
}

/// Take one key off the queue and reconcile it. `None` once the queue has shut down.
pub async fn process_next_item<P: AnnotationPatcher>(
    queue: &WorkQueue<String>,
    reconciler: &Reconciler<P>,
    max_retries: u32,
) -> Option<Outcome> {
    let raw = queue.get().await?;
    debug!(key = %raw, "processing key from the queue");

    let key: ObjectKey = match raw.parse() {
        Ok(k) => k,
        Err(e) => {
            warn!(key = %raw, error = %e, "dropping malformed queue key");
            queue.forget(&raw);
            queue.done(&raw);
            return Some(Outcome::Malformed);
        }
    };

    let outcome = match reconciler.apply(&key).await {
        Ok(()) => {
            metrics::counter!("reconcile_ok", 1u64);
            queue.forget(&raw);
            Outcome::Reconciled
        }
        Err(e) if e.is_not_found() => {
            let retries = queue.num_requeues(&raw);
            warn!(key = %raw, retries, error = %e, "pod disappeared before it could be annotated; dropping");
            metrics::counter!("reconcile_gone", 1u64);
            queue.forget(&raw);
            Outcome::Gone
        }
        Err(e) => {
            let retries = queue.num_requeues(&raw);
            metrics::counter!("reconcile_err", 1u64);
            if retries < max_retries {
                error!(key = %raw, retries, error = %e, "requeueing after error patching pod");
                queue.add_rate_limited(raw.clone());
                Outcome::Requeued { retries }
            } else {
                error!(key = %raw, retries, max_retries, error = %e, "error patching pod after max retries; dropping");
                metrics::counter!("reconcile_dropped", 1u64);
                queue.forget(&raw);
                Outcome::Dropped { retries }
            }
        }
    };
    queue.done(&raw);
    Some(outcome)
}

/// Loop until the queue shuts down.
pub async fn run_worker<P: AnnotationPatcher>(
    id: usize,
    queue: WorkQueue<String>,
    reconciler: Arc<Reconciler<P>>,
    max_retries: u32,
) {
    info!(worker = id, "worker started");
    while process_next_item(&queue, &reconciler, max_retries).await.is_some() {}
    info!(worker = id, "worker stopped");
}
