//! Single classifier loop between the change-stream cache and the work queue.

use podtime_core::{classify, Action, ChangeEvent, Markers};
use podtime_queue::WorkQueue;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// What a single change event did to the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Enqueued,
    Skipped,
    Removed,
}

/// Classify one event. Adds and updates may enqueue; deletes only ever drop queued work.
pub fn handle_event(ev: &ChangeEvent, queue: &WorkQueue<String>, markers: &Markers) -> Dispatch {
    let key = ev.key().to_string();
    match ev {
        ChangeEvent::Added(snap) | ChangeEvent::Updated { new: snap, .. } => match classify(snap, markers) {
            Action::Enqueue => {
                debug!(key = %key, kind = ?ev.kind(), "pod needs stamping; enqueueing");
                queue.add(key);
                Dispatch::Enqueued
            }
            Action::Skip => Dispatch::Skipped,
        },
        ChangeEvent::Deleted(_) => {
            if queue.remove(&key) {
                debug!(key = %key, "pod deleted; dropped queued work");
            }
            Dispatch::Removed
        }
    }
}

/// Drain `events` into `queue` until the channel closes or `cancel` fires.
pub async fn run_dispatcher(
    mut events: mpsc::Receiver<ChangeEvent>,
    queue: WorkQueue<String>,
    markers: Markers,
    cancel: CancellationToken,
) {
    info!(trigger = %markers.trigger, processed = %markers.processed, "dispatcher started");
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            ev = events.recv() => {
                match ev {
                    Some(ev) => { handle_event(&ev, &queue, &markers); }
                    None => {
                        debug!("change event channel closed");
                        break;
                    }
                }
            }
        }
    }
    info!("dispatcher stopped");
}
