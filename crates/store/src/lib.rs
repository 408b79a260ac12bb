//! podtime store: change-stream cache mirroring watched pods
//!
//! The cache consumes a list+watch stream, keeps a local mirror keyed by
//! [`ObjectKey`], and forwards every change as a [`ChangeEvent`] over a bounded
//! channel. Delivery upstream is at-least-once, so the cache also replays
//! the whole mirror as `Updated` events on a fixed resync cadence and diffs
//! relists against the mirror to recover deletions it never saw.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use futures::{Stream, StreamExt};
use k8s_openapi::api::core::v1::Pod;
use kube::runtime::watcher;
use podtime_core::{ChangeEvent, ObjectKey, PodSnapshot};
use rustc_hash::FxHashMap;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Local view of every watched pod.
pub type Mirror = FxHashMap<ObjectKey, PodSnapshot>;

/// Writer half: owns the mirror and drives the watch stream.
pub struct ChangeStreamCache {
    items: Mirror,
    published: Arc<ArcSwap<Mirror>>,
    synced_tx: watch::Sender<bool>,
    events: mpsc::Sender<ChangeEvent>,
    resync: Duration,
}

/// Reader half: readiness and read-only access to the published mirror.
#[derive(Clone)]
pub struct CacheHandle {
    published: Arc<ArcSwap<Mirror>>,
    synced_rx: watch::Receiver<bool>,
}

impl ChangeStreamCache {
    /// Create a cache whose change events are delivered on the returned receiver.
    /// A zero `resync` disables periodic resync.
    pub fn new(capacity: usize, resync: Duration) -> (Self, CacheHandle, mpsc::Receiver<ChangeEvent>) {
        let (events, rx) = mpsc::channel(capacity.max(1));
        let (synced_tx, synced_rx) = watch::channel(false);
        let published = Arc::new(ArcSwap::from_pointee(Mirror::default()));
        let cache = Self { items: Mirror::default(), published: Arc::clone(&published), synced_tx, events, resync };
        (cache, CacheHandle { published, synced_rx }, rx)
    }

    /// Consume `stream` until it ends, the event receiver goes away, or `cancel` fires.
    pub async fn run<S>(mut self, stream: S, cancel: CancellationToken)
    where
        S: Stream<Item = Result<watcher::Event<Pod>, watcher::Error>>,
    {
        futures::pin_mut!(stream);
        let mut resync = resync_timer(self.resync);
        info!(resync_secs = self.resync.as_secs(), "change-stream cache started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("cancellation received; stopping change-stream cache");
                    break;
                }
                next = stream.next() => {
                    match next {
                        Some(Ok(ev)) => {
                            if !self.apply(ev).await { break; }
                        }
                        Some(Err(e)) => warn!(error = %e, "pod watch error; watcher will retry"),
                        None => {
                            warn!("pod watch stream ended");
                            break;
                        }
                    }
                }
                _ = tick(&mut resync) => {
                    if !self.resync_all().await { break; }
                }
            }
        }
        info!(items = self.items.len(), "change-stream cache stopped");
    }

    fn is_synced(&self) -> bool { *self.synced_tx.borrow() }

    fn publish(&self) { self.published.store(Arc::new(self.items.clone())); }

    /// Apply one watcher event to the mirror and emit the resulting changes.
    /// Returns false once nobody is listening for events any more.
    async fn apply(&mut self, ev: watcher::Event<Pod>) -> bool {
        match ev {
            watcher::Event::Restarted(pods) => {
                let listed: Mirror = pods
                    .iter()
                    .filter_map(narrow)
                    .map(|s| (s.key(), s))
                    .collect();
                debug!(count = listed.len(), "pod listing received");
                let changes = if self.is_synced() {
                    relist_changes(&self.items, &listed)
                } else {
                    let mut added: Vec<_> = listed.values().cloned().collect();
                    added.sort_by(|a, b| a.key().cmp(&b.key()));
                    added.into_iter().map(ChangeEvent::Added).collect()
                };
                self.items = listed;
                self.publish();
                if !self.is_synced() {
                    self.synced_tx.send_replace(true);
                    info!(items = self.items.len(), "change-stream cache synced");
                }
                self.emit_all(changes).await
            }
            watcher::Event::Applied(pod) => {
                let Some(snap) = narrow(&pod) else { return true; };
                let ev = match self.items.insert(snap.key(), snap.clone()) {
                    Some(old) => ChangeEvent::Updated { old, new: snap },
                    None => ChangeEvent::Added(snap),
                };
                self.publish();
                self.emit(ev).await
            }
            watcher::Event::Deleted(pod) => {
                let Some(snap) = narrow(&pod) else { return true; };
                self.items.remove(&snap.key());
                self.publish();
                self.emit(ChangeEvent::Deleted(snap)).await
            }
        }
    }

    async fn resync_all(&mut self) -> bool {
        if !self.is_synced() {
            return true;
        }
        metrics::counter!("cache_resyncs", 1u64);
        debug!(items = self.items.len(), "periodic resync");
        let mut snaps: Vec<_> = self.items.values().cloned().collect();
        snaps.sort_by(|a, b| a.key().cmp(&b.key()));
        let changes = snaps.into_iter().map(|s| ChangeEvent::Updated { old: s.clone(), new: s }).collect();
        self.emit_all(changes).await
    }

    async fn emit_all(&self, changes: Vec<ChangeEvent>) -> bool {
        for ev in changes {
            if !self.emit(ev).await {
                return false;
            }
        }
        true
    }

    async fn emit(&self, ev: ChangeEvent) -> bool {
        metrics::counter!("cache_events", 1u64);
        if self.events.send(ev).await.is_err() {
            debug!("change event receiver dropped");
            return false;
        }
        true
    }
}

impl CacheHandle {
    /// Wait until the initial listing has been applied. Returns false if `cancel`
    /// fires first or the cache stops before syncing.
    pub async fn wait_synced(&self, cancel: &CancellationToken) -> bool {
        let mut rx = self.synced_rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return true;
            }
            tokio::select! {
                _ = cancel.cancelled() => return false,
                changed = rx.changed() => {
                    if changed.is_err() {
                        return *rx.borrow();
                    }
                }
            }
        }
    }

    pub fn is_synced(&self) -> bool { *self.synced_rx.borrow() }

    pub fn len(&self) -> usize { self.published.load().len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    pub fn get(&self, key: &ObjectKey) -> Option<PodSnapshot> { self.published.load().get(key).cloned() }
}

/// Changes implied by a fresh listing replacing the current mirror.
fn relist_changes(current: &Mirror, listed: &Mirror) -> Vec<ChangeEvent> {
    let mut out = Vec::new();
    let mut keys: Vec<_> = listed.keys().collect();
    keys.sort();
    for key in keys {
        let Some(new) = listed.get(key) else { continue };
        match current.get(key) {
            Some(old) => out.push(ChangeEvent::Updated { old: old.clone(), new: new.clone() }),
            None => out.push(ChangeEvent::Added(new.clone())),
        }
    }
    let mut gone: Vec<_> = current.iter().filter(|(k, _)| !listed.contains_key(*k)).collect();
    gone.sort_by(|a, b| a.0.cmp(b.0));
    out.extend(gone.into_iter().map(|(_, old)| ChangeEvent::Deleted(old.clone())));
    out
}

fn narrow(pod: &Pod) -> Option<PodSnapshot> {
    match podtime_kubehub::snapshot_from_pod(pod) {
        Ok(s) => Some(s),
        Err(e) => {
            warn!(error = %e, uid = ?pod.metadata.uid, "dropping unusable pod notification");
            None
        }
    }
}

fn resync_timer(period: Duration) -> Option<Interval> {
    if period.is_zero() {
        return None;
    }
    let mut t = tokio::time::interval_at(Instant::now() + period, period);
    t.set_missed_tick_behavior(MissedTickBehavior::Skip);
    Some(t)
}

async fn tick(timer: &mut Option<Interval>) {
    match timer {
        Some(t) => {
            t.tick().await;
        }
        None => std::future::pending().await,
    }
}
