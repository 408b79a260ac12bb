//! Reconciler: stamps the processed annotation on a pod.
//!
//! The patch is written straight to the API server, never derived from the
//! cache. Applying it twice only rewrites the timestamp, so a stale or
//! duplicate dispatch is harmless.

use chrono::{DateTime, SecondsFormat, Utc};
use podtime_core::{Markers, ObjectKey};
use podtime_kubehub::{annotation_patch, PatchError, PodClient};
use tracing::{debug, info};

/// Merge-patch primitive for pod annotations.
#[async_trait::async_trait]
pub trait AnnotationPatcher: Send + Sync {
    async fn merge_annotations(&self, key: &ObjectKey, patch: &serde_json::Value) -> Result<(), PatchError>;
}

#[async_trait::async_trait]
impl AnnotationPatcher for PodClient {
    async fn merge_annotations(&self, key: &ObjectKey, patch: &serde_json::Value) -> Result<(), PatchError> {
        self.patch_annotations(key.namespace(), &key.name, patch).await
    }
}

/// Source of the stamped instant.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> { Utc::now() }
}

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("pod {0} not found")]
    NotFound(ObjectKey),
    #[error("error while patching pod {key}: {source}")]
    Patch {
        key: ObjectKey,
        #[source]
        source: PatchError,
    },
    #[error("refusing to build a patch for {0} with an empty annotation key")]
    InvalidPatch(ObjectKey),
}

impl ReconcileError {
    pub fn is_not_found(&self) -> bool { matches!(self, ReconcileError::NotFound(_)) }
}

pub struct Reconciler<P> {
    patcher: P,
    markers: Markers,
    clock: Box<dyn Clock>,
}

impl<P: AnnotationPatcher> Reconciler<P> {
    pub fn new(patcher: P, markers: Markers) -> Self { Self::with_clock(patcher, markers, SystemClock) }

    pub fn with_clock(patcher: P, markers: Markers, clock: impl Clock + 'static) -> Self {
        Self { patcher, markers, clock: Box::new(clock) }
    }

    pub fn patcher(&self) -> &P { &self.patcher }

    /// Set the processed annotation on `key` to the current RFC3339 instant.
    pub async fn apply(&self, key: &ObjectKey) -> Result<(), ReconcileError> {
        if self.markers.processed.is_empty() {
            return Err(ReconcileError::InvalidPatch(key.clone()));
        }
        let stamp = self.clock.now().to_rfc3339_opts(SecondsFormat::Secs, true);
        let patch = annotation_patch(&self.markers.processed, &stamp);
        info!(key = %key, annotation = %self.markers.processed, value = %stamp, "annotating pod");
        debug!(key = %key, patch = %patch, "patch document");
        match self.patcher.merge_annotations(key, &patch).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => Err(ReconcileError::NotFound(key.clone())),
            Err(source) => Err(ReconcileError::Patch { key: key.clone(), source }),
        }
    }
}
