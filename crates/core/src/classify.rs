use serde::{Deserialize, Serialize};

use crate::PodSnapshot;

/// Annotation whose presence asks for a pod to be stamped.
pub const DEFAULT_TRIGGER_ANNOTATION: &str = "addtime";
/// Annotation written by the reconciler; its presence means "already stamped".
pub const DEFAULT_PROCESSED_ANNOTATION: &str = "timestamp";

/// Annotation keys the classifier and reconciler agree on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Markers {
    pub trigger: String,
    pub processed: String,
}

impl Default for Markers {
    fn default() -> Self {
        Self { trigger: DEFAULT_TRIGGER_ANNOTATION.to_string(), processed: DEFAULT_PROCESSED_ANNOTATION.to_string() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Action {
    Enqueue,
    Skip,
}

/// Decide whether a snapshot needs stamping: trigger present and processed absent.
pub fn classify(snapshot: &PodSnapshot, markers: &Markers) -> Action {
    if snapshot.has_annotation(&markers.trigger) && !snapshot.has_annotation(&markers.processed) {
        Action::Enqueue
    } else {
        Action::Skip
    }
}
