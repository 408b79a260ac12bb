//! podtime core types: object keys, pod snapshots, change events and the trigger classifier.

#![forbid(unsafe_code)]

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

mod classify;
mod config;

pub use classify::{classify, Action, Markers, DEFAULT_PROCESSED_ANNOTATION, DEFAULT_TRIGGER_ANNOTATION};
pub use config::{ControllerConfig, DEFAULT_MAX_RETRIES, DEFAULT_RESYNC_SECS};

/// Errors produced while turning a queue key back into an object identity.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    #[error("empty object key")]
    Empty,
    #[error("object key {0:?} has an empty name")]
    EmptyName(String),
}

/// Stable `(namespace, name)` identity of a watched object.
///
/// Rendered as `namespace/name`, or the bare `name` for an empty namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: Option<&str>, name: impl Into<String>) -> Self {
        let namespace = namespace.filter(|ns| !ns.is_empty()).map(|ns| ns.to_string());
        Self { namespace, name: name.into() }
    }

    pub fn namespace(&self) -> Option<&str> { self.namespace.as_deref() }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => f.write_str(&self.name),
        }
    }
}

impl FromStr for ObjectKey {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(KeyError::Empty);
        }
        let (ns, name) = match s.split_once('/') {
            Some((ns, name)) => (Some(ns), name),
            None => (None, s),
        };
        if name.is_empty() {
            return Err(KeyError::EmptyName(s.to_string()));
        }
        Ok(ObjectKey::new(ns, name))
    }
}

/// Immutable point-in-time view of one watched pod.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodSnapshot {
    pub namespace: Option<String>,
    pub name: String,
    /// Kubernetes annotations as key/value pairs.
    pub annotations: SmallVec<[(String, String); 4]>,
}

impl PodSnapshot {
    pub fn new(namespace: Option<&str>, name: impl Into<String>) -> Self {
        let key = ObjectKey::new(namespace, name);
        Self { namespace: key.namespace, name: key.name, annotations: SmallVec::new() }
    }

    pub fn with_annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.annotations.push((key.into(), value.into()));
        self
    }

    pub fn key(&self) -> ObjectKey {
        ObjectKey { namespace: self.namespace.clone(), name: self.name.clone() }
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    pub fn has_annotation(&self, key: &str) -> bool { self.annotation(key).is_some() }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ChangeKind {
    Added,
    Updated,
    Deleted,
}

/// A single notification from the change-stream cache.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ChangeEvent {
    Added(PodSnapshot),
    Updated { old: PodSnapshot, new: PodSnapshot },
    Deleted(PodSnapshot),
}

impl ChangeEvent {
    pub fn kind(&self) -> ChangeKind {
        match self {
            ChangeEvent::Added(_) => ChangeKind::Added,
            ChangeEvent::Updated { .. } => ChangeKind::Updated,
            ChangeEvent::Deleted(_) => ChangeKind::Deleted,
        }
    }

    /// The most recent state carried by the event.
    pub fn snapshot(&self) -> &PodSnapshot {
        match self {
            ChangeEvent::Added(s) | ChangeEvent::Deleted(s) => s,
            ChangeEvent::Updated { new, .. } => new,
        }
    }

    pub fn key(&self) -> ObjectKey { self.snapshot().key() }
}
