use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::Markers;

pub const DEFAULT_MAX_RETRIES: u32 = 5;
pub const DEFAULT_RESYNC_SECS: u64 = 60;

/// Runtime configuration for one controller process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    pub markers: Markers,
    /// Requeues allowed after a failed patch before the key is dropped.
    pub max_retries: u32,
    /// Full resync cadence of the change-stream cache; zero disables it.
    pub resync: Duration,
    /// Deadline for the initial listing to land in the cache.
    pub sync_timeout: Duration,
    pub workers: usize,
    /// Restrict the watch to one namespace (all namespaces when unset).
    pub namespace: Option<String>,
    /// Kubeconfig path; unset means in-cluster identity.
    pub kubeconfig: Option<PathBuf>,
    /// Capacity of the cache → dispatcher event channel.
    pub event_capacity: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            markers: Markers::default(),
            max_retries: DEFAULT_MAX_RETRIES,
            resync: Duration::from_secs(DEFAULT_RESYNC_SECS),
            sync_timeout: Duration::from_secs(120),
            workers: 1,
            namespace: None,
            kubeconfig: None,
            event_capacity: 1024,
        }
    }
}
