//! podtime controller – stamps pods carrying a trigger annotation
//!
//! Data flow: change-stream cache → dispatcher (classify) → work queue →
//! workers → reconciler (merge patch). A single cancellation token stops the
//! cache, the dispatcher and the queue; in-flight patches finish on their own.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use futures::Stream;
use k8s_openapi::api::core::v1::Pod;
use kube::runtime::watcher;
use podtime_core::ControllerConfig;
use podtime_kubehub::{ClientError, PodClient};
use podtime_queue::WorkQueue;
use podtime_store::{CacheHandle, ChangeStreamCache};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub mod dispatch;
pub mod lifecycle;
pub mod reconcile;
pub mod worker;

pub use dispatch::{handle_event, run_dispatcher, Dispatch};
pub use lifecycle::Lifecycle;
pub use reconcile::{AnnotationPatcher, Clock, ReconcileError, Reconciler, SystemClock};
pub use worker::{process_next_item, run_worker, Outcome};

/// Startup and run-loop failures; anything here ends the process.
#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("error creating kube client: {0}")]
    Client(#[from] ClientError),
    #[error("cancelled while waiting for the pod cache to sync")]
    SyncCancelled,
    #[error("pod watch ended before the cache synced")]
    SyncFailed,
    #[error("pod cache did not sync within {0:?}")]
    SyncTimeout(Duration),
    #[error("pod watch ended unexpectedly")]
    WatchEnded,
}

pub struct Controller<P> {
    config: ControllerConfig,
    reconciler: Arc<Reconciler<P>>,
    queue: WorkQueue<String>,
}

impl<P: AnnotationPatcher + 'static> Controller<P> {
    pub fn new(config: ControllerConfig, patcher: P) -> Result<Self, ControllerError> {
        Self::with_queue(config, patcher, WorkQueue::with_default_rate_limiter())
    }

    pub fn with_queue(config: ControllerConfig, patcher: P, queue: WorkQueue<String>) -> Result<Self, ControllerError> {
        validate(&config)?;
        let reconciler = Arc::new(Reconciler::new(patcher, config.markers.clone()));
        Ok(Self { config, reconciler, queue })
    }

    pub fn queue(&self) -> WorkQueue<String> { self.queue.clone() }

    /// Run until `cancel` fires. Fails fast if the initial listing does not sync.
    pub async fn run<S>(self, stream: S, cancel: CancellationToken) -> Result<(), ControllerError>
    where
        S: Stream<Item = Result<watcher::Event<Pod>, watcher::Error>> + Send + 'static,
    {
        let cfg = &self.config;
        info!(
            trigger = %cfg.markers.trigger,
            processed = %cfg.markers.processed,
            workers = cfg.workers,
            max_retries = cfg.max_retries,
            "pod time controller starting"
        );

        let (cache, handle, events) = ChangeStreamCache::new(cfg.event_capacity, cfg.resync);
        let cache_cancel = cancel.child_token();
        let mut cache_task = tokio::spawn(cache.run(stream, cache_cancel.clone()));

        if let Err(e) = wait_for_sync(&handle, &cancel, cfg.sync_timeout).await {
            cache_cancel.cancel();
            if let Err(join) = cache_task.await {
                warn!(error = %join, "cache task failed");
            }
            return Err(e);
        }
        info!(pods = handle.len(), "pod cache synced; starting workers");

        let dispatcher = tokio::spawn(run_dispatcher(events, self.queue.clone(), cfg.markers.clone(), cancel.clone()));
        let workers: Vec<_> = (0..cfg.workers)
            .map(|id| tokio::spawn(run_worker(id, self.queue.clone(), Arc::clone(&self.reconciler), cfg.max_retries)))
            .collect();

        let mut result = Ok(());
        tokio::select! {
            _ = cancel.cancelled() => info!("shutdown requested"),
            joined = &mut cache_task => {
                if let Err(e) = joined {
                    warn!(error = %e, "cache task failed");
                }
                error!("pod watch stopped; shutting down");
                result = Err(ControllerError::WatchEnded);
            }
        }
        cache_cancel.cancel();
        self.queue.shut_down();

        for w in workers {
            if let Err(e) = w.await {
                warn!(error = %e, "worker task failed");
            }
        }
        if let Err(e) = dispatcher.await {
            warn!(error = %e, "dispatcher task failed");
        }
        if !cache_task.is_finished() {
            if let Err(e) = cache_task.await {
                warn!(error = %e, "cache task failed");
            }
        }
        info!("pod time controller stopped");
        result
    }
}

fn validate(config: &ControllerConfig) -> Result<(), ControllerError> {
    if config.markers.trigger.is_empty() || config.markers.processed.is_empty() {
        return Err(ControllerError::Config("annotation names must not be empty".into()));
    }
    if config.markers.trigger == config.markers.processed {
        return Err(ControllerError::Config(format!(
            "trigger and processed annotations are both {:?}",
            config.markers.trigger
        )));
    }
    if config.workers == 0 {
        return Err(ControllerError::Config("at least one worker is required".into()));
    }
    Ok(())
}

async fn wait_for_sync(handle: &CacheHandle, cancel: &CancellationToken, timeout: Duration) -> Result<(), ControllerError> {
    match tokio::time::timeout(timeout, handle.wait_synced(cancel)).await {
        Ok(true) => Ok(()),
        Ok(false) if cancel.is_cancelled() => Err(ControllerError::SyncCancelled),
        Ok(false) => Err(ControllerError::SyncFailed),
        Err(_) => Err(ControllerError::SyncTimeout(timeout)),
    }
}

/// Build a cluster client from `config` and run the controller until `cancel` fires.
pub async fn run(config: ControllerConfig, cancel: CancellationToken) -> Result<(), ControllerError> {
    let client = podtime_kubehub::create_client(config.kubeconfig.as_deref()).await?;
    let stream = podtime_kubehub::pod_watch_stream(client.clone(), config.namespace.as_deref());
    let controller = Controller::new(config, PodClient::new(client))?;
    controller.run(stream, cancel).await
}
