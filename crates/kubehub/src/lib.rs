//! podtime kubehub – client bootstrap, pod watch wiring and annotation patches

#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};

use futures::Stream;
use k8s_openapi::api::core::v1::Pod;
use kube::{
    api::{Api, Patch, PatchParams},
    config::{KubeConfigOptions, Kubeconfig},
    runtime::{watcher, WatchStreamExt},
    Client, Config,
};
use podtime_core::PodSnapshot;
use tracing::{debug, info};

/// Failures while building a cluster client.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("unable to load kubeconfig from {path}: {source}")]
    Kubeconfig {
        path: PathBuf,
        #[source]
        source: kube::config::KubeconfigError,
    },
    #[error("unable to load in-cluster config: {0}")]
    InCluster(#[source] kube::config::InClusterError),
    #[error("unable to create a client: {0}")]
    Build(#[source] kube::Error),
}

/// Failures while narrowing a watched pod into a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SnapshotError {
    #[error("pod is missing metadata.name")]
    MissingName,
}

/// Failures from the annotation patch primitive.
#[derive(Debug, thiserror::Error)]
pub enum PatchError {
    #[error("pod {0} not found")]
    NotFound(String),
    #[error("patching pod {key}: {source}")]
    Api {
        key: String,
        #[source]
        source: kube::Error,
    },
}

impl PatchError {
    pub fn is_not_found(&self) -> bool { matches!(self, PatchError::NotFound(_)) }
}

/// Build a client from a kubeconfig file, or from the in-cluster service account when `path` is `None`.
pub async fn create_client(path: Option<&Path>) -> Result<Client, ClientError> {
    let config = match path {
        Some(p) => {
            let kubeconfig = Kubeconfig::read_from(p)
                .map_err(|source| ClientError::Kubeconfig { path: p.to_path_buf(), source })?;
            Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .map_err(|source| ClientError::Kubeconfig { path: p.to_path_buf(), source })?
        }
        None => Config::incluster().map_err(ClientError::InCluster)?,
    };
    info!(cluster = %config.cluster_url, ns = %config.default_namespace, "kube client configured");
    Client::try_from(config).map_err(ClientError::Build)
}

/// List+watch pods (optionally within one namespace) with the watcher's default backoff.
pub fn pod_watch_stream(
    client: Client,
    namespace: Option<&str>,
) -> impl Stream<Item = Result<watcher::Event<Pod>, watcher::Error>> + Send + 'static {
    let api: Api<Pod> = match namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    };
    info!(ns = ?namespace, "pod watcher configured");
    watcher::watcher(api, watcher::Config::default()).default_backoff()
}

/// Narrow a pod into the snapshot the classifier works on.
pub fn snapshot_from_pod(pod: &Pod) -> Result<PodSnapshot, SnapshotError> {
    let meta = &pod.metadata;
    let name = meta.name.as_deref().filter(|n| !n.is_empty()).ok_or(SnapshotError::MissingName)?;
    let mut snap = PodSnapshot::new(meta.namespace.as_deref(), name);
    if let Some(annos) = &meta.annotations {
        snap.annotations.extend(annos.iter().map(|(k, v)| (k.clone(), v.clone())));
    }
    Ok(snap)
}

/// Merge patch document setting one annotation.
pub fn annotation_patch(key: &str, value: &str) -> serde_json::Value {
    serde_json::json!({ "metadata": { "annotations": { key: value } } })
}

/// Thin pod client used by the reconciler for merge patches.
#[derive(Clone)]
pub struct PodClient {
    client: Client,
}

impl PodClient {
    pub fn new(client: Client) -> Self { Self { client } }

    pub async fn patch_annotations(
        &self,
        namespace: Option<&str>,
        name: &str,
        patch: &serde_json::Value,
    ) -> Result<(), PatchError> {
        let api: Api<Pod> = match namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::default_namespaced(self.client.clone()),
        };
        let key = match namespace {
            Some(ns) => format!("{}/{}", ns, name),
            None => name.to_string(),
        };
        debug!(key = %key, patch = %patch, "patching pod annotations");
        let pp = PatchParams::default();
        match api.patch(name, &pp, &Patch::Merge(patch)).await {
            Ok(_) => {
                metrics::counter!("pod_patch_ok", 1u64);
                Ok(())
            }
            Err(kube::Error::Api(resp)) if resp.code == 404 => Err(PatchError::NotFound(key)),
            Err(source) => {
                metrics::counter!("pod_patch_err", 1u64);
                Err(PatchError::Api { key, source })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::collections::BTreeMap;

    fn pod(ns: Option<&str>, name: Option<&str>, annos: &[(&str, &str)]) -> Pod {
        let annotations = if annos.is_empty() {
            None
        } else {
            Some(annos.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect::<BTreeMap<_, _>>())
        };
        Pod {
            metadata: ObjectMeta {
                namespace: ns.map(|s| s.to_string()),
                name: name.map(|s| s.to_string()),
                annotations,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn snapshot_carries_identity_and_annotations() {
        let p = pod(Some("ns"), Some("pod1"), &[("addtime", "x"), ("other", "y")]);
        let s = snapshot_from_pod(&p).expect("snapshot");
        assert_eq!(s.key().to_string(), "ns/pod1");
        assert_eq!(s.annotation("addtime"), Some("x"));
        assert_eq!(s.annotation("other"), Some("y"));
        assert_eq!(s.annotation("timestamp"), None);
    }

    #[test]
    fn snapshot_without_annotations_is_empty() {
        let s = snapshot_from_pod(&pod(Some("ns"), Some("pod1"), &[])).expect("snapshot");
        assert!(s.annotations.is_empty());
    }

    #[test]
    fn snapshot_rejects_nameless_pod() {
        assert_eq!(snapshot_from_pod(&pod(Some("ns"), None, &[])), Err(SnapshotError::MissingName));
    }

    #[test]
    fn annotation_patch_only_touches_one_key() {
        let p = annotation_patch("timestamp", "2024-01-01T00:00:00Z");
        assert_eq!(p, serde_json::json!({"metadata": {"annotations": {"timestamp": "2024-01-01T00:00:00Z"}}}));
    }

    #[tokio::test]
    async fn missing_kubeconfig_is_reported_as_kubeconfig_error() {
        let err = create_client(Some(Path::new("/nonexistent/podtime/kubeconfig"))).await.err().expect("error");
        assert!(matches!(err, ClientError::Kubeconfig { .. }));
        assert!(err.to_string().contains("/nonexistent/podtime/kubeconfig"));
    }
}
