#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::error::ErrorResponse;
use podtime_controller::AnnotationPatcher;
use podtime_core::ObjectKey;
use podtime_kubehub::PatchError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    Ok,
    Fail,
    Gone,
}

#[derive(Default)]
struct State {
    calls: Vec<(ObjectKey, serde_json::Value)>,
    modes: BTreeMap<String, Mode>,
}

/// In-memory stand-in for the API server's patch endpoint.
#[derive(Clone, Default)]
pub struct FakeCluster {
    state: Arc<Mutex<State>>,
}

impl FakeCluster {
    pub fn set_mode(&self, key: &str, mode: Mode) { self.state.lock().unwrap().modes.insert(key.to_string(), mode); }

    pub fn calls(&self) -> Vec<(ObjectKey, serde_json::Value)> { self.state.lock().unwrap().calls.clone() }

    pub fn calls_for(&self, key: &str) -> usize {
        self.state.lock().unwrap().calls.iter().filter(|(k, _)| k.to_string() == key).count()
    }
}

#[async_trait::async_trait]
impl AnnotationPatcher for FakeCluster {
    async fn merge_annotations(&self, key: &ObjectKey, patch: &serde_json::Value) -> Result<(), PatchError> {
        let mut st = self.state.lock().unwrap();
        st.calls.push((key.clone(), patch.clone()));
        match st.modes.get(&key.to_string()).copied().unwrap_or(Mode::Ok) {
            Mode::Ok => Ok(()),
            Mode::Gone => Err(PatchError::NotFound(key.to_string())),
            Mode::Fail => Err(PatchError::Api {
                key: key.to_string(),
                source: kube::Error::Api(ErrorResponse {
                    status: "Failure".into(),
                    message: "etcdserver: request timed out".into(),
                    reason: "InternalError".into(),
                    code: 500,
                }),
            }),
        }
    }
}

pub fn pod(ns: &str, name: &str, annos: &[(&str, &str)]) -> Pod {
    Pod {
        metadata: ObjectMeta {
            namespace: Some(ns.to_string()),
            name: Some(name.to_string()),
            annotations: Some(annos.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()),
            ..Default::default()
        },
        ..Default::default()
    }
}

/// Poll `cond` until it holds or a few seconds pass.
pub async fn eventually(mut cond: impl FnMut() -> bool) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}
