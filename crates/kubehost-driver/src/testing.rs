//! In-memory cluster for lifecycle tests
//!
//! Stores Pods and Secrets, assigns UIDs and resource versions, garbage
//! collects Secrets owned by deleted Pods, and scripts Pod IP assignment
//! through the watch stream. Available to other crates' tests through the
//! `testing` feature.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use k8s_openapi::api::core::v1::{Pod, PodStatus, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::WatchEvent;
use parking_lot::Mutex;

use kubehost_common::Error;

use crate::api::{ClusterApi, ClusterConnection, ConnectionSource, PodWatchStream};

type Key = (String, String);

/// How the fake cluster answers a watch
#[derive(Clone, Debug, Default)]
pub enum IpPlan {
    /// Report a Pending event with no IP, then Running with this IP
    Assign(String),
    /// Keep the stream open without ever reporting an IP
    #[default]
    Never,
    /// Close the stream after a single Pending event with no IP
    CloseEarly,
}

#[derive(Default)]
struct State {
    pods: BTreeMap<Key, Pod>,
    secrets: BTreeMap<Key, Secret>,
    next_uid: u64,
    next_rv: u64,
    calls: Vec<String>,
}

impl State {
    fn bump_rv(&mut self) -> String {
        self.next_rv += 1;
        self.next_rv.to_string()
    }

    fn new_uid(&mut self) -> String {
        self.next_uid += 1;
        format!("uid-{}", self.next_uid)
    }
}

/// Drops with the watch stream that owns it
struct WatchGuard(Arc<AtomicUsize>);

impl Drop for WatchGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A cluster held in memory
#[derive(Default)]
pub struct FakeCluster {
    state: Mutex<State>,
    plan: Mutex<IpPlan>,
    open_watches: Arc<AtomicUsize>,
}

fn key(meta: &ObjectMeta) -> Key {
    (
        meta.namespace.clone().unwrap_or_default(),
        meta.name.clone().unwrap_or_default(),
    )
}

fn matches_selector(meta: &ObjectMeta, selector: &str) -> bool {
    let labels = meta.labels.clone().unwrap_or_default();
    selector
        .split(',')
        .filter(|s| !s.is_empty())
        .all(|term| match term.split_once('=') {
            Some((k, v)) => labels.get(k).map(String::as_str) == Some(v),
            None => false,
        })
}

impl FakeCluster {
    /// Empty cluster answering watches according to `plan`
    pub fn new(plan: IpPlan) -> Arc<Self> {
        let fake = Self::default();
        *fake.plan.lock() = plan;
        Arc::new(fake)
    }

    /// Stored Pod, if any
    pub fn pod(&self, namespace: &str, name: &str) -> Option<Pod> {
        self.state
            .lock()
            .pods
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    /// Stored Secret, if any
    pub fn secret(&self, namespace: &str, name: &str) -> Option<Secret> {
        self.state
            .lock()
            .secrets
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    /// Store an object as if someone else created it
    pub fn insert_pod(&self, pod: Pod) {
        let mut state = self.state.lock();
        let mut pod = pod;
        if pod.metadata.uid.is_none() {
            pod.metadata.uid = Some(state.new_uid());
        }
        pod.metadata.resource_version = Some(state.bump_rv());
        state.pods.insert(key(&pod.metadata), pod);
    }

    /// Store a Secret as if someone else created it
    pub fn insert_secret(&self, secret: Secret) {
        let mut state = self.state.lock();
        let mut secret = secret;
        secret.metadata.resource_version = Some(state.bump_rv());
        state.secrets.insert(key(&secret.metadata), secret);
    }

    /// Every mutating call made so far, e.g. `delete_pod default/demo`
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().calls.clone()
    }

    /// Forget recorded calls
    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    /// Watch streams not yet dropped
    pub fn open_watches(&self) -> usize {
        self.open_watches.load(Ordering::SeqCst)
    }

    fn guarded(&self, events: Vec<Result<WatchEvent<Pod>, Error>>, close: bool) -> PodWatchStream {
        self.open_watches.fetch_add(1, Ordering::SeqCst);
        let guard = WatchGuard(self.open_watches.clone());
        let events = stream::iter(events);
        let inner = if close {
            events.boxed()
        } else {
            events.chain(stream::pending()).boxed()
        };
        inner
            .map(move |event| {
                let _held = &guard;
                event
            })
            .boxed()
    }
}

#[async_trait]
impl ClusterApi for FakeCluster {
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>, Error> {
        Ok(self.pod(namespace, name))
    }

    async fn watch_pod(
        &self,
        namespace: &str,
        name: &str,
        _resource_version: &str,
        _timeout: Duration,
    ) -> Result<PodWatchStream, Error> {
        let plan = self.plan.lock().clone();
        let mut state = self.state.lock();
        state.calls.push(format!("watch_pod {}/{}", namespace, name));
        let k = (namespace.to_string(), name.to_string());
        let Some(pending) = state.pods.get(&k).cloned() else {
            return Ok(self.guarded(vec![], false));
        };

        match plan {
            IpPlan::Assign(ip) => {
                let rv = state.bump_rv();
                let Some(pod) = state.pods.get_mut(&k) else {
                    return Ok(self.guarded(vec![], false));
                };
                pod.metadata.resource_version = Some(rv);
                pod.status = Some(PodStatus {
                    phase: Some("Running".to_string()),
                    pod_ip: Some(ip),
                    ..Default::default()
                });
                let running = pod.clone();
                Ok(self.guarded(
                    vec![
                        Ok(WatchEvent::Modified(pending)),
                        Ok(WatchEvent::Modified(running)),
                    ],
                    false,
                ))
            }
            IpPlan::Never => Ok(self.guarded(vec![Ok(WatchEvent::Modified(pending))], false)),
            IpPlan::CloseEarly => Ok(self.guarded(vec![Ok(WatchEvent::Modified(pending))], true)),
        }
    }

    async fn apply_pod(&self, pod: &Pod) -> Result<Pod, Error> {
        let mut state = self.state.lock();
        let k = key(&pod.metadata);
        state.calls.push(format!("apply_pod {}/{}", k.0, k.1));
        let rv = state.bump_rv();
        let existing = state.pods.get(&k).cloned();
        let mut stored = pod.clone();
        match existing {
            Some(existing) => {
                stored.metadata.uid = existing.metadata.uid;
                stored.status = existing.status;
            }
            None => {
                stored.metadata.uid = Some(state.new_uid());
                stored.status = Some(PodStatus {
                    phase: Some("Pending".to_string()),
                    ..Default::default()
                });
            }
        }
        stored.metadata.resource_version = Some(rv);
        state.pods.insert(k, stored.clone());
        Ok(stored)
    }

    async fn apply_secret(&self, secret: &Secret) -> Result<Secret, Error> {
        let mut state = self.state.lock();
        let k = key(&secret.metadata);
        state.calls.push(format!("apply_secret {}/{}", k.0, k.1));
        let rv = state.bump_rv();
        let uid = match state.secrets.get(&k) {
            Some(existing) => existing.metadata.uid.clone(),
            None => Some(state.new_uid()),
        };
        let mut stored = secret.clone();
        stored.metadata.uid = uid;
        stored.metadata.resource_version = Some(rv);
        state.secrets.insert(k, stored.clone());
        Ok(stored)
    }

    async fn list_pods(&self, namespace: &str, label_selector: &str) -> Result<Vec<Pod>, Error> {
        Ok(self
            .state
            .lock()
            .pods
            .iter()
            .filter(|((ns, _), pod)| ns == namespace && matches_selector(&pod.metadata, label_selector))
            .map(|(_, pod)| pod.clone())
            .collect())
    }

    async fn list_secrets(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<Secret>, Error> {
        Ok(self
            .state
            .lock()
            .secrets
            .iter()
            .filter(|((ns, _), s)| ns == namespace && matches_selector(&s.metadata, label_selector))
            .map(|(_, s)| s.clone())
            .collect())
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let mut state = self.state.lock();
        state.calls.push(format!("delete_pod {}/{}", namespace, name));
        let removed = state
            .pods
            .remove(&(namespace.to_string(), name.to_string()));

        // Garbage collection of dependents
        if let Some(uid) = removed.and_then(|p| p.metadata.uid) {
            state.secrets.retain(|_, secret| {
                !secret
                    .metadata
                    .owner_references
                    .as_ref()
                    .is_some_and(|refs| refs.iter().any(|r| r.uid == uid))
            });
        }
        Ok(())
    }

    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let mut state = self.state.lock();
        state
            .calls
            .push(format!("delete_secret {}/{}", namespace, name));
        state
            .secrets
            .remove(&(namespace.to_string(), name.to_string()));
        Ok(())
    }
}

/// Connection source handing out a [`FakeCluster`]
pub struct FakeConnectionSource {
    cluster: Arc<FakeCluster>,
    namespace: String,
}

impl FakeConnectionSource {
    /// Connect to `cluster`, placing hosts in `namespace`
    pub fn new(cluster: Arc<FakeCluster>, namespace: impl Into<String>) -> Self {
        Self {
            cluster,
            namespace: namespace.into(),
        }
    }
}

#[async_trait]
impl ConnectionSource for FakeConnectionSource {
    async fn connect(&self) -> Result<ClusterConnection, Error> {
        Ok(ClusterConnection::new(
            self.cluster.clone(),
            self.namespace.clone(),
        ))
    }
}
