//! Cluster API seam
//!
//! Every call the driver makes against Kubernetes goes through [`ClusterApi`],
//! so the lifecycle logic can be exercised against a mock or an in-memory
//! cluster in tests while production uses the real kube-rs client.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use k8s_openapi::api::core::v1::{Pod, Secret};
use kube::api::{
    Api, DeleteParams, ListParams, Patch, PatchParams, PropagationPolicy, WatchEvent, WatchParams,
};
use kube::Client;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use kubehost_common::error::is_api_not_found;
use kubehost_common::kube_utils::resolve_context;
use kubehost_common::{Error, FIELD_MANAGER};

/// Stream of watch events for a single Pod
pub type PodWatchStream = BoxStream<'static, Result<WatchEvent<Pod>, Error>>;

/// Trait abstracting the Kubernetes operations a host needs
///
/// Errors from the API server are returned as [`Error::Kube`] without
/// translation. Lookups report a missing object as `Ok(None)` and deletes
/// treat a missing object as success.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Point lookup of a Pod
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>, Error>;

    /// Open a watch on a single Pod, starting after `resource_version`
    ///
    /// The server closes the stream after `timeout`. Dropping the stream
    /// closes the subscription.
    async fn watch_pod(
        &self,
        namespace: &str,
        name: &str,
        resource_version: &str,
        timeout: Duration,
    ) -> Result<PodWatchStream, Error>;

    /// Server-side apply a Pod, returning the stored object
    async fn apply_pod(&self, pod: &Pod) -> Result<Pod, Error>;

    /// Server-side apply a Secret, returning the stored object
    async fn apply_secret(&self, secret: &Secret) -> Result<Secret, Error>;

    /// List Pods matching a label selector
    async fn list_pods(&self, namespace: &str, label_selector: &str) -> Result<Vec<Pod>, Error>;

    /// List Secrets matching a label selector
    async fn list_secrets(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<Secret>, Error>;

    /// Delete a Pod; dependents are garbage collected in the background
    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), Error>;

    /// Delete a Secret
    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<(), Error>;
}

/// A cluster handle and the namespace hosts are placed in
#[derive(Clone)]
pub struct ClusterConnection {
    /// Cluster operations
    pub api: Arc<dyn ClusterApi>,
    /// Namespace for every host object
    pub namespace: String,
}

impl ClusterConnection {
    /// Wrap an API handle and namespace
    pub fn new(api: Arc<dyn ClusterApi>, namespace: impl Into<String>) -> Self {
        Self {
            api,
            namespace: namespace.into(),
        }
    }
}

impl std::fmt::Debug for ClusterConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterConnection")
            .field("namespace", &self.namespace)
            .finish_non_exhaustive()
    }
}

/// Resolves a [`ClusterConnection`] from credentials
#[async_trait]
pub trait ConnectionSource: Send + Sync {
    /// Resolve credentials into a connected API handle and namespace
    async fn connect(&self) -> Result<ClusterConnection, Error>;
}

/// Connection source backed by kube-rs credential resolution
#[derive(Clone, Debug, Default)]
pub struct KubeConnectionSource {
    encoded_kubeconfig: Option<String>,
}

impl KubeConnectionSource {
    /// Use a base64-encoded kubeconfig, or the ambient configuration if `None`
    pub fn new(encoded_kubeconfig: Option<String>) -> Self {
        Self { encoded_kubeconfig }
    }
}

#[async_trait]
impl ConnectionSource for KubeConnectionSource {
    async fn connect(&self) -> Result<ClusterConnection, Error> {
        let ctx = resolve_context(self.encoded_kubeconfig.as_deref()).await?;
        Ok(ClusterConnection::new(
            Arc::new(KubeClusterApi::new(ctx.client)),
            ctx.namespace,
        ))
    }
}

/// Real implementation using the kube-rs client
#[derive(Clone)]
pub struct KubeClusterApi {
    client: Client,
}

impl KubeClusterApi {
    /// Create a new KubeClusterApi wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn secrets(&self, namespace: &str) -> Api<Secret> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

fn apply_params() -> PatchParams {
    PatchParams::apply(FIELD_MANAGER).force()
}

fn delete_params() -> DeleteParams {
    DeleteParams {
        grace_period_seconds: Some(0),
        propagation_policy: Some(PropagationPolicy::Background),
        ..Default::default()
    }
}

fn identity<'a>(
    kind: &str,
    meta: &'a k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta,
) -> Result<(&'a str, &'a str), Error> {
    let name = meta
        .name
        .as_deref()
        .ok_or_else(|| Error::internal_with_context("apply", format!("{} has no name", kind)))?;
    let namespace = meta.namespace.as_deref().ok_or_else(|| {
        Error::internal_with_context("apply", format!("{} {} has no namespace", kind, name))
    })?;
    Ok((namespace, name))
}

/// Map a delete result so that an already-missing object counts as deleted
fn ignore_not_found<T>(result: Result<T, kube::Error>) -> Result<(), Error> {
    match result {
        Ok(_) => Ok(()),
        Err(e) if is_api_not_found(&e) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl ClusterApi for KubeClusterApi {
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>, Error> {
        Ok(self.pods(namespace).get_opt(name).await?)
    }

    async fn watch_pod(
        &self,
        namespace: &str,
        name: &str,
        resource_version: &str,
        timeout: Duration,
    ) -> Result<PodWatchStream, Error> {
        let params = WatchParams::default()
            .fields(&format!("metadata.name={}", name))
            .timeout(timeout.as_secs().max(1) as u32);
        let stream = self
            .pods(namespace)
            .watch(&params, resource_version)
            .await?;
        debug!(namespace = %namespace, name = %name, "opened pod watch");
        Ok(stream.map_err(Error::from).boxed())
    }

    async fn apply_pod(&self, pod: &Pod) -> Result<Pod, Error> {
        let (namespace, name) = identity("Pod", &pod.metadata)?;
        Ok(self
            .pods(namespace)
            .patch(name, &apply_params(), &Patch::Apply(pod))
            .await?)
    }

    async fn apply_secret(&self, secret: &Secret) -> Result<Secret, Error> {
        let (namespace, name) = identity("Secret", &secret.metadata)?;
        Ok(self
            .secrets(namespace)
            .patch(name, &apply_params(), &Patch::Apply(secret))
            .await?)
    }

    async fn list_pods(&self, namespace: &str, label_selector: &str) -> Result<Vec<Pod>, Error> {
        let list = self
            .pods(namespace)
            .list(&ListParams::default().labels(label_selector))
            .await?;
        Ok(list.items)
    }

    async fn list_secrets(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<Secret>, Error> {
        let list = self
            .secrets(namespace)
            .list(&ListParams::default().labels(label_selector))
            .await?;
        Ok(list.items)
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), Error> {
        ignore_not_found(self.pods(namespace).delete(name, &delete_params()).await)
    }

    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<(), Error> {
        ignore_not_found(self.secrets(namespace).delete(name, &delete_params()).await)
    }
}
