//! Converging a host's objects onto the cluster
//!
//! The applier makes the cluster match a desired [`HostObjects`] set. Every
//! applied object is labelled with its owner (the host Pod) so that a later
//! converge can find what it applied before and delete whatever is no longer
//! wanted. Lookup and deletion never leave the owner's namespace or label set.
//!
//! The Secret also carries an `ownerReference` to the Pod. Deleting the Pod
//! therefore takes the Secret with it through the cluster's garbage
//! collector; the applier does not delete such dependents itself.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use k8s_openapi::api::core::v1::{Pod, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use tracing::{debug, info};

use kubehost_common::Error;

use crate::api::ClusterApi;
use crate::objects::{HostObjects, OwnerKey};

/// What a converge call should make true
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConvergeIntent {
    /// Create or update the desired set, then prune anything else owned
    Apply,
    /// Delete everything previously applied for this owner
    PruneToEmpty,
}

/// A namespaced object identity
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectKey {
    /// Resource kind
    pub kind: &'static str,
    /// Namespace
    pub namespace: String,
    /// Name
    pub name: String,
}

impl ObjectKey {
    fn new(kind: &'static str, namespace: &str, name: &str) -> Self {
        Self {
            kind,
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }
}

impl std::fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}/{}", self.kind, self.namespace, self.name)
    }
}

/// What a converge call did
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConvergeReport {
    /// Objects created or updated
    pub applied: Vec<ObjectKey>,
    /// Objects deleted explicitly
    pub deleted: Vec<ObjectKey>,
    /// Objects left to garbage collection because their owner was deleted
    pub cascaded: Vec<ObjectKey>,
}

/// Applies host object sets through a [`ClusterApi`]
pub struct Applier {
    api: Arc<dyn ClusterApi>,
}

impl Applier {
    /// Create an applier using the given cluster handle
    pub fn new(api: Arc<dyn ClusterApi>) -> Self {
        Self { api }
    }

    /// Make the cluster match `objects` for the given intent
    ///
    /// Errors from the cluster are returned as-is. A failure part way through
    /// can leave the Pod applied without its Secret; converging again (or
    /// pruning) repairs that.
    pub async fn converge(
        &self,
        objects: &HostObjects,
        intent: ConvergeIntent,
    ) -> Result<ConvergeReport, Error> {
        let owner = objects.owner();
        let namespace = owner.namespace.as_str();
        let selector = owner.selector();

        let existing_pods = self.api.list_pods(namespace, &selector).await?;
        let existing_secrets = self.api.list_secrets(namespace, &selector).await?;

        let mut report = ConvergeReport::default();
        if intent == ConvergeIntent::Apply {
            self.apply_set(objects, &owner, &mut report).await?;
        }

        let desired: BTreeSet<ObjectKey> = report.applied.iter().cloned().collect();
        self.prune(existing_pods, existing_secrets, &desired, &mut report)
            .await?;

        info!(
            owner = %owner.name,
            namespace = %namespace,
            ?intent,
            applied = report.applied.len(),
            deleted = report.deleted.len(),
            cascaded = report.cascaded.len(),
            "converged host objects"
        );
        Ok(report)
    }

    async fn apply_set(
        &self,
        objects: &HostObjects,
        owner: &OwnerKey,
        report: &mut ConvergeReport,
    ) -> Result<(), Error> {
        let labels = owner.labels();

        // The Pod goes first: the Secret's ownerReference needs its UID
        let mut pod = objects.pod.clone();
        stamp_labels(&mut pod.metadata, &labels);
        let applied_pod = self.api.apply_pod(&pod).await?;
        debug!(pod = %owner.name, namespace = %owner.namespace, "applied pod");
        report
            .applied
            .push(ObjectKey::new("Pod", &owner.namespace, objects.name()));

        let owner_ref = owner_reference(&applied_pod)?;
        let mut secret = objects.secret.clone();
        stamp_labels(&mut secret.metadata, &labels);
        secret.metadata.owner_references = Some(vec![owner_ref]);
        self.api.apply_secret(&secret).await?;
        debug!(secret = %owner.name, namespace = %owner.namespace, "applied secret");
        let secret_name = secret.metadata.name.as_deref().unwrap_or_default();
        report
            .applied
            .push(ObjectKey::new("Secret", &owner.namespace, secret_name));

        Ok(())
    }

    async fn prune(
        &self,
        pods: Vec<Pod>,
        secrets: Vec<Secret>,
        desired: &BTreeSet<ObjectKey>,
        report: &mut ConvergeReport,
    ) -> Result<(), Error> {
        let mut deleted_uids = BTreeSet::new();

        for pod in pods {
            let Some(key) = key_of("Pod", &pod.metadata) else {
                continue;
            };
            if desired.contains(&key) {
                continue;
            }
            self.api.delete_pod(&key.namespace, &key.name).await?;
            debug!(object = %key, "deleted pod");
            if let Some(uid) = pod.metadata.uid {
                deleted_uids.insert(uid);
            }
            report.deleted.push(key);
        }

        for secret in secrets {
            let Some(key) = key_of("Secret", &secret.metadata) else {
                continue;
            };
            if desired.contains(&key) {
                continue;
            }
            if owned_by_any(&secret.metadata, &deleted_uids) {
                debug!(object = %key, "left to garbage collection");
                report.cascaded.push(key);
                continue;
            }
            self.api.delete_secret(&key.namespace, &key.name).await?;
            debug!(object = %key, "deleted orphaned secret");
            report.deleted.push(key);
        }

        Ok(())
    }
}

fn key_of(kind: &'static str, meta: &ObjectMeta) -> Option<ObjectKey> {
    Some(ObjectKey::new(
        kind,
        meta.namespace.as_deref()?,
        meta.name.as_deref()?,
    ))
}

fn stamp_labels(meta: &mut ObjectMeta, labels: &BTreeMap<String, String>) {
    let existing = meta.labels.get_or_insert_with(BTreeMap::new);
    existing.extend(labels.iter().map(|(k, v)| (k.clone(), v.clone())));
}

fn owned_by_any(meta: &ObjectMeta, uids: &BTreeSet<String>) -> bool {
    meta.owner_references
        .as_ref()
        .is_some_and(|refs| refs.iter().any(|r| uids.contains(&r.uid)))
}

/// Owner reference pointing at an applied Pod
pub fn owner_reference(pod: &Pod) -> Result<OwnerReference, Error> {
    let name = pod
        .metadata
        .name
        .clone()
        .ok_or_else(|| Error::internal_with_context("apply", "applied pod has no name"))?;
    let uid = pod.metadata.uid.clone().ok_or_else(|| {
        Error::internal_with_context("apply", format!("applied pod {} has no uid", name))
    })?;
    Ok(OwnerReference {
        api_version: "v1".to_string(),
        kind: "Pod".to_string(),
        name,
        uid,
        controller: Some(true),
        block_owner_deletion: Some(true),
    })
}
