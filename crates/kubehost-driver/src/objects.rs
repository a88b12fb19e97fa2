//! Desired object construction for a host
//!
//! Builds the Pod and Secret that together make up one docker host. Pure and
//! deterministic: the same inputs always produce the same objects, and no
//! ownership metadata is attached here. Ownership labels and references are
//! stamped on by the applier, which knows the owner's UID.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    Container, ContainerPort, PersistentVolumeClaimVolumeSource, Pod, PodSpec,
    ResourceRequirements, Secret, SecretVolumeSource, SecurityContext, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;

use kubehost_common::{Error, LABEL_MANAGED_BY, LABEL_MANAGED_BY_KUBEHOST};

/// Name of the single container in a host Pod
pub const CONTAINER_NAME: &str = "machine";

/// Volume backed by the host's Secret
pub const DATA_VOLUME: &str = "data";

/// Volume backed by the shared cache claim
pub const CACHE_VOLUME: &str = "cache-volume";

/// PersistentVolumeClaim used for the cache volume by default
pub const DEFAULT_CACHE_CLAIM: &str = "k8-core";

/// Where the cache volume is mounted
pub const CACHE_MOUNT_PATH: &str = "/var/lib/rancher";

/// Secret key holding cloud-init user-data
pub const USER_DATA_KEY: &str = "user-data";

/// Secret key holding cloud-init meta-data
pub const META_DATA_KEY: &str = "meta-data";

/// cloud-init NoCloud seed path for user-data
pub const USER_DATA_PATH: &str = "/var/lib/cloud/seed/nocloud/user-data";

/// cloud-init NoCloud seed path for meta-data
pub const META_DATA_PATH: &str = "/var/lib/cloud/seed/nocloud/meta-data";

/// Memory limit applied to a host container by default
pub const DEFAULT_MEMORY_LIMIT: &str = "2Gi";

/// Ports every host container exposes, by name
pub const HOST_PORTS: [(&str, i32); 5] = [
    ("ssh", 22),
    ("kube-api", 6443),
    ("endpoint", 9435),
    ("https", 443),
    ("http", 80),
];

/// Tunables for the host Pod that are not part of a host's identity
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PodOptions {
    /// Claim backing the shared cache volume
    pub cache_claim: String,
    /// Memory limit for the host container (Kubernetes quantity)
    pub memory_limit: String,
}

impl Default for PodOptions {
    fn default() -> Self {
        Self {
            cache_claim: DEFAULT_CACHE_CLAIM.to_string(),
            memory_limit: DEFAULT_MEMORY_LIMIT.to_string(),
        }
    }
}

/// Identity of the object that owns an applied set
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct OwnerKey {
    /// Owner kind (always `Pod` for hosts)
    pub kind: String,
    /// Owner namespace
    pub namespace: String,
    /// Owner name
    pub name: String,
}

impl OwnerKey {
    /// Labels stamped on every object in the owner's applied set
    pub fn labels(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            (
                LABEL_MANAGED_BY.to_string(),
                LABEL_MANAGED_BY_KUBEHOST.to_string(),
            ),
            (
                kubehost_common::LABEL_OWNER_KIND.to_string(),
                self.kind.clone(),
            ),
            (
                kubehost_common::LABEL_OWNER_NAMESPACE.to_string(),
                self.namespace.clone(),
            ),
            (
                kubehost_common::LABEL_OWNER_NAME.to_string(),
                self.name.clone(),
            ),
        ])
    }

    /// Label selector matching the owner's applied set
    pub fn selector(&self) -> String {
        self.labels()
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// The Pod and Secret that make up one host
#[derive(Clone, Debug, PartialEq)]
pub struct HostObjects {
    /// The host workload
    pub pod: Pod,
    /// cloud-init payloads mounted into the workload
    pub secret: Secret,
}

impl HostObjects {
    /// The "desired state: deleted" set for a host
    ///
    /// Carries the same identity as the present set but no image and no
    /// payloads. The applier only reads its name, namespace and kind.
    pub fn absent(namespace: &str, name: &str) -> Self {
        build_host_objects(namespace, name, "", None, None, &PodOptions::default())
    }

    /// Host name shared by both objects
    pub fn name(&self) -> &str {
        self.pod.metadata.name.as_deref().unwrap_or_default()
    }

    /// Namespace shared by both objects
    pub fn namespace(&self) -> &str {
        self.pod.metadata.namespace.as_deref().unwrap_or_default()
    }

    /// The owner of this set: the Pod
    pub fn owner(&self) -> OwnerKey {
        OwnerKey {
            kind: "Pod".to_string(),
            namespace: self.namespace().to_string(),
            name: self.name().to_string(),
        }
    }
}

/// Build the Pod and Secret for a host.
///
/// `None` payloads leave the key out of the Secret entirely, which is how the
/// deletion sentinel ends up with an empty data map. `Some(&[])` keeps the key
/// with an empty value so the subPath mount still resolves to a file.
pub fn build_host_objects(
    namespace: &str,
    name: &str,
    image: &str,
    user_data: Option<&[u8]>,
    meta_data: Option<&[u8]>,
    options: &PodOptions,
) -> HostObjects {
    HostObjects {
        pod: build_pod(namespace, name, image, options),
        secret: build_secret(namespace, name, user_data, meta_data),
    }
}

/// Render the cloud-init meta-data document carrying the host's public key
pub fn build_meta_data(public_key: &[u8]) -> Result<Vec<u8>, Error> {
    let doc = serde_json::json!({
        "public-keys": [String::from_utf8_lossy(public_key)],
    });
    Ok(serde_json::to_vec(&doc)?)
}

fn object_meta(namespace: &str, name: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(namespace.to_string()),
        labels: Some(BTreeMap::from([(
            LABEL_MANAGED_BY.to_string(),
            LABEL_MANAGED_BY_KUBEHOST.to_string(),
        )])),
        ..Default::default()
    }
}

fn build_pod(namespace: &str, name: &str, image: &str, options: &PodOptions) -> Pod {
    let ports = HOST_PORTS
        .iter()
        .map(|(port_name, port)| ContainerPort {
            container_port: *port,
            name: Some(port_name.to_string()),
            ..Default::default()
        })
        .collect();

    let volume_mounts = vec![
        VolumeMount {
            name: CACHE_VOLUME.to_string(),
            mount_path: CACHE_MOUNT_PATH.to_string(),
            ..Default::default()
        },
        VolumeMount {
            name: DATA_VOLUME.to_string(),
            mount_path: META_DATA_PATH.to_string(),
            sub_path: Some(META_DATA_KEY.to_string()),
            ..Default::default()
        },
        VolumeMount {
            name: DATA_VOLUME.to_string(),
            mount_path: USER_DATA_PATH.to_string(),
            sub_path: Some(USER_DATA_KEY.to_string()),
            ..Default::default()
        },
    ];

    let volumes = vec![
        Volume {
            name: CACHE_VOLUME.to_string(),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: options.cache_claim.clone(),
                read_only: None,
            }),
            ..Default::default()
        },
        Volume {
            name: DATA_VOLUME.to_string(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(name.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        },
    ];

    let container = Container {
        name: CONTAINER_NAME.to_string(),
        image: Some(image.to_string()),
        ports: Some(ports),
        volume_mounts: Some(volume_mounts),
        resources: Some(ResourceRequirements {
            limits: Some(BTreeMap::from([(
                "memory".to_string(),
                Quantity(options.memory_limit.clone()),
            )])),
            ..Default::default()
        }),
        security_context: Some(SecurityContext {
            privileged: Some(true),
            ..Default::default()
        }),
        stdin: Some(true),
        stdin_once: Some(true),
        tty: Some(true),
        ..Default::default()
    };

    Pod {
        metadata: object_meta(namespace, name),
        spec: Some(PodSpec {
            containers: vec![container],
            volumes: Some(volumes),
            // Host lifecycle is driven by us, never by the kubelet
            restart_policy: Some("Never".to_string()),
            automount_service_account_token: Some(false),
            hostname: Some(name.to_string()),
            termination_grace_period_seconds: Some(0),
            ..Default::default()
        }),
        status: None,
    }
}

fn build_secret(
    namespace: &str,
    name: &str,
    user_data: Option<&[u8]>,
    meta_data: Option<&[u8]>,
) -> Secret {
    let mut data = BTreeMap::new();
    if let Some(bytes) = user_data {
        data.insert(USER_DATA_KEY.to_string(), ByteString(bytes.to_vec()));
    }
    if let Some(bytes) = meta_data {
        data.insert(META_DATA_KEY.to_string(), ByteString(bytes.to_vec()));
    }

    Secret {
        metadata: object_meta(namespace, name),
        data: Some(data),
        ..Default::default()
    }
}
