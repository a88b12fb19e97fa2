//! Common types for kubehost: errors, kube client resolution, and shared constants

#![deny(missing_docs)]

pub mod error;
pub mod kube_utils;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Driver name reported to the plugin framework
pub const DEFAULT_DRIVER_NAME: &str = "kubernetes";

/// Image run for a host when none is configured
pub const DEFAULT_IMAGE: &str = "ghcr.io/william86370/rke2ink:systemd";

/// SSH user baked into the default image
pub const DEFAULT_SSH_USER: &str = "sles";

/// SSH port exposed by every host
pub const DEFAULT_SSH_PORT: u16 = 22;

/// Port the docker daemon listens on inside a host
pub const DOCKER_PORT: u16 = 2376;

/// Field manager used for server-side apply
pub const FIELD_MANAGER: &str = "kubehost";

/// Standard Kubernetes label for the managing tool
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";

/// Value of [`LABEL_MANAGED_BY`] on every object we create
pub const LABEL_MANAGED_BY_KUBEHOST: &str = "kubehost";

/// Label carrying the name of the object that owns an applied set
pub const LABEL_OWNER_NAME: &str = "kubehost.io/owner-name";

/// Label carrying the namespace of the object that owns an applied set
pub const LABEL_OWNER_NAMESPACE: &str = "kubehost.io/owner-namespace";

/// Label carrying the kind of the object that owns an applied set
pub const LABEL_OWNER_KIND: &str = "kubehost.io/owner-kind";
