//! Docker host lifecycle on Kubernetes
//!
//! Each host is a privileged Pod booted by cloud-init, plus a Secret carrying
//! its user-data and meta-data. The [`KubernetesDriver`] creates, starts,
//! stops and inspects hosts by converging these two objects onto the cluster
//! and watching the Pod for its IP.

#![deny(missing_docs)]

pub mod api;
pub mod apply;
pub mod driver;
pub mod objects;
pub mod ssh;
pub mod state;
pub mod watch;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use api::{ClusterApi, ClusterConnection, ConnectionSource, KubeConnectionSource};
pub use driver::{HostIdentity, HostRuntime, KubernetesDriver};
pub use state::HostState;
