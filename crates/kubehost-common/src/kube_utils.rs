//! Kubernetes client resolution using kube-rs
//!
//! Turns the driver's credential option into a working client and the
//! namespace hosts live in. The credential is either a base64-encoded
//! kubeconfig handed to us by the plugin framework, or nothing, in which
//! case the ambient configuration (`KUBECONFIG`, `~/.kube/config`, or the
//! in-cluster service account) is used.

use std::time::Duration;

use base64::{engine::general_purpose::STANDARD, Engine};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use tracing::debug;

use crate::Error;

/// Default connection timeout for kube clients
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default read timeout for kube clients
///
/// Must outlast the server-side watch timeout, otherwise an idle watch on a
/// Pod that has not been scheduled yet is torn down by the client.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(295);

/// A connected client plus the namespace it resolved to
#[derive(Clone)]
pub struct KubeContext {
    /// Authenticated client for the target cluster
    pub client: Client,
    /// Namespace of the current kubeconfig context (or `default`)
    pub namespace: String,
}

impl std::fmt::Debug for KubeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeContext")
            .field("namespace", &self.namespace)
            .finish_non_exhaustive()
    }
}

/// Decode a base64-encoded kubeconfig blob
pub fn decode_kubeconfig(encoded: &str) -> Result<Kubeconfig, Error> {
    let bytes = STANDARD
        .decode(encoded.trim())
        .map_err(|e| Error::config(format!("cannot decode base64 kubeconfig: {}", e)))?;
    let text = String::from_utf8(bytes)
        .map_err(|e| Error::config(format!("kubeconfig is not valid UTF-8: {}", e)))?;
    Kubeconfig::from_yaml(&text)
        .map_err(|e| Error::config(format!("cannot parse kubeconfig: {}", e)))
}

/// Load a client configuration from an optional encoded kubeconfig
///
/// With `Some(blob)`, the decoded kubeconfig's current context is used.
/// With `None`, falls back to `Config::infer()`.
pub async fn load_config(encoded_kubeconfig: Option<&str>) -> Result<Config, Error> {
    let mut config = match encoded_kubeconfig.filter(|s| !s.trim().is_empty()) {
        Some(encoded) => {
            let kubeconfig = decode_kubeconfig(encoded)?;
            Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .map_err(|e| Error::config(format!("failed to load kubeconfig: {}", e)))?
        }
        None => Config::infer()
            .await
            .map_err(|e| Error::config(format!("no reachable cluster context: {}", e)))?,
    };
    config.connect_timeout = Some(DEFAULT_CONNECT_TIMEOUT);
    config.read_timeout = Some(DEFAULT_READ_TIMEOUT);
    Ok(config)
}

/// Build a client from a loaded configuration
pub fn connect(config: Config) -> Result<KubeContext, Error> {
    let namespace = config.default_namespace.clone();
    let client = Client::try_from(config)
        .map_err(|e| Error::config(format!("failed to create client: {}", e)))?;
    debug!(namespace = %namespace, "resolved kubernetes client");
    Ok(KubeContext { client, namespace })
}

/// Resolve credentials into a client and namespace in one step
pub async fn resolve_context(encoded_kubeconfig: Option<&str>) -> Result<KubeContext, Error> {
    connect(load_config(encoded_kubeconfig).await?)
}

#[cfg(test)]
mod tests {
    use super::*;

    const KUBECONFIG: &str = r#"
apiVersion: v1
kind: Config
current-context: hosts
clusters:
- name: lab
  cluster:
    server: https://127.0.0.1:6443
    insecure-skip-tls-verify: true
contexts:
- name: hosts
  context:
    cluster: lab
    user: admin
    namespace: docker-hosts
users:
- name: admin
  user:
    token: abc123
"#;

    #[test]
    fn decode_kubeconfig_reads_current_context() {
        let encoded = STANDARD.encode(KUBECONFIG);
        let kubeconfig = decode_kubeconfig(&encoded).expect("kubeconfig should decode");
        assert_eq!(kubeconfig.current_context.as_deref(), Some("hosts"));
        assert_eq!(kubeconfig.clusters.len(), 1);
    }

    #[test]
    fn decode_kubeconfig_tolerates_trailing_newline() {
        let encoded = format!("{}\n", STANDARD.encode(KUBECONFIG));
        assert!(decode_kubeconfig(&encoded).is_ok());
    }

    #[test]
    fn invalid_base64_is_a_config_error() {
        let err = decode_kubeconfig("!!! not base64 !!!").unwrap_err();
        assert!(matches!(err, Error::Config { .. }));
        assert!(err.to_string().contains("base64"));
    }

    #[test]
    fn invalid_yaml_is_a_config_error() {
        let encoded = STANDARD.encode("clusters: [unterminated");
        let err = decode_kubeconfig(&encoded).unwrap_err();
        assert!(matches!(err, Error::Config { .. }));
    }

    #[tokio::test]
    async fn load_config_uses_context_namespace_and_timeouts() {
        let encoded = STANDARD.encode(KUBECONFIG);
        let config = load_config(Some(&encoded))
            .await
            .expect("config should load");
        assert_eq!(config.default_namespace, "docker-hosts");
        assert_eq!(config.connect_timeout, Some(DEFAULT_CONNECT_TIMEOUT));
        assert_eq!(config.read_timeout, Some(DEFAULT_READ_TIMEOUT));
    }
}
