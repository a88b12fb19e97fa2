//! Host lifecycle controller
//!
//! [`KubernetesDriver`] turns the plugin framework's lifecycle calls into
//! object convergence on the cluster. Host identity is fixed at construction;
//! the only mutable state is the cached address and the cluster connection,
//! which changes only through [`KubernetesDriver::reload`].
//!
//! Calls for one host must be serialized by the caller. Nothing here runs in
//! the background: dropping a call's future cancels it, including any watch
//! it has open.

use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};

use kubehost_common::{
    Error, DEFAULT_DRIVER_NAME, DEFAULT_IMAGE, DEFAULT_SSH_PORT, DEFAULT_SSH_USER, DOCKER_PORT,
};

use crate::api::{ClusterConnection, ConnectionSource};
use crate::apply::{Applier, ConvergeIntent};
use crate::objects::{
    build_host_objects, build_meta_data, HostObjects, PodOptions, DEFAULT_CACHE_CLAIM,
    DEFAULT_MEMORY_LIMIT,
};
use crate::ssh::{public_key_path, KeyGenerator, SshKeygen};
use crate::state::{state_of, HostState};
use crate::watch::{await_address, DEFAULT_ADDRESS_TIMEOUT};

/// Bound on every lifecycle call
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// File name of the host's private key inside its store directory
pub const PRIVATE_KEY_FILE: &str = "id_rsa";

/// Immutable description of one host
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct HostIdentity {
    /// Name the driver reports to the framework
    pub driver_name: String,
    /// Host name, also the Pod and Secret name
    pub machine_name: String,
    /// Directory holding the host's local files (keys, config)
    pub store_path: PathBuf,
    /// Container image the host runs
    pub image: String,
    /// cloud-init user-data file, if any
    pub user_data_path: Option<PathBuf>,
    /// User for SSH access
    pub ssh_user: String,
    /// Port for SSH access
    pub ssh_port: u16,
    /// Claim backing the shared cache volume
    pub cache_claim: String,
    /// Memory limit for the host container
    pub memory_limit: String,
}

impl Default for HostIdentity {
    fn default() -> Self {
        Self {
            driver_name: DEFAULT_DRIVER_NAME.to_string(),
            machine_name: String::new(),
            store_path: PathBuf::new(),
            image: DEFAULT_IMAGE.to_string(),
            user_data_path: None,
            ssh_user: DEFAULT_SSH_USER.to_string(),
            ssh_port: DEFAULT_SSH_PORT,
            cache_claim: DEFAULT_CACHE_CLAIM.to_string(),
            memory_limit: DEFAULT_MEMORY_LIMIT.to_string(),
        }
    }
}

impl HostIdentity {
    /// Identity with defaults for everything but name and store
    pub fn new(machine_name: impl Into<String>, store_path: impl Into<PathBuf>) -> Self {
        Self {
            machine_name: machine_name.into(),
            store_path: store_path.into(),
            ..Default::default()
        }
    }

    /// Path of the host's private SSH key
    pub fn private_key_path(&self) -> PathBuf {
        self.store_path.join(PRIVATE_KEY_FILE)
    }

    /// Pod tunables derived from this identity
    pub fn pod_options(&self) -> PodOptions {
        PodOptions {
            cache_claim: self.cache_claim.clone(),
            memory_limit: self.memory_limit.clone(),
        }
    }
}

/// Mutable per-host state
#[derive(Debug, Default)]
pub struct HostRuntime {
    address: Mutex<Option<String>>,
}

impl HostRuntime {
    /// The address observed by the last successful start
    pub fn address(&self) -> Option<String> {
        self.address.lock().clone()
    }

    fn set_address(&self, address: String) {
        *self.address.lock() = Some(address);
    }

    fn clear_address(&self) {
        self.address.lock().take();
    }
}

/// Lifecycle driver for a single host
pub struct KubernetesDriver {
    identity: HostIdentity,
    connection: RwLock<ClusterConnection>,
    source: Option<Arc<dyn ConnectionSource>>,
    keys: Arc<dyn KeyGenerator>,
    runtime: HostRuntime,
    operation_timeout: Duration,
    address_timeout: Duration,
}

impl std::fmt::Debug for KubernetesDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubernetesDriver")
            .field("identity", &self.identity)
            .field("connection", &*self.connection.read())
            .field("runtime", &self.runtime)
            .finish_non_exhaustive()
    }
}

impl KubernetesDriver {
    /// Create a driver over an established connection
    pub fn new(identity: HostIdentity, connection: ClusterConnection) -> Self {
        Self {
            identity,
            connection: RwLock::new(connection),
            source: None,
            keys: Arc::new(SshKeygen::default()),
            runtime: HostRuntime::default(),
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
            address_timeout: DEFAULT_ADDRESS_TIMEOUT,
        }
    }

    /// Resolve a connection from `source` and create a driver that can
    /// later [`reload`](Self::reload) from the same source
    pub async fn connect(
        identity: HostIdentity,
        source: Arc<dyn ConnectionSource>,
    ) -> Result<Self, Error> {
        let connection = source.connect().await?;
        debug!(host = %identity.machine_name, namespace = %connection.namespace, "connected to cluster");
        let mut driver = Self::new(identity, connection);
        driver.source = Some(source);
        Ok(driver)
    }

    /// Use a different SSH key generator
    pub fn with_key_generator(mut self, keys: Arc<dyn KeyGenerator>) -> Self {
        self.keys = keys;
        self
    }

    /// Override the per-call and address-wait bounds
    pub fn with_timeouts(mut self, operation: Duration, address: Duration) -> Self {
        self.operation_timeout = operation;
        self.address_timeout = address;
        self
    }

    /// Seed the address cell, e.g. from a persisted record
    pub fn with_cached_address(self, address: Option<String>) -> Self {
        if let Some(address) = address.filter(|a| !a.is_empty()) {
            self.runtime.set_address(address);
        }
        self
    }

    /// The host's identity
    pub fn identity(&self) -> &HostIdentity {
        &self.identity
    }

    /// The cached address, if the host was started and not stopped since
    pub fn address(&self) -> Option<String> {
        self.runtime.address()
    }

    /// Namespace hosts are placed in
    pub fn namespace(&self) -> String {
        self.connection.read().namespace.clone()
    }

    /// Name the driver reports to the framework
    pub fn driver_name(&self) -> &str {
        &self.identity.driver_name
    }

    /// Re-resolve the cluster connection from the configured source
    pub async fn reload(&self) -> Result<(), Error> {
        let source = self
            .source
            .as_ref()
            .ok_or_else(|| Error::config("driver has no connection source to reload from"))?;
        let connection = source.connect().await?;
        info!(host = %self.identity.machine_name, namespace = %connection.namespace, "reloaded cluster connection");
        *self.connection.write() = connection;
        Ok(())
    }

    /// Check local inputs before anything is created
    pub async fn pre_create_check(&self) -> Result<(), Error> {
        if let Some(path) = &self.identity.user_data_path {
            read_local(path).await?;
        }
        if self.identity.image.is_empty() {
            return Err(Error::config("image must not be empty"));
        }
        Ok(())
    }

    /// Generate the host's SSH key
    ///
    /// Makes no cluster call; the host stays absent until [`start`](Self::start).
    pub async fn create(&self) -> Result<(), Error> {
        self.pre_create_check().await?;
        self.keys.generate(&self.identity.private_key_path()).await?;
        info!(host = %self.identity.machine_name, "created host");
        Ok(())
    }

    /// Converge the host onto the cluster and wait for its address
    ///
    /// Always stops first, so starting a running or half-applied host
    /// replaces it.
    pub async fn start(&self) -> Result<String, Error> {
        let deadline = Instant::now() + self.operation_timeout;
        let conn = self.connection.read().clone();

        self.bounded(&conn, deadline, self.prune(&conn)).await?;

        let public_key = read_local(&public_key_path(&self.identity.private_key_path())).await?;
        let user_data = match &self.identity.user_data_path {
            Some(path) => read_local(path).await?,
            None => Vec::new(),
        };
        let meta_data = build_meta_data(&public_key)?;
        let objects = build_host_objects(
            &conn.namespace,
            &self.identity.machine_name,
            &self.identity.image,
            Some(&user_data),
            Some(&meta_data),
            &self.identity.pod_options(),
        );

        let applier = Applier::new(conn.api.clone());
        self.bounded(
            &conn,
            deadline,
            applier.converge(&objects, ConvergeIntent::Apply),
        )
        .await?;

        let remaining = deadline.saturating_duration_since(Instant::now());
        let ip = await_address(
            conn.api.as_ref(),
            &conn.namespace,
            &self.identity.machine_name,
            remaining.min(self.address_timeout),
        )
        .await?;

        self.runtime.set_address(ip.clone());
        info!(host = %self.identity.machine_name, namespace = %conn.namespace, ip = %ip, "host started");
        Ok(ip)
    }

    /// Delete the host's objects from the cluster
    ///
    /// Succeeds for a host that does not exist. The cached address is gone
    /// afterwards even if the cluster call fails.
    pub async fn stop(&self) -> Result<(), Error> {
        let deadline = Instant::now() + self.operation_timeout;
        let conn = self.connection.read().clone();
        self.bounded(&conn, deadline, self.prune(&conn)).await?;
        info!(host = %self.identity.machine_name, namespace = %conn.namespace, "host stopped");
        Ok(())
    }

    /// Stop, then start
    pub async fn restart(&self) -> Result<String, Error> {
        self.stop().await?;
        self.start().await
    }

    /// Same as [`stop`](Self::stop)
    pub async fn kill(&self) -> Result<(), Error> {
        self.stop().await
    }

    /// Same as [`stop`](Self::stop); local files are left to the framework
    pub async fn remove(&self) -> Result<(), Error> {
        self.stop().await
    }

    /// Current state from a single Pod lookup
    pub async fn get_state(&self) -> Result<HostState, Error> {
        let deadline = Instant::now() + self.operation_timeout;
        let conn = self.connection.read().clone();
        let pod = self
            .bounded(
                &conn,
                deadline,
                conn.api.get_pod(&conn.namespace, &self.identity.machine_name),
            )
            .await?;
        Ok(state_of(pod.as_ref()))
    }

    /// The host's address, waiting for one if none is cached
    pub async fn get_ip(&self) -> Result<String, Error> {
        if let Some(address) = self.runtime.address() {
            return Ok(address);
        }
        let conn = self.connection.read().clone();
        await_address(
            conn.api.as_ref(),
            &conn.namespace,
            &self.identity.machine_name,
            self.address_timeout,
        )
        .await
    }

    /// Docker endpoint URL for the host
    pub async fn get_url(&self) -> Result<String, Error> {
        let ip = self.get_ip().await?;
        Ok(docker_url(&ip))
    }

    /// Host name for SSH access
    pub async fn get_ssh_hostname(&self) -> Result<String, Error> {
        self.get_ip().await
    }

    /// User for SSH access
    pub fn get_ssh_username(&self) -> &str {
        &self.identity.ssh_user
    }

    /// Port for SSH access
    pub fn get_ssh_port(&self) -> u16 {
        self.identity.ssh_port
    }

    /// Path of the host's private SSH key
    pub fn get_ssh_key_path(&self) -> PathBuf {
        self.identity.private_key_path()
    }

    async fn prune(&self, conn: &ClusterConnection) -> Result<(), Error> {
        self.runtime.clear_address();
        let absent = HostObjects::absent(&conn.namespace, &self.identity.machine_name);
        Applier::new(conn.api.clone())
            .converge(&absent, ConvergeIntent::PruneToEmpty)
            .await?;
        Ok(())
    }

    async fn bounded<T>(
        &self,
        conn: &ClusterConnection,
        deadline: Instant,
        fut: impl Future<Output = Result<T, Error>>,
    ) -> Result<T, Error> {
        match timeout_at(deadline, fut).await {
            Ok(result) => result,
            Err(_) => {
                warn!(host = %self.identity.machine_name, timeout = ?self.operation_timeout, "lifecycle call exceeded its deadline");
                Err(Error::timeout(
                    &conn.namespace,
                    &self.identity.machine_name,
                    self.operation_timeout,
                ))
            }
        }
    }
}

/// `tcp://<ip>:2376`, bracketing IPv6 addresses
pub fn docker_url(ip: &str) -> String {
    match ip.parse::<IpAddr>() {
        Ok(addr) => format!("tcp://{}", SocketAddr::new(addr, DOCKER_PORT)),
        Err(_) => format!("tcp://{}:{}", ip, DOCKER_PORT),
    }
}

async fn read_local(path: &Path) -> Result<Vec<u8>, Error> {
    tokio::fs::read(path)
        .await
        .map_err(|e| Error::config_for_path(path, format!("cannot read {}: {}", path.display(), e)))
}
