//! Subcommand implementations
//!
//! Each command loads the host record, builds a driver for it, runs one
//! lifecycle call, and writes the observed address back to the record.
//! Cluster connections come from a [`SourceFactory`] so the commands can run
//! against something other than a live cluster.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Args;
use tracing::{info, warn};

use kubehost_common::{DEFAULT_IMAGE, DEFAULT_SSH_USER};
use kubehost_driver::objects::{DEFAULT_CACHE_CLAIM, DEFAULT_MEMORY_LIMIT};
use kubehost_driver::{ConnectionSource, HostIdentity, KubeConnectionSource, KubernetesDriver};

use crate::store::{HostRecord, HostStore};
use crate::{Error, Result};

/// Longest name a Pod can carry
const MAX_HOST_NAME_LEN: usize = 63;

/// Options for `create`
#[derive(Args, Debug, Clone)]
pub struct CreateArgs {
    /// Host name, also used for the Pod and Secret
    pub name: String,

    /// Container image the host runs
    #[arg(long = "kubernetes-image", env = "KUBERNETES_IMAGE", default_value = DEFAULT_IMAGE)]
    pub image: String,

    /// cloud-init user-data file
    #[arg(long = "kubernetes-userdata", env = "KUBERNETES_USERDATA")]
    pub user_data: Option<PathBuf>,

    /// Base64-encoded kubeconfig; the ambient configuration is used if unset
    #[arg(
        long = "kubernetes-k8token",
        env = "KUBERNETES_K8TOKEN",
        hide_env_values = true
    )]
    pub k8token: Option<String>,

    /// User for SSH access
    #[arg(long = "kubernetes-ssh-user", env = "KUBERNETES_SSH_USER", default_value = DEFAULT_SSH_USER)]
    pub ssh_user: String,

    /// PersistentVolumeClaim backing the shared cache volume
    #[arg(long = "kubernetes-cache-claim", env = "KUBERNETES_CACHE_CLAIM", default_value = DEFAULT_CACHE_CLAIM)]
    pub cache_claim: String,

    /// Memory limit for the host container
    #[arg(long = "kubernetes-memory-limit", env = "KUBERNETES_MEMORY_LIMIT", default_value = DEFAULT_MEMORY_LIMIT)]
    pub memory_limit: String,
}

/// Host selection shared by every other command
#[derive(Args, Debug, Clone)]
pub struct HostArgs {
    /// Host name
    pub name: String,
}

/// Host names become Pod names, so they must be DNS-1123 labels
pub fn validate_host_name(name: &str) -> Result<()> {
    let valid_chars = name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
    let valid_ends = name
        .chars()
        .next()
        .zip(name.chars().last())
        .is_some_and(|(first, last)| first.is_ascii_alphanumeric() && last.is_ascii_alphanumeric());

    if name.is_empty() || name.len() > MAX_HOST_NAME_LEN || !valid_chars || !valid_ends {
        return Err(Error::validation(format!(
            "invalid host name {:?}: must be at most {} lowercase letters, digits or '-', starting and ending with a letter or digit",
            name, MAX_HOST_NAME_LEN
        )));
    }
    Ok(())
}

/// Resolves the connection source for a host record
pub type SourceFactory = Arc<dyn Fn(&HostRecord) -> Arc<dyn ConnectionSource> + Send + Sync>;

/// What every command runs against
#[derive(Clone)]
pub struct CommandContext {
    /// Local host records
    pub store: HostStore,
    sources: SourceFactory,
}

impl std::fmt::Debug for CommandContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandContext")
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}

impl CommandContext {
    /// Context connecting with each record's kubeconfig through kube-rs
    pub fn new(store: HostStore) -> Self {
        Self::with_sources(
            store,
            Arc::new(|record: &HostRecord| -> Arc<dyn ConnectionSource> {
                Arc::new(KubeConnectionSource::new(record.encoded_kubeconfig.clone()))
            }),
        )
    }

    /// Context using a custom connection source per record
    pub fn with_sources(store: HostStore, sources: SourceFactory) -> Self {
        Self { store, sources }
    }

    async fn open_driver(&self, record: &HostRecord) -> Result<KubernetesDriver> {
        let source = (self.sources)(record);
        let driver = KubernetesDriver::connect(record.identity.clone(), source).await?;
        Ok(driver.with_cached_address(record.address.clone()))
    }

    /// Persist whatever address the driver holds now, then return the call's result
    fn record_outcome<T>(
        &self,
        record: &mut HostRecord,
        driver: &KubernetesDriver,
        outcome: kubehost_common::Result<T>,
    ) -> Result<T> {
        record.address = driver.address();
        self.store.save(record)?;
        Ok(outcome?)
    }
}

/// Build the record `create` persists
///
/// Empty values count as unset, as they do when the framework passes an
/// empty environment variable through.
pub fn new_record(store: &HostStore, args: CreateArgs) -> HostRecord {
    let identity = HostIdentity {
        image: Some(args.image)
            .filter(|i| !i.is_empty())
            .unwrap_or_else(|| DEFAULT_IMAGE.to_string()),
        user_data_path: args.user_data.filter(|p| !p.as_os_str().is_empty()),
        ssh_user: args.ssh_user,
        cache_claim: args.cache_claim,
        memory_limit: args.memory_limit,
        ..HostIdentity::new(args.name.as_str(), store.host_dir(&args.name))
    };
    HostRecord {
        identity,
        encoded_kubeconfig: args.k8token.filter(|t| !t.is_empty()),
        address: None,
    }
}

/// Create a host: generate its key, write its record, start it
///
/// Nothing is written until the cluster connection resolves, so a bad
/// kubeconfig leaves no record behind.
pub async fn create(ctx: &CommandContext, args: CreateArgs) -> Result<()> {
    validate_host_name(&args.name)?;
    if ctx.store.exists(&args.name) {
        return Err(Error::HostAlreadyExists { name: args.name });
    }

    let mut record = new_record(&ctx.store, args);
    let driver = ctx.open_driver(&record).await?;
    driver.create().await?;
    ctx.store.save(&record)?;

    let outcome = driver.start().await;
    let ip = ctx.record_outcome(&mut record, &driver, outcome)?;

    info!(host = %record.name(), namespace = %driver.namespace(), ip = %ip, "host created");
    println!("{}", ip);
    Ok(())
}

/// Start a host and print its address
pub async fn start(ctx: &CommandContext, args: HostArgs) -> Result<()> {
    let mut record = ctx.store.load(&args.name)?;
    let driver = ctx.open_driver(&record).await?;
    let outcome = driver.start().await;
    let ip = ctx.record_outcome(&mut record, &driver, outcome)?;
    println!("{}", ip);
    Ok(())
}

/// Stop, then start a host
pub async fn restart(ctx: &CommandContext, args: HostArgs) -> Result<()> {
    let mut record = ctx.store.load(&args.name)?;
    let driver = ctx.open_driver(&record).await?;
    let outcome = driver.restart().await;
    let ip = ctx.record_outcome(&mut record, &driver, outcome)?;
    println!("{}", ip);
    Ok(())
}

/// Delete a host's cluster objects, keeping its record
pub async fn stop(ctx: &CommandContext, args: HostArgs) -> Result<()> {
    let mut record = ctx.store.load(&args.name)?;
    let driver = ctx.open_driver(&record).await?;
    let outcome = driver.stop().await;
    ctx.record_outcome(&mut record, &driver, outcome)
}

/// Same as `stop`
pub async fn kill(ctx: &CommandContext, args: HostArgs) -> Result<()> {
    let mut record = ctx.store.load(&args.name)?;
    let driver = ctx.open_driver(&record).await?;
    let outcome = driver.kill().await;
    ctx.record_outcome(&mut record, &driver, outcome)
}

/// Delete a host's cluster objects and its local record
///
/// The record goes even if the cluster can't be reached or refuses the
/// delete; otherwise a host with broken credentials could never be removed.
pub async fn remove(ctx: &CommandContext, args: HostArgs) -> Result<()> {
    let record = ctx.store.load(&args.name)?;
    let removed = match ctx.open_driver(&record).await {
        Ok(driver) => driver.remove().await.map_err(Error::from),
        Err(e) => Err(e),
    };
    if let Err(e) = removed {
        warn!(host = %record.name(), error = %e, "could not delete cluster objects, removing local record anyway");
    }
    ctx.store.remove(record.name())?;
    info!(host = %record.name(), "host removed");
    Ok(())
}

/// Print a host's state
pub async fn status(ctx: &CommandContext, args: HostArgs) -> Result<()> {
    let record = ctx.store.load(&args.name)?;
    let driver = ctx.open_driver(&record).await?;
    println!("{}", driver.get_state().await?);
    Ok(())
}

/// Print a host's address
pub async fn ip(ctx: &CommandContext, args: HostArgs) -> Result<()> {
    let record = ctx.store.load(&args.name)?;
    let driver = ctx.open_driver(&record).await?;
    println!("{}", driver.get_ip().await?);
    Ok(())
}

/// Print a host's docker URL
pub async fn url(ctx: &CommandContext, args: HostArgs) -> Result<()> {
    let record = ctx.store.load(&args.name)?;
    let driver = ctx.open_driver(&record).await?;
    println!("{}", driver.get_url().await?);
    Ok(())
}

/// Print the host name to SSH to
pub async fn ssh_hostname(ctx: &CommandContext, args: HostArgs) -> Result<()> {
    let record = ctx.store.load(&args.name)?;
    let driver = ctx.open_driver(&record).await?;
    println!("{}", driver.get_ssh_hostname().await?);
    Ok(())
}

/// Print the SSH user; needs no cluster access
pub fn ssh_username(ctx: &CommandContext, args: HostArgs) -> Result<()> {
    let record = ctx.store.load(&args.name)?;
    println!("{}", record.identity.ssh_user);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use kubehost_driver::testing::{FakeCluster, FakeConnectionSource, IpPlan};
    use kubehost_driver::HostState;
    use tempfile::TempDir;

    fn create_args(name: &str) -> CreateArgs {
        CreateArgs {
            name: name.to_string(),
            image: "img:v1".to_string(),
            user_data: None,
            k8token: Some(String::new()),
            ssh_user: DEFAULT_SSH_USER.to_string(),
            cache_claim: DEFAULT_CACHE_CLAIM.to_string(),
            memory_limit: "4Gi".to_string(),
        }
    }

    fn host(name: &str) -> HostArgs {
        HostArgs {
            name: name.to_string(),
        }
    }

    fn fake_context(dir: &TempDir, cluster: &Arc<FakeCluster>) -> CommandContext {
        let cluster = cluster.clone();
        CommandContext::with_sources(
            HostStore::new(dir.path()),
            Arc::new(move |_: &HostRecord| -> Arc<dyn ConnectionSource> {
                Arc::new(FakeConnectionSource::new(cluster.clone(), "default"))
            }),
        )
    }

    /// Save a record for `name` with its public key in place, as `create` leaves it
    fn seed_host(ctx: &CommandContext, name: &str, address: Option<&str>) {
        let mut record = new_record(&ctx.store, create_args(name));
        record.address = address.map(str::to_string);
        ctx.store.save(&record).unwrap();
        std::fs::write(
            ctx.store.host_dir(name).join("id_rsa.pub"),
            "ssh-rsa AAAAB3NzaC1yc2E demo",
        )
        .unwrap();
    }

    #[test]
    fn host_names_must_be_dns_labels() {
        for ok in ["demo", "host-1", "a", "0abc"] {
            assert!(validate_host_name(ok).is_ok(), "{ok}");
        }
        let too_long = "a".repeat(64);
        for bad in ["", "Demo", "-demo", "demo-", "de_mo", "de.mo", too_long.as_str()] {
            assert!(
                matches!(validate_host_name(bad), Err(Error::Validation { .. })),
                "{bad}"
            );
        }
    }

    #[test]
    fn new_record_keeps_keys_in_host_dir() {
        let store = HostStore::new("/var/lib/machine");
        let record = new_record(&store, create_args("demo"));

        assert_eq!(record.name(), "demo");
        assert_eq!(record.identity.image, "img:v1");
        assert_eq!(record.identity.memory_limit, "4Gi");
        assert_eq!(
            record.identity.private_key_path(),
            PathBuf::from("/var/lib/machine/machines/demo/id_rsa")
        );
        // An empty token means "use the ambient kubeconfig"
        assert_eq!(record.encoded_kubeconfig, None);
        assert_eq!(record.address, None);
    }

    #[test]
    fn empty_image_and_user_data_count_as_unset() {
        let store = HostStore::new("/var/lib/machine");
        let args = CreateArgs {
            image: String::new(),
            user_data: Some(PathBuf::new()),
            ..create_args("demo")
        };
        let record = new_record(&store, args);
        assert_eq!(record.identity.image, DEFAULT_IMAGE);
        assert_eq!(record.identity.user_data_path, None);
    }

    #[tokio::test]
    async fn create_refuses_existing_host() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = CommandContext::new(HostStore::new(dir.path()));
        ctx.store
            .save(&new_record(&ctx.store, create_args("demo")))
            .unwrap();

        let err = create(&ctx, create_args("demo")).await.unwrap_err();
        assert!(matches!(err, Error::HostAlreadyExists { name } if name == "demo"));
    }

    #[tokio::test]
    async fn create_with_bad_kubeconfig_leaves_no_record() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = CommandContext::new(HostStore::new(dir.path()));
        let args = CreateArgs {
            k8token: Some("!!! not base64 !!!".to_string()),
            ..create_args("demo")
        };

        let err = create(&ctx, args).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Driver(kubehost_common::Error::Config { .. })
        ));
        assert!(!ctx.store.exists("demo"));
    }

    #[tokio::test]
    async fn remove_drops_record_when_cluster_is_unreachable() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = CommandContext::new(HostStore::new(dir.path()));
        let mut record = new_record(&ctx.store, create_args("demo"));
        record.encoded_kubeconfig = Some("!!! not base64 !!!".to_string());
        ctx.store.save(&record).unwrap();

        remove(&ctx, host("demo")).await.unwrap();
        assert!(!ctx.store.exists("demo"));
        assert!(!ctx.store.host_dir("demo").exists());
    }

    #[tokio::test]
    async fn commands_on_unknown_host_fail_before_connecting() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = CommandContext::new(HostStore::new(dir.path()));

        assert!(matches!(
            start(&ctx, host("ghost")).await,
            Err(Error::HostNotFound { .. })
        ));
        assert!(matches!(
            ssh_username(&ctx, host("ghost")),
            Err(Error::HostNotFound { .. })
        ));
    }

    /// Story: the address follows the host through start and stop on disk
    #[tokio::test]
    async fn story_address_is_persisted_on_start_and_cleared_on_stop() {
        let dir = tempfile::tempdir().unwrap();
        let cluster = FakeCluster::new(IpPlan::Assign("10.0.0.5".to_string()));
        let ctx = fake_context(&dir, &cluster);
        seed_host(&ctx, "demo", None);

        start(&ctx, host("demo")).await.unwrap();
        assert_eq!(
            ctx.store.load("demo").unwrap().address.as_deref(),
            Some("10.0.0.5")
        );
        assert!(cluster.pod("default", "demo").is_some());

        stop(&ctx, host("demo")).await.unwrap();
        assert_eq!(ctx.store.load("demo").unwrap().address, None);
        assert!(cluster.pod("default", "demo").is_none());
        assert!(ctx.store.exists("demo"));
    }

    #[tokio::test]
    async fn failed_start_clears_persisted_address() {
        let dir = tempfile::tempdir().unwrap();
        let cluster = FakeCluster::new(IpPlan::Assign("10.0.0.5".to_string()));
        let ctx = fake_context(&dir, &cluster);
        seed_host(&ctx, "demo", Some("10.0.0.4"));
        // Without its public key the host can't be started
        std::fs::remove_file(ctx.store.host_dir("demo").join("id_rsa.pub")).unwrap();

        let err = start(&ctx, host("demo")).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Driver(kubehost_common::Error::Config { .. })
        ));
        assert_eq!(ctx.store.load("demo").unwrap().address, None);
    }

    #[tokio::test]
    async fn remove_deletes_cluster_objects_and_record() {
        let dir = tempfile::tempdir().unwrap();
        let cluster = FakeCluster::new(IpPlan::Assign("10.0.0.5".to_string()));
        let ctx = fake_context(&dir, &cluster);
        seed_host(&ctx, "demo", None);
        start(&ctx, host("demo")).await.unwrap();

        remove(&ctx, host("demo")).await.unwrap();
        assert!(cluster.pod("default", "demo").is_none());
        assert!(cluster.secret("default", "demo").is_none());
        assert!(!ctx.store.exists("demo"));

        let record = new_record(&ctx.store, create_args("demo"));
        let driver = ctx.open_driver(&record).await.unwrap();
        assert_eq!(driver.get_state().await.unwrap(), HostState::None);
    }
}
