//! docker-machine driver that runs each host as a Kubernetes Pod

pub mod commands;
pub mod error;
pub mod store;

pub use error::{Error, Result};

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use commands::{CreateArgs, HostArgs};
use store::HostStore;

/// Manage docker hosts running as Kubernetes Pods
#[derive(Parser, Debug)]
#[command(name = "docker-machine-driver-kubernetes")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Directory holding host records and keys [default: ~/.docker/machine]
    #[arg(long, env = "MACHINE_STORAGE_PATH", global = true)]
    pub storage_path: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create a host and start it
    Create(CreateArgs),
    /// Start a host, replacing any existing Pod
    Start(HostArgs),
    /// Delete a host's Pod and Secret, keeping its local record
    Stop(HostArgs),
    /// Stop, then start a host
    Restart(HostArgs),
    /// Same as stop
    Kill(HostArgs),
    /// Delete a host's Pod, Secret and local record
    #[command(alias = "rm")]
    Remove(HostArgs),
    /// Print a host's state
    Status(HostArgs),
    /// Print a host's IP
    Ip(HostArgs),
    /// Print a host's docker URL
    Url(HostArgs),
    /// Print the host name for SSH access
    SshHostname(HostArgs),
    /// Print the user for SSH access
    SshUsername(HostArgs),
}

impl Cli {
    /// Run the CLI command
    pub async fn run(self) -> Result<()> {
        let root = match self.storage_path {
            Some(path) => path,
            None => HostStore::default_root()?,
        };
        let ctx = commands::CommandContext::new(HostStore::new(root));

        match self.command {
            Commands::Create(args) => commands::create(&ctx, args).await,
            Commands::Start(args) => commands::start(&ctx, args).await,
            Commands::Stop(args) => commands::stop(&ctx, args).await,
            Commands::Restart(args) => commands::restart(&ctx, args).await,
            Commands::Kill(args) => commands::kill(&ctx, args).await,
            Commands::Remove(args) => commands::remove(&ctx, args).await,
            Commands::Status(args) => commands::status(&ctx, args).await,
            Commands::Ip(args) => commands::ip(&ctx, args).await,
            Commands::Url(args) => commands::url(&ctx, args).await,
            Commands::SshHostname(args) => commands::ssh_hostname(&ctx, args).await,
            Commands::SshUsername(args) => commands::ssh_username(&ctx, args),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn create_parses_driver_flags() {
        let cli = Cli::try_parse_from([
            "docker-machine-driver-kubernetes",
            "--storage-path",
            "/tmp/machines",
            "create",
            "demo",
            "--kubernetes-image",
            "img:v1",
            "--kubernetes-userdata",
            "/tmp/user-data.yaml",
            "--kubernetes-k8token",
            "YXBpVmVyc2lvbjogdjE=",
        ])
        .unwrap();

        assert_eq!(cli.storage_path, Some(PathBuf::from("/tmp/machines")));
        match cli.command {
            Commands::Create(args) => {
                assert_eq!(args.name, "demo");
                assert_eq!(args.image, "img:v1");
                assert_eq!(args.user_data, Some(PathBuf::from("/tmp/user-data.yaml")));
                assert_eq!(args.k8token.as_deref(), Some("YXBpVmVyc2lvbjogdjE="));
                assert_eq!(args.memory_limit, "2Gi");
            }
            other => panic!("expected create, got {other:?}"),
        }
    }

    #[test]
    fn host_commands_take_a_name() {
        let cli = Cli::try_parse_from(["docker-machine-driver-kubernetes", "rm", "demo"]).unwrap();
        assert!(matches!(cli.command, Commands::Remove(HostArgs { ref name }) if name == "demo"));

        assert!(Cli::try_parse_from(["docker-machine-driver-kubernetes", "status"]).is_err());
    }
}
