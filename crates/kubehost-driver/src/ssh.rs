//! SSH keypair generation for new hosts

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, warn};

#[cfg(test)]
use mockall::automock;

use kubehost_common::Error;

/// Timeout for key generation
const COMMAND_TIMEOUT: Duration = Duration::from_secs(60);

/// Produces an SSH keypair at a path
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KeyGenerator: Send + Sync {
    /// Write a private key to `path` and its public key to `path.pub`
    ///
    /// An existing key at `path` is kept as is.
    async fn generate(&self, path: &Path) -> Result<(), Error>;
}

/// Public key path paired with a private key path
pub fn public_key_path(private_key: &Path) -> PathBuf {
    let mut name = private_key.as_os_str().to_owned();
    name.push(".pub");
    PathBuf::from(name)
}

/// Generates RSA keys with the system `ssh-keygen`
#[derive(Clone, Debug)]
pub struct SshKeygen {
    program: PathBuf,
    bits: u32,
}

impl Default for SshKeygen {
    fn default() -> Self {
        Self {
            program: PathBuf::from("ssh-keygen"),
            bits: 2048,
        }
    }
}

impl SshKeygen {
    /// Use a specific `ssh-keygen` binary
    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }
}

#[async_trait]
impl KeyGenerator for SshKeygen {
    async fn generate(&self, path: &Path) -> Result<(), Error> {
        if tokio::fs::try_exists(path).await.unwrap_or(false) {
            debug!(path = %path.display(), "ssh key already exists");
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                Error::config_for_path(parent, format!("cannot create key directory: {}", e))
            })?;
        }

        let program = self.program.display().to_string();
        let mut cmd = Command::new(&self.program);
        cmd.arg("-q")
            .args(["-t", "rsa"])
            .args(["-b", &self.bits.to_string()])
            .args(["-N", ""])
            .args(["-C", "kubehost"])
            .arg("-f")
            .arg(path);

        let output = tokio::time::timeout(COMMAND_TIMEOUT, cmd.output())
            .await
            .map_err(|_| {
                Error::command(&program, format!("timed out after {:?}", COMMAND_TIMEOUT))
            })?
            .map_err(|e| Error::command(&program, format!("failed to execute: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            warn!(path = %path.display(), error = %stderr, "ssh-keygen failed");
            return Err(Error::command(&program, stderr));
        }

        info!(path = %path.display(), "generated ssh key");
        Ok(())
    }
}
