//! Local host records stored under the machine storage path.
//!
//! Layout, one directory per host:
//! - `<storage>/machines/<name>/config.json`: driver configuration and the
//!   last observed address
//! - `<storage>/machines/<name>/id_rsa{,.pub}`: the host's SSH keypair
//!
//! The storage path defaults to `~/.docker/machine`, the same place the
//! docker-machine framework keeps its own state.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use kubehost_driver::HostIdentity;

use crate::{Error, Result};

const DEFAULT_STORAGE_DIR: &str = ".docker/machine";
const MACHINES_DIR_NAME: &str = "machines";
const CONFIG_FILE_NAME: &str = "config.json";

/// Everything persisted for one host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostRecord {
    /// Immutable host configuration
    pub identity: HostIdentity,
    /// Base64-encoded kubeconfig, if one was given at create time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encoded_kubeconfig: Option<String>,
    /// Address observed by the last successful start
    #[serde(default)]
    pub address: Option<String>,
}

impl HostRecord {
    /// Host name
    pub fn name(&self) -> &str {
        &self.identity.machine_name
    }
}

/// Host records rooted at a storage path
#[derive(Debug, Clone)]
pub struct HostStore {
    root: PathBuf,
}

impl HostStore {
    /// Store rooted at `root`
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// `~/.docker/machine`
    pub fn default_root() -> Result<PathBuf> {
        let home = dirs::home_dir()
            .ok_or_else(|| Error::validation("could not determine home directory"))?;
        Ok(home.join(DEFAULT_STORAGE_DIR))
    }

    /// Storage root
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding one host's files
    pub fn host_dir(&self, name: &str) -> PathBuf {
        self.root.join(MACHINES_DIR_NAME).join(name)
    }

    /// Path of one host's `config.json`
    pub fn config_path(&self, name: &str) -> PathBuf {
        self.host_dir(name).join(CONFIG_FILE_NAME)
    }

    /// Whether a record exists for `name`
    pub fn exists(&self, name: &str) -> bool {
        self.config_path(name).is_file()
    }

    /// Load the record for `name`
    pub fn load(&self, name: &str) -> Result<HostRecord> {
        let path = self.config_path(name);
        if !path.exists() {
            return Err(Error::HostNotFound {
                name: name.to_string(),
            });
        }
        let data = std::fs::read_to_string(&path).map_err(|e| Error::io(&path, e))?;
        Ok(serde_json::from_str(&data)?)
    }

    /// Write a record, creating the host directory if needed
    pub fn save(&self, record: &HostRecord) -> Result<()> {
        let dir = self.host_dir(record.name());
        std::fs::create_dir_all(&dir).map_err(|e| Error::io(&dir, e))?;
        let path = dir.join(CONFIG_FILE_NAME);
        let data = serde_json::to_string_pretty(record)?;
        std::fs::write(&path, data).map_err(|e| Error::io(&path, e))
    }

    /// Delete a host's directory, keys included
    pub fn remove(&self, name: &str) -> Result<()> {
        let dir = self.host_dir(name);
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::io(&dir, e)),
        }
    }
}
