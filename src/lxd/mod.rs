//! Instance, network and storage service consumed by the provisioner
//!
//! The orchestrator only talks to LXD through [`InstanceService`]; the
//! production implementation drives the `lxc` client binary.

mod cli;

use std::collections::BTreeMap;
use serde::{Deserialize, Serialize};
use crate::Result;

pub use cli::LxcCli;

/// LXD device definition (`type`, `path`, `parent`, ...)
pub type Device = BTreeMap<String, String>;

/// Build a device from key/value pairs
pub fn device(pairs: &[(&str, &str)]) -> Device {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub config: BTreeMap<String, String>,
    #[serde(default)]
    pub devices: BTreeMap<String, Device>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Network {
    pub name: String,
    /// Whether LXD manages the network (bridge) or it is a host interface
    pub managed: bool,
}

/// Everything needed to create one instance
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceSpec {
    pub name: String,
    pub image_alias: String,
    pub profiles: Vec<String>,
    pub config: BTreeMap<String, String>,
    pub devices: BTreeMap<String, Device>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InterfaceAddress {
    pub family: String,
    pub address: String,
    pub scope: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Interface {
    pub name: String,
    pub kind: String,
    pub addresses: Vec<InterfaceAddress>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkState {
    pub interfaces: Vec<Interface>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstanceState {
    pub status: String,
    pub network: NetworkState,
}

impl InstanceState {
    pub fn is_running(&self) -> bool {
        self.status.eq_ignore_ascii_case("running")
    }

    pub fn is_stopped(&self) -> bool {
        self.status.eq_ignore_ascii_case("stopped")
    }
}

/// What sits at a path inside an instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Directory,
    File,
    Other,
}

/// Owner and mode applied to injected files and directories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileOwnership {
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
}

impl Default for FileOwnership {
    fn default() -> Self {
        Self {
            uid: 0,
            gid: 0,
            mode: 0o755,
        }
    }
}

#[cfg_attr(test, mockall::automock)]
pub trait InstanceService {
    fn profile(&self, name: &str) -> Result<Option<Profile>>;
    fn create_profile(&self, profile: &Profile) -> Result<()>;

    fn network(&self, name: &str) -> Result<Option<Network>>;
    fn create_network(&self, name: &str) -> Result<()>;
    fn delete_network(&self, name: &str) -> Result<()>;

    fn create_storage_pool(&self, name: &str, driver: &str) -> Result<()>;
    fn delete_storage_pool(&self, name: &str) -> Result<()>;

    /// Names of every instance on the server
    fn instance_names(&self) -> Result<Vec<String>>;
    /// Create an instance, blocking until the operation completes
    fn create_instance(&self, spec: &InstanceSpec) -> Result<()>;
    fn start_instance(&self, name: &str) -> Result<()>;
    fn stop_instance(&self, name: &str) -> Result<()>;
    fn delete_instance(&self, name: &str) -> Result<()>;
    fn instance_state(&self, name: &str) -> Result<InstanceState>;
    fn add_device(&self, instance: &str, device_name: &str, device: &Device) -> Result<()>;

    /// Kind of the entry at `path`, or `None` if nothing is there
    fn file_kind(&self, instance: &str, path: &str) -> Result<Option<FileKind>>;
    fn make_dir(&self, instance: &str, path: &str, ownership: &FileOwnership) -> Result<()>;
    fn push_file(
        &self,
        instance: &str,
        path: &str,
        contents: &[u8],
        ownership: &FileOwnership,
    ) -> Result<()>;
    /// Run a command to completion and return its exit code
    fn exec(&self, instance: &str, command: &[String]) -> Result<i32>;

    /// Host address of the remote the client talks to, if not local
    fn remote_host(&self) -> Result<Option<String>>;
}
