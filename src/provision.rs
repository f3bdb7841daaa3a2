//! Networks, storage pools, the capability profile and instances

use std::collections::BTreeMap;
use std::path::Path;
use crate::config::{Settings, MANAGED_PREFIX};
use crate::lxd::{device, Device, InstanceService, InstanceSpec, Profile};
use crate::record::Role;
use crate::{Error, Result};

/// Name of the capability profile applied to node instances
pub const PROFILE_NAME: &str = "lxdk";

const KERNEL_MODULES: &str = "ip_tables,ip6_tables,netlink_diag,nf_nat,overlay";

const RAW_LXC: &str = "lxc.apparmor.profile=unconfined
lxc.mount.auto=proc:rw sys:rw cgroup:rw
lxc.cgroup.devices.allow=a
lxc.cap.drop=
lxc.apparmor.allow_incomplete=1";

/// Character devices passed through to nodes when the host has them
const CHAR_DEVICES: &[(&str, &str)] = &[
    ("kvm", "kvm"),
    ("tun", "net/tun"),
    ("vhost-net", "vhost-net"),
    ("vhost-vsock", "vhost-vsock"),
    ("vsock", "vsock"),
];

/// Build the capability profile, starting from the default profile's devices
pub fn capability_profile(default: Option<&Profile>) -> Profile {
    let devices = default.map(|p| p.devices.clone()).unwrap_or_default();
    let config = BTreeMap::from([
        ("security.privileged".to_string(), "true".to_string()),
        ("security.nesting".to_string(), "true".to_string()),
        ("linux.kernel_modules".to_string(), KERNEL_MODULES.to_string()),
        ("raw.lxc".to_string(), RAW_LXC.to_string()),
    ]);
    Profile {
        name: PROFILE_NAME.to_string(),
        description: "Kubernetes node capabilities for lxdk".to_string(),
        config,
        devices,
    }
}

/// `lxdk-<cluster>-<role>-<suffix>`
pub fn instance_name(cluster: &str, role: Role) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}{}-{}-{}", MANAGED_PREFIX, cluster, role, &suffix[..5])
}

/// Creates and destroys the resources backing a cluster
pub struct Provisioner<'a> {
    service: &'a dyn InstanceService,
    settings: &'a Settings,
}

impl<'a> Provisioner<'a> {
    pub fn new(service: &'a dyn InstanceService, settings: &'a Settings) -> Self {
        Self { service, settings }
    }

    /// Create the capability profile unless it already exists
    pub fn ensure_profile(&self) -> Result<()> {
        if self.service.profile(PROFILE_NAME)?.is_some() {
            return Ok(());
        }
        let default = self.service.profile("default")?;
        self.service
            .create_profile(&capability_profile(default.as_ref()))
            .map_err(|e| Error::provisioning(format!("profile {}", PROFILE_NAME), e))?;
        tracing::info!(profile = PROFILE_NAME, "Capability profile created");
        Ok(())
    }

    /// Create `lxdk-<cluster>`, or hand back `existing` untouched
    pub fn create_network(&self, cluster: &str, existing: Option<&str>) -> Result<String> {
        if let Some(name) = existing {
            return Ok(name.to_string());
        }
        let name = format!("{}{}", MANAGED_PREFIX, cluster);
        self.service
            .create_network(&name)
            .map_err(|e| Error::provisioning(format!("network {}", name), e))?;
        tracing::info!(cluster = %cluster, network = %name, "Network created");
        Ok(name)
    }

    /// Create `lxdk-<cluster>` with `driver`, or hand back `existing` untouched
    pub fn create_storage_pool(&self, cluster: &str, driver: &str, existing: Option<&str>) -> Result<String> {
        if let Some(name) = existing {
            return Ok(name.to_string());
        }
        let name = format!("{}{}", MANAGED_PREFIX, cluster);
        self.service
            .create_storage_pool(&name, driver)
            .map_err(|e| Error::provisioning(format!("storage pool {}", name), e))?;
        tracing::info!(cluster = %cluster, pool = %name, driver = %driver, "Storage pool created");
        Ok(name)
    }

    /// Instance definition for `role`
    pub fn instance_spec(&self, name: &str, role: Role, pool: &str, nic: Device) -> InstanceSpec {
        let image_role = match role {
            Role::Registry => Role::Worker,
            other => other,
        };

        let mut root = device(&[("type", "disk"), ("path", "/"), ("pool", pool)]);
        if let Some(size) = &self.settings.root_fs_size {
            root.insert("size".into(), size.clone());
        }

        let mut config = BTreeMap::new();
        let (cpu, memory) = match role {
            Role::Controller => (
                self.settings.controller_limits_cpu.as_ref(),
                self.settings.controller_limits_memory.as_ref(),
            ),
            Role::Worker => (
                self.settings.worker_limits_cpu.as_ref(),
                self.settings.worker_limits_memory.as_ref(),
            ),
            _ => (None, None),
        };
        if let Some(cpu) = cpu {
            config.insert("limits.cpu".to_string(), cpu.clone());
        }
        if let Some(memory) = memory {
            config.insert("limits.memory".to_string(), memory.clone());
        }

        // The datastore needs no node capabilities
        let profiles = if role == Role::Etcd {
            config.insert("raw.lxc".to_string(), "lxc.apparmor.allow_incomplete=1".to_string());
            Vec::new()
        } else {
            vec![PROFILE_NAME.to_string()]
        };

        InstanceSpec {
            name: name.to_string(),
            image_alias: format!("{}{}", self.settings.image_prefix, image_role),
            profiles,
            config,
            devices: BTreeMap::from([("root".to_string(), root), ("eth0".to_string(), nic)]),
        }
    }

    /// Create one instance for `role`, blocking until LXD reports completion
    pub fn create_instance(&self, role: Role, cluster: &str, pool: &str, network: &str) -> Result<String> {
        let name = instance_name(cluster, role);
        let wrap = |e: Error| Error::provisioning(format!("{} instance {}", role, name), e);

        let nic = match self.service.network(network).map_err(wrap)? {
            Some(net) if net.managed => {
                device(&[("type", "nic"), ("name", "eth0"), ("network", network)])
            }
            Some(_) => device(&[
                ("type", "nic"),
                ("name", "eth0"),
                ("nictype", "bridged"),
                ("parent", network),
            ]),
            None => {
                return Err(wrap(Error::InstanceService(format!(
                    "network {} does not exist",
                    network
                ))))
            }
        };

        let spec = self.instance_spec(&name, role, pool, nic);
        self.service.create_instance(&spec).map_err(wrap)?;
        tracing::info!(cluster = %cluster, instance = %name, role = %role, image = %spec.image_alias, "Instance created");
        Ok(name)
    }

    pub fn start(&self, instance: &str) -> Result<()> {
        self.service.start_instance(instance)?;
        tracing::info!(instance = %instance, "Instance started");
        Ok(())
    }

    /// Stop an instance, tolerating one that is already stopped
    pub fn stop(&self, instance: &str) -> Result<()> {
        if self.service.instance_state(instance)?.is_stopped() {
            tracing::debug!(instance = %instance, "Already stopped");
            return Ok(());
        }
        self.service.stop_instance(instance)?;
        tracing::info!(instance = %instance, "Instance stopped");
        Ok(())
    }

    /// Stop then delete an instance; a missing instance counts as destroyed
    pub fn destroy(&self, instance: &str) -> Result<()> {
        if !self.service.instance_names()?.iter().any(|n| n == instance) {
            tracing::debug!(instance = %instance, "Instance already gone");
            return Ok(());
        }
        self.stop(instance)?;
        self.service.delete_instance(instance)?;
        tracing::info!(instance = %instance, "Instance deleted");
        Ok(())
    }

    pub fn destroy_network(&self, name: &str) -> Result<()> {
        if self.service.network(name)?.is_none() {
            return Ok(());
        }
        self.service.delete_network(name)?;
        tracing::info!(network = %name, "Network deleted");
        Ok(())
    }

    pub fn destroy_storage_pool(&self, name: &str) -> Result<()> {
        self.service.delete_storage_pool(name)?;
        tracing::info!(pool = %name, "Storage pool deleted");
        Ok(())
    }

    /// Pass the host's loop and virtualization devices through to a node
    pub fn attach_host_devices(&self, instance: &str, dev_root: &Path) -> Result<()> {
        for (name, dev) in host_devices(dev_root) {
            self.service.add_device(instance, &name, &dev)?;
        }
        Ok(())
    }

    /// Forward host port 6443 to the controller's API server
    pub fn attach_api_proxy(&self, controller: &str) -> Result<()> {
        let proxy = device(&[
            ("type", "proxy"),
            ("listen", "tcp:0.0.0.0:6443"),
            ("connect", "tcp:127.0.0.1:6443"),
        ]);
        self.service.add_device(controller, "kube-apiserver", &proxy)
    }
}

fn is_loop_device(name: &str) -> bool {
    name.strip_prefix("loop")
        .is_some_and(|rest| !rest.is_empty() && rest.chars().all(|c| c.is_ascii_digit()))
}

/// Devices under `dev_root` worth passing to a node
pub fn host_devices(dev_root: &Path) -> Vec<(String, Device)> {
    let mut devices = Vec::new();

    let mut loops: Vec<String> = std::fs::read_dir(dev_root)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .map(|e| e.file_name().to_string_lossy().to_string())
                .filter(|n| is_loop_device(n))
                .collect()
        })
        .unwrap_or_default();
    loops.sort();
    for name in loops {
        let path = format!("/dev/{}", name);
        devices.push((
            name,
            device(&[("type", "unix-block"), ("source", &path), ("path", &path)]),
        ));
    }

    for (name, rel) in CHAR_DEVICES {
        if dev_root.join(rel).exists() {
            let path = format!("/dev/{}", rel);
            devices.push((
                name.to_string(),
                device(&[("type", "unix-char"), ("source", &path), ("path", &path)]),
            ));
        }
    }

    devices
}
