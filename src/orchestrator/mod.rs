//! Cluster lifecycle: create, start, stop, delete and the read-only helpers
//!
//! The [`Orchestrator`] owns one implementation of each external seam and is
//! the only component that loads or saves a [`ClusterRecord`]. Operations
//! against one cluster are assumed to come from a single operator process at
//! a time; nothing guards concurrent invocations on the same name.

mod bootstrap;

use std::path::{Path, PathBuf};
use crate::config::{is_managed, ClusterLayout, CreateOptions, Settings};
use crate::error::ResultExt;
use crate::kube::{ClusterApi, Kubectl};
use crate::lxd::{InstanceService, LxcCli};
use crate::pki::{verify, AuthorityKind, CfsslSigner, Signer};
use crate::poll::select_address;
use crate::provision::Provisioner;
use crate::record::{ClusterRecord, LifecycleState, Role};
use crate::store::{LocalStore, RecordStore};
use crate::{Error, Result};
use bootstrap::Bootstrap;

/// Configuration for the orchestrator
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Root under which every cluster gets a directory
    pub cache_dir: PathBuf,
    pub settings: Settings,
    /// Host device tree scanned for passthrough devices
    pub dev_root: PathBuf,
}

impl OrchestratorConfig {
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            settings: Settings::default(),
            dev_root: PathBuf::from("/dev"),
        }
    }

    pub fn settings(mut self, settings: Settings) -> Self {
        self.settings = settings;
        self
    }

    pub fn dev_root(mut self, path: impl Into<PathBuf>) -> Self {
        self.dev_root = path.into();
        self
    }
}

/// Options for `delete`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeleteOptions {
    /// Delete the storage pool if the cluster owns it
    pub delete_storage: bool,
    /// Delete the network if the cluster owns it
    pub delete_network: bool,
}

impl Default for DeleteOptions {
    fn default() -> Self {
        Self {
            delete_storage: true,
            delete_network: true,
        }
    }
}

/// Result of `debug-cert`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertReport {
    /// File name of the authority that signed the certificate
    pub authority: String,
    pub info: verify::CertificateInfo,
}

/// Resources a failed `create` may have to give back
#[derive(Debug, Default)]
struct Owned {
    network: Option<String>,
    pool: Option<String>,
    instances: Vec<String>,
}

/// Drives clusters through their lifecycle
pub struct Orchestrator {
    instances: Box<dyn InstanceService>,
    signer: Box<dyn Signer>,
    cluster_api: Box<dyn ClusterApi>,
    store: Box<dyn RecordStore>,
    config: OrchestratorConfig,
}

impl Orchestrator {
    /// Wire up `lxc`, `cfssl`, `kubectl` and the on-disk record store
    pub fn with_config(config: OrchestratorConfig) -> Result<Self> {
        let settings = &config.settings;
        let instances = Box::new(LxcCli::new(settings.lxc_path.clone()));
        let signer = Box::new(CfsslSigner::new(settings.cfssl_path.clone()));
        let cluster_api = Box::new(Kubectl::new(settings.kubectl_path.clone()));
        let store = Box::new(LocalStore::open(&config.cache_dir)?);
        Ok(Self::with_backends(config, instances, signer, cluster_api, store))
    }

    pub fn with_backends(
        config: OrchestratorConfig,
        instances: Box<dyn InstanceService>,
        signer: Box<dyn Signer>,
        cluster_api: Box<dyn ClusterApi>,
        store: Box<dyn RecordStore>,
    ) -> Self {
        Self {
            instances,
            signer,
            cluster_api,
            store,
            config,
        }
    }

    pub fn layout(&self, cluster: &str) -> ClusterLayout {
        ClusterLayout::new(&self.config.cache_dir, cluster)
    }

    fn provisioner(&self) -> Provisioner<'_> {
        Provisioner::new(self.instances.as_ref(), &self.config.settings)
    }

    /// Addresses never taken as an instance address: the remote we talk to
    fn excluded_addresses(&self) -> Result<Vec<String>> {
        Ok(self.instances.remote_host()?.into_iter().collect())
    }

    /// Provision every resource of a new cluster and its static PKI
    pub fn create(&self, options: &CreateOptions) -> Result<ClusterRecord> {
        options.validate()?;
        let name = options.name.as_str();
        if self.store.exists(name)? {
            return Err(Error::AlreadyExists(name.to_string()));
        }
        tracing::info!(cluster = %name, workers = options.num_workers, "Creating cluster");

        let mut owned = Owned::default();
        let provisioned = self.provision(options, &mut owned);
        if provisioned.is_err() {
            self.rollback(name, &owned);
        }
        let record = provisioned.step(|| format!("create cluster {}", name))?;

        self.store.save(&record)?;
        tracing::info!(cluster = %name, instances = record.instances.len(), "Cluster created");
        Ok(record)
    }

    fn provision(&self, options: &CreateOptions, owned: &mut Owned) -> Result<ClusterRecord> {
        let name = options.name.as_str();
        let layout = self.layout(name);
        layout.ensure()?;
        let p = self.provisioner();

        let network = p.create_network(name, options.network.as_deref())?;
        if options.network.is_none() {
            owned.network = Some(network.clone());
        }
        let driver = options
            .storage_driver
            .clone()
            .unwrap_or_else(|| self.config.settings.storage_driver.clone());
        let pool = p.create_storage_pool(name, &driver, options.storage_pool.as_deref())?;
        if options.storage_pool.is_none() {
            owned.pool = Some(pool.clone());
        }
        p.ensure_profile()?;

        let mut create = |role: Role| -> Result<String> {
            let instance = p.create_instance(role, name, &pool, &network)?;
            owned.instances.push(instance.clone());
            Ok(instance)
        };
        let etcd = create(Role::Etcd)?;
        let controller = create(Role::Controller)?;
        let mut workers = Vec::with_capacity(options.num_workers);
        for _ in 0..options.num_workers {
            workers.push(create(Role::Worker)?);
        }
        let registry = if options.registry {
            Some(create(Role::Registry)?)
        } else {
            None
        };

        let issuer = crate::pki::Issuer::new(self.signer.as_ref(), layout.certificates());
        bootstrap::create_pki(&issuer).step(|| "build certificate authorities".to_string())?;

        Ok(ClusterRecord {
            name: name.to_string(),
            network_id: network,
            storage_pool: pool,
            storage_driver: driver,
            instances: owned.instances.clone(),
            etcd,
            controller,
            registry,
            workers,
            state: LifecycleState::Uninitialized,
        })
    }

    /// Give back the network and pool a failed create made; instances stay
    fn rollback(&self, cluster: &str, owned: &Owned) {
        let p = self.provisioner();
        if !owned.instances.is_empty() {
            tracing::warn!(
                cluster = %cluster,
                instances = ?owned.instances,
                "Leaving created instances for inspection"
            );
        }
        if let Some(pool) = &owned.pool {
            if let Err(e) = p.destroy_storage_pool(pool) {
                tracing::warn!(cluster = %cluster, pool = %pool, error = %e, "Rollback of storage pool failed");
            }
        }
        if let Some(network) = &owned.network {
            if let Err(e) = p.destroy_network(network) {
                tracing::warn!(cluster = %cluster, network = %network, error = %e, "Rollback of network failed");
            }
        }
    }

    /// Boot a created or stopped cluster and bring Kubernetes up on it
    pub fn start(&self, name: &str, use_remote_ip: bool) -> Result<ClusterRecord> {
        let mut record = self.store.load(name)?;
        if !record.state.can_start() {
            return Err(Error::InvalidTransition {
                name: name.to_string(),
                current: record.state.to_string(),
                action: "start".into(),
            });
        }
        for (_, instance) in record.tagged() {
            if self.instances.instance_state(instance)?.is_running() {
                return Err(Error::InvalidTransition {
                    name: name.to_string(),
                    current: format!("{} with {} already running", record.state, instance),
                    action: "start".into(),
                });
            }
        }

        self.bring_up(&record, use_remote_ip)
            .step(|| format!("start cluster {}", name))?;

        record.state = LifecycleState::Running;
        self.store.save(&record)?;
        tracing::info!(cluster = %name, "Cluster running");
        Ok(record)
    }

    fn bring_up(&self, record: &ClusterRecord, use_remote_ip: bool) -> Result<()> {
        let remote = self.instances.remote_host()?;
        let api_host = match (use_remote_ip, remote.as_deref()) {
            (false, _) => None,
            (true, Some(host)) => Some(host.to_string()),
            (true, None) => {
                return Err(Error::Config(
                    "remote IP requested but the client talks to a local LXD".into(),
                ))
            }
        };

        let p = self.provisioner();
        for (_, instance) in record.tagged() {
            p.start(instance).step(|| format!("start instance {}", instance))?;
        }

        let bootstrap = Bootstrap::new(self, &record.name, remote.into_iter().collect());
        let reissued = bootstrap::issue_static(bootstrap.issuer(), true)?;
        if reissued > 0 {
            tracing::warn!(cluster = %record.name, count = reissued, "Re-issued missing role certificates");
        }

        let etcd = bootstrap.resolve(&record.etcd)?;
        bootstrap.etcd(&record.etcd, &etcd)?;

        let registry = match &record.registry {
            Some(instance) => {
                let address = bootstrap.resolve(instance)?;
                bootstrap.registry(instance)?;
                Some((instance.clone(), address))
            }
            None => None,
        };

        let controller = bootstrap.resolve(&record.controller)?;
        if api_host.is_some() {
            p.attach_api_proxy(&record.controller)
                .step(|| format!("forward API port to {}", record.controller))?;
        }
        bootstrap.control_plane(&record.controller, &controller, &etcd, api_host.as_deref())?;

        let endpoints = bootstrap::Endpoints {
            etcd,
            controller,
            registry,
        };
        bootstrap.node(&record.controller, Role::Controller, &controller, &endpoints)?;
        for worker in &record.workers {
            let address = bootstrap.resolve(worker)?;
            bootstrap.node(worker, Role::Worker, &address, &endpoints)?;
        }

        let host = api_host.unwrap_or_else(|| controller.to_string());
        let admin = bootstrap
            .admin_kubeconfig(&host)
            .step(|| "write admin kubeconfig".to_string())?;
        bootstrap.wait_for_api(&admin)?;
        bootstrap.deploy_addons(&admin)?;
        bootstrap.register_control_plane(&admin, &record.controller)?;
        Ok(())
    }

    /// `create` followed by `start`
    pub fn up(&self, options: &CreateOptions, use_remote_ip: bool) -> Result<ClusterRecord> {
        self.create(options)?;
        self.start(&options.name, use_remote_ip)
    }

    /// Stop every instance, workers first; nothing is destroyed
    pub fn stop(&self, name: &str) -> Result<ClusterRecord> {
        let mut record = self.store.load(name)?;
        if !record.state.can_stop() {
            return Err(Error::InvalidTransition {
                name: name.to_string(),
                current: record.state.to_string(),
                action: "stop".into(),
            });
        }

        let p = self.provisioner();
        for (_, instance) in record.tagged().into_iter().rev() {
            p.stop(instance)
                .step(|| format!("stop instance {}", instance))
                .step(|| format!("stop cluster {}", name))?;
        }

        record.state = LifecycleState::Stopped;
        self.store.save(&record)?;
        tracing::info!(cluster = %name, "Cluster stopped");
        Ok(record)
    }

    /// Destroy every resource of a cluster, making as much progress as possible.
    ///
    /// The record is removed last and only if everything else went, so a
    /// failed delete can be re-run.
    pub fn delete(&self, name: &str, options: DeleteOptions) -> Result<()> {
        let record = self.store.load(name)?;
        let p = self.provisioner();
        let mut failures = Vec::new();

        for instance in &record.instances {
            if let Err(e) = p.destroy(instance) {
                tracing::warn!(cluster = %name, instance = %instance, error = %e, "Could not destroy instance");
                failures.push(format!("instance {}: {}", instance, e));
            }
        }

        if options.delete_storage && is_managed(&record.storage_pool) {
            if let Err(e) = p.destroy_storage_pool(&record.storage_pool) {
                tracing::warn!(cluster = %name, pool = %record.storage_pool, error = %e, "Could not delete storage pool");
                failures.push(format!("storage pool {}: {}", record.storage_pool, e));
            }
        } else {
            tracing::info!(cluster = %name, pool = %record.storage_pool, "Keeping storage pool");
        }

        if options.delete_network && is_managed(&record.network_id) {
            if let Err(e) = p.destroy_network(&record.network_id) {
                tracing::warn!(cluster = %name, network = %record.network_id, error = %e, "Could not delete network");
                failures.push(format!("network {}: {}", record.network_id, e));
            }
        } else {
            tracing::info!(cluster = %name, network = %record.network_id, "Keeping network");
        }

        if !failures.is_empty() {
            return Err(Error::Cleanup(failures));
        }

        let layout = self.layout(name);
        remove_dir(&layout.certificates())?;
        remove_dir(&layout.kubeconfigs())?;
        self.store.remove(name)?;
        tracing::info!(cluster = %name, "Cluster deleted");
        Ok(())
    }

    /// Provision, start and configure one more worker on a running cluster
    pub fn add_worker(&self, name: &str) -> Result<String> {
        let mut record = self.store.load(name)?;
        if record.state != LifecycleState::Running {
            return Err(Error::InvalidTransition {
                name: name.to_string(),
                current: record.state.to_string(),
                action: "add a worker".into(),
            });
        }

        let p = self.provisioner();
        let worker = p
            .create_instance(Role::Worker, name, &record.storage_pool, &record.network_id)
            .step(|| format!("add worker to {}", name))?;
        // Track it right away so delete can find it if configuration fails
        record.add_worker(worker.clone());
        self.store.save(&record)?;

        let configure = || -> Result<()> {
            p.start(&worker)?;
            let bootstrap = Bootstrap::new(self, name, self.excluded_addresses()?);
            let endpoints =
                bootstrap.endpoints(&record.etcd, &record.controller, record.registry.as_deref())?;
            let address = bootstrap.resolve(&worker)?;
            bootstrap.node(&worker, Role::Worker, &address, &endpoints)
        };
        configure().step(|| format!("add worker {} to {}", worker, name))?;

        tracing::info!(cluster = %name, instance = %worker, "Worker added");
        Ok(worker)
    }

    pub fn load(&self, name: &str) -> Result<ClusterRecord> {
        self.store.load(name)
    }

    /// Every stored cluster record, by name
    pub fn list(&self) -> Result<Vec<ClusterRecord>> {
        self.store
            .list()?
            .iter()
            .map(|name| self.store.load(name))
            .collect()
    }

    /// Shell line pointing `kubectl` at the admin kubeconfig
    pub fn kubectl_env(&self, name: &str) -> Result<String> {
        self.store.load(name)?;
        let path = self.layout(name).kubeconfig("admin");
        if !path.is_file() {
            return Err(Error::Config(format!(
                "{} has no admin kubeconfig yet, start it first",
                name
            )));
        }
        Ok(format!("export KUBECONFIG={}", path.display()))
    }

    /// `etcdctl` environment for the cluster's datastore
    pub fn etcd_env(&self, name: &str) -> Result<String> {
        let record = self.store.load(name)?;
        let state = self.instances.instance_state(&record.etcd)?;
        let address = select_address(&state.network, &self.excluded_addresses()?).ok_or_else(|| {
            Error::Config(format!("etcd instance {} has no address, is {} running?", record.etcd, name))
        })?;

        let layout = self.layout(name);
        let lines = [
            format!("ETCDCTL_CACERT={}", layout.cert(AuthorityKind::Etcd.file_name()).display()),
            format!("ETCDCTL_CERT={}", layout.cert("etcd").display()),
            format!("ETCDCTL_KEY={}", layout.key("etcd").display()),
            format!("ETCDCTL_ENDPOINTS=https://{}:2379", address),
            "ETCDCTL_API=3".to_string(),
        ];
        Ok(lines.join("\n"))
    }

    /// Find which of the cluster's authorities signed `cert`
    pub fn debug_cert(&self, name: &str, cert: &Path) -> Result<CertReport> {
        self.store.load(name)?;
        let layout = self.layout(name);
        let pem = std::fs::read(cert).map_err(|e| Error::Certificate {
            path: cert.display().to_string(),
            reason: e.to_string(),
        })?;

        let mut candidates = Vec::new();
        for kind in AuthorityKind::ALL {
            let path = layout.cert(kind.file_name());
            if let Ok(ca) = std::fs::read(&path) {
                candidates.push((kind.file_name().to_string(), ca));
            }
        }

        let authority = verify::find_issuer(&pem, &candidates)?.ok_or_else(|| Error::Certificate {
            path: cert.display().to_string(),
            reason: format!("not signed by any authority of {}", name),
        })?;
        Ok(CertReport {
            authority: authority.to_string(),
            info: verify::inspect(&pem)?,
        })
    }
}

fn remove_dir(path: &Path) -> Result<()> {
    match std::fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
