//! In-process doubles for the external collaborators

use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use parking_lot::Mutex;
use rcgen::{
    string::Ia5String, BasicConstraints, CertificateParams, DistinguishedName, DnType, DnValue,
    IsCa, Issuer, KeyPair, SanType,
};
use serde_json::json;
use crate::kube::ClusterApi;
use crate::lxd::{
    Device, FileKind, FileOwnership, InstanceService, InstanceSpec, InstanceState, Interface,
    InterfaceAddress, Network, NetworkState, Profile,
};
use crate::pki::{SignParams, Signer};
use crate::{Error, Result};

fn dn(common_name: &str, organization: Option<&str>) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, DnValue::Utf8String(common_name.to_string()));
    if let Some(org) = organization {
        dn.push(DnType::OrganizationName, DnValue::Utf8String(org.to_string()));
    }
    dn
}

fn san(host: &str) -> SanType {
    match host.parse::<std::net::IpAddr>() {
        Ok(ip) => SanType::IpAddress(ip),
        Err(_) => SanType::DnsName(Ia5String::try_from(host.to_string()).unwrap()),
    }
}

/// Self-signed authority as `(cert_pem, key_pem)`
pub fn test_authority(common_name: &str) -> (String, String) {
    let mut params = CertificateParams::default();
    params.distinguished_name = dn(common_name, Some(common_name));
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    let key = KeyPair::generate().unwrap();
    let cert = params.self_signed(&key).unwrap();
    (cert.pem(), key.serialize_pem())
}

/// Leaf signed by the given authority, SAN'd to `hosts`
pub fn test_leaf(ca_pem: &str, ca_key: &str, common_name: &str, hosts: &[&str]) -> String {
    leaf(ca_pem, ca_key, common_name, None, hosts).0
}

fn leaf(
    ca_pem: &str,
    ca_key: &str,
    common_name: &str,
    organization: Option<&str>,
    hosts: &[&str],
) -> (String, String, String) {
    let ca_key = KeyPair::from_pem(ca_key).unwrap();
    let issuer = Issuer::from_ca_cert_pem(ca_pem, &ca_key).unwrap();

    let mut params = CertificateParams::default();
    params.distinguished_name = dn(common_name, organization);
    params.subject_alt_names = hosts.iter().map(|h| san(h)).collect();
    let key = KeyPair::generate().unwrap();
    let csr = params.serialize_request(&key).unwrap().pem().unwrap();
    let cert = params.signed_by(&key, &issuer).unwrap();
    (cert.pem(), key.serialize_pem(), csr)
}

/// `(CN, O)` of a cfssl-style identity document
fn subject(request: &[u8]) -> (String, Option<String>) {
    let doc: serde_json::Value = serde_json::from_slice(request).unwrap();
    let cn = doc["CN"].as_str().unwrap_or_default().to_string();
    let org = doc["names"][0]["O"].as_str().map(str::to_string);
    (cn, org)
}

/// Output the way cfssl prints it: log lines, then the JSON document
fn cfssl_output(cert: &str, key: &str, csr: &str) -> String {
    format!(
        "2026/01/01 00:00:00 [INFO] signed certificate with serial number 1\n{}",
        json!({ "cert": cert, "key": key, "csr": csr })
    )
}

/// rcgen-backed signer producing cfssl-shaped responses
#[derive(Debug, Clone, Default)]
pub struct TestSigner {
    fail: bool,
    calls: Arc<Mutex<Vec<String>>>,
}

impl TestSigner {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    /// Logical names of every authority and leaf signed so far
    pub fn signed(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    fn record(&self, name: &str) -> Result<()> {
        if self.fail {
            return Err(Error::Signing {
                name: name.to_string(),
                reason: "exit code 1: cannot sign".into(),
            });
        }
        self.calls.lock().push(name.to_string());
        Ok(())
    }
}

impl Signer for TestSigner {
    fn init_authority(&self, name: &str, request: &[u8]) -> Result<String> {
        self.record(name)?;
        let (cn, org) = subject(request);
        let mut params = CertificateParams::default();
        params.distinguished_name = dn(&cn, org.as_deref());
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        let key = KeyPair::generate().unwrap();
        let csr = params.serialize_request(&key).unwrap().pem().unwrap();
        let cert = params.self_signed(&key).unwrap();
        Ok(cfssl_output(&cert.pem(), &key.serialize_pem(), &csr))
    }

    fn sign(&self, name: &str, request: &[u8], params: &SignParams<'_>) -> Result<String> {
        self.record(name)?;
        let (cn, org) = subject(request);
        let ca_pem = std::fs::read_to_string(params.ca_cert)?;
        let ca_key = std::fs::read_to_string(params.ca_key)?;
        assert!(params.config.is_file(), "signing profile missing");
        let hosts: Vec<&str> = params.hostnames.iter().map(String::as_str).collect();
        let (cert, key, csr) = leaf(&ca_pem, &ca_key, &cn, org.as_deref(), &hosts);
        Ok(cfssl_output(&cert, &key, &csr))
    }
}

#[derive(Debug, Clone)]
struct FakeInstance {
    spec: InstanceSpec,
    running: bool,
    address: Option<Ipv4Addr>,
    files: BTreeMap<String, (Vec<u8>, FileOwnership)>,
    dirs: BTreeSet<String>,
    executed: Vec<String>,
    devices: BTreeMap<String, Device>,
}

impl FakeInstance {
    fn new(spec: InstanceSpec) -> Self {
        Self {
            spec,
            running: false,
            address: None,
            files: BTreeMap::new(),
            dirs: BTreeSet::from(["/".to_string()]),
            executed: Vec::new(),
            devices: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Default)]
struct FakeState {
    instances: BTreeMap<String, FakeInstance>,
    profiles: BTreeMap<String, Profile>,
    networks: BTreeMap<String, bool>,
    pools: BTreeMap<String, String>,
    failing_commands: BTreeMap<String, i32>,
    failing_creates: Vec<String>,
    failing_deletes: BTreeSet<String>,
    withhold_addresses: bool,
    leases: u8,
    remote: Option<String>,
}

fn missing(what: &str, name: &str) -> Error {
    Error::InstanceService(format!("{} {} not found", what, name))
}

/// In-memory instance service; clones share state
#[derive(Debug, Clone, Default)]
pub struct FakeInstances {
    state: Arc<Mutex<FakeState>>,
}

impl FakeInstances {
    pub fn add_running(&self, name: &str) {
        let mut instance = FakeInstance::new(InstanceSpec {
            name: name.to_string(),
            ..Default::default()
        });
        instance.running = true;
        self.state.lock().instances.insert(name.to_string(), instance);
    }

    pub fn add_network(&self, name: &str, managed: bool) {
        self.state.lock().networks.insert(name.to_string(), managed);
    }

    pub fn add_pool(&self, name: &str) {
        self.state.lock().pools.insert(name.to_string(), "dir".into());
    }

    pub fn set_remote(&self, host: &str) {
        self.state.lock().remote = Some(host.to_string());
    }

    /// Exit `cmd` with `code` wherever it runs
    pub fn fail_command(&self, cmd: &str, code: i32) {
        self.state.lock().failing_commands.insert(cmd.to_string(), code);
    }

    /// Fail creation of instances whose name contains `pattern`
    pub fn fail_create(&self, pattern: &str) {
        self.state.lock().failing_creates.push(pattern.to_string());
    }

    pub fn fail_delete(&self, name: &str) {
        self.state.lock().failing_deletes.insert(name.to_string());
    }

    /// Started instances never report an address
    pub fn withhold_addresses(&self) {
        self.state.lock().withhold_addresses = true;
    }

    pub fn instances(&self) -> Vec<String> {
        self.state.lock().instances.keys().cloned().collect()
    }

    pub fn is_running(&self, instance: &str) -> bool {
        self.state.lock().instances.get(instance).is_some_and(|i| i.running)
    }

    pub fn address(&self, instance: &str) -> Option<Ipv4Addr> {
        self.state.lock().instances.get(instance).and_then(|i| i.address)
    }

    pub fn has_network(&self, name: &str) -> bool {
        self.state.lock().networks.contains_key(name)
    }

    pub fn has_pool(&self, name: &str) -> bool {
        self.state.lock().pools.contains_key(name)
    }

    pub fn has_profile(&self, name: &str) -> bool {
        self.state.lock().profiles.contains_key(name)
    }

    pub fn devices(&self, instance: &str) -> BTreeMap<String, Device> {
        self.state
            .lock()
            .instances
            .get(instance)
            .map(|i| i.devices.clone())
            .unwrap_or_default()
    }

    pub fn file(&self, instance: &str, path: &str) -> Option<Vec<u8>> {
        self.state
            .lock()
            .instances
            .get(instance)
            .and_then(|i| i.files.get(path))
            .map(|(contents, _)| contents.clone())
    }

    pub fn ownership(&self, instance: &str, path: &str) -> Option<FileOwnership> {
        self.state
            .lock()
            .instances
            .get(instance)
            .and_then(|i| i.files.get(path))
            .map(|(_, ownership)| *ownership)
    }

    pub fn is_dir(&self, instance: &str, path: &str) -> bool {
        self.state
            .lock()
            .instances
            .get(instance)
            .is_some_and(|i| i.dirs.contains(path))
    }

    pub fn put_file(&self, instance: &str, path: &str, contents: &[u8]) {
        if let Some(i) = self.state.lock().instances.get_mut(instance) {
            i.files
                .insert(path.to_string(), (contents.to_vec(), FileOwnership::default()));
        }
    }

    /// Commands run on `instance`, space-joined, in order
    pub fn executed(&self, instance: &str) -> Vec<String> {
        self.state
            .lock()
            .instances
            .get(instance)
            .map(|i| i.executed.clone())
            .unwrap_or_default()
    }

    fn with_instance<T>(&self, name: &str, f: impl FnOnce(&mut FakeInstance) -> Result<T>) -> Result<T> {
        let mut state = self.state.lock();
        let instance = state
            .instances
            .get_mut(name)
            .ok_or_else(|| missing("instance", name))?;
        f(instance)
    }
}

impl InstanceService for FakeInstances {
    fn profile(&self, name: &str) -> Result<Option<Profile>> {
        Ok(self.state.lock().profiles.get(name).cloned())
    }

    fn create_profile(&self, profile: &Profile) -> Result<()> {
        self.state
            .lock()
            .profiles
            .insert(profile.name.clone(), profile.clone());
        Ok(())
    }

    fn network(&self, name: &str) -> Result<Option<Network>> {
        Ok(self.state.lock().networks.get(name).map(|managed| Network {
            name: name.to_string(),
            managed: *managed,
        }))
    }

    fn create_network(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock();
        if state.networks.contains_key(name) {
            return Err(Error::InstanceService(format!("network {} already exists", name)));
        }
        state.networks.insert(name.to_string(), true);
        Ok(())
    }

    fn delete_network(&self, name: &str) -> Result<()> {
        self.state
            .lock()
            .networks
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| missing("network", name))
    }

    fn create_storage_pool(&self, name: &str, driver: &str) -> Result<()> {
        let mut state = self.state.lock();
        if state.pools.contains_key(name) {
            return Err(Error::InstanceService(format!("storage pool {} already exists", name)));
        }
        state.pools.insert(name.to_string(), driver.to_string());
        Ok(())
    }

    fn delete_storage_pool(&self, name: &str) -> Result<()> {
        self.state
            .lock()
            .pools
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| missing("storage pool", name))
    }

    fn instance_names(&self) -> Result<Vec<String>> {
        Ok(self.instances())
    }

    fn create_instance(&self, spec: &InstanceSpec) -> Result<()> {
        let mut state = self.state.lock();
        if state.failing_creates.iter().any(|p| spec.name.contains(p.as_str())) {
            return Err(Error::InstanceService(format!(
                "Image not found: {}",
                spec.image_alias
            )));
        }
        if state.instances.contains_key(&spec.name) {
            return Err(Error::InstanceService(format!("instance {} already exists", spec.name)));
        }
        state
            .instances
            .insert(spec.name.clone(), FakeInstance::new(spec.clone()));
        Ok(())
    }

    fn start_instance(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.leases += 1;
        let lease = Ipv4Addr::new(10, 10, 0, state.leases.wrapping_add(1));
        let withhold = state.withhold_addresses;
        let instance = state
            .instances
            .get_mut(name)
            .ok_or_else(|| missing("instance", name))?;
        if instance.running {
            return Err(Error::InstanceService(format!("instance {} is already running", name)));
        }
        instance.running = true;
        // A fresh lease on every boot
        instance.address = if withhold { None } else { Some(lease) };
        Ok(())
    }

    fn stop_instance(&self, name: &str) -> Result<()> {
        self.with_instance(name, |i| {
            i.running = false;
            i.address = None;
            Ok(())
        })
    }

    fn delete_instance(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock();
        if state.failing_deletes.contains(name) {
            return Err(Error::InstanceService(format!("instance {} is busy", name)));
        }
        state
            .instances
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| missing("instance", name))
    }

    fn instance_state(&self, name: &str) -> Result<InstanceState> {
        self.with_instance(name, |i| {
            let mut interfaces = vec![Interface {
                name: "lo".into(),
                kind: "loopback".into(),
                addresses: vec![InterfaceAddress {
                    family: "inet".into(),
                    address: "127.0.0.1".into(),
                    scope: "local".into(),
                }],
            }];
            if let (true, Some(addr)) = (i.running, i.address) {
                interfaces.push(Interface {
                    name: "eth0".into(),
                    kind: "broadcast".into(),
                    addresses: vec![InterfaceAddress {
                        family: "inet".into(),
                        address: addr.to_string(),
                        scope: "global".into(),
                    }],
                });
            }
            Ok(InstanceState {
                status: if i.running { "Running" } else { "Stopped" }.into(),
                network: NetworkState { interfaces },
            })
        })
    }

    fn add_device(&self, instance: &str, device_name: &str, device: &Device) -> Result<()> {
        self.with_instance(instance, |i| {
            i.devices.insert(device_name.to_string(), device.clone());
            Ok(())
        })
    }

    fn file_kind(&self, instance: &str, path: &str) -> Result<Option<FileKind>> {
        self.with_instance(instance, |i| {
            Ok(if i.dirs.contains(path) {
                Some(FileKind::Directory)
            } else if i.files.contains_key(path) {
                Some(FileKind::File)
            } else {
                None
            })
        })
    }

    fn make_dir(&self, instance: &str, path: &str, _ownership: &FileOwnership) -> Result<()> {
        self.with_instance(instance, |i| {
            i.dirs.insert(path.to_string());
            Ok(())
        })
    }

    fn push_file(
        &self,
        instance: &str,
        path: &str,
        contents: &[u8],
        ownership: &FileOwnership,
    ) -> Result<()> {
        self.with_instance(instance, |i| {
            i.files
                .insert(path.to_string(), (contents.to_vec(), *ownership));
            Ok(())
        })
    }

    fn exec(&self, instance: &str, command: &[String]) -> Result<i32> {
        let joined = command.join(" ");
        let code = self
            .state
            .lock()
            .failing_commands
            .get(&joined)
            .copied()
            .unwrap_or(0);
        self.with_instance(instance, |i| {
            if !i.running {
                return Err(Error::InstanceService(format!("instance {} is not running", instance)));
            }
            i.executed.push(joined);
            Ok(code)
        })
    }

    fn remote_host(&self) -> Result<Option<String>> {
        Ok(self.state.lock().remote.clone())
    }
}

#[derive(Debug, Default)]
struct ApiState {
    never_ready: bool,
    kubeconfigs: Vec<PathBuf>,
    applied: Vec<String>,
    labels: Vec<(String, String)>,
    taints: Vec<(String, String)>,
}

/// Cluster API double that is ready immediately unless told otherwise
#[derive(Debug, Clone, Default)]
pub struct FakeClusterApi {
    state: Arc<Mutex<ApiState>>,
}

impl FakeClusterApi {
    pub fn never_ready(&self) {
        self.state.lock().never_ready = true;
    }

    pub fn applied(&self) -> Vec<String> {
        self.state.lock().applied.clone()
    }

    pub fn labels(&self) -> Vec<(String, String)> {
        self.state.lock().labels.clone()
    }

    pub fn taints(&self) -> Vec<(String, String)> {
        self.state.lock().taints.clone()
    }

    /// Kubeconfigs every call was made with
    pub fn kubeconfigs(&self) -> Vec<PathBuf> {
        self.state.lock().kubeconfigs.clone()
    }

    fn seen(&self, kubeconfig: &Path) -> Result<()> {
        if !kubeconfig.is_file() {
            return Err(Error::ClusterApi(format!("{} does not exist", kubeconfig.display())));
        }
        self.state.lock().kubeconfigs.push(kubeconfig.to_path_buf());
        Ok(())
    }
}

impl ClusterApi for FakeClusterApi {
    fn ready(&self, kubeconfig: &Path) -> Result<bool> {
        self.seen(kubeconfig)?;
        Ok(!self.state.lock().never_ready)
    }

    fn apply(&self, kubeconfig: &Path, manifest: &str) -> Result<()> {
        self.seen(kubeconfig)?;
        self.state.lock().applied.push(manifest.to_string());
        Ok(())
    }

    fn node_registered(&self, kubeconfig: &Path, _node: &str) -> Result<bool> {
        self.seen(kubeconfig)?;
        Ok(true)
    }

    fn label_node(&self, kubeconfig: &Path, node: &str, label: &str) -> Result<()> {
        self.seen(kubeconfig)?;
        self.state.lock().labels.push((node.to_string(), label.to_string()));
        Ok(())
    }

    fn taint_node(&self, kubeconfig: &Path, node: &str, taint: &str) -> Result<()> {
        self.seen(kubeconfig)?;
        self.state.lock().taints.push((node.to_string(), taint.to_string()));
        Ok(())
    }
}
