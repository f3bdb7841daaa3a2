//! Per-role configuration steps shared by `start` and `add-worker`

use std::path::{Path, PathBuf};
use crate::config::ClusterLayout;
use crate::error::ResultExt;
use crate::inject::{Injector, Upload};
use crate::kube::{self, Kubeconfig};
use crate::lxd::FileOwnership;
use crate::pki::{self, AuthorityKind, Issuer, LeafCertificate, LeafRequest};
use crate::poll::{wait_for_address, ResolvedAddress};
use crate::record::Role;
use crate::Result;
use super::Orchestrator;

const ETCD_DIR: &str = "/etc/etcd";
const KUBE_DIR: &str = "/etc/kubernetes";
const LXDK_ENV: &str = "/etc/lxdk/env";

/// Directories and links CRI-O and the kubelet expect on a node
const NODE_PREP: &[&str] = &[
    "mkdir -p /etc/containers",
    "mkdir -p /usr/share/containers/oci/hooks.d",
    "ln -sf /etc/crio/policy.json /etc/containers/policy.json",
    "mkdir -p /etc/cni/net.d",
    "mkdir -p /etc/kubernetes/config",
    "ln -sf /dev/console /dev/kmsg",
];

/// In-cluster names the API server answers to
const API_SERVER_NAMES: &[&str] = &[
    "kubernetes",
    "kubernetes.default",
    "kubernetes.default.svc",
    "kubernetes.default.svc.cluster.local",
];

/// Role certificates that do not depend on an instance address
pub(super) fn static_leaves() -> [(AuthorityKind, LeafRequest); 5] {
    [
        (
            AuthorityKind::Cluster,
            LeafRequest::new("admin", "admin").organization("system:masters"),
        ),
        (
            AuthorityKind::Aggregation,
            LeafRequest::new("aggregation-client", "kube-apiserver"),
        ),
        (
            AuthorityKind::Cluster,
            LeafRequest::new("system:kube-controller-manager", "system:kube-controller-manager")
                .file_name("kube-controller-manager"),
        ),
        (
            AuthorityKind::Cluster,
            LeafRequest::new("system:kube-scheduler", "system:kube-scheduler")
                .file_name("kube-scheduler"),
        ),
        (
            AuthorityKind::Cluster,
            LeafRequest::new("system:kube-proxy", "system:kube-proxy")
                .file_name("kube-proxy")
                .organization("system:node-proxier"),
        ),
    ]
}

/// Signing profile, the three authorities and every static role certificate
pub(super) fn create_pki(issuer: &Issuer<'_>) -> Result<()> {
    issuer.write_signing_profile()?;
    for kind in AuthorityKind::ALL {
        issuer
            .create_authority(kind.file_name(), kind.common_name())
            .step(|| format!("create authority {}", kind.file_name()))?;
    }
    issue_static(issuer, false)?;
    Ok(())
}

/// Issue the static role certificates, optionally only those not on disk.
/// Returns how many were signed.
pub(super) fn issue_static(issuer: &Issuer<'_>, only_missing: bool) -> Result<usize> {
    let profile = issuer.signing_profile_path();
    let mut issued = 0;
    for (kind, request) in static_leaves() {
        if only_missing && issuer.has(request.output_name()) {
            continue;
        }
        issuer
            .issue_leaf(&request, &issuer.authority(kind), &profile)
            .step(|| format!("issue {} certificate", request.name))?;
        issued += 1;
    }
    Ok(issued)
}

pub(super) fn etcd_certificate(issuer: &Issuer<'_>, address: &ResolvedAddress) -> Result<LeafCertificate> {
    let request = LeafRequest::new("etcd", "etcd")
        .hostname(address.to_string())
        .hostname("127.0.0.1");
    issuer.issue_leaf(
        &request,
        &issuer.authority(AuthorityKind::Etcd),
        &issuer.signing_profile_path(),
    )
}

/// API server certificate; `extra_host` is the remote address clients dial
pub(super) fn apiserver_certificate(
    issuer: &Issuer<'_>,
    address: &ResolvedAddress,
    extra_host: Option<&str>,
) -> Result<LeafCertificate> {
    let mut request = LeafRequest::new("kubernetes", "kubernetes")
        .hostname(kube::SERVICE_ADDRESS)
        .hostname(address.to_string())
        .hostname("127.0.0.1");
    for name in API_SERVER_NAMES {
        request = request.hostname(*name);
    }
    if let Some(host) = extra_host {
        request = request.hostname(host);
    }
    issuer.issue_leaf(
        &request,
        &issuer.authority(AuthorityKind::Cluster),
        &issuer.signing_profile_path(),
    )
}

pub(super) fn node_certificate(
    issuer: &Issuer<'_>,
    node: &str,
    address: &ResolvedAddress,
) -> Result<LeafCertificate> {
    let request = LeafRequest::new(format!("node:{}", node), format!("system:node:{}", node))
        .file_name(node)
        .organization("system:nodes")
        .hostname(address.to_string())
        .hostname(node);
    issuer.issue_leaf(
        &request,
        &issuer.authority(AuthorityKind::Cluster),
        &issuer.signing_profile_path(),
    )
}

/// `daemon-reload`, then enable and start each unit in order
fn service_commands(units: &[&str]) -> Vec<String> {
    let mut commands = vec!["systemctl daemon-reload".to_string()];
    for unit in units {
        commands.push(format!("systemctl -q enable {}", unit));
        commands.push(format!("systemctl start {}", unit));
    }
    commands
}

/// Addresses node configuration points at
#[derive(Debug, Clone)]
pub(super) struct Endpoints {
    pub etcd: ResolvedAddress,
    pub controller: ResolvedAddress,
    pub registry: Option<(String, ResolvedAddress)>,
}

/// One bootstrap run against one cluster
pub(super) struct Bootstrap<'a> {
    orch: &'a Orchestrator,
    layout: ClusterLayout,
    issuer: Issuer<'a>,
    injector: Injector<'a>,
    excluded: Vec<String>,
}

impl<'a> Bootstrap<'a> {
    /// `excluded` holds addresses never taken as an instance address
    pub fn new(orch: &'a Orchestrator, cluster: &str, excluded: Vec<String>) -> Self {
        let layout = orch.layout(cluster);
        Self {
            orch,
            issuer: Issuer::new(orch.signer.as_ref(), layout.certificates()),
            injector: Injector::new(orch.instances.as_ref(), FileOwnership::default()),
            layout,
            excluded,
        }
    }

    pub fn issuer(&self) -> &Issuer<'a> {
        &self.issuer
    }

    pub fn resolve(&self, instance: &str) -> Result<ResolvedAddress> {
        wait_for_address(
            self.orch.instances.as_ref(),
            instance,
            &self.excluded,
            &self.orch.config.settings.address_poll,
        )
        .step(|| format!("wait for address of {}", instance))
    }

    /// Resolve etcd, the controller and the registry of a running cluster
    pub fn endpoints(&self, etcd: &str, controller: &str, registry: Option<&str>) -> Result<Endpoints> {
        let registry = match registry {
            Some(name) => Some((name.to_string(), self.resolve(name)?)),
            None => None,
        };
        Ok(Endpoints {
            etcd: self.resolve(etcd)?,
            controller: self.resolve(controller)?,
            registry,
        })
    }

    pub fn etcd(&self, instance: &str, address: &ResolvedAddress) -> Result<()> {
        let step = || format!("configure etcd on {}", instance);
        let cert = etcd_certificate(&self.issuer, address).step(step)?;
        let ca = self.issuer.authority(AuthorityKind::Etcd);
        let files: [&Path; 3] = [&cert.cert, &cert.key, &ca.cert];
        self.injector.upload_files(instance, &files, ETCD_DIR).step(step)?;

        let ip = address.to_string();
        let env = kube::env_file(&[("ETCD_IP", ip.as_str())]);
        self.injector
            .upload(instance, Upload::Bytes(env.as_bytes()), "/etc/etcd/env")
            .step(step)?;
        self.injector
            .run_commands(instance, &service_commands(&["etcd"]))
            .step(step)?;
        tracing::info!(instance = %instance, address = %address, "etcd configured");
        Ok(())
    }

    pub fn registry(&self, instance: &str) -> Result<()> {
        self.injector
            .run_commands(instance, &service_commands(&["oci-registry"]))
            .step(|| format!("configure registry on {}", instance))?;
        tracing::info!(instance = %instance, "Registry started");
        Ok(())
    }

    /// API server, controller manager and scheduler
    pub fn control_plane(
        &self,
        controller: &str,
        address: &ResolvedAddress,
        etcd: &ResolvedAddress,
        extra_host: Option<&str>,
    ) -> Result<()> {
        let step = || format!("configure control plane on {}", controller);
        let certs = self.layout.certificates();
        let cert = apiserver_certificate(&self.issuer, address, extra_host).step(step)?;
        pki::require_all(&certs, &["etcd", "aggregation-client"]).step(step)?;

        let server = kube::api_server_url(&address.to_string());
        let mut kubeconfigs = Vec::new();
        for (file, user) in [
            ("kube-controller-manager", "system:kube-controller-manager"),
            ("kube-scheduler", "system:kube-scheduler"),
        ] {
            let path = self.layout.kubeconfig(file);
            Kubeconfig::from_files(&server, user, &certs, file)
                .and_then(|k| k.write(&path))
                .step(step)?;
            kubeconfigs.push(path);
        }

        let etcd_ip = etcd.to_string();
        let env = kube::env_file(&[("CONTAINER_NAME", controller), ("ETCD_IP", etcd_ip.as_str())]);
        self.injector
            .upload(controller, Upload::Bytes(env.as_bytes()), LXDK_ENV)
            .step(step)?;

        let cluster = self.issuer.authority(AuthorityKind::Cluster);
        let aggregation = self.issuer.authority(AuthorityKind::Aggregation);
        let etcd_ca = self.issuer.authority(AuthorityKind::Etcd);
        let mut files: Vec<PathBuf> = vec![
            cert.cert,
            cert.key,
            cluster.cert,
            cluster.key,
            self.issuer.cert_path("etcd"),
            self.issuer.key_path("etcd"),
            etcd_ca.cert,
            aggregation.cert,
            self.issuer.cert_path("aggregation-client"),
            self.issuer.key_path("aggregation-client"),
        ];
        files.extend(kubeconfigs);
        let files: Vec<&Path> = files.iter().map(PathBuf::as_path).collect();
        self.injector.upload_files(controller, &files, KUBE_DIR).step(step)?;

        self.injector
            .run_commands(
                controller,
                &service_commands(&["kube-apiserver", "kube-controller-manager", "kube-scheduler"]),
            )
            .step(step)?;
        tracing::info!(instance = %controller, address = %address, "Control plane configured");
        Ok(())
    }

    /// Container runtime, kubelet and proxy on a controller or worker
    pub fn node(&self, node: &str, role: Role, address: &ResolvedAddress, endpoints: &Endpoints) -> Result<()> {
        let step = || format!("configure node {}", node);
        let certs = self.layout.certificates();
        let cert = node_certificate(&self.issuer, node, address).step(step)?;

        let server = kube::api_server_url(&endpoints.controller.to_string());
        let kubelet_kubeconfig = self.layout.kubeconfig(&format!("{}-kubelet", node));
        Kubeconfig::from_files(&server, &format!("system:node:{}", node), &certs, node)
            .and_then(|k| k.write(&kubelet_kubeconfig))
            .step(step)?;
        let proxy_kubeconfig = self.layout.kubeconfig("kube-proxy");
        Kubeconfig::from_files(&server, "system:kube-proxy", &certs, "kube-proxy")
            .and_then(|k| k.write(&proxy_kubeconfig))
            .step(step)?;

        self.orch
            .provisioner()
            .attach_host_devices(node, &self.orch.config.dev_root)
            .step(step)?;

        let prep: Vec<String> = NODE_PREP.iter().map(|c| c.to_string()).collect();
        self.injector.run_commands(node, &prep).step(step)?;

        let etcd_ip = endpoints.etcd.to_string();
        let env = if role == Role::Controller {
            kube::env_file(&[("CONTAINER_NAME", node), ("ETCD_IP", etcd_ip.as_str())])
        } else {
            kube::env_file(&[("CONTAINER_NAME", node)])
        };
        let registry_ip = endpoints.registry.as_ref().map(|(name, ip)| (name.as_str(), ip.to_string()));
        let registry = registry_ip
            .as_ref()
            .filter(|_| self.orch.config.settings.enable_insecure_registry)
            .map(|(name, ip)| (*name, ip.as_str()));
        let generated = [
            (LXDK_ENV, env),
            ("/etc/containers/registries.conf", kube::registries_conf(registry)),
            ("/etc/kubernetes/config/kubelet.yaml", kube::kubelet_config(node)),
            ("/etc/systemd/system/kubelet.service", kube::kubelet_unit(node)),
        ];
        for (destination, contents) in &generated {
            self.injector
                .upload(node, Upload::Bytes(contents.as_bytes()), destination)
                .step(step)?;
        }

        let ca = self.issuer.authority(AuthorityKind::Cluster);
        let files: [&Path; 5] = [&ca.cert, &cert.cert, &cert.key, &proxy_kubeconfig, &kubelet_kubeconfig];
        self.injector.upload_files(node, &files, KUBE_DIR).step(step)?;

        self.injector
            .run_commands(node, &service_commands(&["crio", "kubelet", "kube-proxy"]))
            .step(step)?;
        tracing::info!(instance = %node, role = %role, address = %address, "Node configured");
        Ok(())
    }

    /// Write the admin kubeconfig pointing at `host`
    pub fn admin_kubeconfig(&self, host: &str) -> Result<PathBuf> {
        let path = self.layout.kubeconfig("admin");
        Kubeconfig::from_files(&kube::api_server_url(host), "admin", &self.layout.certificates(), "admin")?
            .write(&path)?;
        Ok(path)
    }

    pub fn wait_for_api(&self, kubeconfig: &Path) -> Result<()> {
        let api = self.orch.cluster_api.as_ref();
        self.orch
            .config
            .settings
            .api_poll
            .run("control plane API", |_| Ok(api.ready(kubeconfig)?.then_some(())))?;
        tracing::info!("Control plane API ready");
        Ok(())
    }

    /// Access policy, pod network and cluster DNS
    pub fn deploy_addons(&self, kubeconfig: &Path) -> Result<()> {
        for (name, manifest) in kube::baseline_manifests() {
            self.orch
                .cluster_api
                .apply(kubeconfig, manifest)
                .step(|| format!("apply {} manifest", name))?;
            tracing::info!(addon = name, "Manifest applied");
        }
        Ok(())
    }

    /// Wait for the controller to register, then mark it as control plane
    pub fn register_control_plane(&self, kubeconfig: &Path, controller: &str) -> Result<()> {
        let api = self.orch.cluster_api.as_ref();
        self.orch.config.settings.api_poll.run(
            &format!("registration of node {}", controller),
            |_| Ok(api.node_registered(kubeconfig, controller)?.then_some(())),
        )?;
        api.label_node(kubeconfig, controller, kube::CONTROL_PLANE_ROLE)?;
        api.taint_node(kubeconfig, controller, kube::CONTROL_PLANE_ROLE)?;
        tracing::info!(node = %controller, "Control plane node registered");
        Ok(())
    }
}
