//! Kubernetes-side documents: kubeconfigs, node configuration and add-ons

mod kubectl;

use std::path::Path;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use crate::Result;

pub use kubectl::{ClusterApi, Kubectl};

/// Cluster name written into every kubeconfig
pub const CLUSTER_NAME: &str = "lxdk";

/// First address of the service range, served by the API server
pub const SERVICE_ADDRESS: &str = "10.32.0.1";

pub const CLUSTER_DNS: &str = "10.32.0.10";

pub const POD_CIDR: &str = "10.20.0.0/16";

pub const API_PORT: u16 = 6443;

/// Label and taint applied to the controller once it registers as a node
pub const CONTROL_PLANE_ROLE: &str = "node-role.kubernetes.io/control-plane";

pub const RBAC_MANIFEST: &str = include_str!("../../manifests/rbac.yaml");
pub const FLANNEL_MANIFEST: &str = include_str!("../../manifests/flannel.yaml");
pub const COREDNS_MANIFEST: &str = include_str!("../../manifests/coredns.yaml");

/// Baseline add-ons applied once the API server answers, in order
pub fn baseline_manifests() -> [(&'static str, &'static str); 3] {
    [
        ("rbac", RBAC_MANIFEST),
        ("flannel", FLANNEL_MANIFEST),
        ("coredns", COREDNS_MANIFEST),
    ]
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ClusterEntry {
    pub server: String,
    pub certificate_authority_data: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct UserEntry {
    pub client_certificate_data: String,
    pub client_key_data: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextEntry {
    pub cluster: String,
    pub user: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamedCluster {
    pub name: String,
    pub cluster: ClusterEntry,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamedUser {
    pub name: String,
    pub user: UserEntry,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamedContext {
    pub name: String,
    pub context: ContextEntry,
}

/// Client access document with embedded credentials
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Kubeconfig {
    pub api_version: String,
    pub kind: String,
    pub clusters: Vec<NamedCluster>,
    pub users: Vec<NamedUser>,
    pub contexts: Vec<NamedContext>,
    #[serde(rename = "current-context")]
    pub current_context: String,
}

impl Kubeconfig {
    /// Single-cluster, single-user kubeconfig
    pub fn new(server: &str, user: &str, ca_pem: &[u8], cert_pem: &[u8], key_pem: &[u8]) -> Self {
        Self {
            api_version: "v1".into(),
            kind: "Config".into(),
            clusters: vec![NamedCluster {
                name: CLUSTER_NAME.into(),
                cluster: ClusterEntry {
                    server: server.into(),
                    certificate_authority_data: STANDARD.encode(ca_pem),
                },
            }],
            users: vec![NamedUser {
                name: user.into(),
                user: UserEntry {
                    client_certificate_data: STANDARD.encode(cert_pem),
                    client_key_data: STANDARD.encode(key_pem),
                },
            }],
            contexts: vec![NamedContext {
                name: "default".into(),
                context: ContextEntry {
                    cluster: CLUSTER_NAME.into(),
                    user: user.into(),
                },
            }],
            current_context: "default".into(),
        }
    }

    /// Build from certificate files in `cert_dir`
    pub fn from_files(server: &str, user: &str, cert_dir: &Path, cert_file: &str) -> Result<Self> {
        let ca = std::fs::read(cert_dir.join("ca.pem"))?;
        let cert = std::fs::read(cert_dir.join(format!("{}.pem", cert_file)))?;
        let key = std::fs::read(cert_dir.join(format!("{}-key.pem", cert_file)))?;
        Ok(Self::new(server, user, &ca, &cert, &key))
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        use std::os::unix::fs::PermissionsExt;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_yaml::to_string(self)?)?;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        Ok(())
    }
}

pub fn api_server_url(host: &str) -> String {
    format!("https://{}:{}", host, API_PORT)
}

/// `KEY=value` lines for a systemd environment file
pub fn env_file(pairs: &[(&str, &str)]) -> String {
    pairs
        .iter()
        .map(|(k, v)| format!("{}={}\n", k, v))
        .collect()
}

/// Kubelet configuration for `node`
pub fn kubelet_config(node: &str) -> String {
    format!(
        r#"kind: KubeletConfiguration
apiVersion: kubelet.config.k8s.io/v1beta1
authentication:
  anonymous:
    enabled: false
  webhook:
    enabled: true
  x509:
    clientCAFile: "/etc/kubernetes/ca.pem"
authorization:
  mode: Webhook
cgroupDriver: systemd
clusterDomain: "cluster.local"
clusterDNS:
  - "{dns}"
podCIDR: "{pods}"
runtimeRequestTimeout: "10m"
tlsCertFile: "/etc/kubernetes/{node}.pem"
tlsPrivateKeyFile: "/etc/kubernetes/{node}-key.pem"
failSwapOn: false
evictionHard: {{}}
enforceNodeAllocatable: []
maxPods: 1000
"#,
        dns = CLUSTER_DNS,
        pods = POD_CIDR,
        node = node
    )
}

/// systemd unit running the kubelet against CRI-O
pub fn kubelet_unit(node: &str) -> String {
    format!(
        r#"[Unit]
Description=Kubernetes Kubelet
After=crio.service
Requires=crio.service

[Service]
ExecStart=/usr/local/bin/kubelet \
  --config=/etc/kubernetes/config/kubelet.yaml \
  --container-runtime-endpoint=unix:///var/run/crio/crio.sock \
  --kubeconfig=/etc/kubernetes/{node}-kubelet.kubeconfig \
  --register-node=true \
  --v=2
Restart=on-failure
RestartSec=5

[Install]
WantedBy=multi-user.target
"#,
        node = node
    )
}

/// containers-registries.conf pointing at the cluster registry
pub fn registries_conf(registry: Option<(&str, &str)>) -> String {
    let mut conf = String::from("unqualified-search-registries = ['docker.io']\n");
    if let Some((name, address)) = registry {
        for prefix in ["registry.local", name, address] {
            conf.push_str(&format!(
                "\n[[registry]]\nprefix = \"{}:5000\"\ninsecure = true\nlocation = \"{}:5000\"\n",
                prefix, address
            ));
        }
    }
    conf
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_kubeconfig_shape() {
        let kfg = Kubeconfig::new("https://10.0.0.3:6443", "admin", b"CA", b"CERT", b"KEY");
        let yaml = serde_yaml::to_string(&kfg).unwrap();

        assert!(yaml.contains("apiVersion: v1"));
        assert!(yaml.contains("current-context: default"));
        assert!(yaml.contains("certificate-authority-data: Q0E="));
        assert!(yaml.contains("client-certificate-data: Q0VSVA=="));
        assert!(yaml.contains("server: https://10.0.0.3:6443"));

        let parsed: Kubeconfig = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed.users[0].name, "admin");
        assert_eq!(parsed.contexts[0].context.cluster, "lxdk");
    }

    #[test]
    fn test_kubeconfig_from_files() {
        let temp = TempDir::new().unwrap();
        for (file, body) in [("ca.pem", "ca"), ("kube-proxy.pem", "cert"), ("kube-proxy-key.pem", "key")] {
            std::fs::write(temp.path().join(file), body).unwrap();
        }
        let kfg = Kubeconfig::from_files("https://x:6443", "system:kube-proxy", temp.path(), "kube-proxy").unwrap();
        assert_eq!(kfg.users[0].user.client_key_data, STANDARD.encode("key"));

        let path = temp.path().join("kubeconfigs/kube-proxy.kubeconfig");
        kfg.write(&path).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn test_node_templates_reference_node() {
        let node = "lxdk-test-worker-abcde";
        assert!(kubelet_config(node).contains("tlsCertFile: \"/etc/kubernetes/lxdk-test-worker-abcde.pem\""));
        assert!(kubelet_config(node).contains("evictionHard: {}"));
        assert!(kubelet_unit(node).contains("--kubeconfig=/etc/kubernetes/lxdk-test-worker-abcde-kubelet.kubeconfig"));
    }

    #[test]
    fn test_registries_conf() {
        let conf = registries_conf(Some(("lxdk-test-registry-abcde", "10.0.0.9")));
        assert_eq!(conf.matches("[[registry]]").count(), 3);
        assert!(conf.contains("prefix = \"lxdk-test-registry-abcde:5000\""));
        assert!(conf.contains("location = \"10.0.0.9:5000\""));
        assert!(!registries_conf(None).contains("[[registry]]"));
    }

    #[test]
    fn test_env_file() {
        assert_eq!(
            env_file(&[("CONTAINER_NAME", "n1"), ("ETCD_IP", "10.0.0.2")]),
            "CONTAINER_NAME=n1\nETCD_IP=10.0.0.2\n"
        );
    }

    #[test]
    fn test_manifests_embedded() {
        assert!(RBAC_MANIFEST.contains("system:kube-apiserver-to-kubelet"));
        assert!(FLANNEL_MANIFEST.contains("10.244.0.0/16"));
        assert!(!FLANNEL_MANIFEST.contains("PodSecurityPolicy"));
        assert!(COREDNS_MANIFEST.contains("clusterIP: 10.32.0.10"));
    }
}
