//! Cluster configuration utility (`kubectl`)

use std::io::Write;
use std::path::Path;
use std::process::{Command, Output, Stdio};
use crate::{Error, Result};

/// Operations the start pipeline performs against a running control plane
pub trait ClusterApi {
    /// Whether the API server answers authenticated requests
    fn ready(&self, kubeconfig: &Path) -> Result<bool>;
    /// Apply a multi-document manifest
    fn apply(&self, kubeconfig: &Path, manifest: &str) -> Result<()>;
    fn node_registered(&self, kubeconfig: &Path, node: &str) -> Result<bool>;
    fn label_node(&self, kubeconfig: &Path, node: &str, label: &str) -> Result<()>;
    fn taint_node(&self, kubeconfig: &Path, node: &str, taint: &str) -> Result<()>;
}

pub struct Kubectl {
    binary: String,
}

impl Default for Kubectl {
    fn default() -> Self {
        Self::new("kubectl")
    }
}

impl Kubectl {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    fn run(&self, kubeconfig: &Path, args: &[&str], stdin: Option<&str>) -> Result<Output> {
        tracing::debug!(binary = %self.binary, ?args, "kubectl");
        let mut child = Command::new(&self.binary)
            .arg("--kubeconfig")
            .arg(kubeconfig)
            .args(args)
            .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::ClusterApi(format!("could not run {}: {}", self.binary, e)))?;

        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(input.as_bytes())?;
        }
        Ok(child.wait_with_output()?)
    }

    fn checked(&self, kubeconfig: &Path, args: &[&str], stdin: Option<&str>) -> Result<()> {
        let output = self.run(kubeconfig, args, stdin)?;
        if !output.status.success() {
            return Err(Error::ClusterApi(format!(
                "kubectl {} (exit code {:?}): {}",
                args.join(" "),
                output.status.code(),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }
}

impl ClusterApi for Kubectl {
    fn ready(&self, kubeconfig: &Path) -> Result<bool> {
        let output = self.run(kubeconfig, &["get", "clusterroles", "-o", "name"], None)?;
        if !output.status.success() {
            tracing::debug!(
                stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                "API server not ready"
            );
        }
        Ok(output.status.success())
    }

    fn apply(&self, kubeconfig: &Path, manifest: &str) -> Result<()> {
        self.checked(kubeconfig, &["apply", "-f", "-"], Some(manifest))
    }

    fn node_registered(&self, kubeconfig: &Path, node: &str) -> Result<bool> {
        let output = self.run(kubeconfig, &["get", "node", node, "-o", "name"], None)?;
        Ok(output.status.success())
    }

    fn label_node(&self, kubeconfig: &Path, node: &str, label: &str) -> Result<()> {
        let label = format!("{}=", label);
        self.checked(kubeconfig, &["label", "node", node, &label, "--overwrite"], None)
    }

    fn taint_node(&self, kubeconfig: &Path, node: &str, taint: &str) -> Result<()> {
        let taint = format!("{}:NoSchedule", taint);
        self.checked(kubeconfig, &["taint", "node", node, &taint, "--overwrite"], None)
    }
}
