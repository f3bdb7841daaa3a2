//! `lxc` client wrappers

use std::collections::BTreeMap;
use std::io::Write;
use std::process::Command;
use serde::Deserialize;
use serde_json::json;
use super::*;
use crate::Error;

/// Drives LXD through the `lxc` binary, using `lxc query` for REST calls
pub struct LxcCli {
    binary: String,
}

impl Default for LxcCli {
    fn default() -> Self {
        Self::new("lxc")
    }
}

#[derive(Deserialize)]
struct RawState {
    #[serde(default)]
    status: String,
    #[serde(default)]
    network: Option<BTreeMap<String, RawInterface>>,
}

#[derive(Deserialize)]
struct RawInterface {
    #[serde(default)]
    addresses: Vec<RawAddress>,
    #[serde(rename = "type", default)]
    kind: String,
}

#[derive(Deserialize)]
struct RawAddress {
    family: String,
    address: String,
    scope: String,
}

#[derive(Deserialize)]
struct RawRemote {
    #[serde(rename = "Addr", default)]
    addr: String,
}

impl LxcCli {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Run `lxc` and return stdout, failing with stderr on non-zero exit
    fn lxc(&self, args: &[&str]) -> Result<String> {
        tracing::debug!(binary = %self.binary, ?args, "lxc");
        let output = Command::new(&self.binary).args(args).output()?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stdout = String::from_utf8_lossy(&output.stdout);
            return Err(Error::InstanceService(format!(
                "lxc {} (exit code {:?}): {}{}",
                args.first().unwrap_or(&""),
                output.status.code(),
                stderr.trim(),
                stdout.trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    /// `lxc query --wait -X <method> [-d <body>] <path>`
    fn query(&self, method: &str, path: &str, body: Option<serde_json::Value>) -> Result<String> {
        let data = body.map(|b| b.to_string());
        let mut args = vec!["query", "--wait", "-X", method];
        if let Some(data) = &data {
            args.push("-d");
            args.push(data);
        }
        args.push(path);
        self.lxc(&args)
    }

    /// GET that maps "not found" to `None`
    fn get<T: for<'de> Deserialize<'de>>(&self, path: &str) -> Result<Option<T>> {
        match self.query("GET", path, None) {
            Ok(out) => Ok(Some(serde_json::from_str(&out)?)),
            Err(Error::InstanceService(msg)) if is_not_found(&msg) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn set_state(&self, name: &str, action: &str) -> Result<()> {
        self.query(
            "PUT",
            &format!("/1.0/instances/{}/state", name),
            Some(json!({ "action": action, "timeout": 30, "force": false })),
        )?;
        Ok(())
    }
}

fn is_not_found(msg: &str) -> bool {
    msg.to_ascii_lowercase().contains("not found")
}

/// Host part of a remote address such as `https://10.0.0.2:8443`
fn remote_addr_host(addr: &str) -> Option<String> {
    let rest = addr.strip_prefix("https://")?;
    let host = if let Some(v6) = rest.strip_prefix('[') {
        v6.split(']').next()?
    } else {
        rest.split(':').next()?
    };
    (!host.is_empty()).then(|| host.to_string())
}

/// Interpret `stat -c %F` output; only a missing path maps to `None`
fn parse_stat(
    instance: &str,
    path: &str,
    success: bool,
    stdout: &str,
    stderr: &str,
) -> Result<Option<FileKind>> {
    if !success {
        if stderr.contains("No such file or directory") {
            return Ok(None);
        }
        return Err(Error::InstanceService(format!(
            "stat {} on {}: {}",
            path,
            instance,
            stderr.trim()
        )));
    }
    Ok(Some(match stdout.trim() {
        "directory" => FileKind::Directory,
        "regular file" | "regular empty file" => FileKind::File,
        _ => FileKind::Other,
    }))
}

fn network_state(raw: RawState) -> InstanceState {
    let interfaces = raw
        .network
        .unwrap_or_default()
        .into_iter()
        .map(|(name, iface)| Interface {
            name,
            kind: iface.kind,
            addresses: iface
                .addresses
                .into_iter()
                .map(|a| InterfaceAddress {
                    family: a.family,
                    address: a.address,
                    scope: a.scope,
                })
                .collect(),
        })
        .collect();
    InstanceState {
        status: raw.status,
        network: NetworkState { interfaces },
    }
}

impl InstanceService for LxcCli {
    fn profile(&self, name: &str) -> Result<Option<Profile>> {
        self.get(&format!("/1.0/profiles/{}", name))
    }

    fn create_profile(&self, profile: &Profile) -> Result<()> {
        self.query("POST", "/1.0/profiles", Some(serde_json::to_value(profile)?))?;
        Ok(())
    }

    fn network(&self, name: &str) -> Result<Option<Network>> {
        self.get(&format!("/1.0/networks/{}", name))
    }

    fn create_network(&self, name: &str) -> Result<()> {
        self.query(
            "POST",
            "/1.0/networks",
            Some(json!({
                "name": name,
                "type": "bridge",
                "config": {
                    "ipv4.address": "auto",
                    "ipv4.nat": "true",
                    "ipv6.address": "none",
                },
            })),
        )?;
        Ok(())
    }

    fn delete_network(&self, name: &str) -> Result<()> {
        self.query("DELETE", &format!("/1.0/networks/{}", name), None)?;
        Ok(())
    }

    fn create_storage_pool(&self, name: &str, driver: &str) -> Result<()> {
        self.query(
            "POST",
            "/1.0/storage-pools",
            Some(json!({ "name": name, "driver": driver })),
        )?;
        Ok(())
    }

    fn delete_storage_pool(&self, name: &str) -> Result<()> {
        self.query("DELETE", &format!("/1.0/storage-pools/{}", name), None)?;
        Ok(())
    }

    fn instance_names(&self) -> Result<Vec<String>> {
        let out = self.query("GET", "/1.0/instances", None)?;
        let urls: Vec<String> = serde_json::from_str(&out)?;
        Ok(urls
            .iter()
            .filter_map(|u| u.rsplit('/').next())
            .map(|n| n.split('?').next().unwrap_or(n).to_string())
            .collect())
    }

    fn create_instance(&self, spec: &InstanceSpec) -> Result<()> {
        self.query(
            "POST",
            "/1.0/instances",
            Some(json!({
                "name": spec.name,
                "type": "container",
                "source": { "type": "image", "alias": spec.image_alias },
                "profiles": spec.profiles,
                "config": spec.config,
                "devices": spec.devices,
            })),
        )?;
        Ok(())
    }

    fn start_instance(&self, name: &str) -> Result<()> {
        self.set_state(name, "start")
    }

    fn stop_instance(&self, name: &str) -> Result<()> {
        self.set_state(name, "stop")
    }

    fn delete_instance(&self, name: &str) -> Result<()> {
        self.query("DELETE", &format!("/1.0/instances/{}", name), None)?;
        Ok(())
    }

    fn instance_state(&self, name: &str) -> Result<InstanceState> {
        let out = self.query("GET", &format!("/1.0/instances/{}/state", name), None)?;
        let raw: RawState = serde_json::from_str(&out)?;
        Ok(network_state(raw))
    }

    fn add_device(&self, instance: &str, device_name: &str, device: &Device) -> Result<()> {
        self.query(
            "PATCH",
            &format!("/1.0/instances/{}", instance),
            Some(json!({ "devices": { device_name: device } })),
        )?;
        Ok(())
    }

    fn file_kind(&self, instance: &str, path: &str) -> Result<Option<FileKind>> {
        let output = Command::new(&self.binary)
            .args(["exec", instance, "--", "stat", "-c", "%F", path])
            .output()?;
        parse_stat(
            instance,
            path,
            output.status.success(),
            &String::from_utf8_lossy(&output.stdout),
            &String::from_utf8_lossy(&output.stderr),
        )
    }

    fn make_dir(&self, instance: &str, path: &str, ownership: &FileOwnership) -> Result<()> {
        let mode = format!("{:04o}", ownership.mode);
        let uid = ownership.uid.to_string();
        let gid = ownership.gid.to_string();
        self.lxc(&[
            "exec", instance, "--", "install", "-d", "-m", &mode, "-o", &uid, "-g", &gid, path,
        ])?;
        Ok(())
    }

    fn push_file(
        &self,
        instance: &str,
        path: &str,
        contents: &[u8],
        ownership: &FileOwnership,
    ) -> Result<()> {
        let mut staged = tempfile::NamedTempFile::new()?;
        staged.write_all(contents)?;
        staged.flush()?;

        let source = staged.path().to_string_lossy().to_string();
        let target = format!("{}{}", instance, path);
        let mode = format!("{:04o}", ownership.mode);
        let uid = ownership.uid.to_string();
        let gid = ownership.gid.to_string();
        self.lxc(&[
            "file", "push", "--uid", &uid, "--gid", &gid, "--mode", &mode, &source, &target,
        ])?;
        Ok(())
    }

    fn exec(&self, instance: &str, command: &[String]) -> Result<i32> {
        tracing::debug!(instance = %instance, ?command, "exec");
        let output = Command::new(&self.binary)
            .args(["exec", instance, "--"])
            .args(command)
            .output()?;
        if !output.status.success() {
            tracing::warn!(
                instance = %instance,
                stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                "command exited non-zero"
            );
        }
        Ok(output.status.code().unwrap_or(-1))
    }

    fn remote_host(&self) -> Result<Option<String>> {
        let default = self.lxc(&["remote", "get-default"])?;
        let remotes: BTreeMap<String, RawRemote> =
            serde_json::from_str(&self.lxc(&["remote", "list", "--format", "json"])?)?;
        Ok(remotes
            .get(default.trim())
            .and_then(|r| remote_addr_host(&r.addr)))
    }
}
