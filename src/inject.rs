//! File injection and remote command sequences

use std::path::{Component, Path};
use crate::lxd::{FileKind, FileOwnership, InstanceService};
use crate::{Error, Result};

/// Source of an upload
#[derive(Debug, Clone, Copy)]
pub enum Upload<'a> {
    /// In-memory contents; the destination is the full file path
    Bytes(&'a [u8]),
    /// A local file; the destination is a directory and the base name is kept
    File(&'a Path),
}

/// Pushes files and runs commands inside one instance at a time.
///
/// `defaults` applies to created directories and in-memory uploads; file
/// uploads carry the source's own owner and mode.
pub struct Injector<'a> {
    service: &'a dyn InstanceService,
    defaults: FileOwnership,
}

impl<'a> Injector<'a> {
    pub fn new(service: &'a dyn InstanceService, defaults: FileOwnership) -> Self {
        Self { service, defaults }
    }

    /// Upload `source` and return the path written inside the instance
    pub fn upload(&self, instance: &str, source: Upload<'_>, destination: &str) -> Result<String> {
        match source {
            Upload::Bytes(contents) => {
                let parent = parent_dir(destination);
                self.ensure_dir(instance, &parent)?;
                self.service
                    .push_file(instance, destination, contents, &self.defaults)?;
                tracing::debug!(instance = %instance, path = %destination, "Uploaded contents");
                Ok(destination.to_string())
            }
            Upload::File(path) => {
                let file_name = path
                    .file_name()
                    .ok_or_else(|| Error::Config(format!("{} has no file name", path.display())))?
                    .to_string_lossy()
                    .to_string();
                let contents = std::fs::read(path)?;
                let ownership = ownership_of(path).unwrap_or(self.defaults);
                let target = join(destination, &file_name);

                self.ensure_dir(instance, destination)?;
                self.service.push_file(instance, &target, &contents, &ownership)?;
                tracing::debug!(instance = %instance, path = %target, "Uploaded file");
                Ok(target)
            }
        }
    }

    /// Upload several local files into one directory
    pub fn upload_files(&self, instance: &str, files: &[&Path], directory: &str) -> Result<()> {
        for file in files {
            self.upload(instance, Upload::File(file), directory)?;
        }
        Ok(())
    }

    /// Create `dir` and its parents, checking each level top-down
    pub fn ensure_dir(&self, instance: &str, dir: &str) -> Result<()> {
        let mut current = String::new();
        for component in Path::new(dir).components() {
            let Component::Normal(part) = component else {
                continue;
            };
            current.push('/');
            current.push_str(&part.to_string_lossy());

            match self.service.file_kind(instance, &current)? {
                Some(FileKind::Directory) => {}
                Some(_) => {
                    return Err(Error::PathConflict {
                        instance: instance.to_string(),
                        path: current,
                    })
                }
                None => self.service.make_dir(instance, &current, &self.defaults)?,
            }
        }
        Ok(())
    }

    /// Run each command to completion, stopping at the first non-zero exit
    pub fn run_commands(&self, instance: &str, commands: &[String]) -> Result<()> {
        for command in commands {
            let argv: Vec<String> = command.split_whitespace().map(str::to_string).collect();
            if argv.is_empty() {
                continue;
            }
            tracing::debug!(instance = %instance, command = %command, "Running");
            let code = self.service.exec(instance, &argv)?;
            if code != 0 {
                return Err(Error::CommandFailure {
                    instance: instance.to_string(),
                    command: command.clone(),
                    code,
                });
            }
        }
        Ok(())
    }
}

/// Owner and permission bits of a local file
fn ownership_of(path: &Path) -> Option<FileOwnership> {
    use std::os::unix::fs::MetadataExt;

    let meta = std::fs::metadata(path).ok()?;
    Some(FileOwnership {
        uid: meta.uid(),
        gid: meta.gid(),
        mode: meta.mode() & 0o777,
    })
}

fn parent_dir(path: &str) -> String {
    match path.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(idx) => path[..idx].to_string(),
    }
}

fn join(dir: &str, file: &str) -> String {
    format!("{}/{}", dir.trim_end_matches('/'), file)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeInstances;
    use tempfile::TempDir;

    fn injector(service: &FakeInstances) -> Injector<'_> {
        Injector::new(service, FileOwnership::default())
    }

    #[test]
    fn test_bytes_upload_targets_full_path() {
        let fake = FakeInstances::default();
        fake.add_running("node");

        let written = injector(&fake)
            .upload("node", Upload::Bytes(b"ETCD_IP=10.0.0.2\n"), "/etc/lxdk/env")
            .unwrap();

        assert_eq!(written, "/etc/lxdk/env");
        assert_eq!(fake.file("node", "/etc/lxdk/env").unwrap(), b"ETCD_IP=10.0.0.2\n");
        assert!(fake.is_dir("node", "/etc"));
        assert!(fake.is_dir("node", "/etc/lxdk"));
    }

    #[test]
    fn test_file_upload_keeps_base_name_and_mode() {
        use std::os::unix::fs::PermissionsExt;

        let temp = TempDir::new().unwrap();
        let source = temp.path().join("admin-key.pem");
        std::fs::write(&source, "key").unwrap();
        std::fs::set_permissions(&source, std::fs::Permissions::from_mode(0o600)).unwrap();

        let fake = FakeInstances::default();
        fake.add_running("node");
        let written = injector(&fake)
            .upload("node", Upload::File(&source), "/etc/kubernetes/")
            .unwrap();

        assert_eq!(written, "/etc/kubernetes/admin-key.pem");
        assert_eq!(fake.file("node", "/etc/kubernetes/admin-key.pem").unwrap(), b"key");
        assert_eq!(fake.ownership("node", "/etc/kubernetes/admin-key.pem").unwrap().mode, 0o600);
    }

    #[test]
    fn test_non_directory_component_conflicts() {
        let fake = FakeInstances::default();
        fake.add_running("node");
        fake.put_file("node", "/etc/kubernetes", b"oops");

        let err = injector(&fake)
            .upload("node", Upload::Bytes(b"x"), "/etc/kubernetes/config/kubelet.yaml")
            .unwrap_err();

        match err {
            Error::PathConflict { instance, path } => {
                assert_eq!(instance, "node");
                assert_eq!(path, "/etc/kubernetes");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(!fake.is_dir("node", "/etc/kubernetes/config"));
    }

    #[test]
    fn test_commands_stop_at_first_failure() {
        let fake = FakeInstances::default();
        fake.add_running("node");
        fake.fail_command("systemctl start etcd", 3);

        let commands = vec![
            "systemctl daemon-reload".to_string(),
            "systemctl start etcd".to_string(),
            "systemctl enable etcd".to_string(),
        ];
        let err = injector(&fake).run_commands("node", &commands).unwrap_err();

        assert!(matches!(err, Error::CommandFailure { code: 3, .. }));
        assert_eq!(
            fake.executed("node"),
            vec!["systemctl daemon-reload".to_string(), "systemctl start etcd".to_string()]
        );
    }

    #[test]
    fn test_parent_dir() {
        assert_eq!(parent_dir("/etc/lxdk/env"), "/etc/lxdk");
        assert_eq!(parent_dir("/env"), "/");
        assert_eq!(join("/etc/kubernetes/", "ca.pem"), "/etc/kubernetes/ca.pem");
    }
}
