//! Global settings, create options and on-disk cluster layout

use std::path::{Path, PathBuf};
use serde::{Deserialize, Serialize};
use crate::poll::PollPolicy;
use crate::{Error, Result};

/// Prefix marking networks, pools and instances owned by lxdk
pub const MANAGED_PREFIX: &str = "lxdk-";

/// Linux caps interface names at 15 bytes
const MAX_BRIDGE_NAME: usize = 15;

/// Longest hostname label LXD accepts for an instance
const MAX_INSTANCE_NAME: usize = 63;

/// Global defaults read from `config.toml`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub cache_dir: Option<PathBuf>,
    pub controller_limits_cpu: Option<String>,
    pub controller_limits_memory: Option<String>,
    pub worker_limits_cpu: Option<String>,
    pub worker_limits_memory: Option<String>,
    pub root_fs_size: Option<String>,
    pub storage_driver: String,
    pub enable_insecure_registry: bool,
    pub image_prefix: String,
    pub lxc_path: String,
    pub cfssl_path: String,
    pub kubectl_path: String,
    pub address_poll: PollPolicy,
    pub api_poll: PollPolicy,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            cache_dir: None,
            controller_limits_cpu: None,
            controller_limits_memory: None,
            worker_limits_cpu: None,
            worker_limits_memory: None,
            root_fs_size: None,
            storage_driver: "dir".into(),
            enable_insecure_registry: true,
            image_prefix: "kubedee-".into(),
            lxc_path: "lxc".into(),
            cfssl_path: "cfssl".into(),
            kubectl_path: "kubectl".into(),
            address_poll: PollPolicy::ADDRESS,
            api_poll: PollPolicy::API,
        }
    }
}

impl Settings {
    /// Load settings from `path`, or the default location when none is given.
    /// A missing file yields defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => match Self::default_path() {
                Some(p) => p,
                None => return Ok(Self::default()),
            },
        };

        if !path.exists() {
            return Ok(Self::default());
        }

        let contents = std::fs::read_to_string(&path)?;
        let settings: Settings = toml::from_str(&contents)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        settings.validate()?;
        Ok(settings)
    }

    /// `$HOME/.config/lxdk/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".config/lxdk/config.toml"))
    }

    pub fn validate(&self) -> Result<()> {
        if self.storage_driver.is_empty() {
            return Err(Error::Config("storage_driver cannot be empty".into()));
        }
        if self.address_poll.max_attempts == 0 || self.api_poll.max_attempts == 0 {
            return Err(Error::Config("poll max_attempts must be at least 1".into()));
        }
        Ok(())
    }

    /// Resolve the cache root: explicit override, then config, then `~/.cache/lxdk`
    pub fn cache_dir(&self, cli_override: Option<PathBuf>) -> Result<PathBuf> {
        if let Some(dir) = cli_override.or_else(|| self.cache_dir.clone()) {
            return Ok(dir);
        }
        std::env::var_os("HOME")
            .map(|home| PathBuf::from(home).join(".cache/lxdk"))
            .ok_or_else(|| Error::Config("no cache directory configured and HOME is unset".into()))
    }
}

/// Parameters for `create`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateOptions {
    pub name: String,
    pub num_workers: usize,
    /// Storage driver for a cluster-owned pool
    pub storage_driver: Option<String>,
    /// Reuse an existing pool instead of creating one
    pub storage_pool: Option<String>,
    /// Reuse an existing network instead of creating one
    pub network: Option<String>,
    pub registry: bool,
}

impl Default for CreateOptions {
    fn default() -> Self {
        Self {
            name: String::new(),
            num_workers: 1,
            storage_driver: None,
            storage_pool: None,
            network: None,
            registry: true,
        }
    }
}

impl CreateOptions {
    pub fn builder() -> CreateOptionsBuilder {
        CreateOptionsBuilder::default()
    }

    /// Name of the network the cluster will use
    pub fn network_name(&self) -> String {
        self.network
            .clone()
            .unwrap_or_else(|| format!("{}{}", MANAGED_PREFIX, self.name))
    }

    /// Name of the storage pool the cluster will use
    pub fn pool_name(&self) -> String {
        self.storage_pool
            .clone()
            .unwrap_or_else(|| format!("{}{}", MANAGED_PREFIX, self.name))
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::Config("name cannot be empty".into()));
        }
        let valid = self
            .name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
        if !valid || self.name.starts_with('-') || self.name.ends_with('-') {
            return Err(Error::Config(format!(
                "name {:?} must contain only lowercase letters, digits and inner dashes",
                self.name
            )));
        }
        if self.network.is_none() && self.network_name().len() > MAX_BRIDGE_NAME {
            return Err(Error::Config(format!(
                "name {:?} is too long for a bridge name ({} > {} bytes), pick a shorter name or pass an existing network",
                self.name,
                self.network_name().len(),
                MAX_BRIDGE_NAME
            )));
        }
        let longest = format!("{}{}-controller-xxxxx", MANAGED_PREFIX, self.name);
        if longest.len() > MAX_INSTANCE_NAME {
            return Err(Error::Config(format!(
                "name {:?} is too long for instance names",
                self.name
            )));
        }
        if self.num_workers < 1 {
            return Err(Error::Config("num_workers must be at least 1".into()));
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct CreateOptionsBuilder {
    options: CreateOptions,
}

impl CreateOptionsBuilder {
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.options.name = name.into();
        self
    }

    pub fn num_workers(mut self, count: usize) -> Self {
        self.options.num_workers = count;
        self
    }

    pub fn storage_driver(mut self, driver: impl Into<String>) -> Self {
        self.options.storage_driver = Some(driver.into());
        self
    }

    pub fn storage_pool(mut self, pool: impl Into<String>) -> Self {
        self.options.storage_pool = Some(pool.into());
        self
    }

    pub fn network(mut self, network: impl Into<String>) -> Self {
        self.options.network = Some(network.into());
        self
    }

    pub fn registry(mut self, enabled: bool) -> Self {
        self.options.registry = enabled;
        self
    }

    pub fn build(self) -> CreateOptions {
        self.options
    }

    pub fn build_validated(self) -> Result<CreateOptions> {
        let options = self.build();
        options.validate()?;
        Ok(options)
    }
}

/// Paths of one cluster's directory under the cache root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterLayout {
    root: PathBuf,
}

impl ClusterLayout {
    pub fn new(cache_dir: &Path, name: &str) -> Self {
        Self {
            root: cache_dir.join(name),
        }
    }

    pub fn state_file(&self) -> PathBuf {
        self.root.join("state.toml")
    }

    pub fn certificates(&self) -> PathBuf {
        self.root.join("certificates")
    }

    pub fn kubeconfigs(&self) -> PathBuf {
        self.root.join("kubeconfigs")
    }

    /// `<certificates>/<file>.pem`
    pub fn cert(&self, file: &str) -> PathBuf {
        self.certificates().join(format!("{}.pem", file))
    }

    /// `<certificates>/<file>-key.pem`
    pub fn key(&self, file: &str) -> PathBuf {
        self.certificates().join(format!("{}-key.pem", file))
    }

    /// `<kubeconfigs>/<file>.kubeconfig`
    pub fn kubeconfig(&self, file: &str) -> PathBuf {
        self.kubeconfigs().join(format!("{}.kubeconfig", file))
    }

    /// Create the certificate and kubeconfig directories
    pub fn ensure(&self) -> Result<()> {
        std::fs::create_dir_all(self.certificates())?;
        std::fs::create_dir_all(self.kubeconfigs())?;
        Ok(())
    }
}

/// Whether a network or pool name marks an lxdk-owned resource
pub fn is_managed(name: &str) -> bool {
    name.starts_with(MANAGED_PREFIX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_options_builder() {
        let options = CreateOptions::builder()
            .name("test")
            .num_workers(3)
            .storage_driver("btrfs")
            .build();

        assert_eq!(options.name, "test");
        assert_eq!(options.num_workers, 3);
        assert_eq!(options.storage_driver.as_deref(), Some("btrfs"));
        assert_eq!(options.network_name(), "lxdk-test");
        assert_eq!(options.pool_name(), "lxdk-test");
        assert!(options.registry);
    }

    #[test]
    fn test_options_validation() {
        assert!(CreateOptions::builder().build().validate().is_err());
        assert!(CreateOptions::builder().name("Test").build().validate().is_err());
        assert!(CreateOptions::builder().name("-x").build().validate().is_err());
        assert!(CreateOptions::builder().name("test").num_workers(0).build().validate().is_err());

        // lxdk-averylongname exceeds the bridge limit unless a network is supplied
        assert!(CreateOptions::builder().name("averylongname").build().validate().is_err());
        assert!(CreateOptions::builder()
            .name("averylongname")
            .network("lxdbr0")
            .build_validated()
            .is_ok());

        assert!(CreateOptions::builder().name("test").build_validated().is_ok());
    }

    #[test]
    fn test_external_resources_keep_their_names() {
        let options = CreateOptions::builder()
            .name("test")
            .network("lxdbr0")
            .storage_pool("default")
            .build();
        assert_eq!(options.network_name(), "lxdbr0");
        assert_eq!(options.pool_name(), "default");
        assert!(!is_managed(&options.network_name()));
        assert!(!is_managed(&options.pool_name()));
        assert!(is_managed("lxdk-test"));
    }

    #[test]
    fn test_settings_missing_file_defaults() {
        let temp = TempDir::new().unwrap();
        let settings = Settings::load(Some(&temp.path().join("absent.toml"))).unwrap();
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.address_poll.max_attempts, 50);
        assert_eq!(settings.api_poll.max_attempts, 50);
    }

    #[test]
    fn test_settings_partial_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
storage_driver = "btrfs"
worker_limits_memory = "2GB"
enable_insecure_registry = false

[address_poll]
max_attempts = 10
interval_ms = 500
"#,
        )
        .unwrap();

        let settings = Settings::load(Some(&path)).unwrap();
        assert_eq!(settings.storage_driver, "btrfs");
        assert_eq!(settings.worker_limits_memory.as_deref(), Some("2GB"));
        assert!(!settings.enable_insecure_registry);
        assert_eq!(settings.address_poll.max_attempts, 10);
        assert_eq!(settings.api_poll, PollPolicy::API);
        assert_eq!(settings.image_prefix, "kubedee-");
    }

    #[test]
    fn test_settings_invalid_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.toml");
        std::fs::write(&path, "storage_driver = [").unwrap();
        assert!(matches!(Settings::load(Some(&path)), Err(Error::Config(_))));
    }

    #[test]
    fn test_cache_dir_precedence() {
        let settings = Settings {
            cache_dir: Some(PathBuf::from("/from/config")),
            ..Default::default()
        };
        assert_eq!(
            settings.cache_dir(Some(PathBuf::from("/from/cli"))).unwrap(),
            PathBuf::from("/from/cli")
        );
        assert_eq!(settings.cache_dir(None).unwrap(), PathBuf::from("/from/config"));
    }

    #[test]
    fn test_layout_paths() {
        let layout = ClusterLayout::new(Path::new("/cache"), "test");
        assert_eq!(layout.state_file(), PathBuf::from("/cache/test/state.toml"));
        assert_eq!(layout.cert("ca-etcd"), PathBuf::from("/cache/test/certificates/ca-etcd.pem"));
        assert_eq!(layout.key("admin"), PathBuf::from("/cache/test/certificates/admin-key.pem"));
        assert_eq!(
            layout.kubeconfig("admin"),
            PathBuf::from("/cache/test/kubeconfigs/admin.kubeconfig")
        );
    }
}
