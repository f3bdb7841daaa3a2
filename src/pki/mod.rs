//! Certificate authority hierarchy and leaf issuance
//!
//! Three authorities back a cluster:
//!
//! - `ca` signs the API server, kubelet and client identities
//! - `ca-aggregation` signs the front-proxy client
//! - `ca-etcd` signs the datastore certificate
//!
//! Signing itself is delegated to a [`Signer`]; the [`Issuer`] owns the
//! request documents and the on-disk artifacts (`<file>.pem`,
//! `<file>-key.pem`, `<file>.csr`).

mod cfssl;
pub mod verify;

use std::path::{Path, PathBuf};
use serde::{Deserialize, Serialize};
use serde_json::json;
use crate::{Error, Result};

pub use cfssl::{parse_response, CfsslSigner, SignParams, SignedArtifacts, Signer};

/// Name of the signing profile every leaf is issued under
pub const PROFILE: &str = "kubernetes";

/// File name of the signing-profile document
pub const SIGNING_CONFIG: &str = "ca-config.json";

/// Validity of every leaf certificate
pub const LEAF_EXPIRY: &str = "8760h";

/// The three authorities of a cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AuthorityKind {
    Cluster,
    Aggregation,
    Etcd,
}

impl AuthorityKind {
    pub const ALL: [AuthorityKind; 3] = [
        AuthorityKind::Cluster,
        AuthorityKind::Aggregation,
        AuthorityKind::Etcd,
    ];

    /// Base file name of the authority's artifacts
    pub fn file_name(self) -> &'static str {
        match self {
            AuthorityKind::Cluster => "ca",
            AuthorityKind::Aggregation => "ca-aggregation",
            AuthorityKind::Etcd => "ca-etcd",
        }
    }

    pub fn common_name(self) -> &'static str {
        match self {
            AuthorityKind::Cluster => "Kubernetes",
            AuthorityKind::Aggregation => "Kubernetes Front Proxy CA",
            AuthorityKind::Etcd => "etcd",
        }
    }
}

/// A self-signed authority on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Authority {
    pub name: String,
    pub common_name: String,
    pub cert: PathBuf,
    pub key: PathBuf,
}

/// A signed leaf on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeafCertificate {
    pub name: String,
    pub cert: PathBuf,
    pub key: PathBuf,
}

/// Everything needed to issue one leaf certificate
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LeafRequest {
    /// Logical name, used for logging and as the default file name
    pub name: String,
    /// On-disk base name when the logical name is not filesystem safe
    pub file_name: Option<String>,
    pub common_name: String,
    pub organization: Option<String>,
    /// Subject alternative names (addresses and DNS names)
    pub hostnames: Vec<String>,
    /// Signing request sent verbatim instead of the generated default
    pub request_override: Option<Vec<u8>>,
}

impl LeafRequest {
    pub fn new(name: impl Into<String>, common_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            common_name: common_name.into(),
            ..Default::default()
        }
    }

    pub fn file_name(mut self, file_name: impl Into<String>) -> Self {
        self.file_name = Some(file_name.into());
        self
    }

    pub fn organization(mut self, organization: impl Into<String>) -> Self {
        self.organization = Some(organization.into());
        self
    }

    pub fn hostname(mut self, host: impl Into<String>) -> Self {
        self.hostnames.push(host.into());
        self
    }

    pub fn request_override(mut self, request: Vec<u8>) -> Self {
        self.request_override = Some(request);
        self
    }

    /// Base name the artifacts are written under
    pub fn output_name(&self) -> &str {
        self.file_name.as_deref().unwrap_or(&self.name)
    }

    /// Signing request document sent to the signer
    pub fn request(&self) -> Result<Vec<u8>> {
        if let Some(request) = &self.request_override {
            return Ok(request.clone());
        }
        let organization = self.organization.as_deref().unwrap_or(&self.name);
        Ok(serde_json::to_vec_pretty(&identity_document(
            &self.common_name,
            organization,
            "lxdk",
        ))?)
    }
}

fn identity_document(common_name: &str, organization: &str, unit: &str) -> serde_json::Value {
    json!({
        "CN": common_name,
        "key": { "algo": "rsa", "size": 2048 },
        "names": [{
            "C": "DE",
            "L": "Berlin",
            "O": organization,
            "OU": unit,
            "ST": "Berlin",
        }],
    })
}

/// Generation request for a self-signed authority
pub fn authority_request(common_name: &str) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec_pretty(&identity_document(
        common_name,
        common_name,
        "CA",
    ))?)
}

/// Signing-profile document shared by every leaf
pub fn signing_profile() -> serde_json::Value {
    json!({
        "signing": {
            "default": { "expiry": LEAF_EXPIRY },
            "profiles": {
                PROFILE: {
                    "usages": ["signing", "key encipherment", "server auth", "client auth"],
                    "expiry": LEAF_EXPIRY,
                },
            },
        },
    })
}

/// Issues authorities and leaves into one certificate directory
pub struct Issuer<'a> {
    signer: &'a dyn Signer,
    dir: PathBuf,
}

impl<'a> Issuer<'a> {
    pub fn new(signer: &'a dyn Signer, dir: impl Into<PathBuf>) -> Self {
        Self {
            signer,
            dir: dir.into(),
        }
    }

    /// Path of the signing-profile document
    pub fn signing_profile_path(&self) -> PathBuf {
        self.dir.join(SIGNING_CONFIG)
    }

    /// Write the signing-profile document, returning its path
    pub fn write_signing_profile(&self) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.signing_profile_path();
        std::fs::write(&path, serde_json::to_vec_pretty(&signing_profile())?)?;
        Ok(path)
    }

    /// Paths of an existing authority
    pub fn authority(&self, kind: AuthorityKind) -> Authority {
        Authority {
            name: kind.file_name().to_string(),
            common_name: kind.common_name().to_string(),
            cert: self.cert_path(kind.file_name()),
            key: self.key_path(kind.file_name()),
        }
    }

    /// Generate a self-signed authority. Overwrites existing key material.
    pub fn create_authority(&self, name: &str, common_name: &str) -> Result<Authority> {
        std::fs::create_dir_all(&self.dir)?;
        let request = authority_request(common_name)?;
        let output = self.signer.init_authority(name, &request)?;
        let artifacts = parse_response(name, &output).map_err(|e| Error::Signing {
            name: name.to_string(),
            reason: format!("no parsable certificate in output: {}", e),
        })?;
        let (cert, key) = self.write_artifacts(name, &artifacts)?;

        tracing::info!(authority = %name, dir = %self.dir.display(), "Authority created");
        Ok(Authority {
            name: name.to_string(),
            common_name: common_name.to_string(),
            cert,
            key,
        })
    }

    /// Sign a leaf with `authority` under `profile`
    pub fn issue_leaf(
        &self,
        request: &LeafRequest,
        authority: &Authority,
        profile: &Path,
    ) -> Result<LeafCertificate> {
        let document = request.request()?;
        let params = SignParams {
            ca_cert: &authority.cert,
            ca_key: &authority.key,
            config: profile,
            profile: PROFILE,
            hostnames: &request.hostnames,
        };
        let output = self.signer.sign(&request.name, &document, &params)?;
        let artifacts = parse_response(&request.name, &output)?;
        let (cert, key) = self.write_artifacts(request.output_name(), &artifacts)?;

        tracing::info!(
            leaf = %request.name,
            authority = %authority.name,
            hostnames = ?request.hostnames,
            "Certificate issued"
        );
        Ok(LeafCertificate {
            name: request.name.clone(),
            cert,
            key,
        })
    }

    /// Whether `<file>.pem` and `<file>-key.pem` are both present
    pub fn has(&self, file: &str) -> bool {
        self.cert_path(file).is_file() && self.key_path(file).is_file()
    }

    pub fn cert_path(&self, file: &str) -> PathBuf {
        self.dir.join(format!("{}.pem", file))
    }

    pub fn key_path(&self, file: &str) -> PathBuf {
        self.dir.join(format!("{}-key.pem", file))
    }

    fn write_artifacts(&self, file: &str, artifacts: &SignedArtifacts) -> Result<(PathBuf, PathBuf)> {
        use std::os::unix::fs::PermissionsExt;

        let cert = self.cert_path(file);
        let key = self.key_path(file);
        std::fs::write(&cert, &artifacts.cert)?;
        std::fs::write(&key, &artifacts.key)?;
        std::fs::set_permissions(&key, std::fs::Permissions::from_mode(0o600))?;
        if let Some(csr) = &artifacts.csr {
            std::fs::write(self.dir.join(format!("{}.csr", file)), csr)?;
        }
        Ok((cert, key))
    }
}

impl std::fmt::Debug for Issuer<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Issuer").field("dir", &self.dir).finish()
    }
}

/// Check a leaf file exists for every name, reporting the first missing one
pub fn require_all(dir: &Path, files: &[&str]) -> Result<()> {
    for file in files {
        let path = dir.join(format!("{}.pem", file));
        if !path.is_file() {
            return Err(Error::Certificate {
                path: path.display().to_string(),
                reason: "missing".into(),
            });
        }
    }
    Ok(())
}
