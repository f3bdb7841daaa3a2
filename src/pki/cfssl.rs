//! External signing authority (`cfssl`)

use std::io::Write;
use std::path::Path;
use std::process::{Command, Stdio};
use serde::Deserialize;
use crate::{Error, Result};

/// Authority and profile a leaf is signed under
#[derive(Debug, Clone, Copy)]
pub struct SignParams<'a> {
    pub ca_cert: &'a Path,
    pub ca_key: &'a Path,
    pub config: &'a Path,
    pub profile: &'a str,
    pub hostnames: &'a [String],
}

/// Certificate, key and CSR returned by the signer
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SignedArtifacts {
    pub cert: String,
    pub key: String,
    #[serde(default)]
    pub csr: Option<String>,
}

/// Produces signed material from a JSON signing request.
///
/// Implementations return the raw response; [`parse_response`] locates
/// the `{cert,key,csr}` document inside it.
pub trait Signer {
    fn init_authority(&self, name: &str, request: &[u8]) -> Result<String>;
    fn sign(&self, name: &str, request: &[u8], params: &SignParams<'_>) -> Result<String>;
}

/// Locate and parse the JSON document in a signer response
pub fn parse_response(name: &str, output: &str) -> Result<SignedArtifacts> {
    let start = output.find('{').ok_or_else(|| Error::MalformedResponse {
        name: name.to_string(),
        reason: "no JSON document in signer output".into(),
    })?;
    let artifacts: SignedArtifacts =
        serde_json::from_str(&output[start..]).map_err(|e| Error::MalformedResponse {
            name: name.to_string(),
            reason: e.to_string(),
        })?;
    if !artifacts.cert.contains("BEGIN CERTIFICATE") {
        return Err(Error::MalformedResponse {
            name: name.to_string(),
            reason: "response carries no PEM certificate".into(),
        });
    }
    Ok(artifacts)
}

/// Runs `cfssl gencert`, feeding the request on stdin
pub struct CfsslSigner {
    binary: String,
}

impl Default for CfsslSigner {
    fn default() -> Self {
        Self::new("cfssl")
    }
}

impl CfsslSigner {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    fn gencert(&self, name: &str, args: &[String], request: &[u8]) -> Result<String> {
        tracing::debug!(binary = %self.binary, ?args, "cfssl");
        let mut child = Command::new(&self.binary)
            .arg("gencert")
            .args(args)
            .arg("-")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::Signing {
                name: name.to_string(),
                reason: format!("could not run {}: {}", self.binary, e),
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(request)?;
        }
        let output = child.wait_with_output()?;

        if !output.status.success() {
            return Err(Error::Signing {
                name: name.to_string(),
                reason: format!(
                    "exit code {:?}: {}",
                    output.status.code(),
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

impl Signer for CfsslSigner {
    fn init_authority(&self, name: &str, request: &[u8]) -> Result<String> {
        self.gencert(name, &["-initca".to_string()], request)
    }

    fn sign(&self, name: &str, request: &[u8], params: &SignParams<'_>) -> Result<String> {
        let mut args = vec![
            format!("-ca={}", params.ca_cert.display()),
            format!("-ca-key={}", params.ca_key.display()),
            format!("-config={}", params.config.display()),
            format!("-profile={}", params.profile),
        ];
        if !params.hostnames.is_empty() {
            args.push(format!("-hostname={}", params.hostnames.join(",")));
        }
        self.gencert(name, &args, request)
    }
}
