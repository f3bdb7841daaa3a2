//! Error types for lxdk

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Cluster already exists: {0}")]
    AlreadyExists(String),

    #[error("Cluster not found: {0}")]
    NotFound(String),

    #[error("Invalid transition: cluster {name} is {current}, cannot {action}")]
    InvalidTransition {
        name: String,
        current: String,
        action: String,
    },

    #[error("Provisioning {resource} failed: {source}")]
    Provisioning {
        resource: String,
        #[source]
        source: Box<Error>,
    },

    #[error("Signing {name} failed: {reason}")]
    Signing { name: String, reason: String },

    #[error("Malformed signer response for {name}: {reason}")]
    MalformedResponse { name: String, reason: String },

    #[error("Timed out waiting for {what} after {attempts} attempts")]
    Timeout { what: String, attempts: u32 },

    #[error("Command `{command}` failed on {instance} with exit code {code}")]
    CommandFailure {
        instance: String,
        command: String,
        code: i32,
    },

    #[error("Path conflict on {instance}: {path} exists and is not a directory")]
    PathConflict { instance: String, path: String },

    #[error("Persistence error at {path}: {reason}")]
    Persistence { path: String, reason: String },

    #[error("Invalid certificate {path}: {reason}")]
    Certificate { path: String, reason: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Instance service error: {0}")]
    InstanceService(String),

    #[error("Cluster API error: {0}")]
    ClusterApi(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Cleanup incomplete: {}", .0.join("; "))]
    Cleanup(Vec<String>),

    #[error("{step}: {source}")]
    Step {
        step: String,
        #[source]
        source: Box<Error>,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Wrap an instance service failure for the named resource
    pub fn provisioning(resource: impl Into<String>, source: Error) -> Self {
        Error::Provisioning {
            resource: resource.into(),
            source: Box::new(source),
        }
    }

    /// Innermost error, skipping step context
    pub fn root(&self) -> &Error {
        match self {
            Error::Step { source, .. } => source.root(),
            other => other,
        }
    }

    /// Check if this is (or wraps) a timeout
    pub fn is_timeout(&self) -> bool {
        matches!(self.root(), Error::Timeout { .. })
    }
}

/// Attach pipeline step context to a result
pub trait ResultExt<T> {
    fn step(self, step: impl FnOnce() -> String) -> Result<T>;
}

impl<T> ResultExt<T> for Result<T> {
    fn step(self, step: impl FnOnce() -> String) -> Result<T> {
        self.map_err(|e| Error::Step {
            step: step(),
            source: Box::new(e),
        })
    }
}
