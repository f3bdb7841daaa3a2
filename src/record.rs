//! Persisted description of one cluster

use serde::{Deserialize, Serialize};
use crate::{Error, Result};

/// Lifecycle state of a cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    Uninitialized,
    Running,
    Stopped,
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LifecycleState::Uninitialized => write!(f, "uninitialized"),
            LifecycleState::Running => write!(f, "running"),
            LifecycleState::Stopped => write!(f, "stopped"),
        }
    }
}

impl LifecycleState {
    /// Check whether `start` may run from this state
    pub fn can_start(self) -> bool {
        self != LifecycleState::Running
    }

    /// Check whether `stop` may run from this state
    pub fn can_stop(self) -> bool {
        self != LifecycleState::Stopped
    }
}

/// Logical function of a provisioned instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Etcd,
    Controller,
    Worker,
    Registry,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Etcd => "etcd",
            Role::Controller => "controller",
            Role::Worker => "worker",
            Role::Registry => "registry",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The single source of truth for one cluster
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterRecord {
    pub name: String,
    pub network_id: String,
    pub storage_pool: String,
    pub storage_driver: String,
    pub instances: Vec<String>,
    pub etcd: String,
    pub controller: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registry: Option<String>,
    #[serde(default)]
    pub workers: Vec<String>,
    pub state: LifecycleState,
}

impl ClusterRecord {
    /// Role-tagged identifiers, in start order
    pub fn tagged(&self) -> Vec<(Role, &str)> {
        let mut tagged = vec![(Role::Etcd, self.etcd.as_str())];
        if let Some(registry) = &self.registry {
            tagged.push((Role::Registry, registry.as_str()));
        }
        tagged.push((Role::Controller, self.controller.as_str()));
        tagged.extend(self.workers.iter().map(|w| (Role::Worker, w.as_str())));
        tagged
    }

    /// Role of a listed instance
    pub fn role_of(&self, instance: &str) -> Option<Role> {
        self.tagged()
            .into_iter()
            .find(|(_, id)| *id == instance)
            .map(|(role, _)| role)
    }

    /// Record a new worker, keeping the instance list in sync
    pub fn add_worker(&mut self, instance: impl Into<String>) {
        let instance = instance.into();
        if !self.instances.contains(&instance) {
            self.instances.push(instance.clone());
        }
        self.workers.push(instance);
    }

    /// Check that every role tag appears in the instance list
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::Config("cluster record has an empty name".into()));
        }
        for (role, id) in self.tagged() {
            if !self.instances.iter().any(|i| i == id) {
                return Err(Error::Config(format!(
                    "cluster {}: {} instance {} missing from instance list",
                    self.name, role, id
                )));
            }
        }
        Ok(())
    }
}
