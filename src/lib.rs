//! lxdk
//!
//! Multi-node Kubernetes clusters on a single LXD host. Every cluster gets
//! a dedicated etcd instance, one controller, any number of workers and an
//! optional image registry, plus a private PKI with three authorities that
//! is bootstrapped through `cfssl`.
//!
//! # Lifecycle
//!
//! - **create** provisions network, storage pool, instances and the static PKI
//! - **start** boots the instances, issues address-bound certificates and
//!   brings the control plane and nodes up
//! - **stop** halts every instance and keeps all state
//! - **delete** destroys everything the cluster owns
//!
//! # Example
//!
//! ```no_run
//! use lxdk::{CreateOptions, Orchestrator, OrchestratorConfig, Settings};
//!
//! let settings = Settings::load(None)?;
//! let cache = settings.cache_dir(None)?;
//! let orch = Orchestrator::with_config(OrchestratorConfig::new(cache).settings(settings))?;
//!
//! let options = CreateOptions::builder().name("dev").num_workers(2).build();
//! orch.up(&options, false)?;
//! println!("{}", orch.kubectl_env("dev")?);
//!
//! orch.stop("dev")?;
//! # Ok::<(), lxdk::Error>(())
//! ```

pub mod config;
pub mod error;
pub mod inject;
pub mod kube;
pub mod lxd;
pub mod orchestrator;
pub mod pki;
pub mod poll;
pub mod provision;
pub mod record;
pub mod store;

#[cfg(test)]
mod testing;

pub use config::{CreateOptions, Settings};
pub use error::{Error, Result};
pub use orchestrator::{DeleteOptions, Orchestrator, OrchestratorConfig};
pub use record::{ClusterRecord, LifecycleState, Role};
