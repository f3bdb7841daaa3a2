//! Bounded readiness polling

use std::net::Ipv4Addr;
use std::time::Duration;
use serde::{Deserialize, Serialize};
use crate::lxd::{InstanceService, NetworkState};
use crate::{Error, Result};

/// Attempt ceiling and fixed interval for a readiness loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollPolicy {
    pub max_attempts: u32,
    pub interval_ms: u64,
}

impl PollPolicy {
    /// Instance address assignment
    pub const ADDRESS: PollPolicy = PollPolicy {
        max_attempts: 50,
        interval_ms: 2_000,
    };

    /// Control plane API availability
    pub const API: PollPolicy = PollPolicy {
        max_attempts: 50,
        interval_ms: 3_000,
    };

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Run `probe` until it yields a value, at most `max_attempts` times.
    ///
    /// `Ok(None)` means "not ready yet"; an `Err` aborts the loop.
    pub fn run<T>(&self, what: &str, mut probe: impl FnMut(u32) -> Result<Option<T>>) -> Result<T> {
        for attempt in 1..=self.max_attempts {
            if let Some(value) = probe(attempt)? {
                return Ok(value);
            }
            tracing::debug!(what, attempt, max = self.max_attempts, "not ready yet");
            if attempt < self.max_attempts {
                std::thread::sleep(self.interval());
            }
        }
        Err(Error::Timeout {
            what: what.to_string(),
            attempts: self.max_attempts,
        })
    }
}

/// An instance address that has been observed on a live interface.
///
/// Only [`wait_for_address`] constructs these, so anything taking one
/// cannot run before the instance's network is up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResolvedAddress(Ipv4Addr);

impl ResolvedAddress {
    pub(crate) fn new(addr: Ipv4Addr) -> Self {
        Self(addr)
    }

    pub fn ip(&self) -> Ipv4Addr {
        self.0
    }
}

impl std::fmt::Display for ResolvedAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Interfaces that never carry the instance's routable address
const OVERLAY_INTERFACES: &[&str] = &["cni0", "flannel.1"];

/// Pick the first routable IPv4 address from an instance's network state
pub fn select_address(network: &NetworkState, excluded: &[String]) -> Option<Ipv4Addr> {
    network
        .interfaces
        .iter()
        .filter(|iface| iface.kind != "loopback")
        .filter(|iface| !OVERLAY_INTERFACES.contains(&iface.name.as_str()))
        .flat_map(|iface| iface.addresses.iter())
        .filter(|a| a.family == "inet")
        .filter(|a| a.scope != "link" && a.scope != "local")
        .filter(|a| !excluded.iter().any(|e| e == &a.address))
        .find_map(|a| a.address.parse::<Ipv4Addr>().ok())
}

/// Wait until `instance` reports a qualifying address
pub fn wait_for_address(
    service: &dyn InstanceService,
    instance: &str,
    excluded: &[String],
    policy: &PollPolicy,
) -> Result<ResolvedAddress> {
    let what = format!("address of {}", instance);
    let addr = policy.run(&what, |_| {
        let state = service.instance_state(instance)?;
        Ok(select_address(&state.network, excluded))
    })?;
    tracing::info!(instance = %instance, address = %addr, "Instance address resolved");
    Ok(ResolvedAddress::new(addr))
}
