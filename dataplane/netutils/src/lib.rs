/*
Copyright 2023 The Kubernetes Authors.

SPDX-License-Identifier: (GPL-2.0-only OR BSD-2-Clause)
*/

//! Host networking primitives used by the node agent: neighbour (ARP) lookups,
//! interface enumeration and connection-tracking cleanup.

pub mod conntrack;
#[cfg(target_os = "linux")]
pub mod netlink;
pub mod system;

use std::net::Ipv4Addr;

use async_trait::async_trait;
use thiserror::Error;

pub use conntrack::{
    AddressMatch, ConntrackEntry, ConntrackFilter, FlowTuple, HardwareAddr, Protocol,
};
pub use system::SystemConntrack;

#[derive(Error, Debug)]
pub enum Error {
    #[error("netlink error: {0}")]
    Netlink(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("command `{command}` failed: {stderr}")]
    Command { command: String, stderr: String },
    #[error("failed to parse conntrack entry `{0}`")]
    ParseEntry(String),
    #[error("invalid hardware address `{0}`")]
    InvalidHardwareAddr(String),
    #[error("{0} of {1} conntrack deletions failed: {2}")]
    PartialDelete(usize, usize, String),
    #[error("operation not supported on this platform: {0}")]
    Unsupported(&'static str),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Operating system access needed to keep connection tracking consistent with the
/// cluster view of gateways and endpoints.
#[async_trait]
pub trait ConntrackPort: Send + Sync {
    /// Resolves the link-layer address currently associated with `ip`. `Ok(None)`
    /// means the neighbour could not be resolved.
    async fn resolve_hardware_addr(&self, ip: Ipv4Addr) -> Result<Option<HardwareAddr>>;

    /// Deletes every entry matching `filter` and returns how many were removed.
    /// Deleting entries that no longer exist is not an error.
    async fn delete(&self, filter: &ConntrackFilter) -> Result<usize>;

    /// Names of the network interfaces present on the host.
    async fn interfaces(&self) -> Result<Vec<String>>;
}
