/*
Copyright 2023 The Kubernetes Authors.

SPDX-License-Identifier: (GPL-2.0-only OR BSD-2-Clause)
*/

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::conntrack::parse_proc_entry;
use crate::{ConntrackEntry, ConntrackFilter, ConntrackPort, Error, HardwareAddr, Result};

const PROC_CONNTRACK: &str = "/proc/net/nf_conntrack";
const CONNTRACK_BIN: &str = "conntrack";
// discard port, only used to make the kernel resolve the neighbour
const PROBE_PORT: u16 = 9;
const PROBE_SETTLE: Duration = Duration::from_millis(200);

/// [`ConntrackPort`] backed by the running kernel: rtnetlink for neighbours and
/// links, procfs for listing flows and the `conntrack` tool for deleting them.
pub struct SystemConntrack {
    proc_path: PathBuf,
    conntrack_bin: String,
}

impl Default for SystemConntrack {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemConntrack {
    pub fn new() -> Self {
        SystemConntrack {
            proc_path: PathBuf::from(PROC_CONNTRACK),
            conntrack_bin: CONNTRACK_BIN.to_string(),
        }
    }

    async fn list(&self) -> Result<Vec<ConntrackEntry>> {
        let content = tokio::fs::read_to_string(&self.proc_path).await?;
        let mut entries = vec![];
        for line in content.lines().filter(|l| !l.trim().is_empty()) {
            match parse_proc_entry(line) {
                Ok(Some(entry)) => entries.push(entry),
                Ok(None) => {}
                Err(err) => debug!("skipping conntrack line: {err}"),
            }
        }
        Ok(entries)
    }

    async fn delete_entry(&self, entry: &ConntrackEntry) -> Result<()> {
        let args = [
            "-D".to_string(),
            "-p".to_string(),
            entry.protocol.to_string(),
            "--orig-src".to_string(),
            entry.orig.src.to_string(),
            "--orig-dst".to_string(),
            entry.orig.dst.to_string(),
            "--orig-port-src".to_string(),
            entry.orig.sport.to_string(),
            "--orig-port-dst".to_string(),
            entry.orig.dport.to_string(),
        ];
        let output = Command::new(&self.conntrack_bin).args(&args).output().await?;
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        // the entry may have expired between listing and deleting
        if output.status.success() || stderr.contains("0 flow entries have been deleted") {
            return Ok(());
        }
        Err(Error::Command {
            command: format!("{} {}", self.conntrack_bin, args.join(" ")),
            stderr: stderr.trim().to_string(),
        })
    }
}

#[async_trait]
impl ConntrackPort for SystemConntrack {
    async fn resolve_hardware_addr(&self, ip: Ipv4Addr) -> Result<Option<HardwareAddr>> {
        if let Some(addr) = lookup_neighbour(ip).await? {
            return Ok(Some(addr));
        }
        // Nothing cached yet: send a probe so the kernel issues an ARP request, then
        // look again.
        match tokio::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await {
            Ok(socket) => {
                if let Err(err) = socket.send_to(&[0], (ip, PROBE_PORT)).await {
                    debug!("neighbour probe to {ip} failed: {err}");
                }
            }
            Err(err) => warn!("unable to open probe socket: {err}"),
        }
        tokio::time::sleep(PROBE_SETTLE).await;
        lookup_neighbour(ip).await
    }

    async fn delete(&self, filter: &ConntrackFilter) -> Result<usize> {
        let matching: Vec<ConntrackEntry> = self
            .list()
            .await?
            .into_iter()
            .filter(|entry| filter.matches(entry))
            .collect();

        let mut deleted = 0;
        let mut failures = vec![];
        for entry in &matching {
            match self.delete_entry(entry).await {
                Ok(()) => deleted += 1,
                Err(err) => failures.push(err.to_string()),
            }
        }
        if !failures.is_empty() {
            return Err(Error::PartialDelete(
                failures.len(),
                matching.len(),
                failures.join("; "),
            ));
        }
        Ok(deleted)
    }

    async fn interfaces(&self) -> Result<Vec<String>> {
        #[cfg(target_os = "linux")]
        {
            tokio::task::spawn_blocking(crate::netlink::link_names)
                .await
                .map_err(|e| Error::Netlink(e.to_string()))?
        }
        #[cfg(not(target_os = "linux"))]
        {
            Err(Error::Unsupported("interface enumeration"))
        }
    }
}

async fn lookup_neighbour(ip: Ipv4Addr) -> Result<Option<HardwareAddr>> {
    #[cfg(target_os = "linux")]
    {
        tokio::task::spawn_blocking(move || crate::netlink::neighbour_hardware_addr(ip))
            .await
            .map_err(|e| Error::Netlink(e.to_string()))?
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = ip;
        Err(Error::Unsupported("neighbour lookup"))
    }
}
