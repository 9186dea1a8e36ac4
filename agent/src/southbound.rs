/*
Copyright 2024 The Kubernetes Authors.

Licensed under the Apache License, Version 2.0 (the "License");
you may not use this file except in compliance with the License.
You may obtain a copy of the License at

    http://www.apache.org/licenses/LICENSE-2.0

Unless required by applicable law or agreed to in writing, software
distributed under the License is distributed on an "AS IS" BASIS,
WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
See the License for the specific language governing permissions and
limitations under the License.
*/

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use crate::consts::DEFAULT_ZONE;
use crate::{Error, Result};

/// Read access to the realized state in the southbound database the node is
/// currently connected to.
#[async_trait]
pub trait SouthboundDb: Send + Sync {
    /// Zone name stored in the database; the default zone when none is stored.
    async fn zone(&self) -> Result<String>;
    /// Whether the logical router static route flow towards `subnet` exists.
    async fn node_route_exists(&self, subnet: &str) -> Result<bool>;
    /// Names of all load balancers.
    async fn load_balancer_names(&self) -> Result<Vec<String>>;
    async fn port_binding_exists(&self, logical_port: &str) -> Result<bool>;
}

/// Points the local controller at the node's own zone database.
#[async_trait]
pub trait ControlPlaneTarget: Send + Sync {
    async fn retarget(&self) -> Result<()>;
}

const SBCTL_TIMEOUT: &str = "--timeout=15";

/// [`SouthboundDb`] backed by `ovn-sbctl`.
pub struct OvnSbctl {
    db: String,
}

impl OvnSbctl {
    pub fn new(db: impl Into<String>) -> Self {
        OvnSbctl { db: db.into() }
    }

    async fn run(&self, args: &[&str]) -> Result<(String, String)> {
        let mut command = Command::new("ovn-sbctl");
        command.arg(SBCTL_TIMEOUT);
        if !self.db.is_empty() {
            command.arg(format!("--db={}", self.db));
        }
        let output = command
            .args(args)
            .output()
            .await
            .map_err(|e| Error::SouthboundError(format!("failed to run ovn-sbctl: {e}")))?;
        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        debug!(?args, %stdout, %stderr, "ovn-sbctl");
        if !output.status.success() {
            return Err(Error::SouthboundError(format!(
                "ovn-sbctl {} failed: {stderr}",
                args.join(" ")
            )));
        }
        Ok((stdout, stderr))
    }

    async fn find_exists(&self, table: &str, condition: &str) -> Result<bool> {
        let (stdout, stderr) = self
            .run(&["--bare", "--columns", "_uuid", "find", table, condition])
            .await?;
        Ok(stderr.is_empty() && !stdout.is_empty())
    }
}

#[async_trait]
impl SouthboundDb for OvnSbctl {
    async fn zone(&self) -> Result<String> {
        match self.run(&["get", "SB_Global", ".", "options:name"]).await {
            Ok((stdout, _)) => Ok(stdout.trim_matches('"').to_string()),
            Err(Error::SouthboundError(msg)) if msg.contains("no key \"name\" in SB_Global record") => {
                Ok(DEFAULT_ZONE.to_string())
            }
            Err(err) => Err(err),
        }
    }

    async fn node_route_exists(&self, subnet: &str) -> Result<bool> {
        let family = if crate::annotations::is_ipv6_cidr(subnet) {
            "ip6"
        } else {
            "ip4"
        };
        let condition = format!("match=\"reg7 == 0 && {family}.dst == {subnet}\"");
        self.find_exists("logical_flow", &condition).await
    }

    async fn load_balancer_names(&self) -> Result<Vec<String>> {
        let (stdout, _) = self
            .run(&["--bare", "--columns", "name", "find", "Load_Balancer"])
            .await?;
        Ok(stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    async fn port_binding_exists(&self, logical_port: &str) -> Result<bool> {
        self.find_exists("Port_Binding", &format!("logical_port={logical_port}"))
            .await
    }
}

/// [`ControlPlaneTarget`] that rewrites `external_ids:ovn-remote` through `ovs-vsctl`.
pub struct OvsRemoteTarget {
    remote: String,
}

impl OvsRemoteTarget {
    pub fn new(remote: impl Into<String>) -> Self {
        OvsRemoteTarget {
            remote: remote.into(),
        }
    }
}

#[async_trait]
impl ControlPlaneTarget for OvsRemoteTarget {
    async fn retarget(&self) -> Result<()> {
        if self.remote.is_empty() {
            return Err(Error::InvalidConfigError(
                "southbound remote is not configured".to_string(),
            ));
        }
        let output = Command::new("ovs-vsctl")
            .args([
                "--timeout=15",
                "set",
                "Open_vSwitch",
                ".",
                &format!("external_ids:ovn-remote=\"{}\"", self.remote),
            ])
            .output()
            .await
            .map_err(|e| Error::SouthboundError(format!("failed to run ovs-vsctl: {e}")))?;
        if !output.status.success() {
            return Err(Error::SouthboundError(format!(
                "failed to set ovn-remote: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        info!(remote = %self.remote, "control plane connection retargeted");
        Ok(())
    }
}
