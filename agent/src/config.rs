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

use std::time::Duration;

use clap::{Parser, ValueEnum};

use crate::consts::*;
use crate::{Error, Result};

/// How the node participates in the dataplane.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum NodeMode {
    /// Regular node running the full agent.
    Full,
    /// Accelerator card running the dataplane on behalf of a host.
    Dpu,
    /// Host whose dataplane is offloaded to a DPU; it has no southbound database.
    DpuHost,
}

/// Poll intervals, timeouts and periods used by the coordination loops.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Timings {
    pub zone_poll_interval: Duration,
    pub zone_timeout: Duration,
    pub barrier_poll_interval: Duration,
    pub barrier_timeout: Duration,
    pub conntrack_sweep_interval: Duration,
    pub heartbeat_interval: Duration,
    pub lease_duration_seconds: i32,
}

impl Default for Timings {
    fn default() -> Self {
        Timings {
            zone_poll_interval: DEFAULT_ZONE_POLL_INTERVAL,
            zone_timeout: DEFAULT_ZONE_TIMEOUT,
            barrier_poll_interval: DEFAULT_BARRIER_POLL_INTERVAL,
            barrier_timeout: DEFAULT_BARRIER_TIMEOUT,
            conntrack_sweep_interval: DEFAULT_CONNTRACK_SWEEP_INTERVAL,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            lease_duration_seconds: DEFAULT_LEASE_DURATION_SECONDS,
        }
    }
}

/// Immutable configuration handed to every component at construction.
#[derive(Clone, Debug)]
pub struct AgentConfig {
    pub node_name: String,
    pub mode: NodeMode,
    /// Zone this node is configured to belong to.
    pub zone: String,
    pub interconnect_enabled: bool,
    pub ipv4_mode: bool,
    pub ipv6_mode: bool,
    /// Interface that must exist before the agent reports ready, if any.
    pub gateway_interface: Option<String>,
    /// Connection string of the southbound database for this node's zone.
    pub southbound_remote: String,
    pub lease_namespace: String,
    pub timings: Timings,
}

impl AgentConfig {
    pub fn new(node_name: impl Into<String>, zone: impl Into<String>) -> Self {
        AgentConfig {
            node_name: node_name.into(),
            mode: NodeMode::Full,
            zone: zone.into(),
            interconnect_enabled: false,
            ipv4_mode: true,
            ipv6_mode: false,
            gateway_interface: None,
            southbound_remote: String::new(),
            lease_namespace: DEFAULT_LEASE_NAMESPACE.to_string(),
            timings: Timings::default(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.node_name.is_empty() {
            return Err(Error::InvalidConfigError("node name must be set".to_string()));
        }
        if self.zone.is_empty() {
            return Err(Error::InvalidConfigError("zone must be set".to_string()));
        }
        if !self.ipv4_mode && !self.ipv6_mode {
            return Err(Error::InvalidConfigError(
                "at least one of IPv4 or IPv6 must be enabled".to_string(),
            ));
        }
        let t = &self.timings;
        let polls = [
            ("zone", t.zone_poll_interval, t.zone_timeout),
            ("barrier", t.barrier_poll_interval, t.barrier_timeout),
        ];
        for (name, interval, timeout) in polls {
            if interval.is_zero() || timeout < interval {
                return Err(Error::InvalidConfigError(format!(
                    "{name} poll interval {interval:?} must be non-zero and not exceed its timeout {timeout:?}"
                )));
            }
        }
        let durations = [
            ("zone timeout", t.zone_timeout),
            ("barrier timeout", t.barrier_timeout),
            ("conntrack sweep interval", t.conntrack_sweep_interval),
            ("heartbeat interval", t.heartbeat_interval),
        ];
        for (name, value) in durations {
            if value > MAX_CONFIGURED_DURATION {
                return Err(Error::InvalidConfigError(format!(
                    "{name} {value:?} exceeds the maximum of {MAX_CONFIGURED_DURATION:?}"
                )));
            }
        }
        if t.conntrack_sweep_interval.is_zero() || t.heartbeat_interval.is_zero() {
            return Err(Error::InvalidConfigError(
                "sweep and heartbeat intervals must be non-zero".to_string(),
            ));
        }
        if t.lease_duration_seconds <= 0 {
            return Err(Error::InvalidConfigError(
                "lease duration must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Whether this node runs the interconnect upgrade barrier for `zone` at all.
    pub fn interconnect_multi_zone(&self, zone: &str) -> bool {
        self.interconnect_enabled && zone != DEFAULT_ZONE
    }
}

#[derive(Debug, Parser, Clone)]
#[clap(name = "node-agent", about = "Attaches a node to the virtual network fabric")]
pub struct Options {
    /// Name of the Kubernetes node this agent runs on.
    #[clap(long, env = "K8S_NODE")]
    pub node_name: String,
    #[clap(long, value_enum, default_value = "full")]
    pub mode: NodeMode,
    #[clap(long, default_value = DEFAULT_ZONE)]
    pub zone: String,
    #[clap(long)]
    pub enable_interconnect: bool,
    #[clap(long, default_value_t = true, action = clap::ArgAction::Set)]
    pub ipv4: bool,
    #[clap(long)]
    pub ipv6: bool,
    #[clap(long)]
    pub gateway_interface: Option<String>,
    #[clap(long, env = "OVN_SB_REMOTE", default_value = "unix:/var/run/ovn/ovnsb_db.sock")]
    pub sb_remote: String,
    #[clap(long, default_value = DEFAULT_LEASE_NAMESPACE)]
    pub lease_namespace: String,
    /// Seconds to wait for the southbound zone to match.
    #[clap(long, default_value_t = 300)]
    pub zone_timeout_seconds: u64,
    /// Seconds to wait for the interconnect readiness barrier.
    #[clap(long, default_value_t = 1800)]
    pub barrier_timeout_seconds: u64,
    #[clap(long, default_value_t = 60)]
    pub conntrack_sweep_seconds: u64,
    #[clap(long, default_value_t = 10)]
    pub heartbeat_interval_seconds: u64,
    #[clap(long, default_value_t = DEFAULT_LEASE_DURATION_SECONDS)]
    pub lease_duration_seconds: i32,
}

impl TryFrom<Options> for AgentConfig {
    type Error = Error;

    fn try_from(opts: Options) -> Result<Self> {
        let config = AgentConfig {
            node_name: opts.node_name,
            mode: opts.mode,
            zone: opts.zone,
            interconnect_enabled: opts.enable_interconnect,
            ipv4_mode: opts.ipv4,
            ipv6_mode: opts.ipv6,
            gateway_interface: opts.gateway_interface,
            southbound_remote: opts.sb_remote,
            lease_namespace: opts.lease_namespace,
            timings: Timings {
                zone_timeout: Duration::from_secs(opts.zone_timeout_seconds),
                barrier_timeout: Duration::from_secs(opts.barrier_timeout_seconds),
                conntrack_sweep_interval: Duration::from_secs(opts.conntrack_sweep_seconds),
                heartbeat_interval: Duration::from_secs(opts.heartbeat_interval_seconds),
                lease_duration_seconds: opts.lease_duration_seconds,
                ..Timings::default()
            },
        };
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_constants() {
        let t = Timings::default();
        assert_eq!(t.zone_poll_interval, Duration::from_millis(500));
        assert_eq!(t.zone_timeout, Duration::from_secs(300));
        assert_eq!(t.barrier_timeout, Duration::from_secs(1800));
        assert_eq!(t.conntrack_sweep_interval, Duration::from_secs(60));
        assert_eq!(t.heartbeat_interval, Duration::from_secs(10));
        assert_eq!(t.lease_duration_seconds, 40);
    }

    #[test]
    fn options_parse_into_config() {
        let opts = Options::parse_from([
            "node-agent",
            "--node-name",
            "worker-1",
            "--zone",
            "zone-a",
            "--enable-interconnect",
            "--mode",
            "dpu-host",
        ]);
        let config = AgentConfig::try_from(opts).unwrap();
        assert_eq!(config.mode, NodeMode::DpuHost);
        assert!(config.interconnect_multi_zone("zone-a"));
        assert!(!config.interconnect_multi_zone(DEFAULT_ZONE));
    }

    #[test]
    fn rejects_unbounded_timeouts() {
        let opts = Options::parse_from([
            "node-agent",
            "--node-name",
            "worker-1",
            "--barrier-timeout-seconds",
            "18446744073709551615",
        ]);
        let err = AgentConfig::try_from(opts).unwrap_err();
        assert!(err.to_string().contains("barrier timeout"), "{err}");

        let mut config = AgentConfig::new("worker-1", "zone-a");
        config.timings.zone_timeout = MAX_CONFIGURED_DURATION + Duration::from_secs(1);
        assert!(config.validate().is_err());
        config.timings.zone_timeout = MAX_CONFIGURED_DURATION;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_timeout_shorter_than_poll() {
        let mut config = AgentConfig::new("worker-1", "zone-a");
        config.timings.zone_timeout = Duration::from_millis(100);
        assert!(config.validate().is_err());
        config.timings = Timings::default();
        config.ipv4_mode = false;
        assert!(config.validate().is_err());
    }
}
