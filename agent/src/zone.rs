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

//! Zone handover for the node's control-plane connection.
//!
//! A node first waits until the southbound database it can reach reports the zone
//! the node is configured for. When a deployment moves from a single zone to one
//! zone per node (interconnect), the node additionally holds its connection on the
//! legacy database until its new zone controller has programmed routes towards
//! every remote node, a load balancer for every service and a port binding for
//! every local pod. Only then is the migrated marker written and the connection
//! moved over, in that order.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use k8s_openapi::api::core::v1::{Node, Pod, Service};
use kube::ResourceExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::annotations::{
    has_node_migrated_zone, is_ipv6_cidr, logical_port_name, no_host_subnet, node_subnets,
    node_zone, NodeAnnotator,
};
use crate::cluster::ClusterView;
use crate::config::{AgentConfig, NodeMode};
use crate::consts::*;
use crate::southbound::{ControlPlaneTarget, SouthboundDb};
use crate::wait::{poll_until, PollError};
use crate::{Error, Result};

/// Cached outcome of the three readiness checks. A check that passed once is not
/// evaluated again.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct UpgradeBarrier {
    pub nodes_done: bool,
    pub services_done: bool,
    pub pods_done: bool,
}

impl UpgradeBarrier {
    pub fn is_complete(&self) -> bool {
        self.nodes_done && self.services_done && self.pods_done
    }

    pub fn pending(&self) -> String {
        let pending: Vec<&str> = [
            (self.nodes_done, "nodes"),
            (self.services_done, "services"),
            (self.pods_done, "pods"),
        ]
        .iter()
        .filter(|(done, _)| !done)
        .map(|(_, name)| *name)
        .collect();
        if pending.is_empty() {
            "none".to_string()
        } else {
            pending.join(",")
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MigrationPhase {
    NotMigrating,
    AwaitingClusterReadiness(UpgradeBarrier),
    Migrated,
}

impl MigrationPhase {
    fn rank(&self) -> u8 {
        match self {
            MigrationPhase::NotMigrating => 0,
            MigrationPhase::AwaitingClusterReadiness(_) => 1,
            MigrationPhase::Migrated => 2,
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct ZoneMigrationCoordinator {
    config: Arc<AgentConfig>,
    view: Arc<dyn ClusterView>,
    southbound: Arc<dyn SouthboundDb>,
    target: Arc<dyn ControlPlaneTarget>,
    cancel: CancellationToken,
    phase: Mutex<MigrationPhase>,
}

impl ZoneMigrationCoordinator {
    pub fn new(
        config: Arc<AgentConfig>,
        view: Arc<dyn ClusterView>,
        southbound: Arc<dyn SouthboundDb>,
        target: Arc<dyn ControlPlaneTarget>,
        cancel: CancellationToken,
    ) -> Self {
        ZoneMigrationCoordinator {
            config,
            view,
            southbound,
            target,
            cancel,
            phase: Mutex::new(MigrationPhase::NotMigrating),
        }
    }

    pub fn phase(&self) -> MigrationPhase {
        *lock(&self.phase)
    }

    // Phases only move forward; within AwaitingClusterReadiness the cached flags
    // only ever flip to true, so a later snapshot always supersedes an earlier one.
    fn advance(&self, next: MigrationPhase) {
        let mut phase = lock(&self.phase);
        if next.rank() < phase.rank() {
            warn!(current = ?*phase, ?next, "ignoring migration phase regression");
            return;
        }
        *phase = next;
    }

    /// Polls the reachable southbound database until it reports `desired`. Returns
    /// the matched zone, or [`Error::ZoneMismatchTimeout`] with the last zone seen.
    pub async fn wait_for_zone_match(&self, desired: &str, timeout: Duration) -> Result<String> {
        let observed: Mutex<Option<String>> = Mutex::new(None);
        let last_error: Mutex<Option<String>> = Mutex::new(None);
        let (observed_ref, error_ref) = (&observed, &last_error);

        let result = poll_until(
            self.config.timings.zone_poll_interval,
            timeout,
            &self.cancel,
            || async move {
                match self.southbound.zone().await {
                    Ok(zone) => {
                        let matched = zone == desired;
                        if !matched {
                            *lock(error_ref) = Some(format!(
                                "node {} zone {desired} mismatch with the southbound zone {zone}",
                                self.config.node_name
                            ));
                        }
                        *lock(observed_ref) = Some(zone);
                        matched
                    }
                    Err(err) => {
                        *lock(error_ref) = Some(format!(
                            "failed to get the zone name from the southbound database: {err}"
                        ));
                        false
                    }
                }
            },
        )
        .await;

        match result {
            Ok(()) => {
                info!(zone = desired, "node zone matches the southbound database");
                Ok(desired.to_string())
            }
            Err(PollError::Cancelled) => Err(Error::Cancelled),
            Err(PollError::Timeout) => Err(Error::ZoneMismatchTimeout {
                desired: desired.to_string(),
                observed: lock(&observed).take(),
                last_error: lock(&last_error).take(),
            }),
        }
    }

    /// Whether the interconnect upgrade barrier has to run for this node in `zone`.
    pub fn needs_upgrade_barrier(&self, zone: &str, node: &Node) -> bool {
        self.config.mode != NodeMode::DpuHost
            && self.config.interconnect_multi_zone(zone)
            && !has_node_migrated_zone(node)
    }

    pub async fn retarget(&self) -> Result<()> {
        self.target.retarget().await
    }

    pub async fn record_zone_annotation(&self, zone: &str) -> Result<()> {
        NodeAnnotator::new(self.view.as_ref(), &self.config.node_name)
            .set(ZONE_NAME_ANNOTATION, zone)
            .run()
            .await
    }

    /// Settles the phase for a node that does not go through the barrier.
    pub fn skip_barrier(&self, node: &Node) {
        if has_node_migrated_zone(node) {
            self.advance(MigrationPhase::Migrated);
        }
    }

    /// Blocks until every remote node, service and local pod is realized in the new
    /// zone database, then records the migrated marker and retargets the
    /// control-plane connection. A timeout leaves no safe state to continue in and
    /// must be treated as fatal by the caller.
    pub async fn run_interconnect_upgrade_barrier(
        &self,
        node: &Node,
        zone: &str,
        timeout: Duration,
    ) -> Result<()> {
        if !self.needs_upgrade_barrier(zone, node) {
            self.skip_barrier(node);
            return Ok(());
        }
        info!(zone, "interconnect is enabled; waiting for the zone to be ready");
        let start = Instant::now();
        self.advance(MigrationPhase::AwaitingClusterReadiness(
            UpgradeBarrier::default(),
        ));

        let barrier = Mutex::new(UpgradeBarrier::default());
        let last_error = Mutex::new(String::from("not evaluated"));
        let (barrier_ref, error_ref) = (&barrier, &last_error);

        let result = poll_until(
            self.config.timings.barrier_poll_interval,
            timeout,
            &self.cancel,
            || async move {
                let mut state = *lock(barrier_ref);
                let outcome = self.poll_once(&mut state).await;
                *lock(barrier_ref) = state;
                self.advance(MigrationPhase::AwaitingClusterReadiness(state));
                match outcome {
                    Ok(complete) => {
                        if !complete {
                            *lock(error_ref) = format!("waiting on {}", state.pending());
                        }
                        complete
                    }
                    Err(err) => {
                        *lock(error_ref) = err.to_string();
                        false
                    }
                }
            },
        )
        .await;

        match result {
            Ok(()) => {}
            Err(PollError::Cancelled) => return Err(Error::Cancelled),
            Err(PollError::Timeout) => {
                let state = *lock(&barrier);
                return Err(Error::BarrierTimeout {
                    pending: state.pending(),
                    last_error: lock(&last_error).clone(),
                });
            }
        }

        // marker first, then retarget
        NodeAnnotator::new(self.view.as_ref(), &self.config.node_name)
            .set(ZONE_MIGRATED_ANNOTATION, zone)
            .run()
            .await?;
        info!(elapsed = ?start.elapsed(), "finished annotating node as zone migrated");
        self.advance(MigrationPhase::Migrated);

        self.target.retarget().await?;
        info!(elapsed = ?start.elapsed(), "control plane connection moved to the zone database");
        Ok(())
    }

    /// One barrier pass. Checks are evaluated in order and a failing check ends the
    /// pass; checks already passed are skipped. Returns whether all three hold.
    pub async fn poll_once(&self, barrier: &mut UpgradeBarrier) -> Result<bool> {
        if !barrier.nodes_done {
            if !self.nodes_ready().await? {
                return Ok(false);
            }
            info!("interconnect barrier: node routes are ready");
            barrier.nodes_done = true;
        }
        if !barrier.services_done {
            if !self.services_ready().await? {
                return Ok(false);
            }
            info!("interconnect barrier: service load balancers are ready");
            barrier.services_done = true;
        }
        if !barrier.pods_done {
            if !self.pods_ready().await? {
                return Ok(false);
            }
            info!("interconnect barrier: local pod ports are ready");
            barrier.pods_done = true;
        }
        Ok(true)
    }

    async fn nodes_ready(&self) -> Result<bool> {
        let nodes = self.view.list_nodes().await?;
        for node in &nodes {
            let name = node.name_any();
            if name == self.config.node_name
                || node_zone(node) == self.config.zone
                || no_host_subnet(node)
            {
                continue;
            }
            let Some(subnets) = node_subnets(node)? else {
                info!(node = %name, "skipping node without a subnet annotation");
                continue;
            };
            for subnet in subnets {
                if !self.route_present(&subnet).await? {
                    debug!(node = %name, %subnet, "route for remote node not yet present");
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }

    async fn route_present(&self, subnet: &str) -> Result<bool> {
        let family_enabled = if is_ipv6_cidr(subnet) {
            self.config.ipv6_mode
        } else {
            self.config.ipv4_mode
        };
        if !family_enabled {
            return Ok(true);
        }
        self.southbound.node_route_exists(subnet).await
    }

    async fn services_ready(&self) -> Result<bool> {
        let services = self.view.list_services().await?;
        let lb_names = self.southbound.load_balancer_names().await?;
        for svc in services.iter().filter(|s| has_cluster_ip(s)) {
            let ns = svc.namespace().unwrap_or_default();
            if !load_balancer_exists(&lb_names, &ns, &svc.name_any()) {
                debug!(service = %format!("{ns}/{}", svc.name_any()), "load balancer not yet present");
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn pods_ready(&self) -> Result<bool> {
        let pods = self.view.list_pods(None, &self.config.node_name).await?;
        for pod in pods.iter().filter(|p| needs_logical_port(p, &self.config.node_name)) {
            let ns = pod.namespace().unwrap_or_default();
            let port = logical_port_name(&ns, &pod.name_any());
            if !self.southbound.port_binding_exists(&port).await? {
                debug!(%port, "port binding not yet present");
                return Ok(false);
            }
        }
        Ok(true)
    }
}

// Headless and ExternalName services have no load balancer.
pub fn has_cluster_ip(svc: &Service) -> bool {
    let Some(spec) = svc.spec.as_ref() else {
        return false;
    };
    if spec.type_.as_deref() == Some("ExternalName") {
        return false;
    }
    matches!(spec.cluster_ip.as_deref(), Some(ip) if !ip.is_empty() && ip != "None")
}

pub fn load_balancer_exists(lb_names: &[String], namespace: &str, name: &str) -> bool {
    let key = format!("{SERVICE_LB_PREFIX}{namespace}/{name}");
    let prefixed = format!("{key}_");
    lb_names
        .iter()
        .any(|lb| *lb == key || lb.starts_with(&prefixed))
}

// Scheduled to this node, still running and attached to the pod network.
pub fn needs_logical_port(pod: &Pod, node_name: &str) -> bool {
    let Some(spec) = pod.spec.as_ref() else {
        return false;
    };
    if spec.node_name.as_deref() != Some(node_name) || spec.host_network.unwrap_or(false) {
        return false;
    }
    let phase = pod.status.as_ref().and_then(|s| s.phase.as_deref());
    !matches!(phase, Some("Succeeded") | Some("Failed"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_lists_unfinished_checks() {
        let mut barrier = UpgradeBarrier::default();
        assert_eq!(barrier.pending(), "nodes,services,pods");
        barrier.nodes_done = true;
        barrier.pods_done = true;
        assert_eq!(barrier.pending(), "services");
        barrier.services_done = true;
        assert!(barrier.is_complete());
    }

    #[test]
    fn load_balancer_names_match_service_prefix() {
        let names = vec![
            "Service_default/kubernetes_TCP_cluster".to_string(),
            "Service_kube-system/dns".to_string(),
        ];
        assert!(load_balancer_exists(&names, "default", "kubernetes"));
        assert!(load_balancer_exists(&names, "kube-system", "dns"));
        assert!(!load_balancer_exists(&names, "default", "kube"));
    }

    #[test]
    fn phase_ranks_are_ordered() {
        assert!(MigrationPhase::NotMigrating.rank() < MigrationPhase::Migrated.rank());
        assert!(
            MigrationPhase::AwaitingClusterReadiness(UpgradeBarrier::default()).rank()
                < MigrationPhase::Migrated.rank()
        );
    }
}
