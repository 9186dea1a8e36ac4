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

use std::sync::Arc;

use kube::Client;
use netutils::ConntrackPort;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::annotations::{dpu_node_ready, is_dpu_host, node_zone, NodeAnnotator};
use crate::cluster::ClusterView;
use crate::config::{AgentConfig, NodeMode};
use crate::consts::{DEFAULT_ZONE, DPU_NODE_READY_ANNOTATION};
use crate::conntrack::{ConntrackReconciler, ExternalRouteSource};
use crate::heartbeat::{Heartbeat, HeartbeatOptions};
use crate::southbound::{ControlPlaneTarget, SouthboundDb};
use crate::wait::{poll_until, PollError};
use crate::zone::ZoneMigrationCoordinator;
use crate::{watch, Error, Result};

/// Brings the node up: settles its zone, runs the upgrade barrier when needed and
/// starts the long running reconcilers.
pub struct NodeAgent {
    config: Arc<AgentConfig>,
    view: Arc<dyn ClusterView>,
    port: Arc<dyn ConntrackPort>,
    coordinator: Arc<ZoneMigrationCoordinator>,
    reconciler: Arc<ConntrackReconciler>,
    client: Option<Client>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    heartbeat: Option<JoinHandle<Result<()>>>,
    heartbeat_reports: Option<UnboundedReceiver<Result<()>>>,
}

impl NodeAgent {
    pub fn new(
        config: AgentConfig,
        view: Arc<dyn ClusterView>,
        southbound: Arc<dyn SouthboundDb>,
        target: Arc<dyn ControlPlaneTarget>,
        port: Arc<dyn ConntrackPort>,
        routes: Arc<dyn ExternalRouteSource>,
    ) -> Self {
        let config = Arc::new(config);
        let cancel = CancellationToken::new();
        let coordinator = Arc::new(ZoneMigrationCoordinator::new(
            config.clone(),
            view.clone(),
            southbound,
            target,
            cancel.clone(),
        ));
        let reconciler = Arc::new(ConntrackReconciler::new(
            config.clone(),
            view.clone(),
            port.clone(),
            routes,
        ));
        NodeAgent {
            config,
            view,
            port,
            coordinator,
            reconciler,
            client: None,
            cancel,
            tasks: vec![],
            heartbeat: None,
            heartbeat_reports: None,
        }
    }

    /// Client used for the namespace and EndpointSlice watches. Without one only
    /// the periodic sweep reconciles conntrack state.
    pub fn with_client(mut self, client: Client) -> Self {
        self.client = Some(client);
        self
    }

    pub fn coordinator(&self) -> Arc<ZoneMigrationCoordinator> {
        self.coordinator.clone()
    }

    pub fn reconciler(&self) -> Arc<ConntrackReconciler> {
        self.reconciler.clone()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Liveness reports of the heartbeat, available once after [`Self::start`] on
    /// DPU and DPU host nodes.
    pub fn take_heartbeat_reports(&mut self) -> Option<UnboundedReceiver<Result<()>>> {
        self.heartbeat_reports.take()
    }

    /// Runs the startup sequence. Any error is fatal for the agent.
    pub async fn start(&mut self) -> Result<()> {
        let config = self.config.clone();
        let node = self
            .view
            .get_node(&config.node_name)
            .await?
            .ok_or_else(|| Error::InvalidConfigError(format!("node {} does not exist", config.node_name)))?;

        // A DPU host has no southbound database to ask.
        let zone = if config.mode == NodeMode::DpuHost {
            config.zone.clone()
        } else {
            self.coordinator
                .wait_for_zone_match(&config.zone, config.timings.zone_timeout)
                .await?
        };

        let needs_barrier = self.coordinator.needs_upgrade_barrier(&zone, &node);
        if !needs_barrier {
            self.coordinator.skip_barrier(&node);
            if config.mode != NodeMode::DpuHost {
                self.coordinator.retarget().await?;
            }
        }

        if let Some(iface) = config.gateway_interface.as_deref() {
            let interfaces = self.port.interfaces().await?;
            if !interfaces.iter().any(|i| i == iface) {
                return Err(Error::InvalidConfigError(format!(
                    "gateway interface {iface} does not exist"
                )));
            }
        }

        self.coordinator.record_zone_annotation(&zone).await?;

        if needs_barrier {
            self.coordinator
                .run_interconnect_upgrade_barrier(&node, &zone, config.timings.barrier_timeout)
                .await?;
        }

        self.start_conntrack_reconciliation(&zone);

        if matches!(config.mode, NodeMode::Dpu | NodeMode::DpuHost) {
            self.start_heartbeat()?;
        }

        match config.mode {
            NodeMode::DpuHost => self.wait_for_dpu_ready(&zone).await?,
            NodeMode::Dpu => {
                NodeAnnotator::new(self.view.as_ref(), &config.node_name)
                    .set(DPU_NODE_READY_ANNOTATION, "")
                    .run()
                    .await?;
            }
            NodeMode::Full => {}
        }

        info!(node = %config.node_name, %zone, "node agent initialized and ready");
        Ok(())
    }

    fn start_conntrack_reconciliation(&mut self, zone: &str) {
        let config = &self.config;
        // With one zone per node, gateway namespaces are handled by the zone controller.
        if !config.interconnect_enabled || zone == DEFAULT_ZONE {
            if let Some(client) = self.client.clone() {
                self.tasks.push(tokio::spawn(watch::run_namespace_watch(
                    client,
                    self.reconciler.clone(),
                    self.cancel.clone(),
                )));
            }
            self.tasks.push(tokio::spawn(
                self.reconciler.clone().run_periodic_sweep(self.cancel.clone()),
            ));
        }
        if config.mode != NodeMode::DpuHost {
            if let Some(client) = self.client.clone() {
                self.tasks.push(tokio::spawn(watch::run_endpoint_slice_watch(
                    client,
                    self.reconciler.clone(),
                    self.cancel.clone(),
                )));
            }
        }
    }

    fn start_heartbeat(&mut self) -> Result<()> {
        let config = &self.config;
        let options = HeartbeatOptions::new(config.node_name.clone())
            .namespace(config.lease_namespace.clone())
            .lease_duration_seconds(config.timings.lease_duration_seconds)
            .interval(config.timings.heartbeat_interval)
            .mode(config.mode);
        let (heartbeat, reports) = Heartbeat::new(self.view.clone(), config.node_name.clone(), options)?;
        self.heartbeat = Some(heartbeat.start(self.cancel.clone()));
        self.heartbeat_reports = Some(reports);
        Ok(())
    }

    // Waits until every DPU node of the zone has marked itself ready.
    async fn wait_for_dpu_ready(&self, zone: &str) -> Result<()> {
        let view = self.view.as_ref();
        let result = poll_until(
            self.config.timings.zone_poll_interval,
            self.config.timings.zone_timeout,
            &self.cancel,
            || async move {
                let Ok(nodes) = view.list_nodes().await else {
                    return false;
                };
                nodes
                    .iter()
                    .filter(|n| !is_dpu_host(n) && node_zone(n) == zone)
                    .all(dpu_node_ready)
            },
        )
        .await;
        match result {
            Ok(()) => Ok(()),
            Err(PollError::Cancelled) => Err(Error::Cancelled),
            Err(PollError::Timeout) => Err(Error::TimeoutError("the DPU node to be ready".to_string())),
        }
    }

    /// Stops every task and waits for them. Returns the outcome of the heartbeat's
    /// final lease cleanup, if a heartbeat was running.
    pub async fn shutdown(mut self) -> Result<()> {
        if self.config.mode == NodeMode::Dpu {
            if let Err(err) = NodeAnnotator::new(self.view.as_ref(), &self.config.node_name)
                .delete(DPU_NODE_READY_ANNOTATION)
                .run()
                .await
            {
                error!("failed to remove the DPU ready annotation: {err}");
            }
        }

        self.cancel.cancel();
        for task in self.tasks.drain(..) {
            if let Err(err) = task.await {
                error!("task failed during shutdown: {err}");
            }
        }
        match self.heartbeat.take() {
            Some(handle) => handle
                .await
                .map_err(|e| Error::HeartbeatError(format!("heartbeat task failed: {e}")))?,
            None => Ok(()),
        }
    }
}
