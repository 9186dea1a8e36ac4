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

//! Removal of stale UDP conntrack entries.
//!
//! UDP flows have no teardown, so an entry pinned to an external gateway or a
//! service endpoint that went away keeps blackholing traffic until it times out.
//! Two triggers clean them up: changes to a namespace's external gateway
//! annotations (plus a periodic sweep over all such namespaces), and endpoints
//! disappearing from an EndpointSlice.

use std::collections::{BTreeMap, BTreeSet};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Namespace, Pod, Service};
use k8s_openapi::api::discovery::v1::EndpointSlice;
use kube::ResourceExt;
use netutils::{ConntrackFilter, ConntrackPort, HardwareAddr, Protocol};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::annotations::{external_gateway_ips, has_external_gateway_annotations};
use crate::cluster::ClusterView;
use crate::config::AgentConfig;
use crate::consts::{NO_MATCH_LABEL, SERVICE_NAME_LABEL};
use crate::{Error, NamespacedName, Result};

/// Source of gateway IPs configured through external route policies, as opposed to
/// namespace annotations.
#[async_trait]
pub trait ExternalRouteSource: Send + Sync {
    async fn gateway_ips(&self, namespace: &str) -> Result<BTreeSet<String>>;
}

/// Used when no external route policy controller runs on the node.
pub struct NoExternalRoutes;

#[async_trait]
impl ExternalRouteSource for NoExternalRoutes {
    async fn gateway_ips(&self, _namespace: &str) -> Result<BTreeSet<String>> {
        Ok(BTreeSet::new())
    }
}

pub struct ConntrackReconciler {
    config: Arc<AgentConfig>,
    view: Arc<dyn ClusterView>,
    port: Arc<dyn ConntrackPort>,
    routes: Arc<dyn ExternalRouteSource>,
}

impl ConntrackReconciler {
    pub fn new(
        config: Arc<AgentConfig>,
        view: Arc<dyn ClusterView>,
        port: Arc<dyn ConntrackPort>,
        routes: Arc<dyn ExternalRouteSource>,
    ) -> Self {
        ConntrackReconciler {
            config,
            view,
            port,
            routes,
        }
    }

    /// Handles a namespace add or update. Updates that leave both gateway
    /// annotations untouched are ignored.
    pub async fn on_namespace_update(&self, old: Option<&Namespace>, new: &Namespace) -> Result<()> {
        if let Some(old) = old {
            if !crate::annotations::ex_gateway_annotations_changed(old, new) {
                return Ok(());
            }
        } else if !has_external_gateway_annotations(new) {
            return Ok(());
        }
        if !self.has_local_pods(new).await {
            debug!(namespace = %new.name_any(), "no local pods; skipping conntrack sync");
            return Ok(());
        }
        self.sync_external_gateways(new).await
    }

    // Fails open: if the pods cannot be listed the namespace is reconciled anyway.
    async fn has_local_pods(&self, namespace: &Namespace) -> bool {
        let ns = namespace.name_any();
        match self.view.list_pods(Some(&ns), &self.config.node_name).await {
            Ok(pods) => !pods.is_empty(),
            Err(err) => {
                warn!(namespace = %ns, "unable to list local pods: {err}");
                true
            }
        }
    }

    /// Deletes UDP entries towards the namespace's local pods whose next-hop label is
    /// not one of the namespace's current gateways.
    pub async fn sync_external_gateways(&self, namespace: &Namespace) -> Result<()> {
        let ns = namespace.name_any();
        let allow_list = self.build_allow_list(namespace).await?;

        let pods = self
            .view
            .list_pods(Some(&ns), &self.config.node_name)
            .await?;

        let mut errors = vec![];
        for pod in &pods {
            let ips = match pod_ips(pod) {
                Ok(ips) => ips,
                Err(err) => {
                    errors.push(err);
                    continue;
                }
            };
            for ip in ips {
                let filter = ConntrackFilter::orig_dst(ip, Protocol::Udp)
                    .with_unmatched_labels(allow_list.clone());
                match self.port.delete(&filter).await {
                    Ok(count) if count > 0 => {
                        info!(namespace = %ns, pod_ip = %ip, count, "deleted stale gateway conntrack entries")
                    }
                    Ok(_) => {}
                    Err(err) => {
                        error!(pod_ip = %ip, "failed to delete conntrack entries: {err}");
                        errors.push(Error::ConntrackError(err));
                    }
                }
            }
        }
        Error::aggregate(errors)
    }

    /// Byte-reversed hardware addresses of every gateway of the namespace, or the
    /// single non-matching sentinel when none resolve.
    pub async fn build_allow_list(&self, namespace: &Namespace) -> Result<Vec<Vec<u8>>> {
        let ns = namespace.name_any();
        let mut gateway_ips = self.routes.gateway_ips(&ns).await?;
        gateway_ips.extend(external_gateway_ips(namespace));

        let mut allow_list: Vec<Vec<u8>> = self
            .resolve_next_hops(&gateway_ips)
            .await
            .into_values()
            .map(|mac| mac.reversed().into_bytes())
            .collect();
        if allow_list.is_empty() {
            allow_list.push(NO_MATCH_LABEL.to_vec());
        }
        Ok(allow_list)
    }

    /// Resolves every IPv4 gateway concurrently, one task per address. IPv6
    /// gateways are not supported and are skipped; failures are logged.
    pub async fn resolve_next_hops(&self, gateway_ips: &BTreeSet<String>) -> BTreeMap<Ipv4Addr, HardwareAddr> {
        let mut tasks = JoinSet::new();
        for gw in gateway_ips.iter().filter(|ip| !ip.is_empty()) {
            let ip = match gw.parse::<IpAddr>() {
                Ok(IpAddr::V4(ip)) => ip,
                Ok(IpAddr::V6(_)) => {
                    debug!(gateway = %gw, "IPv6 external gateways are not supported for conntrack cleanup");
                    continue;
                }
                Err(_) => {
                    warn!(gateway = %gw, "ignoring unparsable gateway IP");
                    continue;
                }
            };
            let port = self.port.clone();
            tasks.spawn(async move { (ip, port.resolve_hardware_addr(ip).await) });
        }

        let mut resolved = BTreeMap::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((ip, Ok(Some(mac)))) if !mac.is_empty() => {
                    resolved.insert(ip, mac);
                }
                Ok((ip, Ok(_))) => warn!(gateway = %ip, "no hardware address found for gateway"),
                Ok((ip, Err(err))) => {
                    error!(gateway = %ip, "failed to look up hardware address: {err}")
                }
                Err(err) => error!("hardware address lookup task failed: {err}"),
            }
        }
        resolved
    }

    /// Handles an EndpointSlice update (`new` set) or delete (`new` unset). UDP
    /// entries are removed for every old endpoint no longer present in `new`.
    pub async fn on_endpoint_slice_update(
        &self,
        old: Option<&EndpointSlice>,
        new: Option<&EndpointSlice>,
    ) -> Result<()> {
        let Some(old) = old else {
            return Ok(());
        };
        let key = service_namespaced_name(old)?;
        let service = self.view.get_service(&key.namespace, &key.name).await?;

        let mut errors = vec![];
        for old_port in old.ports.iter().flatten() {
            if old_port.protocol.as_deref() != Some("UDP") {
                continue;
            }
            let Some(port) = old_port.port.and_then(|p| u16::try_from(p).ok()) else {
                continue;
            };
            for endpoint in &old.endpoints {
                for address in &endpoint.addresses {
                    let Ok(ip) = address.parse::<IpAddr>() else {
                        warn!(%address, "ignoring unparsable endpoint address");
                        continue;
                    };
                    if let Some(new) = new {
                        if endpoint_slice_contains(new, ip, port, "UDP", service.as_ref()) {
                            continue;
                        }
                    }
                    let filter = ConntrackFilter::reply_any(ip, port, Protocol::Udp);
                    if let Err(err) = self.port.delete(&filter).await {
                        error!(endpoint = %ip, port, "failed to delete conntrack entries: {err}");
                        errors.push(Error::ConntrackError(err));
                    }
                }
            }
        }
        Error::aggregate(errors)
    }

    /// Reconciles every namespace carrying a gateway annotation and at least one
    /// local pod. Covers events the watch missed or coalesced.
    pub async fn sweep_stale_namespaces(&self) -> Result<()> {
        let start = Instant::now();
        let namespaces = self.view.list_namespaces().await?;
        let mut errors = vec![];
        for namespace in namespaces
            .iter()
            .filter(|ns| has_external_gateway_annotations(ns))
        {
            if !self.has_local_pods(namespace).await {
                continue;
            }
            if let Err(err) = self.sync_external_gateways(namespace).await {
                error!(namespace = %namespace.name_any(), "conntrack sweep failed: {err}");
                errors.push(err);
            }
        }
        debug!(elapsed = ?start.elapsed(), "conntrack sweep finished");
        Error::aggregate(errors)
    }

    /// Runs [`Self::sweep_stale_namespaces`] immediately and then on every sweep
    /// interval until cancelled.
    pub async fn run_periodic_sweep(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.timings.conntrack_sweep_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("stopping conntrack sweep");
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(err) = self.sweep_stale_namespaces().await {
                        warn!("conntrack sweep incomplete: {err}");
                    }
                }
            }
        }
    }
}

/// IPs of the pod on the default network. A pod without IPs yields none.
pub fn pod_ips(pod: &Pod) -> Result<Vec<IpAddr>> {
    let Some(status) = pod.status.as_ref() else {
        return Ok(vec![]);
    };
    let mut raw: Vec<String> = status
        .pod_ips
        .iter()
        .flatten()
        .filter_map(|p| p.ip.clone())
        .collect();
    if raw.is_empty() {
        raw.extend(status.pod_ip.clone());
    }
    raw.iter()
        .map(|ip| {
            ip.parse::<IpAddr>().map_err(|_| Error::AnnotationError {
                object: format!("pod {}/{}", pod.namespace().unwrap_or_default(), pod.name_any()),
                key: "status.podIPs".to_string(),
                reason: format!("invalid IP {ip}"),
            })
        })
        .collect()
}

pub fn service_namespaced_name(slice: &EndpointSlice) -> Result<NamespacedName> {
    let namespace = slice.namespace().unwrap_or_default();
    let name = slice.labels().get(SERVICE_NAME_LABEL).cloned().ok_or_else(|| {
        Error::InvalidConfigError(format!(
            "cannot reconcile conntrack: endpointslice {namespace}/{} has no {SERVICE_NAME_LABEL} label",
            slice.name_any()
        ))
    })?;
    Ok(NamespacedName { name, namespace })
}

/// Whether `slice` still serves `ip:port/protocol`. Not-ready endpoints count only
/// when the service publishes not-ready addresses.
pub fn endpoint_slice_contains(
    slice: &EndpointSlice,
    ip: IpAddr,
    port: u16,
    protocol: &str,
    service: Option<&Service>,
) -> bool {
    let publish_not_ready = service
        .and_then(|s| s.spec.as_ref())
        .and_then(|spec| spec.publish_not_ready_addresses)
        .unwrap_or(false);
    let port_present = slice.ports.iter().flatten().any(|p| {
        p.port == Some(i32::from(port)) && p.protocol.as_deref().unwrap_or("TCP") == protocol
    });
    if !port_present {
        return false;
    }
    slice
        .endpoints
        .iter()
        .filter(|ep| {
            publish_not_ready
                || ep
                    .conditions
                    .as_ref()
                    .and_then(|c| c.ready)
                    .unwrap_or(true)
        })
        .flat_map(|ep| ep.addresses.iter())
        .any(|addr| addr.parse::<IpAddr>().ok() == Some(ip))
}
