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

#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use agent::consts::*;
use agent::{AgentConfig, ClusterView, ControlPlaneTarget, Error, Result, SouthboundDb};
use async_trait::async_trait;
use k8s_openapi::api::coordination::v1::Lease;
use k8s_openapi::api::core::v1::{
    Namespace, Node, Pod, PodIP, PodSpec, PodStatus, Service, ServiceSpec,
};
use k8s_openapi::api::discovery::v1::{Endpoint, EndpointConditions, EndpointPort, EndpointSlice};
use kube::api::ObjectMeta;
use kube::ResourceExt;
use netutils::{ConntrackFilter, ConntrackPort, HardwareAddr};

/// Ordered record of side effects shared between fakes.
pub type EventLog = Arc<Mutex<Vec<String>>>;

pub fn test_config(node_name: &str, zone: &str) -> AgentConfig {
    let mut config = AgentConfig::new(node_name, zone);
    config.timings.zone_timeout = Duration::from_secs(5);
    config.timings.barrier_timeout = Duration::from_secs(10);
    config.timings.heartbeat_interval = Duration::from_secs(1);
    config
}

fn not_found() -> kube::Error {
    kube::Error::Api(kube::error::ErrorResponse {
        status: "Failure".to_string(),
        message: "not found".to_string(),
        reason: "NotFound".to_string(),
        code: 404,
    })
}

#[derive(Default)]
pub struct FakeClusterView {
    pub nodes: Mutex<BTreeMap<String, Node>>,
    pub namespaces: Mutex<Vec<Namespace>>,
    pub pods: Mutex<Vec<Pod>>,
    pub services: Mutex<Vec<Service>>,
    pub leases: Mutex<BTreeMap<(String, String), Lease>>,
    pub events: EventLog,
    pub list_nodes_calls: AtomicUsize,
    pub fail_list_pods: AtomicBool,
    pub fail_list_namespaces: AtomicBool,
    /// Number of upcoming lease replacements rejected as if another writer won.
    pub lease_conflicts: AtomicUsize,
    versions: AtomicU64,
}

impl FakeClusterView {
    pub fn new(events: EventLog) -> Self {
        FakeClusterView {
            events,
            ..FakeClusterView::default()
        }
    }

    pub fn add_node(&self, node: Node) {
        self.nodes.lock().unwrap().insert(node.name_any(), node);
    }

    pub fn node(&self, name: &str) -> Option<Node> {
        self.nodes.lock().unwrap().get(name).cloned()
    }

    pub fn lease(&self, namespace: &str, name: &str) -> Option<Lease> {
        self.leases
            .lock()
            .unwrap()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    fn next_version(&self) -> String {
        (self.versions.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }
}

#[async_trait]
impl ClusterView for FakeClusterView {
    async fn get_node(&self, name: &str) -> Result<Option<Node>> {
        Ok(self.node(name))
    }

    async fn list_nodes(&self) -> Result<Vec<Node>> {
        self.list_nodes_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.nodes.lock().unwrap().values().cloned().collect())
    }

    async fn list_namespaces(&self) -> Result<Vec<Namespace>> {
        if self.fail_list_namespaces.load(Ordering::SeqCst) {
            return Err(Error::TimeoutError("namespace lister".to_string()));
        }
        Ok(self.namespaces.lock().unwrap().clone())
    }

    async fn list_pods(&self, namespace: Option<&str>, node_name: &str) -> Result<Vec<Pod>> {
        if self.fail_list_pods.load(Ordering::SeqCst) {
            return Err(Error::TimeoutError("pod lister".to_string()));
        }
        Ok(self
            .pods
            .lock()
            .unwrap()
            .iter()
            .filter(|p| namespace.map_or(true, |ns| p.namespace().as_deref() == Some(ns)))
            .filter(|p| p.spec.as_ref().and_then(|s| s.node_name.as_deref()) == Some(node_name))
            .cloned()
            .collect())
    }

    async fn list_services(&self) -> Result<Vec<Service>> {
        Ok(self.services.lock().unwrap().clone())
    }

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>> {
        Ok(self
            .services
            .lock()
            .unwrap()
            .iter()
            .find(|s| s.namespace().as_deref() == Some(namespace) && s.name_any() == name)
            .cloned())
    }

    async fn patch_node_annotations(
        &self,
        node_name: &str,
        annotations: &BTreeMap<String, Option<String>>,
    ) -> Result<()> {
        let mut nodes = self.nodes.lock().unwrap();
        let node = nodes.get_mut(node_name).ok_or(Error::KubeError(not_found()))?;
        let current = node.annotations_mut();
        for (key, value) in annotations {
            match value {
                Some(value) => {
                    current.insert(key.clone(), value.clone());
                    self.events.lock().unwrap().push(format!("annotate {key}"));
                }
                None => {
                    current.remove(key);
                    self.events.lock().unwrap().push(format!("remove {key}"));
                }
            }
        }
        Ok(())
    }

    async fn get_lease(&self, namespace: &str, name: &str) -> Result<Option<Lease>> {
        Ok(self.lease(namespace, name))
    }

    async fn list_leases(&self, namespace: &str) -> Result<Vec<Lease>> {
        Ok(self
            .leases
            .lock()
            .unwrap()
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .map(|(_, lease)| lease.clone())
            .collect())
    }

    async fn create_lease(&self, namespace: &str, lease: &Lease) -> Result<Lease> {
        let key = (namespace.to_string(), lease.name_any());
        let mut leases = self.leases.lock().unwrap();
        if leases.contains_key(&key) {
            return Err(Error::ConflictError(format!("lease {namespace}/{}", key.1)));
        }
        let mut stored = lease.clone();
        stored.metadata.resource_version = Some(self.next_version());
        leases.insert(key, stored.clone());
        Ok(stored)
    }

    async fn replace_lease(&self, namespace: &str, lease: &Lease) -> Result<Lease> {
        let key = (namespace.to_string(), lease.name_any());
        let mut leases = self.leases.lock().unwrap();
        let stored = leases.get_mut(&key).ok_or(Error::KubeError(not_found()))?;
        if self
            .lease_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            // someone else got there first
            stored.metadata.resource_version = Some(self.next_version());
            return Err(Error::ConflictError(format!("lease {namespace}/{}", key.1)));
        }
        if stored.metadata.resource_version != lease.metadata.resource_version {
            return Err(Error::ConflictError(format!("lease {namespace}/{}", key.1)));
        }
        let mut updated = lease.clone();
        updated.metadata.resource_version = Some(self.next_version());
        *stored = updated.clone();
        Ok(updated)
    }

    async fn delete_lease(&self, namespace: &str, name: &str) -> Result<()> {
        self.leases
            .lock()
            .unwrap()
            .remove(&(namespace.to_string(), name.to_string()));
        self.events.lock().unwrap().push(format!("delete lease {name}"));
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeSouthbound {
    /// Successive answers to zone queries; the last one repeats.
    pub zones: Mutex<VecDeque<String>>,
    pub routes: Mutex<BTreeSet<String>>,
    pub load_balancers: Mutex<Vec<String>>,
    pub port_bindings: Mutex<BTreeSet<String>>,
    pub route_calls: AtomicUsize,
}

impl FakeSouthbound {
    pub fn with_zone(zone: &str) -> Self {
        let southbound = FakeSouthbound::default();
        southbound.zones.lock().unwrap().push_back(zone.to_string());
        southbound
    }
}

#[async_trait]
impl SouthboundDb for FakeSouthbound {
    async fn zone(&self) -> Result<String> {
        let mut zones = self.zones.lock().unwrap();
        if zones.len() > 1 {
            return Ok(zones.pop_front().unwrap_or_default());
        }
        zones
            .front()
            .cloned()
            .ok_or_else(|| Error::SouthboundError("database unreachable".to_string()))
    }

    async fn node_route_exists(&self, subnet: &str) -> Result<bool> {
        self.route_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.routes.lock().unwrap().contains(subnet))
    }

    async fn load_balancer_names(&self) -> Result<Vec<String>> {
        Ok(self.load_balancers.lock().unwrap().clone())
    }

    async fn port_binding_exists(&self, logical_port: &str) -> Result<bool> {
        Ok(self.port_bindings.lock().unwrap().contains(logical_port))
    }
}

pub struct FakeTarget {
    pub events: EventLog,
}

#[async_trait]
impl ControlPlaneTarget for FakeTarget {
    async fn retarget(&self) -> Result<()> {
        self.events.lock().unwrap().push("retarget".to_string());
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeConntrack {
    pub neighbours: Mutex<HashMap<Ipv4Addr, HardwareAddr>>,
    pub deleted: Mutex<Vec<ConntrackFilter>>,
    pub interfaces: Mutex<Vec<String>>,
    pub resolve_calls: AtomicUsize,
    /// Deletions for these IPs are attempted and then reported as failed.
    pub failing: Mutex<BTreeSet<IpAddr>>,
}

impl FakeConntrack {
    pub fn deletions(&self) -> Vec<ConntrackFilter> {
        self.deleted.lock().unwrap().clone()
    }
}

#[async_trait]
impl ConntrackPort for FakeConntrack {
    async fn resolve_hardware_addr(&self, ip: Ipv4Addr) -> netutils::Result<Option<HardwareAddr>> {
        self.resolve_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.neighbours.lock().unwrap().get(&ip).cloned())
    }

    async fn delete(&self, filter: &ConntrackFilter) -> netutils::Result<usize> {
        self.deleted.lock().unwrap().push(filter.clone());
        if self.failing.lock().unwrap().contains(&filter.ip) {
            return Err(netutils::Error::Command {
                command: "conntrack -D".to_string(),
                stderr: "boom".to_string(),
            });
        }
        Ok(1)
    }

    async fn interfaces(&self) -> netutils::Result<Vec<String>> {
        Ok(self.interfaces.lock().unwrap().clone())
    }
}

fn meta(name: &str, namespace: Option<&str>) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: namespace.map(str::to_string),
        ..ObjectMeta::default()
    }
}

pub fn node(name: &str, zone: &str, subnets: &[&str]) -> Node {
    let mut node = Node {
        metadata: meta(name, None),
        ..Node::default()
    };
    node.annotations_mut()
        .insert(ZONE_NAME_ANNOTATION.to_string(), zone.to_string());
    if !subnets.is_empty() {
        let value = serde_json::json!({ "default": subnets });
        node.annotations_mut()
            .insert(NODE_SUBNETS_ANNOTATION.to_string(), value.to_string());
    }
    node
}

pub fn namespace(name: &str, gateways: &str) -> Namespace {
    let mut ns = Namespace {
        metadata: meta(name, None),
        ..Namespace::default()
    };
    ns.annotations_mut().insert(
        EXTERNAL_GATEWAY_POD_IPS_ANNOTATION.to_string(),
        gateways.to_string(),
    );
    ns
}

pub fn pod(namespace: &str, name: &str, node_name: &str, ip: &str) -> Pod {
    Pod {
        metadata: meta(name, Some(namespace)),
        spec: Some(PodSpec {
            node_name: Some(node_name.to_string()),
            ..PodSpec::default()
        }),
        status: Some(PodStatus {
            phase: Some("Running".to_string()),
            pod_ip: Some(ip.to_string()),
            pod_ips: Some(vec![PodIP {
                ip: Some(ip.to_string()),
            }]),
            ..PodStatus::default()
        }),
    }
}

pub fn service(namespace: &str, name: &str, cluster_ip: &str) -> Service {
    Service {
        metadata: meta(name, Some(namespace)),
        spec: Some(ServiceSpec {
            cluster_ip: Some(cluster_ip.to_string()),
            ..ServiceSpec::default()
        }),
        ..Service::default()
    }
}

pub fn endpoint_slice(namespace: &str, service: &str, addresses: &[&str], port: i32) -> EndpointSlice {
    let mut slice = EndpointSlice {
        metadata: meta(&format!("{service}-abcde"), Some(namespace)),
        address_type: "IPv4".to_string(),
        endpoints: addresses
            .iter()
            .map(|addr| Endpoint {
                addresses: vec![addr.to_string()],
                conditions: Some(EndpointConditions {
                    ready: Some(true),
                    ..EndpointConditions::default()
                }),
                ..Endpoint::default()
            })
            .collect(),
        ports: Some(vec![EndpointPort {
            port: Some(port),
            protocol: Some("UDP".to_string()),
            ..EndpointPort::default()
        }]),
    };
    slice
        .labels_mut()
        .insert(SERVICE_NAME_LABEL.to_string(), service.to_string());
    slice
}
