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

use std::collections::{BTreeMap, BTreeSet, HashMap};

use k8s_openapi::api::core::v1::{Namespace, Node};
use kube::ResourceExt;
use serde::Deserialize;

use crate::cluster::ClusterView;
use crate::consts::*;
use crate::{Error, Result};

// Returns the zone recorded on the node, or the default zone when unset.
pub fn node_zone(node: &Node) -> String {
    node.annotations()
        .get(ZONE_NAME_ANNOTATION)
        .cloned()
        .unwrap_or_else(|| DEFAULT_ZONE.to_string())
}

pub fn has_node_migrated_zone(node: &Node) -> bool {
    node.annotations().contains_key(ZONE_MIGRATED_ANNOTATION)
}

pub fn no_host_subnet(node: &Node) -> bool {
    node.labels().contains_key(NO_HOST_SUBNET_LABEL)
}

pub fn is_dpu_host(node: &Node) -> bool {
    node.labels().contains_key(DPU_HOST_LABEL)
}

pub fn dpu_node_ready(node: &Node) -> bool {
    node.annotations().contains_key(DPU_NODE_READY_ANNOTATION)
}

#[derive(Deserialize)]
#[serde(untagged)]
enum SubnetValue {
    Single(String),
    Multiple(Vec<String>),
}

/// Host subnets allocated to the node on the default network. `Ok(None)` means the
/// annotation (or the default network entry) has not been written yet.
pub fn node_subnets(node: &Node) -> Result<Option<Vec<String>>> {
    let Some(raw) = node.annotations().get(NODE_SUBNETS_ANNOTATION) else {
        return Ok(None);
    };
    let parsed: HashMap<String, SubnetValue> =
        serde_json::from_str(raw).map_err(|e| Error::AnnotationError {
            object: format!("node {}", node.name_any()),
            key: NODE_SUBNETS_ANNOTATION.to_string(),
            reason: e.to_string(),
        })?;
    Ok(parsed.get(DEFAULT_NETWORK_NAME).map(|value| match value {
        SubnetValue::Single(subnet) => vec![subnet.clone()],
        SubnetValue::Multiple(subnets) => subnets.clone(),
    }))
}

pub fn is_ipv6_cidr(cidr: &str) -> bool {
    cidr.split('/').next().is_some_and(|addr| addr.contains(':'))
}

// Name of the logical switch port backing a pod.
pub fn logical_port_name(namespace: &str, name: &str) -> String {
    format!("{namespace}_{name}")
}

fn split_ips(value: Option<&String>) -> impl Iterator<Item = String> + '_ {
    value
        .into_iter()
        .flat_map(|v| v.split(','))
        .map(|ip| ip.trim().to_string())
        .filter(|ip| !ip.is_empty())
}

/// Union of the IPs listed in both external gateway annotations of a namespace.
pub fn external_gateway_ips(namespace: &Namespace) -> BTreeSet<String> {
    let annotations = namespace.annotations();
    split_ips(annotations.get(EXTERNAL_GATEWAY_POD_IPS_ANNOTATION))
        .chain(split_ips(annotations.get(ROUTING_EXTERNAL_GWS_ANNOTATION)))
        .collect()
}

pub fn has_external_gateway_annotations(namespace: &Namespace) -> bool {
    let annotations = namespace.annotations();
    annotations.contains_key(EXTERNAL_GATEWAY_POD_IPS_ANNOTATION)
        || annotations.contains_key(ROUTING_EXTERNAL_GWS_ANNOTATION)
}

// Any difference in either annotation counts; working out whether a gateway was
// actually removed is left to the reconciliation itself.
pub fn ex_gateway_annotations_changed(old: &Namespace, new: &Namespace) -> bool {
    [
        EXTERNAL_GATEWAY_POD_IPS_ANNOTATION,
        ROUTING_EXTERNAL_GWS_ANNOTATION,
    ]
    .iter()
    .any(|key| old.annotations().get(*key) != new.annotations().get(*key))
}

/// Batches node annotation changes into a single merge patch.
pub struct NodeAnnotator<'a> {
    view: &'a dyn ClusterView,
    node_name: String,
    changes: BTreeMap<String, Option<String>>,
}

impl<'a> NodeAnnotator<'a> {
    pub fn new(view: &'a dyn ClusterView, node_name: impl Into<String>) -> Self {
        NodeAnnotator {
            view,
            node_name: node_name.into(),
            changes: BTreeMap::new(),
        }
    }

    pub fn set(&mut self, key: &str, value: impl Into<String>) -> &mut Self {
        self.changes.insert(key.to_string(), Some(value.into()));
        self
    }

    pub fn delete(&mut self, key: &str) -> &mut Self {
        self.changes.insert(key.to_string(), None);
        self
    }

    pub async fn run(&mut self) -> Result<()> {
        if self.changes.is_empty() {
            return Ok(());
        }
        self.view
            .patch_node_annotations(&self.node_name, &self.changes)
            .await?;
        self.changes.clear();
        Ok(())
    }
}
