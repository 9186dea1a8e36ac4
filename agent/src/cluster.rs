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

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::coordination::v1::Lease;
use k8s_openapi::api::core::v1::{Namespace, Node, Pod, Service};
use kube::{
    api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams},
    Client, ResourceExt,
};
use serde_json::json;
use tracing::debug;

use crate::consts::NODE_AGENT_FIELD_MANAGER;
use crate::{Error, Result};

/// Read access to cluster objects plus the few writes the agent performs.
///
/// Lookups of a single object return `Ok(None)` when it does not exist. Lease
/// replacement is optimistic: a stale `resourceVersion` yields
/// [`Error::ConflictError`] and the caller must re-fetch before trying again.
#[async_trait]
pub trait ClusterView: Send + Sync {
    async fn get_node(&self, name: &str) -> Result<Option<Node>>;
    async fn list_nodes(&self) -> Result<Vec<Node>>;
    async fn list_namespaces(&self) -> Result<Vec<Namespace>>;
    /// Pods scheduled to `node_name`, in `namespace` or across all namespaces.
    async fn list_pods(&self, namespace: Option<&str>, node_name: &str) -> Result<Vec<Pod>>;
    async fn list_services(&self) -> Result<Vec<Service>>;
    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>>;

    /// Merges `annotations` into the node; a `None` value removes the key.
    async fn patch_node_annotations(
        &self,
        node_name: &str,
        annotations: &BTreeMap<String, Option<String>>,
    ) -> Result<()>;

    async fn get_lease(&self, namespace: &str, name: &str) -> Result<Option<Lease>>;
    async fn list_leases(&self, namespace: &str) -> Result<Vec<Lease>>;
    async fn create_lease(&self, namespace: &str, lease: &Lease) -> Result<Lease>;
    async fn replace_lease(&self, namespace: &str, lease: &Lease) -> Result<Lease>;
    /// Deleting a lease that is already gone succeeds.
    async fn delete_lease(&self, namespace: &str, name: &str) -> Result<()>;
}

/// [`ClusterView`] talking to the Kubernetes API server.
#[derive(Clone)]
pub struct KubeClusterView {
    client: Client,
}

impl KubeClusterView {
    pub fn new(client: Client) -> Self {
        KubeClusterView { client }
    }

    pub fn client(&self) -> Client {
        self.client.clone()
    }
}

// Returns true if the provided error is a not found error.
pub fn check_if_not_found_err(error: &kube::Error) -> bool {
    matches!(error, kube::Error::Api(response) if response.code == 404)
}

fn check_if_conflict_err(error: &kube::Error) -> bool {
    matches!(error, kube::Error::Api(response) if response.code == 409)
}

fn optional<T>(result: std::result::Result<T, kube::Error>) -> Result<Option<T>> {
    match result {
        Ok(obj) => Ok(Some(obj)),
        Err(err) if check_if_not_found_err(&err) => Ok(None),
        Err(err) => Err(Error::KubeError(err)),
    }
}

#[async_trait]
impl ClusterView for KubeClusterView {
    async fn get_node(&self, name: &str) -> Result<Option<Node>> {
        let api: Api<Node> = Api::all(self.client.clone());
        optional(api.get(name).await)
    }

    async fn list_nodes(&self) -> Result<Vec<Node>> {
        let api: Api<Node> = Api::all(self.client.clone());
        let nodes = api
            .list(&ListParams::default())
            .await
            .map_err(Error::KubeError)?;
        Ok(nodes.items)
    }

    async fn list_namespaces(&self) -> Result<Vec<Namespace>> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let namespaces = api
            .list(&ListParams::default())
            .await
            .map_err(Error::KubeError)?;
        Ok(namespaces.items)
    }

    async fn list_pods(&self, namespace: Option<&str>, node_name: &str) -> Result<Vec<Pod>> {
        let api: Api<Pod> = match namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        };
        let params = ListParams::default().fields(&format!("spec.nodeName={node_name}"));
        let pods = api.list(&params).await.map_err(Error::KubeError)?;
        Ok(pods.items)
    }

    async fn list_services(&self) -> Result<Vec<Service>> {
        let api: Api<Service> = Api::all(self.client.clone());
        let services = api
            .list(&ListParams::default())
            .await
            .map_err(Error::KubeError)?;
        Ok(services.items)
    }

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        optional(api.get(name).await)
    }

    async fn patch_node_annotations(
        &self,
        node_name: &str,
        annotations: &BTreeMap<String, Option<String>>,
    ) -> Result<()> {
        let api: Api<Node> = Api::all(self.client.clone());
        let patch = Patch::Merge(json!({
            "metadata": {
                "annotations": annotations,
            }
        }));
        let params = PatchParams {
            field_manager: Some(NODE_AGENT_FIELD_MANAGER.to_string()),
            ..PatchParams::default()
        };
        api.patch(node_name, &params, &patch)
            .await
            .map_err(Error::KubeError)?;
        debug!(node = node_name, ?annotations, "patched node annotations");
        Ok(())
    }

    async fn get_lease(&self, namespace: &str, name: &str) -> Result<Option<Lease>> {
        let api: Api<Lease> = Api::namespaced(self.client.clone(), namespace);
        optional(api.get(name).await)
    }

    async fn list_leases(&self, namespace: &str) -> Result<Vec<Lease>> {
        let api: Api<Lease> = Api::namespaced(self.client.clone(), namespace);
        let leases = api
            .list(&ListParams::default())
            .await
            .map_err(Error::KubeError)?;
        Ok(leases.items)
    }

    async fn create_lease(&self, namespace: &str, lease: &Lease) -> Result<Lease> {
        let api: Api<Lease> = Api::namespaced(self.client.clone(), namespace);
        api.create(&PostParams::default(), lease)
            .await
            .map_err(Error::KubeError)
    }

    async fn replace_lease(&self, namespace: &str, lease: &Lease) -> Result<Lease> {
        let api: Api<Lease> = Api::namespaced(self.client.clone(), namespace);
        let name = lease.name_any();
        match api.replace(&name, &PostParams::default(), lease).await {
            Ok(lease) => Ok(lease),
            Err(err) if check_if_conflict_err(&err) => {
                Err(Error::ConflictError(format!("lease {namespace}/{name}")))
            }
            Err(err) => Err(Error::KubeError(err)),
        }
    }

    async fn delete_lease(&self, namespace: &str, name: &str) -> Result<()> {
        let api: Api<Lease> = Api::namespaced(self.client.clone(), namespace);
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(err) if check_if_not_found_err(&err) => Ok(()),
            Err(err) => Err(Error::KubeError(err)),
        }
    }
}
