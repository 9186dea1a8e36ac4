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

use thiserror::Error;

pub mod annotations;
pub mod cluster;
pub mod config;
pub mod consts;
pub mod conntrack;
pub mod heartbeat;
pub mod node;
pub mod southbound;
pub mod wait;
pub mod watch;
pub mod zone;

pub use cluster::{ClusterView, KubeClusterView};
pub use config::{AgentConfig, NodeMode, Timings};
pub use conntrack::{ConntrackReconciler, ExternalRouteSource, NoExternalRoutes};
pub use heartbeat::{Heartbeat, HeartbeatOptions};
pub use node::NodeAgent;
pub use southbound::{ControlPlaneTarget, SouthboundDb};
pub use zone::{MigrationPhase, UpgradeBarrier, ZoneMigrationCoordinator};

#[derive(Error, Debug)]
pub enum Error {
    #[error("kube error: {0}")]
    KubeError(#[source] kube::Error),
    #[error("{0} was modified concurrently")]
    ConflictError(String),
    #[error("invalid configuration: `{0}`")]
    InvalidConfigError(String),
    #[error("invalid annotation {key} on {object}: {reason}")]
    AnnotationError {
        object: String,
        key: String,
        reason: String,
    },
    #[error("southbound database error: {0}")]
    SouthboundError(String),
    #[error("conntrack error: {0}")]
    ConntrackError(#[from] netutils::Error),
    #[error(
        "timed out waiting for the node zone {desired} to match the southbound zone {}: {}",
        .observed.as_deref().unwrap_or("<unknown>"),
        .last_error.as_deref().unwrap_or("no error")
    )]
    ZoneMismatchTimeout {
        desired: String,
        observed: Option<String>,
        last_error: Option<String>,
    },
    #[error("timed out waiting for the interconnect zone to be ready ({pending} pending): {last_error}")]
    BarrierTimeout { pending: String, last_error: String },
    #[error("timed out waiting for {0}")]
    TimeoutError(String),
    #[error("heartbeat lease is not valid: {0}")]
    HeartbeatError(String),
    #[error("{}", join_errors(.0))]
    AggregateError(Vec<Error>),
    #[error("operation cancelled")]
    Cancelled,
}

impl Error {
    /// Collapses a batch of failures into one error, or `Ok` when there were none.
    pub fn aggregate(mut errors: Vec<Error>) -> Result<()> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(Error::AggregateError(errors)),
        }
    }
}

fn join_errors(errors: &[Error]) -> String {
    let messages: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
    format!("[{}]", messages.join(", "))
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct NamespacedName {
    pub name: String,
    pub namespace: String,
}

impl std::fmt::Display for NamespacedName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}
