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

//! Lease based liveness between a DPU and its host.
//!
//! The DPU side owns one lease per node and renews it every interval. The host
//! side only reads: it lists every lease in the namespace and reports an error
//! as soon as one of them is missing or expired. Both report through an
//! unbounded channel; the task's [`JoinHandle`] carries the final outcome.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::MicroTime;
use kube::api::ObjectMeta;
use kube::ResourceExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cluster::{check_if_not_found_err, ClusterView};
use crate::config::NodeMode;
use crate::consts::{DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_LEASE_DURATION_SECONDS, DEFAULT_LEASE_NAMESPACE};
use crate::{Error, Result};

#[derive(Clone, Debug)]
pub struct HeartbeatOptions {
    pub holder_identity: String,
    pub namespace: String,
    pub lease_duration_seconds: i32,
    pub interval: Duration,
    pub mode: NodeMode,
}

impl HeartbeatOptions {
    pub fn new(holder_identity: impl Into<String>) -> Self {
        HeartbeatOptions {
            holder_identity: holder_identity.into(),
            namespace: DEFAULT_LEASE_NAMESPACE.to_string(),
            lease_duration_seconds: DEFAULT_LEASE_DURATION_SECONDS,
            interval: DEFAULT_HEARTBEAT_INTERVAL,
            mode: NodeMode::Dpu,
        }
    }

    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn lease_duration_seconds(mut self, seconds: i32) -> Self {
        self.lease_duration_seconds = seconds;
        self
    }

    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn mode(mut self, mode: NodeMode) -> Self {
        self.mode = mode;
        self
    }
}

pub struct Heartbeat {
    view: Arc<dyn ClusterView>,
    node_name: String,
    options: HeartbeatOptions,
    errors: mpsc::UnboundedSender<Result<()>>,
}

impl Heartbeat {
    /// Returns the heartbeat together with the receiving end of its report channel.
    pub fn new(
        view: Arc<dyn ClusterView>,
        node_name: impl Into<String>,
        options: HeartbeatOptions,
    ) -> Result<(Self, mpsc::UnboundedReceiver<Result<()>>)> {
        if options.mode == NodeMode::Full {
            return Err(Error::InvalidConfigError(
                "heartbeat only runs on DPU and DPU host nodes".to_string(),
            ));
        }
        if options.interval.is_zero() || options.lease_duration_seconds <= 0 {
            return Err(Error::InvalidConfigError(
                "heartbeat interval and lease duration must be positive".to_string(),
            ));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        Ok((
            Heartbeat {
                view,
                node_name: node_name.into(),
                options,
                errors: tx,
            },
            rx,
        ))
    }

    /// Spawns the heartbeat loop. The handle resolves after `cancel` fires, with the
    /// outcome of the lease deletion on the DPU side and `Ok` on the host side.
    pub fn start(self, cancel: CancellationToken) -> JoinHandle<Result<()>> {
        tokio::spawn(async move {
            match self.options.mode {
                NodeMode::DpuHost => self.run_host(cancel).await,
                _ => self.run_dpu(cancel).await,
            }
        })
    }

    fn report(&self, result: Result<()>) {
        // nobody listening is fine
        let _ = self.errors.send(result);
    }

    async fn run_dpu(self, cancel: CancellationToken) -> Result<()> {
        info!(node = %self.node_name, namespace = %self.options.namespace, "starting DPU heartbeat");
        let mut current = match self.acquire().await {
            Ok(lease) => Some(lease),
            Err(err) => {
                warn!("failed to acquire heartbeat lease: {err}");
                self.report(Err(err));
                None
            }
        };

        let mut ticker = tokio::time::interval(self.options.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let renewed = match current.as_ref() {
                        Some(lease) => self.renew(lease).await,
                        None => self.acquire().await,
                    };
                    match renewed {
                        Ok(lease) => current = Some(lease),
                        Err(err) => {
                            warn!("failed to renew heartbeat lease: {err}");
                            self.report(Err(err));
                        }
                    }
                }
            }
        }

        info!(node = %self.node_name, "stopping DPU heartbeat, deleting lease");
        self.view
            .delete_lease(&self.options.namespace, &self.node_name)
            .await
    }

    async fn run_host(self, cancel: CancellationToken) -> Result<()> {
        info!(namespace = %self.options.namespace, "starting DPU host heartbeat check");
        let mut ticker = tokio::time::interval(self.options.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("stopping DPU host heartbeat check");
                    return Ok(());
                }
                _ = ticker.tick() => {
                    let result = validate_heartbeat(self.view.as_ref(), &self.options.namespace).await;
                    if let Err(err) = &result {
                        warn!("{err}");
                    }
                    self.report(result);
                }
            }
        }
    }

    /// Adopts the node's existing lease, renewing it in place, or creates a new one.
    pub async fn acquire(&self) -> Result<Lease> {
        let ns = &self.options.namespace;
        match self.view.get_lease(ns, &self.node_name).await? {
            Some(existing) => {
                debug!(node = %self.node_name, "adopting existing heartbeat lease");
                self.renew(&existing).await
            }
            None => {
                let lease = self.new_lease(Utc::now());
                self.view.create_lease(ns, &lease).await
            }
        }
    }

    /// Advances `renewTime` of `current`, keeping its `acquireTime`. A conflict
    /// re-fetches the lease and retries once; a vanished lease is recreated with the
    /// original acquisition time.
    pub async fn renew(&self, current: &Lease) -> Result<Lease> {
        let ns = &self.options.namespace;
        match self.view.replace_lease(ns, &self.renewed(current)).await {
            Ok(lease) => Ok(lease),
            Err(Error::ConflictError(what)) => {
                debug!("{what} changed, re-fetching before renewal");
                match self.view.get_lease(ns, &self.node_name).await? {
                    Some(latest) => self.view.replace_lease(ns, &self.renewed(&latest)).await,
                    None => self.recreate(current).await,
                }
            }
            Err(Error::KubeError(err)) if check_if_not_found_err(&err) => self.recreate(current).await,
            Err(err) => Err(err),
        }
    }

    async fn recreate(&self, previous: &Lease) -> Result<Lease> {
        let mut lease = self.new_lease(Utc::now());
        if let (Some(spec), Some(acquired)) = (lease.spec.as_mut(), acquire_time(previous)) {
            spec.acquire_time = Some(MicroTime(acquired));
        }
        self.view.create_lease(&self.options.namespace, &lease).await
    }

    fn new_lease(&self, now: DateTime<Utc>) -> Lease {
        Lease {
            metadata: ObjectMeta {
                name: Some(self.node_name.clone()),
                namespace: Some(self.options.namespace.clone()),
                ..ObjectMeta::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: Some(self.options.holder_identity.clone()),
                lease_duration_seconds: Some(self.options.lease_duration_seconds),
                acquire_time: Some(MicroTime(now)),
                renew_time: Some(MicroTime(now)),
                ..LeaseSpec::default()
            }),
        }
    }

    fn renewed(&self, current: &Lease) -> Lease {
        let now = Utc::now();
        let mut lease = current.clone();
        let spec = lease.spec.get_or_insert_with(LeaseSpec::default);
        spec.holder_identity = Some(self.options.holder_identity.clone());
        spec.lease_duration_seconds = Some(self.options.lease_duration_seconds);
        spec.acquire_time.get_or_insert(MicroTime(now));
        spec.renew_time = Some(MicroTime(next_renew_time(
            spec.renew_time.as_ref().map(|t| t.0),
            now,
        )));
        lease
    }
}

fn acquire_time(lease: &Lease) -> Option<DateTime<Utc>> {
    lease.spec.as_ref()?.acquire_time.as_ref().map(|t| t.0)
}

/// `now`, unless that would not move past `previous`.
pub fn next_renew_time(previous: Option<DateTime<Utc>>, now: DateTime<Utc>) -> DateTime<Utc> {
    match previous {
        Some(prev) if now <= prev => prev + chrono::Duration::microseconds(1),
        _ => now,
    }
}

/// Time after which the lease is no longer live, if it carries enough to tell.
pub fn lease_expiry(lease: &Lease) -> Option<DateTime<Utc>> {
    let spec = lease.spec.as_ref()?;
    let renewed = spec.renew_time.as_ref()?.0;
    let duration = spec.lease_duration_seconds?;
    Some(renewed + chrono::Duration::seconds(i64::from(duration)))
}

/// Checks that `leases` is non-empty and that none of them has expired at `now`.
pub fn check_leases(leases: &[Lease], now: DateTime<Utc>) -> Result<()> {
    if leases.is_empty() {
        return Err(Error::HeartbeatError("no heartbeat leases found".to_string()));
    }
    for lease in leases {
        match lease_expiry(lease) {
            Some(expiry) if expiry > now => {}
            Some(expiry) => {
                return Err(Error::HeartbeatError(format!(
                    "lease {} expired at {expiry}",
                    lease.name_any()
                )))
            }
            None => {
                return Err(Error::HeartbeatError(format!(
                    "lease {} has no renew time or duration",
                    lease.name_any()
                )))
            }
        }
    }
    Ok(())
}

pub async fn validate_heartbeat(view: &dyn ClusterView, namespace: &str) -> Result<()> {
    let leases = view.list_leases(namespace).await?;
    check_leases(&leases, Utc::now())
}

/// Whether every lease in `namespace` is live. Lookup failures count as invalid.
pub async fn is_heartbeat_valid(view: &dyn ClusterView, namespace: &str) -> bool {
    validate_heartbeat(view, namespace).await.is_ok()
}
