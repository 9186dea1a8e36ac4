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

use agent::config::Options;
use agent::southbound::{OvnSbctl, OvsRemoteTarget};
use agent::*;

use anyhow::Context;
use clap::Parser;
use kube::Client;
use netutils::SystemConntrack;
use tokio::signal::unix::{signal, SignalKind};
use tracing::*;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let opts = Options::parse();
    let config = AgentConfig::try_from(opts).context("invalid configuration")?;

    let client = Client::try_default()
        .await
        .context("failed to create kube Client")?;

    let southbound = Arc::new(OvnSbctl::new(config.southbound_remote.clone()));
    let target = Arc::new(OvsRemoteTarget::new(config.southbound_remote.clone()));
    let mut agent = NodeAgent::new(
        config,
        Arc::new(KubeClusterView::new(client.clone())),
        southbound,
        target,
        Arc::new(SystemConntrack::new()),
        Arc::new(NoExternalRoutes),
    )
    .with_client(client);

    // installed before startup so the zone wait and the barrier observe it
    let mut terminate =
        signal(SignalKind::terminate()).context("failed to listen for SIGTERM")?;
    let cancel = agent.cancellation_token();
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = terminate.recv() => {}
        }
        info!("shutdown signal received");
        cancel.cancel();
    });

    run(&mut agent).await;

    if let Some(mut reports) = agent.take_heartbeat_reports() {
        tokio::spawn(async move {
            while let Some(report) = reports.recv().await {
                if let Err(err) = report {
                    warn!("heartbeat: {err}");
                }
            }
        });
    }

    agent.cancellation_token().cancelled().await;
    info!("shutting down");
    agent.shutdown().await?;
    Ok(())
}

pub async fn run(agent: &mut NodeAgent) {
    match agent.start().await {
        Ok(()) => {}
        // interrupted by a shutdown signal, shutdown still runs
        Err(Error::Cancelled) => info!("node agent startup interrupted"),
        Err(error) => {
            error!("failed to start node agent: {error}");
            std::process::exit(1);
        }
    }
}
