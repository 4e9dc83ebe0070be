//! Selkie IPAM garbage collector.
//!
//! Watches the Selkie IPAM datastore and the Kubernetes API, reclaiming IP
//! addresses whose backing pods are gone and releasing block affinities left
//! behind by deleted nodes or long-empty blocks.

mod cli;
mod config;
mod controller;
mod error;
mod k8s;
mod metrics;
mod state;
mod syncer;

use std::sync::{Arc, atomic::Ordering};

use clap::Parser;
use error::{GcError, Result};
use kube::{Client, runtime::reflector};
use selkie_ipam::KubernetesIpamClient;
use tokio::{signal, sync::broadcast};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, filter::LevelFilter};

use crate::{
    cli::Cli,
    config::Conf,
    controller::IpamController,
    k8s::{ApiPodQuerier, Listers, watch},
    metrics::{HealthState, registry},
};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let conf = Conf::load(cli.config.as_deref(), cli.log_level.as_deref())?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::from_level(conf.log_level).into())
                .from_env_lossy(),
        )
        .init();
    info!(
        event.name = "gc.starting",
        version = env!("CARGO_PKG_VERSION"),
        "starting selkie-ipam-gc"
    );

    registry::init_registry();

    let client = Client::try_default().await?;
    let (shutdown_tx, _) = broadcast::channel(4);

    // Reflector-backed listers for the resources consulted during scans.
    let (pod_store, pod_writer) = reflector::store();
    let (node_store, node_writer) = reflector::store();
    let listers = Listers {
        pods: pod_store,
        nodes: node_store,
    };

    let ipam = Arc::new(KubernetesIpamClient::new(client.clone()));
    let pod_querier = Arc::new(ApiPodQuerier::new(client.clone()));
    let (mut controller, handle) =
        IpamController::new(conf.controller(), ipam, listers.clone(), pod_querier);

    // Kubernetes watches feed the listers and the deletion channels; the
    // datastore watches feed the syncer channel.
    watch::spawn_pod_watch(
        client.clone(),
        pod_writer,
        handle.clone(),
        shutdown_tx.subscribe(),
    );
    watch::spawn_node_watch(
        client.clone(),
        node_writer,
        handle.clone(),
        shutdown_tx.subscribe(),
    );
    syncer::spawn(client.clone(), handle.clone(), &shutdown_tx);

    let health = HealthState::default();
    if conf.metrics.enabled {
        let listen_addr = conf.metrics.listen_addr.clone();
        let server_health = health.clone();
        let server_shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move {
            if let Err(e) = metrics::server::serve(&listen_addr, server_health, server_shutdown).await
            {
                error!(
                    event.name = "metrics.server_failed",
                    error.message = %e,
                    "metrics server exited"
                );
            }
        });
    }

    // Scans consult the listers, so wait for their initial sync before the
    // controller starts acting on datastore state.
    listers
        .pods
        .wait_until_ready()
        .await
        .map_err(|e| GcError::CacheSync(e.to_string()))?;
    listers
        .nodes
        .wait_until_ready()
        .await
        .map_err(|e| GcError::CacheSync(e.to_string()))?;
    health.caches_synced.store(true, Ordering::Relaxed);
    info!(event.name = "gc.caches_synced", "kubernetes caches synced");

    let controller_shutdown = shutdown_tx.subscribe();
    let controller_task = tokio::spawn(async move { controller.run(controller_shutdown).await });

    signal::ctrl_c().await?;
    info!(event.name = "gc.stopping", "received shutdown signal");
    let _ = shutdown_tx.send(());
    let _ = controller_task.await;
    Ok(())
}
