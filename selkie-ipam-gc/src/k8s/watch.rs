//! Watch tasks keeping the listers warm and feeding deletion events to the
//! controller.

use futures::{StreamExt, TryStreamExt};
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::{
    Api, Client,
    runtime::{WatchStreamExt, reflector::store::Writer, watcher},
};
use tokio::{sync::broadcast, task::JoinHandle};
use tracing::{error, info, warn};

use crate::controller::ControllerHandle;

/// Watches all pods, maintaining the pod lister and forwarding deletions.
pub fn spawn_pod_watch(
    client: Client,
    mut writer: Writer<Pod>,
    handle: ControllerHandle,
    mut shutdown: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let api: Api<Pod> = Api::all(client);
        let mut stream = watcher(api, watcher::Config::default())
            .default_backoff()
            .boxed();
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!(event.name = "k8s.pod_watch_stopped", "pod watch shutting down");
                    return;
                }
                ev = stream.try_next() => match ev {
                    Ok(Some(event)) => {
                        writer.apply_watcher_event(&event);
                        if let watcher::Event::Delete(pod) = &event {
                            handle.on_kubernetes_pod_deleted(pod.clone()).await;
                        }
                    }
                    Ok(None) => {
                        warn!(event.name = "k8s.pod_watch_ended", "pod watch stream ended");
                        return;
                    }
                    Err(e) => {
                        error!(
                            event.name = "k8s.pod_watch_error",
                            error.message = %e,
                            "pod watch error, stream will back off and retry"
                        );
                    }
                }
            }
        }
    })
}

/// Watches all nodes, maintaining the node lister and signalling deletions.
/// Deletions are a pure wakeup for the controller; the content is irrelevant.
pub fn spawn_node_watch(
    client: Client,
    mut writer: Writer<Node>,
    handle: ControllerHandle,
    mut shutdown: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let api: Api<Node> = Api::all(client);
        let mut stream = watcher(api, watcher::Config::default())
            .default_backoff()
            .boxed();
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!(event.name = "k8s.node_watch_stopped", "node watch shutting down");
                    return;
                }
                ev = stream.try_next() => match ev {
                    Ok(Some(event)) => {
                        writer.apply_watcher_event(&event);
                        if let watcher::Event::Delete(_) = &event {
                            handle.on_kubernetes_node_deleted().await;
                        }
                    }
                    Ok(None) => {
                        warn!(event.name = "k8s.node_watch_ended", "node watch stream ended");
                        return;
                    }
                    Err(e) => {
                        error!(
                            event.name = "k8s.node_watch_error",
                            error.message = %e,
                            "node watch error, stream will back off and retry"
                        );
                    }
                }
            }
        }
    })
}
