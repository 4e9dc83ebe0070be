//! Datastore feed: watches the Selkie IPAM resources and translates watch
//! events into [`SyncerUpdate`] messages for the controller.
//!
//! Each resource kind runs its own watch task. A shared gate reports
//! `InSync` once every source has completed its initial list; later re-lists
//! diff against the known set and emit deletion tombstones for objects that
//! vanished while the watch was down.

use std::{
    collections::{HashMap, HashSet},
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use futures::{StreamExt, TryStreamExt};
use kube::{
    Api, Client, Resource, ResourceExt,
    runtime::{WatchStreamExt, watcher},
};
use selkie_ipam::model::{
    ClusterInformation, IpPool, IpamBlock, SelkieNode, SyncStatus, SyncerUpdate,
};
use serde::de::DeserializeOwned;
use tokio::{sync::broadcast, task::JoinHandle};
use tracing::{error, info, warn};

use crate::controller::ControllerHandle;

const SOURCE_COUNT: usize = 4;

/// Counts sources that finished their initial list; announces `InSync` once.
#[derive(Clone)]
struct SyncGate {
    synced_sources: Arc<AtomicUsize>,
}

impl SyncGate {
    fn new() -> Self {
        Self {
            synced_sources: Arc::new(AtomicUsize::new(0)),
        }
    }

    async fn source_synced(&self, handle: &ControllerHandle) {
        let synced = self.synced_sources.fetch_add(1, Ordering::SeqCst) + 1;
        if synced == SOURCE_COUNT {
            info!(
                event.name = "syncer.in_sync",
                "all datastore sources listed, reporting InSync"
            );
            handle
                .send_update(SyncerUpdate::Status(SyncStatus::InSync))
                .await;
        }
    }
}

/// Per-source bookkeeping turning watcher events into updates.
struct SourceState<K> {
    known: HashMap<String, K>,
    init_seen: HashSet<String>,
    in_init: bool,
    synced: bool,
}

impl<K> SourceState<K>
where
    K: Resource<DynamicType = ()> + Clone,
{
    fn new() -> Self {
        Self {
            known: HashMap::new(),
            init_seen: HashSet::new(),
            in_init: false,
            synced: false,
        }
    }

    /// Returns the updates to emit for `event` and whether this source just
    /// completed its first list.
    fn handle_event(
        &mut self,
        event: watcher::Event<K>,
        to_upsert: &impl Fn(&K) -> SyncerUpdate,
        to_delete: &impl Fn(&K) -> SyncerUpdate,
    ) -> (Vec<SyncerUpdate>, bool) {
        let mut updates = Vec::new();
        let mut just_synced = false;
        match event {
            watcher::Event::Init => {
                self.in_init = true;
                self.init_seen.clear();
            }
            watcher::Event::InitApply(obj) | watcher::Event::Apply(obj) => {
                let name = obj.name_any();
                if self.in_init {
                    self.init_seen.insert(name.clone());
                }
                updates.push(to_upsert(&obj));
                self.known.insert(name, obj);
            }
            watcher::Event::InitDone => {
                self.in_init = false;
                // Objects that were known before the re-list but absent from
                // it were deleted while the watch was down.
                let vanished: Vec<String> = self
                    .known
                    .keys()
                    .filter(|name| !self.init_seen.contains(*name))
                    .cloned()
                    .collect();
                for name in vanished {
                    if let Some(obj) = self.known.remove(&name) {
                        updates.push(to_delete(&obj));
                    }
                }
                if !self.synced {
                    self.synced = true;
                    just_synced = true;
                }
            }
            watcher::Event::Delete(obj) => {
                self.known.remove(&obj.name_any());
                updates.push(to_delete(&obj));
            }
        }
        (updates, just_synced)
    }
}

fn spawn_source<K>(
    api: Api<K>,
    kind: &'static str,
    handle: ControllerHandle,
    gate: SyncGate,
    mut shutdown: broadcast::Receiver<()>,
    to_upsert: impl Fn(&K) -> SyncerUpdate + Send + Sync + 'static,
    to_delete: impl Fn(&K) -> SyncerUpdate + Send + Sync + 'static,
) -> JoinHandle<()>
where
    K: Resource<DynamicType = ()>
        + Clone
        + DeserializeOwned
        + std::fmt::Debug
        + Send
        + Sync
        + 'static,
{
    tokio::spawn(async move {
        let mut state = SourceState::new();
        let mut stream = watcher(api, watcher::Config::default())
            .default_backoff()
            .boxed();
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!(event.name = "syncer.source_stopped", kind, "datastore watch shutting down");
                    return;
                }
                ev = stream.try_next() => match ev {
                    Ok(Some(event)) => {
                        let (updates, just_synced) =
                            state.handle_event(event, &to_upsert, &to_delete);
                        for update in updates {
                            handle.send_update(update).await;
                        }
                        if just_synced {
                            gate.source_synced(&handle).await;
                        }
                    }
                    Ok(None) => {
                        warn!(event.name = "syncer.source_ended", kind, "datastore watch stream ended");
                        return;
                    }
                    Err(e) => {
                        error!(
                            event.name = "syncer.source_error",
                            kind,
                            error.message = %e,
                            "datastore watch error, stream will back off and retry"
                        );
                    }
                }
            }
        }
    })
}

/// Starts the watch tasks for every datastore resource kind.
pub fn spawn(
    client: Client,
    handle: ControllerHandle,
    shutdown: &broadcast::Sender<()>,
) -> Vec<JoinHandle<()>> {
    let gate = SyncGate::new();
    vec![
        spawn_source(
            Api::<IpamBlock>::all(client.clone()),
            "ipamblock",
            handle.clone(),
            gate.clone(),
            shutdown.subscribe(),
            |block| SyncerUpdate::BlockUpserted(block.spec.clone()),
            |block| SyncerUpdate::BlockDeleted {
                cidr: block.spec.cidr.clone(),
            },
        ),
        spawn_source(
            Api::<IpPool>::all(client.clone()),
            "ippool",
            handle.clone(),
            gate.clone(),
            shutdown.subscribe(),
            |pool| SyncerUpdate::PoolUpserted {
                name: pool.name_any(),
                pool: pool.spec.clone(),
            },
            |pool| SyncerUpdate::PoolDeleted {
                name: pool.name_any(),
            },
        ),
        spawn_source(
            Api::<SelkieNode>::all(client.clone()),
            "selkienode",
            handle.clone(),
            gate.clone(),
            shutdown.subscribe(),
            |node| SyncerUpdate::NodeUpserted(node.clone()),
            |node| SyncerUpdate::NodeDeleted {
                name: node.name_any(),
            },
        ),
        spawn_source(
            Api::<ClusterInformation>::all(client),
            "clusterinformation",
            handle,
            gate,
            shutdown.subscribe(),
            |info| SyncerUpdate::ClusterInformation {
                datastore_ready: info.spec.datastore_ready,
            },
            // Losing the cluster information resource locks the datastore.
            |_| SyncerUpdate::ClusterInformation {
                datastore_ready: Some(false),
            },
        ),
    ]
}

#[cfg(test)]
mod tests {
    use selkie_ipam::model::IpamBlockSpec;

    use super::*;

    fn block(cidr: &str) -> IpamBlock {
        IpamBlock::new(
            &cidr.replace(['.', '/'], "-"),
            IpamBlockSpec {
                cidr: cidr.to_string(),
                ..Default::default()
            },
        )
    }

    fn upsert(b: &IpamBlock) -> SyncerUpdate {
        SyncerUpdate::BlockUpserted(b.spec.clone())
    }

    fn delete(b: &IpamBlock) -> SyncerUpdate {
        SyncerUpdate::BlockDeleted {
            cidr: b.spec.cidr.clone(),
        }
    }

    #[test]
    fn initial_list_reports_sync_once() {
        let mut state = SourceState::new();

        let (updates, synced) = state.handle_event(watcher::Event::Init, &upsert, &delete);
        assert!(updates.is_empty());
        assert!(!synced);

        let (updates, synced) =
            state.handle_event(watcher::Event::InitApply(block("10.0.0.0/26")), &upsert, &delete);
        assert_eq!(updates.len(), 1);
        assert!(!synced);

        let (updates, synced) = state.handle_event(watcher::Event::InitDone, &upsert, &delete);
        assert!(updates.is_empty());
        assert!(synced);

        // A later re-list does not re-announce.
        let (_, synced) = state.handle_event(watcher::Event::Init, &upsert, &delete);
        assert!(!synced);
        let (_, synced) = state.handle_event(watcher::Event::InitDone, &upsert, &delete);
        assert!(!synced);
    }

    #[test]
    fn relist_emits_tombstones_for_vanished_objects() {
        let mut state = SourceState::new();
        state.handle_event(watcher::Event::Init, &upsert, &delete);
        state.handle_event(watcher::Event::InitApply(block("10.0.0.0/26")), &upsert, &delete);
        state.handle_event(watcher::Event::InitApply(block("10.0.0.64/26")), &upsert, &delete);
        state.handle_event(watcher::Event::InitDone, &upsert, &delete);

        // The watch reconnects and only one block remains.
        state.handle_event(watcher::Event::Init, &upsert, &delete);
        state.handle_event(watcher::Event::InitApply(block("10.0.0.0/26")), &upsert, &delete);
        let (updates, _) = state.handle_event(watcher::Event::InitDone, &upsert, &delete);

        assert_eq!(updates.len(), 1);
        match &updates[0] {
            SyncerUpdate::BlockDeleted { cidr } => assert_eq!(cidr, "10.0.0.64/26"),
            other => panic!("expected a block tombstone, got {other:?}"),
        }
    }

    #[test]
    fn live_delete_removes_from_known_set() {
        let mut state = SourceState::new();
        state.handle_event(watcher::Event::Apply(block("10.0.0.0/26")), &upsert, &delete);
        let (updates, _) =
            state.handle_event(watcher::Event::Delete(block("10.0.0.0/26")), &upsert, &delete);
        assert_eq!(updates.len(), 1);
        assert!(state.known.is_empty());
    }
}
