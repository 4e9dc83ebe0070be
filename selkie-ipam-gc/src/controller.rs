//! The IPAM reconciliation controller.
//!
//! A single task owns every cache and is woken through bounded channels:
//! datastore syncer updates, Kubernetes node/pod deletions, a coalescing sync
//! kick and a periodic ticker. Nothing else mutates controller state, which
//! keeps the whole reconciliation loop lock free.

mod retry;
pub(crate) mod sync;
#[cfg(test)]
pub(crate) mod testutil;

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

use k8s_openapi::api::core::v1::Pod;
use selkie_ipam::{
    IpamClient,
    model::{IpamBlockSpec, SelkieNode, SyncStatus, SyncerUpdate, k8s_node_name},
};
use tokio::{
    sync::{broadcast, mpsc, oneshot},
    time::MissedTickBehavior,
};
use tracing::{debug, info, warn};

use crate::{
    k8s::{Listers, PodQuerier},
    metrics::registry,
    state::{
        AllocationState, BlockReleaseTracker, HandleTracker, PoolManager,
        allocation::Allocation, pools::UNKNOWN_POOL_LABEL,
    },
};

pub use retry::RetryController;

/// Capacity of the bursty input channels. Producers block when a channel
/// fills up, which is acceptable back-pressure: they are event-loop workers
/// themselves.
pub const BATCH_UPDATE_SIZE: usize = 256;

/// Label carried by nodes mid-migration from another network provider. A
/// node whose label value is anything but [`MIGRATION_VALUE_MIGRATED`] must
/// keep its block affinities.
pub const MIGRATION_LABEL: &str = "selkie.io/node-network-during-migration";
pub const MIGRATION_VALUE_MIGRATED: &str = "selkie";

#[derive(Clone, Debug)]
pub struct ControllerConfig {
    /// Dwell time before a candidate leak is confirmed, and before an empty
    /// block's affinity is released. `None` disables the candidacy stage.
    pub leak_grace_period: Option<Duration>,

    /// How long to keep draining a deletion channel after the first event
    /// before processing the batch.
    pub consolidation_window: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            leak_grace_period: Some(Duration::from_secs(15 * 60)),
            consolidation_window: Duration::from_secs(1),
        }
    }
}

/// Pause command used by tests to quiesce the loop while inspecting state.
pub struct PauseRequest {
    ack: oneshot::Sender<()>,
    resume: oneshot::Receiver<()>,
}

pub struct PauseGuard {
    resume_tx: oneshot::Sender<()>,
}

impl PauseGuard {
    pub fn resume(self) {
        let _ = self.resume_tx.send(());
    }
}

/// Cloneable producer side of the controller's channels.
#[derive(Clone)]
pub struct ControllerHandle {
    syncer_tx: mpsc::Sender<SyncerUpdate>,
    node_deletion_tx: mpsc::Sender<()>,
    pod_deletion_tx: mpsc::Sender<Pod>,
    sync_tx: mpsc::Sender<()>,
    pause_tx: mpsc::Sender<PauseRequest>,
}

impl ControllerHandle {
    /// Forwards one datastore update to the controller.
    pub async fn send_update(&self, update: SyncerUpdate) {
        let _ = self.syncer_tx.send(update).await;
    }

    /// Signals that a Kubernetes node was deleted. Content is irrelevant;
    /// any deletion forces a full scan.
    pub async fn on_kubernetes_node_deleted(&self) {
        let _ = self.node_deletion_tx.send(()).await;
    }

    pub async fn on_kubernetes_pod_deleted(&self, pod: Pod) {
        let _ = self.pod_deletion_tx.send(pod).await;
    }

    /// Requests a sync. The kick channel holds a single token, so repeated
    /// kicks coalesce into one sync.
    pub fn kick(&self) {
        let _ = self.sync_tx.try_send(());
    }

    /// Pauses the main loop until the returned guard is resumed. Testing
    /// affordance: lets tests read controller state without racing the loop.
    pub async fn pause(&self) -> PauseGuard {
        let (ack_tx, ack_rx) = oneshot::channel();
        let (resume_tx, resume_rx) = oneshot::channel();
        let _ = self
            .pause_tx
            .send(PauseRequest {
                ack: ack_tx,
                resume: resume_rx,
            })
            .await;
        let _ = ack_rx.await;
        PauseGuard { resume_tx }
    }
}

struct Channels {
    syncer_rx: mpsc::Receiver<SyncerUpdate>,
    node_deletion_rx: mpsc::Receiver<()>,
    pod_deletion_rx: mpsc::Receiver<Pod>,
    sync_rx: mpsc::Receiver<()>,
    pause_rx: mpsc::Receiver<PauseRequest>,
}

pub struct IpamController {
    pub(crate) config: ControllerConfig,
    pub(crate) ipam: Arc<dyn IpamClient>,
    pub(crate) listers: Listers,
    pub(crate) pod_querier: Arc<dyn PodQuerier>,

    pub(crate) sync_status: SyncStatus,
    pub(crate) datastore_ready: bool,

    /// Maps Selkie node names to their Kubernetes counterparts. Nodes not
    /// orchestrated by Kubernetes map to `""`.
    pub(crate) kubernetes_nodes_by_selkie_name: HashMap<String, String>,

    /// Raw block storage, keyed by CIDR.
    pub(crate) all_blocks: HashMap<String, IpamBlockSpec>,

    pub(crate) allocation_state: AllocationState,
    pub(crate) handle_tracker: HandleTracker,

    /// Ids of allocations confirmed as leaks, awaiting release.
    pub(crate) confirmed_leaks: HashSet<String>,

    /// Together these decide when block affinities are redundant.
    pub(crate) nodes_by_block: HashMap<String, String>,
    pub(crate) blocks_by_node: HashMap<String, HashSet<String>>,

    /// Affine blocks with no allocations, candidates for affinity release.
    pub(crate) empty_blocks: HashMap<String, String>,

    /// Handle-less allocations per block. These can never be reclaimed here;
    /// surfaced through a gauge so operators notice them.
    pub(crate) missing_handles_by_block: HashMap<String, u64>,

    pub(crate) pool_manager: PoolManager,
    pub(crate) block_release_tracker: BlockReleaseTracker,

    pub(crate) full_sync_required: bool,
    pub(crate) retry: RetryController,
    pub(crate) sync_count: u64,

    sync_tx: mpsc::Sender<()>,
    channels: Option<Channels>,
}

impl IpamController {
    pub fn new(
        config: ControllerConfig,
        ipam: Arc<dyn IpamClient>,
        listers: Listers,
        pod_querier: Arc<dyn PodQuerier>,
    ) -> (Self, ControllerHandle) {
        let (syncer_tx, syncer_rx) = mpsc::channel(BATCH_UPDATE_SIZE);
        let (node_deletion_tx, node_deletion_rx) = mpsc::channel(BATCH_UPDATE_SIZE);
        let (pod_deletion_tx, pod_deletion_rx) = mpsc::channel(BATCH_UPDATE_SIZE);
        let (sync_tx, sync_rx) = mpsc::channel(1);
        let (pause_tx, pause_rx) = mpsc::channel(1);

        let handle = ControllerHandle {
            syncer_tx,
            node_deletion_tx,
            pod_deletion_tx,
            sync_tx: sync_tx.clone(),
            pause_tx,
        };

        let controller = Self {
            block_release_tracker: BlockReleaseTracker::new(config.leak_grace_period),
            retry: RetryController::new(sync_tx.clone()),
            config,
            ipam,
            listers,
            pod_querier,
            sync_status: SyncStatus::WaitForDatastore,
            datastore_ready: true,
            kubernetes_nodes_by_selkie_name: HashMap::new(),
            all_blocks: HashMap::new(),
            allocation_state: AllocationState::default(),
            handle_tracker: HandleTracker::default(),
            confirmed_leaks: HashSet::new(),
            nodes_by_block: HashMap::new(),
            blocks_by_node: HashMap::new(),
            empty_blocks: HashMap::new(),
            missing_handles_by_block: HashMap::new(),
            pool_manager: PoolManager::default(),
            full_sync_required: false,
            sync_count: 0,
            sync_tx,
            channels: Some(Channels {
                syncer_rx,
                node_deletion_rx,
                pod_deletion_rx,
                sync_rx,
                pause_rx,
            }),
        };
        (controller, handle)
    }

    /// Main worker loop. Waits for something to wake it, consolidates bursts
    /// into batches and triggers syncs.
    pub async fn run(&mut self, mut shutdown: broadcast::Receiver<()>) {
        let mut ch = self
            .channels
            .take()
            .expect("controller run() called twice");

        let period = self.sync_period();
        info!(
            event.name = "ipam.controller_started",
            period_secs = period.as_secs(),
            "will run periodic IPAM sync"
        );
        let mut ticker =
            tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                Some(()) = ch.node_deletion_rx.recv() => {
                    let batch =
                        drain_window(&mut ch.node_deletion_rx, (), self.config.consolidation_window)
                            .await;
                    debug!(
                        event.name = "ipam.node_deletion_batch",
                        num = batch.len(),
                        "consolidated node deletion events"
                    );
                    // Deleted nodes must have their affinities released, and
                    // only a full scan picks up nodes with no allocations.
                    self.full_scan_next_sync("batch node deletion");
                    self.kick();
                }
                Some(pod) = ch.pod_deletion_rx.recv() => {
                    let batch =
                        drain_window(&mut ch.pod_deletion_rx, pod, self.config.consolidation_window)
                            .await;
                    debug!(
                        event.name = "ipam.pod_deletion_batch",
                        num = batch.len(),
                        "consolidated pod deletion events"
                    );
                    for pod in &batch {
                        self.allocation_state.mark_dirty_pod_deleted(pod);
                    }
                    self.kick();
                }
                Some(update) = ch.syncer_rx.recv() => {
                    let batch = drain_ready(&mut ch.syncer_rx, update);
                    for update in batch {
                        self.handle_update(update);
                    }
                    self.kick();
                }
                _ = ticker.tick() => {
                    self.full_scan_next_sync("periodic sync");
                    debug!(event.name = "ipam.periodic_sync", "periodic IPAM sync");
                    if let Err(e) = self.sync_ipam().await {
                        warn!(
                            event.name = "ipam.periodic_sync_failed",
                            error.message = %e,
                            "periodic IPAM sync failed"
                        );
                    }
                }
                Some(()) = ch.sync_rx.recv() => {
                    debug!(event.name = "ipam.triggered_sync", "triggered IPAM sync");
                    match self.sync_ipam().await {
                        Ok(()) => self.retry.success(),
                        Err(e) => {
                            // The retry controller guarantees at most one
                            // pending retry and manages backoff.
                            warn!(
                                event.name = "ipam.sync_failed",
                                error.message = %e,
                                "error syncing IPAM data"
                            );
                            self.retry.schedule_retry();
                        }
                    }
                    self.update_metrics();
                }
                Some(req) = ch.pause_rx.recv() => {
                    warn!(
                        event.name = "ipam.loop_paused",
                        "pausing main loop so tests can read state"
                    );
                    let _ = req.ack.send(());
                    let _ = req.resume.await;
                }
                _ = shutdown.recv() => {
                    info!(event.name = "ipam.controller_stopped", "controller shutting down");
                    return;
                }
            }
        }
    }

    fn sync_period(&self) -> Duration {
        let mut period = Duration::from_secs(5 * 60);
        if let Some(grace) = self.config.leak_grace_period {
            if !grace.is_zero() {
                period = period.max(grace / 2);
            }
        }
        period
    }

    pub(crate) fn kick(&self) {
        let _ = self.sync_tx.try_send(());
    }

    /// Marks the next sync as a full scan of all IPAM data.
    pub(crate) fn full_scan_next_sync(&mut self, reason: &str) {
        if self.full_sync_required {
            debug!(
                event.name = "ipam.full_sync_pending",
                reason = %reason,
                "full resync already pending"
            );
            return;
        }
        self.full_sync_required = true;
        info!(
            event.name = "ipam.full_sync_marked",
            reason = %reason,
            "marking IPAM for full resync"
        );
    }

    /// Dispatches one datastore update to its handler.
    pub(crate) fn handle_update(&mut self, update: SyncerUpdate) {
        match update {
            SyncerUpdate::Status(status) => {
                self.sync_status = status;
                if status == SyncStatus::InSync {
                    info!(
                        event.name = "ipam.in_sync",
                        "syncer is InSync, kicking sync channel"
                    );
                    self.kick();
                }
            }
            SyncerUpdate::BlockUpserted(block) => self.on_block_updated(block),
            SyncerUpdate::BlockDeleted { cidr } => self.on_block_deleted(&cidr),
            SyncerUpdate::NodeUpserted(node) => self.on_node_updated(&node),
            SyncerUpdate::NodeDeleted { name } => self.on_node_deleted(&name),
            SyncerUpdate::PoolUpserted { name, pool } => self.on_pool_updated(name, pool),
            SyncerUpdate::PoolDeleted { name } => self.on_pool_deleted(&name),
            SyncerUpdate::ClusterInformation { datastore_ready } => {
                if let Some(ready) = datastore_ready {
                    self.datastore_ready = ready;
                }
            }
        }
    }

    /// Ingests a block upsert: refreshes the affinity indices, diffs the
    /// block's allocations against the cache and updates empty-block
    /// candidacy.
    fn on_block_updated(&mut self, block: IpamBlockSpec) {
        let block_cidr = block.cidr.clone();
        debug!(event.name = "ipam.block_updated", block = %block_cidr, "received block update");

        // Track the affine node even when the block holds no allocations, so
        // stale affinities of empty blocks can be found and released.
        let mut affine_node = String::new();
        match block.affine_host() {
            Some(host) => {
                affine_node = host.to_string();
                self.nodes_by_block
                    .insert(block_cidr.clone(), affine_node.clone());
                self.blocks_by_node
                    .entry(affine_node.clone())
                    .or_default()
                    .insert(block_cidr.clone());
            }
            None if block.affinity.is_none() => {
                // Affinity may have been removed.
                if let Some(node) = self.nodes_by_block.remove(&block_cidr) {
                    if let Some(blocks) = self.blocks_by_node.get_mut(&node) {
                        blocks.remove(&block_cidr);
                    }
                }
            }
            None => {}
        }

        let mut num_allocations = 0;
        let mut missing_handles = 0u64;
        let mut current: HashSet<String> = HashSet::new();
        for (ordinal, slot) in block.allocations.iter().enumerate() {
            let Some(attr_index) = slot else { continue };
            num_allocations += 1;
            let Some(attr) = block.attributes.get(*attr_index as usize) else {
                warn!(
                    event.name = "ipam.block_malformed",
                    block = %block_cidr,
                    ordinal,
                    "allocation references a missing attribute, dropping"
                );
                continue;
            };
            // Without a handle the IP can never be released here.
            let Some(handle) = attr.handle.clone() else {
                missing_handles += 1;
                continue;
            };
            let Some(ip) = block.ordinal_to_ip(ordinal as u32) else {
                warn!(
                    event.name = "ipam.block_malformed",
                    block = %block_cidr,
                    ordinal,
                    "allocation ordinal outside the block CIDR, dropping"
                );
                continue;
            };

            let alloc = Allocation::new(
                ip.to_string(),
                handle,
                attr.secondary.clone(),
                block.sequence_number_for_ordinal(ordinal as u32),
                block_cidr.clone(),
            );
            current.insert(alloc.id());

            if self.allocation_state.contains(&alloc.id()) {
                continue;
            }
            debug!(
                event.name = "ipam.new_allocation",
                ip = %alloc.ip,
                handle = %alloc.handle,
                block = %block_cidr,
                "new IP allocation"
            );
            self.handle_tracker.set_allocation(&alloc);
            self.allocation_state.allocate(alloc);
        }

        if missing_handles > 0
            && self.missing_handles_by_block.get(&block_cidr) != Some(&missing_handles)
        {
            warn!(
                event.name = "ipam.allocations_missing_handle",
                block = %block_cidr,
                num = missing_handles,
                "block has allocations without a handle; they cannot be reclaimed"
            );
        }
        if missing_handles > 0 {
            self.missing_handles_by_block
                .insert(block_cidr.clone(), missing_handles);
        } else {
            self.missing_handles_by_block.remove(&block_cidr);
        }

        // Empty-block candidacy. Blocks without an affinity clean themselves
        // up when their last address is freed, so only affine blocks are
        // tracked.
        self.empty_blocks.remove(&block_cidr);
        if !affine_node.is_empty() && num_allocations == 0 {
            self.empty_blocks
                .insert(block_cidr.clone(), affine_node);
        } else if !affine_node.is_empty() {
            self.block_release_tracker.mark_in_use(&block_cidr);
        }

        // Drop allocations that the block no longer carries.
        for id in self.allocation_state.ids_for_block(&block_cidr) {
            if current.contains(&id) {
                continue;
            }
            if let Some(released) = self.allocation_state.release(&id) {
                self.handle_tracker.remove_allocation(&released);
            }
            self.confirmed_leaks.remove(&id);
        }

        self.pool_manager.on_block_updated(&block_cidr);
        self.all_blocks.insert(block_cidr, block);
    }

    fn on_block_deleted(&mut self, block_cidr: &str) {
        info!(event.name = "ipam.block_deleted", block = %block_cidr, "received block delete");

        for id in self.allocation_state.ids_for_block(block_cidr) {
            if let Some(released) = self.allocation_state.release(&id) {
                self.handle_tracker.remove_allocation(&released);
            }
            self.confirmed_leaks.remove(&id);
        }

        if let Some(node) = self.nodes_by_block.remove(block_cidr) {
            if let Some(blocks) = self.blocks_by_node.get_mut(&node) {
                blocks.remove(block_cidr);
            }
        }
        self.all_blocks.remove(block_cidr);
        self.empty_blocks.remove(block_cidr);
        self.missing_handles_by_block.remove(block_cidr);

        self.block_release_tracker.on_block_deleted(block_cidr);
        self.pool_manager.on_block_deleted(block_cidr);
    }

    /// Maintains the Selkie node → Kubernetes node mapping. Every known
    /// Selkie node gets an entry; non-Kubernetes nodes map to `""`.
    fn on_node_updated(&mut self, node: &SelkieNode) {
        let Some(name) = node.metadata.name.clone() else {
            warn!(event.name = "ipam.node_unnamed", "dropping node update without a name");
            return;
        };
        let knode = match k8s_node_name(node) {
            Ok(k) => k,
            Err(e) => {
                info!(
                    event.name = "ipam.node_not_kubernetes",
                    error.message = %e,
                    "unable to get corresponding kubernetes node name"
                );
                String::new()
            }
        };
        match self.kubernetes_nodes_by_selkie_name.get(&name).cloned() {
            None => {
                debug!(
                    event.name = "ipam.node_mapping_added",
                    node = %name,
                    k8s_node = %knode,
                    "adding selkie node to kubernetes node mapping"
                );
                self.kubernetes_nodes_by_selkie_name.insert(name, knode);
            }
            Some(current) if current != knode => {
                warn!(
                    event.name = "ipam.node_mapping_changed",
                    node = %name,
                    k8s_node = %knode,
                    previous = %current,
                    "updating selkie node to kubernetes node mapping"
                );
                self.kubernetes_nodes_by_selkie_name.insert(name, knode);
            }
            Some(_) => {}
        }
    }

    fn on_node_deleted(&mut self, name: &str) {
        if self.kubernetes_nodes_by_selkie_name.remove(name).is_some() {
            debug!(
                event.name = "ipam.node_mapping_removed",
                node = %name,
                "removing mapping for deleted selkie node"
            );
        }
    }

    fn on_pool_updated(&mut self, name: String, pool: selkie_ipam::IpPoolSpec) {
        if !self.pool_manager.contains_pool(&name) {
            registry::register_pool_vectors(&name);
            registry::publish_pool_size(&name, &pool.cidr);
        }
        self.pool_manager.on_pool_updated(name, pool);
    }

    fn on_pool_deleted(&mut self, name: &str) {
        registry::unregister_pool_vectors(name);
        registry::clear_pool_size(name);
        self.pool_manager.on_pool_deleted(name);
    }

    /// Publishes the current allocation picture. Gated on a ready, in-sync
    /// datastore so half-built caches never hit the metrics endpoint.
    pub(crate) fn update_metrics(&self) {
        if !self.datastore_ready {
            warn!(
                event.name = "ipam.metrics_skipped",
                "datastore is locked, skipping metrics sync"
            );
            return;
        }
        if self.sync_status != SyncStatus::InSync {
            debug!(
                event.name = "ipam.metrics_skipped",
                status = ?self.sync_status,
                "not yet received InSync notification, skipping metrics sync"
            );
            return;
        }

        let mut legacy_blocks_by_node: HashMap<String, i64> = HashMap::new();
        let mut legacy_borrowed_by_node: HashMap<String, i64> = HashMap::new();

        for (pool_name, pool_blocks) in self.pool_manager.blocks_by_pool() {
            let mut in_use = self.zeroed_node_values(pool_name);
            let mut borrowed = self.zeroed_node_values(pool_name);
            let mut gc_candidates = self.zeroed_node_values(pool_name);
            let mut blocks: HashMap<String, i64> = HashMap::new();

            for block_cidr in pool_blocks {
                let Some(block) = self.all_blocks.get(block_cidr) else {
                    continue;
                };
                let affine = block.affine_host().unwrap_or(registry::NO_AFFINITY_LABEL);
                *legacy_blocks_by_node.entry(affine.to_string()).or_default() += 1;
                *blocks.entry(affine.to_string()).or_default() += 1;

                for id in self.allocation_state.ids_for_block(block_cidr) {
                    let Some(alloc) = self.allocation_state.get(&id) else {
                        continue;
                    };
                    let node = if alloc.node().is_empty() {
                        registry::UNKNOWN_NODE_LABEL
                    } else {
                        alloc.node()
                    };
                    *in_use.entry(node.to_string()).or_default() += 1;

                    if node != registry::UNKNOWN_NODE_LABEL
                        && (block.affine_host().is_none() || node != affine)
                    {
                        // The allocation's node doesn't match the block's:
                        // this IP is borrowed.
                        *legacy_borrowed_by_node.entry(node.to_string()).or_default() += 1;
                        *borrowed.entry(node.to_string()).or_default() += 1;
                    }

                    // Include confirmed leaks in case something keeps them
                    // from being reclaimed promptly.
                    if alloc.is_candidate_leak() || alloc.is_confirmed_leak() {
                        *gc_candidates.entry(node.to_string()).or_default() += 1;
                    }
                }
            }
            registry::update_pool_gauges(pool_name, &in_use, &borrowed, &blocks, &gc_candidates);
        }

        registry::LEGACY_ALLOCATIONS_GAUGE.reset();
        self.allocation_state.iter(|node, ids| {
            registry::LEGACY_ALLOCATIONS_GAUGE
                .with_label_values(&[node])
                .set(ids.len() as i64);
        });
        registry::LEGACY_BLOCKS_GAUGE.reset();
        for (node, num) in &legacy_blocks_by_node {
            registry::LEGACY_BLOCKS_GAUGE.with_label_values(&[node]).set(*num);
        }
        registry::LEGACY_BORROWED_GAUGE.reset();
        for (node, num) in &legacy_borrowed_by_node {
            registry::LEGACY_BORROWED_GAUGE
                .with_label_values(&[node])
                .set(*num);
        }
        registry::MISSING_HANDLE_GAUGE
            .set(self.missing_handles_by_block.values().sum::<u64>() as i64);
        debug!(event.name = "ipam.metrics_updated", "IPAM metrics updated");
    }

    /// Seeds explicit zero values for every known node so utilization
    /// queries see zeroes rather than absent series. The unknown pool is not
    /// seeded.
    fn zeroed_node_values(&self, pool: &str) -> HashMap<String, i64> {
        let mut values = HashMap::new();
        if pool != UNKNOWN_POOL_LABEL {
            for node in self.kubernetes_nodes_by_selkie_name.keys() {
                values.insert(node.clone(), 0);
            }
        }
        values
    }
}

/// Drains a channel for `window` after the first item, consolidating bursts
/// (e.g. mass deletions) into a single batch.
async fn drain_window<T>(rx: &mut mpsc::Receiver<T>, first: T, window: Duration) -> Vec<T> {
    let mut batch = vec![first];
    let deadline = tokio::time::sleep(window);
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            item = rx.recv() => match item {
                Some(item) => batch.push(item),
                None => break,
            },
            _ = &mut deadline => break,
        }
    }
    batch
}

/// Drains whatever is immediately available without waiting.
fn drain_ready<T>(rx: &mut mpsc::Receiver<T>, first: T) -> Vec<T> {
    let mut batch = vec![first];
    while let Ok(item) = rx.try_recv() {
        batch.push(item);
    }
    batch
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::mpsc;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn drain_window_collects_burst() {
        let (tx, mut rx) = mpsc::channel(512);
        for _ in 0..499 {
            tx.send(()).await.unwrap();
        }
        let batch = drain_window(&mut rx, (), Duration::from_secs(1)).await;
        assert_eq!(batch.len(), 500);
    }

    #[tokio::test(start_paused = true)]
    async fn drain_window_ends_at_deadline() {
        let (tx, mut rx) = mpsc::channel::<u32>(16);
        tx.send(1).await.unwrap();
        let late_tx = tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            let _ = late_tx.send(2).await;
        });
        let batch = drain_window(&mut rx, 0, Duration::from_secs(1)).await;
        // The item sent after the window closed is not part of the batch.
        assert_eq!(batch, vec![0, 1]);
    }

    #[test]
    fn drain_ready_does_not_wait() {
        let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
        rt.block_on(async {
            let (tx, mut rx) = mpsc::channel(16);
            tx.send(1).await.unwrap();
            tx.send(2).await.unwrap();
            let batch = drain_ready(&mut rx, 0);
            assert_eq!(batch, vec![0, 1, 2]);
        });
    }
}
