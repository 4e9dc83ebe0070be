//! The reconciliation engine: scans allocations for leaks, garbage collects
//! confirmed leaks, and releases redundant block and host affinities.

use std::{
    collections::{HashMap, HashSet},
    net::IpAddr,
    time::Duration,
};

use selkie_ipam::{
    IpamError,
    model::{AffinityConfig, AffinityType, NotKubernetes, SyncStatus, k8s_node_name},
};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::{
    controller::{IpamController, MIGRATION_LABEL, MIGRATION_VALUE_MIGRATED},
    k8s::pod_ip_strings,
    metrics::registry,
};

/// Cap on the number of IPs released per sync. Residual leaks trigger an
/// immediate follow-up pass via the sync channel.
const MAX_RELEASE_BATCH: usize = 10_000;

const SLOW_PASS: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub(crate) enum NodeResolveError {
    #[error(transparent)]
    NotKubernetes(#[from] NotKubernetes),

    #[error(transparent)]
    Ipam(#[from] IpamError),
}

fn log_if_slow(start: Instant, msg: &str) {
    let elapsed = start.elapsed();
    if elapsed > SLOW_PASS {
        info!(duration_ms = elapsed.as_millis() as u64, "{msg}");
    }
}

impl IpamController {
    /// One full reconciliation pass. Returns without work until the
    /// datastore is ready and the syncer has reported InSync.
    pub(crate) async fn sync_ipam(&mut self) -> Result<(), IpamError> {
        let start = Instant::now();

        if !self.datastore_ready {
            warn!(
                event.name = "ipam.sync_skipped",
                "datastore is locked, skipping ipam sync"
            );
            return Ok(());
        }
        if self.sync_status != SyncStatus::InSync {
            debug!(
                event.name = "ipam.sync_skipped",
                status = ?self.sync_status,
                "not yet received InSync notification, skipping ipam sync"
            );
            return Ok(());
        }

        debug!(event.name = "ipam.sync_started", "synchronizing IPAM data");
        self.sync_count += 1;

        // Scan known allocations for leaks and for nodes whose affinities
        // should be released.
        let nodes_to_release = self.check_allocations().await;

        // Release all leaks confirmed by the scan above.
        self.garbage_collect_known_leaks().await?;

        // Release affinities of empty blocks that are no longer needed so
        // they can be claimed elsewhere.
        self.release_unused_blocks().await?;

        // Nodes gone from the Kubernetes API with no valid allocations can
        // be cleaned out of IPAM entirely.
        self.release_nodes(nodes_to_release).await?;

        self.allocation_state.sync_complete();
        debug!(event.name = "ipam.sync_complete", "IPAM sync completed");

        if !self.confirmed_leaks.is_empty() {
            // Usually the release batch cap; pick the rest up immediately.
            info!(
                event.name = "ipam.leaks_remaining",
                num = self.confirmed_leaks.len(),
                "confirmed leaks still exist, scheduling another pass"
            );
            self.kick();
        }
        log_if_slow(start, "IPAM sync complete");
        Ok(())
    }

    /// Scans IPAM state, classifying allocations through the leak state
    /// machine and collecting nodes whose affinities should be released.
    ///
    /// An allocation is a candidate leak when its pod is gone or has a
    /// mismatched IP; it is confirmed either after the grace period or
    /// immediately when its node is gone from the Kubernetes API. A node is
    /// released when it no longer exists in Kubernetes and every remaining
    /// allocation on it is a confirmed leak.
    pub(crate) async fn check_allocations(&mut self) -> Vec<String> {
        let start = Instant::now();

        let mut nodes_to_check: HashSet<String> = HashSet::new();
        if self.full_sync_required {
            info!(
                event.name = "ipam.full_scan",
                "performing a full scan of IPAM allocations for leaks and redundant affinities"
            );
            // Affine nodes are included even with no allocations at all, so
            // their redundant affinities are found.
            nodes_to_check.extend(self.nodes_by_block.values().cloned());
            nodes_to_check.extend(self.allocation_state.nodes().cloned());
            self.full_sync_required = false;
        } else {
            debug!(
                event.name = "ipam.dirty_scan",
                "checking dirty nodes for leaks and redundant affinities"
            );
            nodes_to_check.extend(self.allocation_state.dirty_nodes());
        }

        let mut nodes_to_release = Vec::new();
        for cnode in nodes_to_check {
            // Selkie and Kubernetes node names can differ outside of
            // CRD-backed clusters; resolve before consulting the node lister.
            let knode = match self.kubernetes_node_for_selkie(&cnode).await {
                Ok(knode) => knode,
                Err(NodeResolveError::NotKubernetes(_)) => {
                    debug!(
                        event.name = "ipam.node_skipped",
                        node = %cnode,
                        "skipping non-kubernetes node"
                    );
                    continue;
                }
                Err(e) => {
                    warn!(
                        event.name = "ipam.node_lookup_failed",
                        node = %cnode,
                        error.message = %e,
                        "failed to look up corresponding node, skipping"
                    );
                    continue;
                }
            };
            let kubernetes_node_exists = !knode.is_empty() && self.node_exists(&knode);
            debug!(
                event.name = "ipam.checking_node",
                node = %cnode,
                k8s_node = %knode,
                exists = kubernetes_node_exists,
                "checking node"
            );

            // Tunnel addresses only leak when the node itself goes away and
            // nothing valid remains on it; defer them until we know that.
            let mut tunnel_ids: Vec<String> = Vec::new();
            let mut can_delete = true;

            for id in self.allocation_state.ids_for_node(&cnode) {
                let Some(alloc) = self.allocation_state.get_mut(&id) else {
                    continue;
                };
                alloc.knode = knode.clone();

                if alloc.is_windows_reserved() {
                    // Released automatically with the block.
                    continue;
                }
                if !alloc.is_pod_ip() && !alloc.is_tunnel_address() {
                    info!(
                        event.name = "ipam.unknown_allocation",
                        ip = %alloc.ip,
                        node = %cnode,
                        "IP allocation on node is from an unknown source, cannot clean up \
                         its block until it is removed"
                    );
                    can_delete = false;
                    continue;
                }
                if alloc.is_tunnel_address() {
                    tunnel_ids.push(id);
                    continue;
                }

                let snapshot = alloc.clone();
                let valid = self.allocation_is_valid(&snapshot, true).await;

                let Some(alloc) = self.allocation_state.get_mut(&id) else {
                    continue;
                };
                if valid {
                    // A valid allocation breaks our confidence that the node
                    // can be cleaned up, even if it appears deleted.
                    can_delete = false;
                    alloc.mark_valid();
                } else if !kubernetes_node_exists {
                    // Both the node and the pod are gone; skip candidacy.
                    alloc.mark_confirmed_leak();
                } else if let Some(grace) = self.config.leak_grace_period {
                    alloc.mark_leak(grace);
                }

                if self.allocation_state.is_confirmed(&id) {
                    self.confirmed_leaks.insert(id.clone());
                } else if self.confirmed_leaks.remove(&id) {
                    info!(
                        event.name = "ipam.leak_resurrected",
                        id = %id,
                        "leaked IP has been resurrected"
                    );
                }
            }

            if !kubernetes_node_exists {
                if !can_delete {
                    info!(
                        event.name = "ipam.node_retained",
                        node = %cnode,
                        "cannot clean up node yet, IPs still in use on this node"
                    );
                    continue;
                }
                for id in tunnel_ids {
                    if let Some(alloc) = self.allocation_state.get_mut(&id) {
                        alloc.mark_confirmed_leak();
                    }
                    self.confirmed_leaks.insert(id);
                }
                nodes_to_release.push(cnode);
            }
        }
        log_if_slow(start, "allocation scan complete");
        nodes_to_release
    }

    /// Whether the allocation is still in use. `prefer_cache` consults the
    /// pod lister; otherwise the API server is queried directly for extra
    /// confidence. Biased toward validity: any uncertainty keeps the IP.
    pub(crate) async fn allocation_is_valid(
        &self,
        alloc: &crate::state::Allocation,
        prefer_cache: bool,
    ) -> bool {
        if alloc.is_tunnel_address() {
            // Tunnel addresses are valid as long as the hosting node exists.
            return !alloc.knode.is_empty();
        }

        let ns = alloc.namespace().unwrap_or("");
        let pod_name = alloc.pod().unwrap_or("");
        if ns.is_empty() || pod_name.is_empty() {
            // Not a pod address, or it predates these attributes. No way to
            // run the checks below, so assume it is valid.
            debug!(
                event.name = "ipam.allocation_unverifiable",
                ip = %alloc.ip,
                "allocation is missing pod metadata, assuming valid"
            );
            return true;
        }

        let pod = if prefer_cache {
            self.listers.pod(ns, pod_name).map(|p| (*p).clone())
        } else {
            match self.pod_querier.get_pod(ns, pod_name).await {
                Ok(pod) => pod,
                Err(e) => {
                    warn!(
                        event.name = "ipam.pod_query_failed",
                        namespace = %ns,
                        pod = %pod_name,
                        error.message = %e,
                        "failed to query pod, assuming it exists and the allocation is valid"
                    );
                    return true;
                }
            }
        };
        let Some(pod) = pod else {
            debug!(
                event.name = "ipam.pod_missing",
                namespace = %ns,
                pod = %pod_name,
                "pod not found, assuming the allocation leaked"
            );
            return false;
        };

        if let Some(pod_node) = pod.spec.as_ref().and_then(|s| s.node_name.as_deref()) {
            if !pod_node.is_empty() && !alloc.knode.is_empty() && pod_node != alloc.knode {
                info!(
                    event.name = "ipam.pod_rescheduled",
                    old = %alloc.knode,
                    new = %pod_node,
                    "pod rescheduled on a new node, allocation no longer valid"
                );
                return false;
            }
        }

        let reported_ips = pod_ip_strings(&pod);
        if reported_ips.is_empty() {
            // Kubelet has not reported an IP yet.
            debug!(
                event.name = "ipam.pod_ip_unreported",
                namespace = %ns,
                pod = %pod_name,
                "pod IP not yet reported, considering allocation valid"
            );
            return true;
        }

        let evicted = pod.status.as_ref().is_some_and(|s| {
            s.phase.as_deref() == Some("Failed") && s.reason.as_deref() == Some("Evicted")
        });
        if evicted {
            debug!(
                event.name = "ipam.pod_evicted",
                namespace = %ns,
                pod = %pod_name,
                "pod failed with Evicted, allocation no longer valid"
            );
            return false;
        }

        let Ok(alloc_ip) = alloc.ip.parse::<IpAddr>() else {
            warn!(
                event.name = "ipam.allocation_ip_unparseable",
                ip = %alloc.ip,
                "failed to parse allocation IP, assuming valid"
            );
            return true;
        };
        for reported in reported_ips {
            match reported.parse::<IpAddr>() {
                Ok(ip) if ip == alloc_ip => return true,
                Ok(_) => {}
                Err(e) => {
                    warn!(
                        event.name = "ipam.pod_ip_unparseable",
                        ip = %reported,
                        error.message = %e,
                        "failed to parse pod IP, assuming allocation valid"
                    );
                    return true;
                }
            }
        }
        debug!(
            event.name = "ipam.allocation_stale",
            ip = %alloc.ip,
            "allocated IP no longer in use by pod"
        );
        false
    }

    /// Re-verifies and releases confirmed leaks, in batches of at most
    /// [`MAX_RELEASE_BATCH`]. Released IPs are retired from every cache
    /// immediately rather than waiting for the datastore echo.
    pub(crate) async fn garbage_collect_known_leaks(&mut self) -> Result<(), IpamError> {
        let start = Instant::now();

        let mut opts = Vec::new();
        let mut pending_by_address: HashMap<String, String> = HashMap::new();

        let mut ids: Vec<String> = self.confirmed_leaks.iter().cloned().collect();
        ids.sort_unstable();
        for id in ids {
            let Some(alloc) = self.allocation_state.get(&id) else {
                self.confirmed_leaks.remove(&id);
                continue;
            };
            let snapshot = alloc.clone();

            // Final check before destruction. Prefer the cache when the
            // hosting node is gone (high confidence already); otherwise ask
            // the API server directly.
            let prefer_cache = snapshot.knode.is_empty();
            if self.allocation_is_valid(&snapshot, prefer_cache).await {
                info!(
                    event.name = "ipam.leak_resurrected",
                    ip = %snapshot.ip,
                    "leaked IP has been resurrected after querying latest state"
                );
                self.confirmed_leaks.remove(&id);
                if let Some(alloc) = self.allocation_state.get_mut(&id) {
                    alloc.mark_valid();
                }
                continue;
            }

            // Never release part of a handle.
            let state = &self.allocation_state;
            if !self
                .handle_tracker
                .is_confirmed_leak(&snapshot.handle, |hid| state.is_confirmed(hid))
            {
                debug!(
                    event.name = "ipam.handle_partially_valid",
                    handle = %snapshot.handle,
                    "some IPs with this handle are still valid, skipping"
                );
                continue;
            }

            let release = snapshot.release_options();
            pending_by_address.insert(release.address.clone(), id);
            opts.push(release);
            if opts.len() >= MAX_RELEASE_BATCH {
                break;
            }
        }

        if opts.is_empty() {
            return Ok(());
        }

        // Bulk release lets the datastore fold multiple IPs from the same
        // block into a single update.
        info!(
            event.name = "ipam.gc_started",
            num = opts.len(),
            "garbage collecting leaked IP addresses"
        );
        let outcome = self.ipam.release_ips(&opts).await;

        // Options that came back were released, or were unallocated to begin
        // with. Either way their bookkeeping can be retired now instead of
        // waiting for the syncer update.
        for opt in &outcome.released {
            let Some(id) = pending_by_address.remove(&opt.address) else {
                warn!(
                    event.name = "ipam.gc_unexpected_release",
                    address = %opt.address,
                    "datastore reported a release we did not request"
                );
                continue;
            };
            if let Some(released) = self.allocation_state.release(&id) {
                self.handle_tracker.remove_allocation(&released);
                let pool = self.pool_manager.pool_of_block(&released.block).to_string();
                let node = if released.node().is_empty() {
                    registry::UNKNOWN_NODE_LABEL
                } else {
                    released.node()
                };
                registry::increment_reclamation(&pool, node);
                info!(
                    event.name = "ipam.gc_released",
                    ip = %released.ip,
                    handle = %released.handle,
                    "successfully garbage collected leaked IP address"
                );
            }
            self.confirmed_leaks.remove(&id);
        }

        for id in pending_by_address.values() {
            warn!(
                event.name = "ipam.gc_residual",
                id = %id,
                "leaked IP address was not successfully garbage collected"
            );
        }

        log_if_slow(start, "leak GC complete");
        match outcome.error {
            // Releasing something that is already gone is a success.
            Some(e) if !e.is_not_found() => {
                warn!(
                    event.name = "ipam.gc_failed",
                    error.message = %e,
                    "failed to garbage collect one or more leaked IP addresses"
                );
                Err(e)
            }
            _ => Ok(()),
        }
    }

    /// Releases affinities of blocks that have been empty past the grace
    /// period, provided the owning node keeps at least one other affine
    /// block and is not mid-migration.
    pub(crate) async fn release_unused_blocks(&mut self) -> Result<(), IpamError> {
        let empties: Vec<(String, String)> = self
            .empty_blocks
            .iter()
            .map(|(block, node)| (block.clone(), node.clone()))
            .collect();

        for (block_cidr, node) in empties {
            let node_block_count = self.blocks_by_node.get(&node).map_or(0, HashSet::len);
            if node_block_count <= 1 {
                // Never strip a node of its last affine block.
                continue;
            }

            match self.node_is_being_migrated(&node).await {
                Ok(false) => {}
                Ok(true) => {
                    info!(
                        event.name = "ipam.block_retained_migration",
                        block = %block_cidr,
                        node = %node,
                        "node is undergoing a network migration, skipping affinity release"
                    );
                    self.block_release_tracker.mark_in_use(&block_cidr);
                    continue;
                }
                Err(e) => {
                    warn!(
                        event.name = "ipam.migration_check_failed",
                        block = %block_cidr,
                        node = %node,
                        error.message = %e,
                        "failed to check node migration status, skipping affinity release"
                    );
                    self.block_release_tracker.mark_in_use(&block_cidr);
                    continue;
                }
            }

            if !self.block_release_tracker.mark_empty(&block_cidr) {
                debug!(
                    event.name = "ipam.block_within_grace",
                    block = %block_cidr,
                    "block is empty but still within the grace period"
                );
                continue;
            }

            let Some(block) = self.all_blocks.get(&block_cidr).cloned() else {
                warn!(
                    event.name = "ipam.block_cache_miss",
                    block = %block_cidr,
                    "could not find empty block in cache, skipping affinity release"
                );
                continue;
            };

            info!(
                event.name = "ipam.block_affinity_release",
                block = %block_cidr,
                node = %node,
                node_blocks = node_block_count,
                "releasing affinity for empty block"
            );
            if let Err(e) = self.ipam.release_block_affinity(&block, true).await {
                warn!(
                    event.name = "ipam.block_affinity_release_failed",
                    block = %block_cidr,
                    error.message = %e,
                    "unable or unwilling to release affinity for block"
                );
                continue;
            }

            // The released block is deleted by the datastore. Update
            // blocks_by_node here so other empty blocks on the node keep an
            // accurate count and the node never loses every block at once.
            self.empty_blocks.remove(&block_cidr);
            if let Some(blocks) = self.blocks_by_node.get_mut(&node) {
                blocks.remove(&block_cidr);
            }
            self.nodes_by_block.remove(&block_cidr);
            self.all_blocks.remove(&block_cidr);
            self.block_release_tracker.on_block_deleted(&block_cidr);
            self.pool_manager.on_block_deleted(&block_cidr);
        }
        Ok(())
    }

    /// Releases host affinities for nodes gone from the Kubernetes API.
    /// Per-node failures do not stop the batch; the first error is returned
    /// at the end so the sync retries.
    pub(crate) async fn release_nodes(&mut self, nodes: Vec<String>) -> Result<(), IpamError> {
        if nodes.is_empty() {
            return Ok(());
        }
        info!(
            event.name = "ipam.node_release_batch",
            num = nodes.len(),
            "found a batch of nodes to release"
        );

        let mut stored_err: Option<IpamError> = None;
        for cnode in nodes {
            info!(
                event.name = "ipam.node_cleanup",
                node = %cnode,
                "cleaning up IPAM affinities for deleted node"
            );
            if let Err(e) = self.cleanup_node(&cnode).await {
                warn!(
                    event.name = "ipam.node_cleanup_failed",
                    node = %cnode,
                    error.message = %e,
                    "error cleaning up node"
                );
                stored_err.get_or_insert(e);
            }
        }
        match stored_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn cleanup_node(&mut self, cnode: &str) -> Result<(), IpamError> {
        // By now the node is known absent from Kubernetes and every
        // remaining allocation on it was confirmed leaked and released.
        let affinity = AffinityConfig {
            affinity_type: AffinityType::Host,
            host: cnode.to_string(),
        };
        self.ipam.release_host_affinities(&affinity, true).await?;
        registry::clear_reclaimed_count_for_node(cnode);
        debug!(
            event.name = "ipam.node_released",
            node = %cnode,
            "released all affinities for node"
        );
        Ok(())
    }

    pub(crate) fn node_exists(&self, knode: &str) -> bool {
        self.listers.node_exists(knode)
    }

    /// True iff the node is labelled as undergoing a migration from another
    /// network provider and has not yet completed it.
    pub(crate) async fn node_is_being_migrated(
        &self,
        cnode: &str,
    ) -> Result<bool, NodeResolveError> {
        let kname = self.kubernetes_node_for_selkie(cnode).await?;
        let Some(node) = self.listers.node(&kname) else {
            // A node that does not exist is not being migrated.
            return Ok(false);
        };
        for (label, value) in node.metadata.labels.iter().flatten() {
            if label.as_str() == MIGRATION_LABEL && value.as_str() != MIGRATION_VALUE_MIGRATED {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// The Kubernetes node name corresponding to a Selkie node: cache first,
    /// falling back to an explicit datastore lookup in case the cache is
    /// running behind. `""` means the node has no Kubernetes counterpart.
    pub(crate) async fn kubernetes_node_for_selkie(
        &self,
        cnode: &str,
    ) -> Result<String, NodeResolveError> {
        if let Some(knode) = self.kubernetes_nodes_by_selkie_name.get(cnode) {
            if !knode.is_empty() {
                return Ok(knode.clone());
            }
        }
        debug!(
            event.name = "ipam.node_cache_miss",
            node = %cnode,
            "node not in cache, looking it up in the datastore"
        );
        let node = match self.ipam.get_node(cnode).await {
            Ok(node) => node,
            Err(e) if e.is_not_found() => {
                info!(
                    event.name = "ipam.node_gone",
                    node = %cnode,
                    "selkie node referenced in IPAM data does not exist"
                );
                return Ok(String::new());
            }
            Err(e) => {
                warn!(
                    event.name = "ipam.node_query_failed",
                    node = %cnode,
                    error.message = %e,
                    "failed to query selkie node referenced in IPAM data"
                );
                return Err(e.into());
            }
        };
        Ok(k8s_node_name(&node)?)
    }
}
