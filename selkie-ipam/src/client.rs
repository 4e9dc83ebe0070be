//! The datastore client used by controllers to release IPAM resources.

use async_trait::async_trait;
use kube::{
    Api, Client,
    api::{ListParams, PostParams},
};
use tracing::{debug, warn};

use crate::{
    error::{IpamError, from_kube},
    model::{
        AffinityConfig, AffinityType, IpamBlock, IpamBlockSpec, ReleaseOptions, SelkieNode,
        block_resource_name,
    },
};

/// Result of a bulk IP release. Partial success is normal: `released` lists
/// the options that were applied (or referenced already-unallocated
/// addresses), while `error` carries the first failure encountered.
#[derive(Debug, Default)]
pub struct BulkRelease {
    pub released: Vec<ReleaseOptions>,
    pub error: Option<IpamError>,
}

/// Release-side interface onto the IPAM datastore.
#[async_trait]
pub trait IpamClient: Send + Sync {
    /// Releases the given allocations. Options whose address is unallocated
    /// are reported as released; options whose handle or sequence number no
    /// longer match the slot are silently left in place.
    async fn release_ips(&self, opts: &[ReleaseOptions]) -> BulkRelease;

    /// Releases a block's affinity. With `require_empty`, refuses non-empty
    /// blocks. Releasing the affinity of an empty block deletes the block.
    async fn release_block_affinity(
        &self,
        block: &IpamBlockSpec,
        require_empty: bool,
    ) -> Result<(), IpamError>;

    /// Releases every affinity held by the host named in `affinity`.
    async fn release_host_affinities(
        &self,
        affinity: &AffinityConfig,
        require_empty: bool,
    ) -> Result<(), IpamError>;

    async fn get_node(&self, name: &str) -> Result<SelkieNode, IpamError>;
}

/// [`IpamClient`] backed by the Selkie CRDs.
#[derive(Clone)]
pub struct KubernetesIpamClient {
    blocks: Api<IpamBlock>,
    nodes: Api<SelkieNode>,
}

impl KubernetesIpamClient {
    pub fn new(client: Client) -> Self {
        Self {
            blocks: Api::all(client.clone()),
            nodes: Api::all(client),
        }
    }

    async fn write_back(&self, mut block: IpamBlock) -> Result<(), IpamError> {
        let name = block
            .metadata
            .name
            .clone()
            .ok_or_else(|| IpamError::Malformed("block without a name".to_string()))?;

        if block.spec.is_empty() && block.spec.affinity.is_none() {
            // Nothing left to hold the block open.
            debug!(
                event.name = "ipam.block_deleted",
                block = %block.spec.cidr,
                "deleting empty block with no affinity"
            );
            self.blocks
                .delete(&name, &Default::default())
                .await
                .map(|_| ())
                .map_err(|e| from_kube(&name, e))
        } else {
            block.spec.sequence_number += 1;
            self.blocks
                .replace(&name, &PostParams::default(), &block)
                .await
                .map(|_| ())
                .map_err(|e| from_kube(&name, e))
        }
    }
}

#[async_trait]
impl IpamClient for KubernetesIpamClient {
    async fn release_ips(&self, opts: &[ReleaseOptions]) -> BulkRelease {
        let mut outcome = BulkRelease::default();

        let blocks = match self.blocks.list(&ListParams::default()).await {
            Ok(list) => list,
            Err(e) => {
                outcome.error = Some(IpamError::Kube(e));
                return outcome;
            }
        };

        let mut matched = vec![false; opts.len()];
        for mut block in blocks {
            let in_block: Vec<usize> = opts
                .iter()
                .enumerate()
                .filter(|&(_, o)| {
                    o.address
                        .parse()
                        .ok()
                        .and_then(|ip| block.spec.ip_to_ordinal(ip))
                        .is_some()
                })
                .map(|(i, _)| i)
                .collect();
            if in_block.is_empty() {
                continue;
            }
            for &i in &in_block {
                matched[i] = true;
            }

            let selected: Vec<&ReleaseOptions> = in_block.iter().map(|&i| &opts[i]).collect();
            let (released, changed) = apply_release(&mut block.spec, &selected);
            if !changed {
                outcome.released.extend(released);
                continue;
            }
            match self.write_back(block).await {
                Ok(()) => outcome.released.extend(released),
                Err(e) => {
                    warn!(
                        event.name = "ipam.release_write_failed",
                        error.message = %e,
                        "failed to write released block back to the datastore"
                    );
                    if outcome.error.is_none() {
                        outcome.error = Some(e);
                    }
                }
            }
        }

        // Addresses outside every known block were never allocated; report
        // them as released so callers can retire their bookkeeping.
        for (i, opt) in opts.iter().enumerate() {
            if !matched[i] {
                outcome.released.push(opt.clone());
            }
        }
        outcome
    }

    async fn release_block_affinity(
        &self,
        block: &IpamBlockSpec,
        require_empty: bool,
    ) -> Result<(), IpamError> {
        let name = block_resource_name(&block.cidr);
        let mut current = self.blocks.get(&name).await.map_err(|e| from_kube(&name, e))?;

        if require_empty && !current.spec.is_empty() {
            return Err(IpamError::BlockNotEmpty(current.spec.cidr.clone()));
        }
        current.spec.affinity = None;
        self.write_back(current).await
    }

    async fn release_host_affinities(
        &self,
        affinity: &AffinityConfig,
        require_empty: bool,
    ) -> Result<(), IpamError> {
        let AffinityType::Host = affinity.affinity_type;

        let blocks = self
            .blocks
            .list(&ListParams::default())
            .await
            .map_err(IpamError::Kube)?;

        let mut stored_err = None;
        for mut block in blocks {
            if block.spec.affine_host() != Some(affinity.host.as_str()) {
                continue;
            }
            if require_empty && !block.spec.is_empty() {
                stored_err.get_or_insert(IpamError::BlockNotEmpty(block.spec.cidr.clone()));
                continue;
            }
            block.spec.affinity = None;
            if let Err(e) = self.write_back(block).await {
                if !e.is_not_found() {
                    stored_err.get_or_insert(e);
                }
            }
        }
        match stored_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn get_node(&self, name: &str) -> Result<SelkieNode, IpamError> {
        self.nodes.get(name).await.map_err(|e| from_kube(name, e))
    }
}

/// Applies release options to a block spec. Returns the options that were
/// satisfied (cleared, or already unallocated) and whether the spec changed.
/// Handle or sequence-number mismatches leave the slot untouched: the slot
/// was reused since the caller last observed it.
fn apply_release(
    spec: &mut IpamBlockSpec,
    opts: &[&ReleaseOptions],
) -> (Vec<ReleaseOptions>, bool) {
    let mut released = Vec::new();
    let mut changed = false;

    for opt in opts {
        let Some(ordinal) = opt.address.parse().ok().and_then(|ip| spec.ip_to_ordinal(ip))
        else {
            continue;
        };
        let Some(attr_index) = spec.allocations.get(ordinal as usize).copied().flatten() else {
            // Already unallocated.
            released.push((*opt).clone());
            continue;
        };
        let handle = spec
            .attributes
            .get(attr_index as usize)
            .and_then(|a| a.handle.as_deref());
        if handle != Some(opt.handle.as_str()) {
            continue;
        }
        if let Some(seq) = opt.sequence_number {
            if seq != spec.sequence_number_for_ordinal(ordinal) {
                continue;
            }
        }
        spec.allocations[ordinal as usize] = None;
        spec.unallocated.push(ordinal);
        spec.sequence_number_for_allocation.remove(&ordinal.to_string());
        released.push((*opt).clone());
        changed = true;
    }
    (released, changed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::AllocationAttribute;

    fn block_with_allocation(ip_ordinal: usize, handle: &str, seq: u64) -> IpamBlockSpec {
        let mut spec = IpamBlockSpec {
            cidr: "10.0.0.0/26".to_string(),
            allocations: vec![None; 64],
            attributes: vec![AllocationAttribute {
                handle: Some(handle.to_string()),
                ..Default::default()
            }],
            sequence_number: seq,
            ..Default::default()
        };
        spec.allocations[ip_ordinal] = Some(0);
        spec
    }

    fn opts(address: &str, handle: &str, seq: Option<u64>) -> ReleaseOptions {
        ReleaseOptions {
            address: address.to_string(),
            handle: handle.to_string(),
            sequence_number: seq,
        }
    }

    #[test]
    fn release_clears_matching_slot() {
        let mut spec = block_with_allocation(5, "h1", 3);
        let o = opts("10.0.0.5", "h1", Some(3));
        let (released, changed) = apply_release(&mut spec, &[&o]);
        assert!(changed);
        assert_eq!(released, vec![o]);
        assert!(spec.allocations[5].is_none());
        assert!(spec.unallocated.contains(&5));
    }

    #[test]
    fn sequence_mismatch_leaves_slot_alone() {
        let mut spec = block_with_allocation(5, "h1", 3);
        let o = opts("10.0.0.5", "h1", Some(2));
        let (released, changed) = apply_release(&mut spec, &[&o]);
        assert!(!changed);
        assert!(released.is_empty());
        assert!(spec.allocations[5].is_some());
    }

    #[test]
    fn handle_mismatch_leaves_slot_alone() {
        let mut spec = block_with_allocation(5, "h1", 3);
        let o = opts("10.0.0.5", "h2", Some(3));
        let (released, changed) = apply_release(&mut spec, &[&o]);
        assert!(!changed);
        assert!(released.is_empty());
    }

    #[test]
    fn unallocated_address_counts_as_released() {
        let mut spec = block_with_allocation(5, "h1", 3);
        let o = opts("10.0.0.9", "h1", None);
        let (released, changed) = apply_release(&mut spec, &[&o]);
        assert!(!changed);
        assert_eq!(released, vec![o]);
    }
}
