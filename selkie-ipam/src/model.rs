//! Datastore resource definitions and the messages derived from them.

use std::{
    collections::BTreeMap,
    net::IpAddr,
    str::FromStr,
};

use ipnetwork::IpNetwork;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Attribute key holding the pod name of a workload allocation.
pub const ATTRIBUTE_POD: &str = "pod";
/// Attribute key holding the namespace of a workload allocation.
pub const ATTRIBUTE_NAMESPACE: &str = "namespace";
/// Attribute key holding the plugin node an allocation was made on.
pub const ATTRIBUTE_NODE: &str = "node";
/// Attribute key describing what kind of endpoint the allocation backs.
pub const ATTRIBUTE_TYPE: &str = "type";

pub const ATTRIBUTE_TYPE_IPIP: &str = "ipipTunnelAddress";
pub const ATTRIBUTE_TYPE_VXLAN: &str = "vxlanTunnelAddress";
pub const ATTRIBUTE_TYPE_VXLAN_V6: &str = "vxlanTunnelAddressV6";
pub const ATTRIBUTE_TYPE_WIREGUARD: &str = "wireguardTunnelAddress";
pub const ATTRIBUTE_TYPE_WIREGUARD_V6: &str = "wireguardTunnelAddressV6";

/// Handle used for the reserved addresses at the top of Windows blocks.
/// These are never released individually, only with their block.
pub const WINDOWS_RESERVED_HANDLE: &str = "windows-reserved-ipam-handle";

/// Prefix of a block affinity naming its owning host.
pub const HOST_AFFINITY_PREFIX: &str = "host:";

/// Attributes attached to one or more allocations made with the same handle.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AllocationAttribute {
    /// Handle identifying the workload the allocation belongs to. Allocations
    /// without a handle cannot be released through [`ReleaseOptions`].
    pub handle: Option<String>,
    #[serde(default)]
    pub secondary: BTreeMap<String, String>,
}

/// One contiguous CIDR carved out of an [`IpPool`], the unit of affinity.
///
/// `allocations` is indexed by ordinal within the CIDR; each entry is either
/// unallocated (`None`) or an index into `attributes`.
#[derive(CustomResource, Clone, Debug, Default, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "ipam.selkie.io",
    version = "v1",
    kind = "IpamBlock",
    plural = "ipamblocks"
)]
#[serde(rename_all = "camelCase")]
pub struct IpamBlockSpec {
    pub cidr: String,
    pub affinity: Option<String>,
    pub allocations: Vec<Option<u32>>,
    #[serde(default)]
    pub unallocated: Vec<u32>,
    #[serde(default)]
    pub attributes: Vec<AllocationAttribute>,
    #[serde(default)]
    pub sequence_number: u64,
    #[serde(default)]
    pub sequence_number_for_allocation: BTreeMap<String, u64>,
}

impl IpamBlockSpec {
    pub fn parse_cidr(&self) -> Result<IpNetwork, ipnetwork::IpNetworkError> {
        IpNetwork::from_str(&self.cidr)
    }

    /// The node this block is affine to, if the affinity is a host affinity.
    pub fn affine_host(&self) -> Option<&str> {
        self.affinity
            .as_deref()
            .and_then(|a| a.strip_prefix(HOST_AFFINITY_PREFIX))
    }

    pub fn is_empty(&self) -> bool {
        self.allocations.iter().all(Option::is_none)
    }

    pub fn num_allocations(&self) -> usize {
        self.allocations.iter().filter(|a| a.is_some()).count()
    }

    /// Sequence number for a given ordinal, falling back to the block-level
    /// sequence number for allocations that predate per-ordinal tracking.
    pub fn sequence_number_for_ordinal(&self, ordinal: u32) -> u64 {
        self.sequence_number_for_allocation
            .get(&ordinal.to_string())
            .copied()
            .unwrap_or(self.sequence_number)
    }

    /// The IP address at `ordinal` within this block's CIDR.
    pub fn ordinal_to_ip(&self, ordinal: u32) -> Option<IpAddr> {
        let cidr = self.parse_cidr().ok()?;
        ip_at_ordinal(&cidr, ordinal)
    }

    /// The ordinal of `ip` within this block's CIDR, or `None` if the address
    /// is outside the block.
    pub fn ip_to_ordinal(&self, ip: IpAddr) -> Option<u32> {
        let cidr = self.parse_cidr().ok()?;
        if !cidr.contains(ip) {
            return None;
        }
        match (cidr.network(), ip) {
            (IpAddr::V4(base), IpAddr::V4(ip)) => {
                Some(u32::from(ip).wrapping_sub(u32::from(base)))
            }
            (IpAddr::V6(base), IpAddr::V6(ip)) => {
                u32::try_from(u128::from(ip).wrapping_sub(u128::from(base))).ok()
            }
            _ => None,
        }
    }
}

fn ip_at_ordinal(cidr: &IpNetwork, ordinal: u32) -> Option<IpAddr> {
    match cidr.network() {
        IpAddr::V4(base) => {
            let size = 1u64 << (32 - cidr.prefix());
            if u64::from(ordinal) >= size {
                return None;
            }
            Some(IpAddr::V4((u32::from(base) + ordinal).into()))
        }
        IpAddr::V6(base) => {
            let host_bits = 128 - u32::from(cidr.prefix());
            if host_bits < 128 && u128::from(ordinal) >= (1u128 << host_bits) {
                return None;
            }
            Some(IpAddr::V6((u128::from(base) + u128::from(ordinal)).into()))
        }
    }
}

/// Datastore resource name for a block, derived from its CIDR.
pub fn block_resource_name(cidr: &str) -> String {
    cidr.replace(['.', ':', '/'], "-")
}

/// An IP pool from which blocks are carved.
#[derive(CustomResource, Clone, Debug, Default, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "ipam.selkie.io",
    version = "v1",
    kind = "IpPool",
    plural = "ippools"
)]
#[serde(rename_all = "camelCase")]
pub struct IpPoolSpec {
    pub cidr: String,
    #[serde(default)]
    pub disabled: bool,
}

/// Per-node plugin state. A node managed by an orchestrator carries a
/// reference naming its counterpart there.
#[derive(CustomResource, Clone, Debug, Default, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "selkie.io",
    version = "v1",
    kind = "SelkieNode",
    plural = "selkienodes"
)]
#[serde(rename_all = "camelCase")]
pub struct SelkieNodeSpec {
    #[serde(default)]
    pub orchestration_refs: Vec<OrchRef>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct OrchRef {
    pub orchestrator: String,
    pub node_name: String,
}

pub const ORCHESTRATOR_KUBERNETES: &str = "k8s";

/// Cluster-wide datastore state. A single instance named `default` carries
/// the readiness flag controllers gate destructive work on.
#[derive(CustomResource, Clone, Debug, Default, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "selkie.io",
    version = "v1",
    kind = "ClusterInformation",
    plural = "clusterinformations"
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterInformationSpec {
    pub datastore_ready: Option<bool>,
}

/// Raised when a Selkie node has no Kubernetes orchestrator reference.
#[derive(Debug, Error)]
#[error("node {0} is not orchestrated by kubernetes")]
pub struct NotKubernetes(pub String);

/// The Kubernetes node name recorded on a Selkie node.
pub fn k8s_node_name(node: &SelkieNode) -> Result<String, NotKubernetes> {
    node.spec
        .orchestration_refs
        .iter()
        .find(|r| r.orchestrator == ORCHESTRATOR_KUBERNETES)
        .map(|r| r.node_name.clone())
        .ok_or_else(|| NotKubernetes(node.metadata.name.clone().unwrap_or_default()))
}

/// Options for releasing a single allocation with optimistic concurrency.
/// A sequence-number mismatch means the slot was reused and must be left
/// alone.
#[derive(Clone, Debug, PartialEq)]
pub struct ReleaseOptions {
    pub address: String,
    pub handle: String,
    pub sequence_number: Option<u64>,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum AffinityType {
    Host,
}

/// Identifies a set of affinities to operate on.
#[derive(Clone, Debug)]
pub struct AffinityConfig {
    pub affinity_type: AffinityType,
    pub host: String,
}

/// Sync state of a datastore watch session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncStatus {
    WaitForDatastore,
    ResyncInProgress,
    InSync,
}

/// One datastore event as seen by a controller. Deletions carry only the key.
#[derive(Clone, Debug)]
pub enum SyncerUpdate {
    BlockUpserted(IpamBlockSpec),
    BlockDeleted { cidr: String },
    NodeUpserted(SelkieNode),
    NodeDeleted { name: String },
    PoolUpserted { name: String, pool: IpPoolSpec },
    PoolDeleted { name: String },
    /// Cluster information update. `None` leaves the cached readiness
    /// untouched; deletion of the resource is reported as `Some(false)`.
    ClusterInformation { datastore_ready: Option<bool> },
    Status(SyncStatus),
}
