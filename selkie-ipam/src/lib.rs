//! Shared Selkie IPAM datastore model and client.
//!
//! The Selkie IPAM datastore lives in cluster-scoped custom resources:
//! [`model::IpamBlock`] for allocation blocks, [`model::IpPool`] for pools and
//! [`model::SelkieNode`] for per-node plugin state. This crate defines those
//! resources, the message types consumed by controllers watching the
//! datastore, and the [`client::IpamClient`] trait with its Kubernetes-backed
//! implementation.

pub mod client;
pub mod error;
pub mod model;

pub use client::{BulkRelease, IpamClient, KubernetesIpamClient};
pub use error::IpamError;
pub use model::{
    AffinityConfig, AffinityType, AllocationAttribute, ClusterInformation,
    ClusterInformationSpec, IpPool, IpPoolSpec, IpamBlock, IpamBlockSpec, NotKubernetes,
    ReleaseOptions, SelkieNode, SelkieNodeSpec, SyncStatus, SyncerUpdate,
};
