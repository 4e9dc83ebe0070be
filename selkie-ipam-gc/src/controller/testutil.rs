//! Shared fakes and builders for controller tests.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, Pod, PodIP, PodSpec, PodStatus};
use kube::runtime::reflector::{self, store::Writer};
use selkie_ipam::{
    BulkRelease, IpamClient, IpamError,
    model::{
        AffinityConfig, ATTRIBUTE_NAMESPACE, ATTRIBUTE_NODE, ATTRIBUTE_POD, ATTRIBUTE_TYPE,
        AllocationAttribute, IpamBlockSpec, OrchRef, ORCHESTRATOR_KUBERNETES, ReleaseOptions,
        SelkieNode, SelkieNodeSpec,
    },
};

use crate::{
    controller::{ControllerConfig, ControllerHandle, IpamController},
    k8s::{Listers, PodQuerier},
};

/// Records release calls and serves canned node lookups.
#[derive(Default)]
pub(crate) struct FakeIpam {
    pub released: Mutex<Vec<ReleaseOptions>>,
    /// Addresses the next `release_ips` call will fail to release.
    pub withhold: Mutex<HashSet<String>>,
    /// Error attached to the next `release_ips` outcome.
    pub release_error: Mutex<Option<IpamError>>,
    pub affinity_releases: Mutex<Vec<String>>,
    pub host_releases: Mutex<Vec<String>>,
    pub nodes: Mutex<HashMap<String, SelkieNode>>,
}

impl FakeIpam {
    pub fn add_node(&self, name: &str, knode: Option<&str>) {
        self.nodes
            .lock()
            .unwrap()
            .insert(name.to_string(), selkie_node(name, knode));
    }

    pub fn released_addresses(&self) -> Vec<String> {
        self.released
            .lock()
            .unwrap()
            .iter()
            .map(|o| o.address.clone())
            .collect()
    }
}

#[async_trait]
impl IpamClient for FakeIpam {
    async fn release_ips(&self, opts: &[ReleaseOptions]) -> BulkRelease {
        let withhold = self.withhold.lock().unwrap().clone();
        let released: Vec<ReleaseOptions> = opts
            .iter()
            .filter(|o| !withhold.contains(&o.address))
            .cloned()
            .collect();
        self.released.lock().unwrap().extend(released.clone());
        BulkRelease {
            released,
            error: self.release_error.lock().unwrap().take(),
        }
    }

    async fn release_block_affinity(
        &self,
        block: &IpamBlockSpec,
        _require_empty: bool,
    ) -> Result<(), IpamError> {
        self.affinity_releases
            .lock()
            .unwrap()
            .push(block.cidr.clone());
        Ok(())
    }

    async fn release_host_affinities(
        &self,
        affinity: &AffinityConfig,
        _require_empty: bool,
    ) -> Result<(), IpamError> {
        self.host_releases.lock().unwrap().push(affinity.host.clone());
        Ok(())
    }

    async fn get_node(&self, name: &str) -> Result<SelkieNode, IpamError> {
        self.nodes
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| IpamError::ResourceDoesNotExist(name.to_string()))
    }
}

/// Direct pod lookups served from a map, standing in for the API server.
#[derive(Default)]
pub(crate) struct FakePods {
    pods: Mutex<HashMap<(String, String), Pod>>,
    pub fail: Mutex<bool>,
}

impl FakePods {
    pub fn put(&self, pod: Pod) {
        let ns = pod.metadata.namespace.clone().unwrap_or_default();
        let name = pod.metadata.name.clone().unwrap_or_default();
        self.pods.lock().unwrap().insert((ns, name), pod);
    }

}

#[async_trait]
impl PodQuerier for FakePods {
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>, kube::Error> {
        if *self.fail.lock().unwrap() {
            return Err(kube::Error::Api(kube::core::ErrorResponse {
                status: "Failure".to_string(),
                message: "injected failure".to_string(),
                reason: "InternalError".to_string(),
                code: 500,
            }));
        }
        Ok(self
            .pods
            .lock()
            .unwrap()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }
}

pub(crate) struct Harness {
    pub controller: IpamController,
    pub handle: ControllerHandle,
    pub ipam: Arc<FakeIpam>,
    pub pods_api: Arc<FakePods>,
    pub pod_writer: Writer<Pod>,
    pub node_writer: Writer<Node>,
}

pub(crate) fn harness(config: ControllerConfig) -> Harness {
    let (pod_store, pod_writer) = reflector::store();
    let (node_store, node_writer) = reflector::store();
    let ipam = Arc::new(FakeIpam::default());
    let pods_api = Arc::new(FakePods::default());
    let (controller, handle) = IpamController::new(
        config,
        ipam.clone(),
        Listers {
            pods: pod_store,
            nodes: node_store,
        },
        pods_api.clone(),
    );
    Harness {
        controller,
        handle,
        ipam,
        pods_api,
        pod_writer,
        node_writer,
    }
}

pub(crate) fn apply<K>(writer: &mut Writer<K>, obj: K)
where
    K: kube::runtime::reflector::Lookup + Clone + 'static,
    K::DynamicType: Default + Eq + std::hash::Hash + Clone,
{
    writer.apply_watcher_event(&kube::runtime::watcher::Event::Apply(obj));
}

pub(crate) fn delete<K>(writer: &mut Writer<K>, obj: K)
where
    K: kube::runtime::reflector::Lookup + Clone + 'static,
    K::DynamicType: Default + Eq + std::hash::Hash + Clone,
{
    writer.apply_watcher_event(&kube::runtime::watcher::Event::Delete(obj));
}

pub(crate) fn pod(ns: &str, name: &str, node: &str, ips: &[&str]) -> Pod {
    let mut pod = Pod::default();
    pod.metadata.namespace = Some(ns.to_string());
    pod.metadata.name = Some(name.to_string());
    pod.spec = Some(PodSpec {
        node_name: Some(node.to_string()),
        ..Default::default()
    });
    pod.status = Some(PodStatus {
        pod_ip: ips.first().map(|ip| ip.to_string()),
        pod_ips: Some(
            ips.iter()
                .map(|ip| PodIP { ip: ip.to_string() })
                .collect(),
        ),
        ..Default::default()
    });
    pod
}

pub(crate) fn k8s_node(name: &str) -> Node {
    let mut node = Node::default();
    node.metadata.name = Some(name.to_string());
    node
}

pub(crate) fn selkie_node(name: &str, knode: Option<&str>) -> SelkieNode {
    let mut spec = SelkieNodeSpec::default();
    if let Some(knode) = knode {
        spec.orchestration_refs.push(OrchRef {
            orchestrator: ORCHESTRATOR_KUBERNETES.to_string(),
            node_name: knode.to_string(),
        });
    }
    SelkieNode::new(name, spec)
}

/// Builds block specs for tests.
pub(crate) struct BlockBuilder {
    spec: IpamBlockSpec,
}

impl BlockBuilder {
    pub fn new(cidr: &str) -> Self {
        let size = cidr
            .parse::<ipnetwork::IpNetwork>()
            .map(|net| match net {
                ipnetwork::IpNetwork::V4(n) => 1usize << (32 - n.prefix()).min(10),
                ipnetwork::IpNetwork::V6(n) => 1usize << (128 - n.prefix()).min(10),
            })
            .unwrap_or(64);
        Self {
            spec: IpamBlockSpec {
                cidr: cidr.to_string(),
                allocations: vec![None; size],
                ..Default::default()
            },
        }
    }

    pub fn affinity(mut self, node: &str) -> Self {
        self.spec.affinity = Some(format!("host:{node}"));
        self
    }

    pub fn allocation(mut self, ordinal: u32, attr: AllocationAttribute) -> Self {
        self.spec.allocations[ordinal as usize] = Some(self.spec.attributes.len() as u32);
        self.spec.attributes.push(attr);
        self
    }

    pub fn pod_allocation(
        self,
        ordinal: u32,
        handle: &str,
        ns: &str,
        pod: &str,
        node: &str,
    ) -> Self {
        let mut secondary = std::collections::BTreeMap::new();
        secondary.insert(ATTRIBUTE_NAMESPACE.to_string(), ns.to_string());
        secondary.insert(ATTRIBUTE_POD.to_string(), pod.to_string());
        secondary.insert(ATTRIBUTE_NODE.to_string(), node.to_string());
        self.allocation(
            ordinal,
            AllocationAttribute {
                handle: Some(handle.to_string()),
                secondary,
            },
        )
    }

    pub fn tunnel_allocation(self, ordinal: u32, handle: &str, node: &str, kind: &str) -> Self {
        let mut secondary = std::collections::BTreeMap::new();
        secondary.insert(ATTRIBUTE_NODE.to_string(), node.to_string());
        secondary.insert(ATTRIBUTE_TYPE.to_string(), kind.to_string());
        self.allocation(
            ordinal,
            AllocationAttribute {
                handle: Some(handle.to_string()),
                secondary,
            },
        )
    }

    pub fn build(self) -> IpamBlockSpec {
        self.spec
    }
}
