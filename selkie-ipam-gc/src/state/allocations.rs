//! Primary allocation store with per-node and per-block indices.

use std::collections::{HashMap, HashSet};

use k8s_openapi::api::core::v1::Pod;
use tracing::debug;

use crate::state::allocation::Allocation;

/// Owns every tracked [`Allocation`] and keeps the lookup indices in step.
///
/// Other components (handle tracker, confirmed-leak index) refer to
/// allocations by id only; this store is the single owner of the records.
/// Nodes whose allocations changed since the last sync are tracked as dirty
/// so incremental scans can skip the rest.
#[derive(Default)]
pub struct AllocationState {
    allocations: HashMap<String, Allocation>,
    by_block: HashMap<String, HashSet<String>>,
    by_node: HashMap<String, HashSet<String>>,
    dirty_nodes: HashSet<String>,
}

impl AllocationState {
    pub fn contains(&self, id: &str) -> bool {
        self.allocations.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<&Allocation> {
        self.allocations.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut Allocation> {
        self.allocations.get_mut(id)
    }

    pub fn is_confirmed(&self, id: &str) -> bool {
        self.allocations
            .get(id)
            .is_some_and(Allocation::is_confirmed_leak)
    }

    /// Adds an allocation, marking its node dirty. Allocations with no node
    /// attribute are indexed by block only.
    pub fn allocate(&mut self, a: Allocation) {
        let id = a.id();
        let node = a.node().to_string();
        self.by_block
            .entry(a.block.clone())
            .or_default()
            .insert(id.clone());
        if !node.is_empty() {
            self.by_node.entry(node.clone()).or_default().insert(id.clone());
            self.dirty_nodes.insert(node);
        }
        self.allocations.insert(id, a);
    }

    /// Removes an allocation and returns it. The node stays marked dirty for
    /// one more sync so the release itself is observed.
    pub fn release(&mut self, id: &str) -> Option<Allocation> {
        let a = self.allocations.remove(id)?;
        if let Some(ids) = self.by_block.get_mut(&a.block) {
            ids.remove(id);
            if ids.is_empty() {
                self.by_block.remove(&a.block);
            }
        }
        let node = a.node().to_string();
        if !node.is_empty() {
            if let Some(ids) = self.by_node.get_mut(&node) {
                ids.remove(id);
                if ids.is_empty() {
                    self.by_node.remove(&node);
                }
            }
            self.dirty_nodes.insert(node);
        }
        Some(a)
    }

    /// Marks the node that hosted a deleted pod for re-inspection.
    /// Best effort: a pod that was never scheduled is a no-op.
    pub fn mark_dirty_pod_deleted(&mut self, pod: &Pod) {
        let Some(node) = pod
            .spec
            .as_ref()
            .and_then(|s| s.node_name.as_deref())
            .filter(|n| !n.is_empty())
        else {
            return;
        };
        debug!(
            event.name = "ipam.pod_deleted",
            node = %node,
            "marking node dirty after pod deletion"
        );
        self.dirty_nodes.insert(node.to_string());
    }

    pub fn iter(&self, mut f: impl FnMut(&str, &HashSet<String>)) {
        for (node, ids) in &self.by_node {
            f(node, ids);
        }
    }

    pub fn nodes(&self) -> impl Iterator<Item = &String> {
        self.by_node.keys()
    }

    pub fn dirty_nodes(&self) -> Vec<String> {
        self.dirty_nodes.iter().cloned().collect()
    }

    pub fn ids_for_node(&self, node: &str) -> Vec<String> {
        self.by_node
            .get(node)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn ids_for_block(&self, block: &str) -> Vec<String> {
        self.by_block
            .get(block)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Clears the dirty set once a sync has fully completed.
    pub fn sync_complete(&mut self) {
        self.dirty_nodes.clear();
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use k8s_openapi::api::core::v1::PodSpec;
    use selkie_ipam::model::ATTRIBUTE_NODE;

    use super::*;

    fn alloc(ip: &str, node: &str, block: &str) -> Allocation {
        let mut attrs = BTreeMap::new();
        if !node.is_empty() {
            attrs.insert(ATTRIBUTE_NODE.to_string(), node.to_string());
        }
        Allocation::new(
            ip.to_string(),
            format!("handle-{ip}"),
            attrs,
            0,
            block.to_string(),
        )
    }

    #[test]
    fn allocate_indexes_and_dirties() {
        let mut s = AllocationState::default();
        let a = alloc("10.0.0.1", "node-a", "10.0.0.0/26");
        let id = a.id();
        s.allocate(a);

        assert!(s.contains(&id));
        assert_eq!(s.ids_for_node("node-a"), vec![id.clone()]);
        assert_eq!(s.ids_for_block("10.0.0.0/26"), vec![id]);
        assert_eq!(s.dirty_nodes(), vec!["node-a".to_string()]);
    }

    #[test]
    fn release_keeps_node_dirty_for_final_pass() {
        let mut s = AllocationState::default();
        let a = alloc("10.0.0.1", "node-a", "10.0.0.0/26");
        let id = a.id();
        s.allocate(a);
        s.sync_complete();
        assert!(s.dirty_nodes().is_empty());

        let released = s.release(&id).unwrap();
        assert_eq!(released.ip, "10.0.0.1");
        assert!(!s.contains(&id));
        assert!(s.ids_for_node("node-a").is_empty());
        // The last release is still observed by the next sync.
        assert_eq!(s.dirty_nodes(), vec!["node-a".to_string()]);
    }

    #[test]
    fn nodeless_allocations_are_block_indexed_only() {
        let mut s = AllocationState::default();
        let a = alloc("10.0.0.2", "", "10.0.0.0/26");
        let id = a.id();
        s.allocate(a);

        assert!(s.contains(&id));
        assert!(s.dirty_nodes().is_empty());
        assert_eq!(s.ids_for_block("10.0.0.0/26").len(), 1);
    }

    #[test]
    fn pod_deletion_marks_scheduled_node() {
        let mut s = AllocationState::default();
        let mut pod = Pod::default();
        s.mark_dirty_pod_deleted(&pod);
        assert!(s.dirty_nodes().is_empty());

        pod.spec = Some(PodSpec {
            node_name: Some("node-b".to_string()),
            ..Default::default()
        });
        s.mark_dirty_pod_deleted(&pod);
        assert_eq!(s.dirty_nodes(), vec!["node-b".to_string()]);
    }
}
