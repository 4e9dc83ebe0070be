//! Tracks which allocations share a workload handle.

use std::collections::{HashMap, HashSet};

use crate::state::allocation::Allocation;

/// Indexes allocation ids by handle. A handle usually covers a single IP, but
/// dual-stack and multi-network workloads allocate several IPs together; the
/// garbage collector must only release a handle once every IP under it is
/// confirmed leaked.
#[derive(Default)]
pub struct HandleTracker {
    by_handle: HashMap<String, HashSet<String>>,
}

impl HandleTracker {
    pub fn set_allocation(&mut self, a: &Allocation) {
        self.by_handle
            .entry(a.handle.clone())
            .or_default()
            .insert(a.id());
    }

    pub fn remove_allocation(&mut self, a: &Allocation) {
        if let Some(ids) = self.by_handle.get_mut(&a.handle) {
            ids.remove(&a.id());
            if ids.is_empty() {
                self.by_handle.remove(&a.handle);
            }
        }
    }

    /// True iff every allocation sharing `handle` is a confirmed leak,
    /// according to the supplied lookup. Gates destructive release so a
    /// partially leaked handle is never garbage collected.
    pub fn is_confirmed_leak(&self, handle: &str, is_confirmed: impl Fn(&str) -> bool) -> bool {
        self.by_handle
            .get(handle)
            .map(|ids| ids.iter().all(|id| is_confirmed(id)))
            .unwrap_or(true)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    fn alloc(ip: &str, handle: &str) -> Allocation {
        Allocation::new(
            ip.to_string(),
            handle.to_string(),
            BTreeMap::new(),
            0,
            "10.0.0.0/26".to_string(),
        )
    }

    #[test]
    fn partial_handle_is_not_confirmed() {
        let mut t = HandleTracker::default();
        let a = alloc("10.0.0.1", "h1");
        let b = alloc("fd00::1", "h1");
        t.set_allocation(&a);
        t.set_allocation(&b);

        let confirmed: HashSet<String> = [a.id()].into_iter().collect();
        assert!(!t.is_confirmed_leak("h1", |id| confirmed.contains(id)));

        let confirmed: HashSet<String> = [a.id(), b.id()].into_iter().collect();
        assert!(t.is_confirmed_leak("h1", |id| confirmed.contains(id)));
    }

    #[test]
    fn removal_drops_empty_handles() {
        let mut t = HandleTracker::default();
        let a = alloc("10.0.0.1", "h1");
        t.set_allocation(&a);
        t.remove_allocation(&a);
        assert!(t.by_handle.is_empty());
    }
}
