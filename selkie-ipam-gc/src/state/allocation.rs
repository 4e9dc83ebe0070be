//! A single tracked IP allocation and its leak state machine.

use std::{collections::BTreeMap, time::Duration};

use selkie_ipam::model::{
    ATTRIBUTE_NAMESPACE, ATTRIBUTE_NODE, ATTRIBUTE_POD, ATTRIBUTE_TYPE, ATTRIBUTE_TYPE_IPIP,
    ATTRIBUTE_TYPE_VXLAN, ATTRIBUTE_TYPE_VXLAN_V6, ATTRIBUTE_TYPE_WIREGUARD,
    ATTRIBUTE_TYPE_WIREGUARD_V6, ReleaseOptions, WINDOWS_RESERVED_HANDLE,
};
use tokio::time::Instant;
use tracing::info;

/// One assigned IP within a block, together with its leak state.
///
/// The state machine has three states: valid (no timer), candidate leak
/// (timer running) and confirmed leak. A candidate becomes confirmed once the
/// grace period has elapsed; an allocation whose node is known to be gone
/// skips the candidate stage entirely. Any state returns to valid when a
/// later check finds the backing pod again.
#[derive(Clone, Debug)]
pub struct Allocation {
    pub ip: String,
    pub handle: String,
    pub attrs: BTreeMap<String, String>,
    pub sequence_number: u64,
    pub block: String,

    /// Kubernetes node hosting this allocation, resolved during scans. Empty
    /// when the plugin node has no Kubernetes counterpart.
    pub knode: String,

    leaked_at: Option<Instant>,
    confirmed_leak: bool,
}

impl Allocation {
    pub fn new(
        ip: String,
        handle: String,
        attrs: BTreeMap<String, String>,
        sequence_number: u64,
        block: String,
    ) -> Self {
        Self {
            ip,
            handle,
            attrs,
            sequence_number,
            block,
            knode: String::new(),
            leaked_at: None,
            confirmed_leak: false,
        }
    }

    /// Unique id within the controller's caches.
    pub fn id(&self) -> String {
        format!("{}/{}/{}", self.block, self.ip, self.sequence_number)
    }

    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attrs.get(key).map(String::as_str)
    }

    /// The plugin node this allocation was made on, or `""` if unrecorded.
    pub fn node(&self) -> &str {
        self.attr(ATTRIBUTE_NODE).unwrap_or("")
    }

    pub fn pod(&self) -> Option<&str> {
        self.attr(ATTRIBUTE_POD)
    }

    pub fn namespace(&self) -> Option<&str> {
        self.attr(ATTRIBUTE_NAMESPACE)
    }

    pub fn is_pod_ip(&self) -> bool {
        self.pod().is_some_and(|p| !p.is_empty())
            && self.namespace().is_some_and(|ns| !ns.is_empty())
    }

    pub fn is_tunnel_address(&self) -> bool {
        matches!(
            self.attr(ATTRIBUTE_TYPE),
            Some(
                ATTRIBUTE_TYPE_IPIP
                    | ATTRIBUTE_TYPE_VXLAN
                    | ATTRIBUTE_TYPE_VXLAN_V6
                    | ATTRIBUTE_TYPE_WIREGUARD
                    | ATTRIBUTE_TYPE_WIREGUARD_V6
            )
        )
    }

    /// Windows reserved addresses are never garbage collected individually;
    /// they go away with their block.
    pub fn is_windows_reserved(&self) -> bool {
        self.handle == WINDOWS_RESERVED_HANDLE
    }

    /// Clears any leak state. Called whenever a check finds the allocation in
    /// use after all.
    pub fn mark_valid(&mut self) {
        if self.leaked_at.is_some() || self.confirmed_leak {
            info!(
                event.name = "ipam.allocation_valid",
                ip = %self.ip,
                handle = %self.handle,
                "allocation is in use, clearing leak state"
            );
        }
        self.leaked_at = None;
        self.confirmed_leak = false;
    }

    /// Marks the allocation as a candidate leak, promoting it to confirmed
    /// once it has been a candidate for at least `grace`.
    pub fn mark_leak(&mut self, grace: Duration) {
        let since = *self.leaked_at.get_or_insert_with(|| {
            info!(
                event.name = "ipam.leak_candidate",
                ip = %self.ip,
                handle = %self.handle,
                block = %self.block,
                "allocation marked as a candidate leak"
            );
            Instant::now()
        });
        if since.elapsed() >= grace {
            self.mark_confirmed_leak();
        }
    }

    /// Skips the candidate stage. Used when the hosting node is known absent.
    pub fn mark_confirmed_leak(&mut self) {
        if !self.confirmed_leak {
            info!(
                event.name = "ipam.leak_confirmed",
                ip = %self.ip,
                handle = %self.handle,
                block = %self.block,
                "allocation confirmed as leaked"
            );
        }
        if self.leaked_at.is_none() {
            self.leaked_at = Some(Instant::now());
        }
        self.confirmed_leak = true;
    }

    pub fn is_candidate_leak(&self) -> bool {
        self.leaked_at.is_some() && !self.confirmed_leak
    }

    pub fn is_confirmed_leak(&self) -> bool {
        self.confirmed_leak
    }

    /// Options for releasing this allocation with optimistic concurrency:
    /// the datastore refuses the release if the slot was reused since.
    pub fn release_options(&self) -> ReleaseOptions {
        ReleaseOptions {
            address: self.ip.clone(),
            handle: self.handle.clone(),
            sequence_number: Some(self.sequence_number),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pod_allocation() -> Allocation {
        let mut attrs = BTreeMap::new();
        attrs.insert(ATTRIBUTE_POD.to_string(), "p1".to_string());
        attrs.insert(ATTRIBUTE_NAMESPACE.to_string(), "ns1".to_string());
        attrs.insert(ATTRIBUTE_NODE.to_string(), "node-a".to_string());
        Allocation::new(
            "10.0.0.5".to_string(),
            "h1".to_string(),
            attrs,
            0,
            "10.0.0.0/26".to_string(),
        )
    }

    #[test]
    fn classification() {
        let a = pod_allocation();
        assert!(a.is_pod_ip());
        assert!(!a.is_tunnel_address());
        assert!(!a.is_windows_reserved());

        let mut tunnel = pod_allocation();
        tunnel.attrs.clear();
        tunnel
            .attrs
            .insert(ATTRIBUTE_TYPE.to_string(), ATTRIBUTE_TYPE_VXLAN.to_string());
        assert!(tunnel.is_tunnel_address());
        assert!(!tunnel.is_pod_ip());

        let mut reserved = pod_allocation();
        reserved.handle = WINDOWS_RESERVED_HANDLE.to_string();
        assert!(reserved.is_windows_reserved());
    }

    #[tokio::test(start_paused = true)]
    async fn candidate_promotes_after_grace() {
        let grace = Duration::from_secs(30);
        let mut a = pod_allocation();

        a.mark_leak(grace);
        assert!(a.is_candidate_leak());
        assert!(!a.is_confirmed_leak());

        tokio::time::advance(Duration::from_secs(29)).await;
        a.mark_leak(grace);
        assert!(a.is_candidate_leak());

        tokio::time::advance(Duration::from_secs(2)).await;
        a.mark_leak(grace);
        assert!(a.is_confirmed_leak());
        assert!(!a.is_candidate_leak());
    }

    #[tokio::test(start_paused = true)]
    async fn mark_valid_clears_timer() {
        let mut a = pod_allocation();
        a.mark_leak(Duration::from_secs(30));
        a.mark_valid();
        assert!(!a.is_candidate_leak());

        // A fresh candidacy starts the clock over.
        tokio::time::advance(Duration::from_secs(60)).await;
        a.mark_leak(Duration::from_secs(30));
        assert!(a.is_candidate_leak());
        assert!(!a.is_confirmed_leak());
    }

    #[test]
    fn confirmed_leak_skips_candidacy() {
        let mut a = pod_allocation();
        a.mark_confirmed_leak();
        assert!(a.is_confirmed_leak());
        assert!(!a.is_candidate_leak());
    }

    #[test]
    fn release_options_carry_sequence_number() {
        let mut a = pod_allocation();
        a.sequence_number = 12;
        let opts = a.release_options();
        assert_eq!(opts.address, "10.0.0.5");
        assert_eq!(opts.handle, "h1");
        assert_eq!(opts.sequence_number, Some(12));
    }
}
