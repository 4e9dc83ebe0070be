//! Tracks how long blocks have been continuously empty.

use std::{collections::HashMap, time::Duration};

use tokio::time::Instant;
use tracing::debug;

/// Gates block affinity release on a dwell period. There is a small but
/// valid window during allocation in which a freshly claimed block is still
/// empty; releasing it immediately would race the allocator.
pub struct BlockReleaseTracker {
    grace_period: Option<Duration>,
    empty_since: HashMap<String, Instant>,
}

impl BlockReleaseTracker {
    pub fn new(grace_period: Option<Duration>) -> Self {
        Self {
            grace_period,
            empty_since: HashMap::new(),
        }
    }

    /// Clears any empty timer for the block.
    pub fn mark_in_use(&mut self, block: &str) {
        if self.empty_since.remove(block).is_some() {
            debug!(
                event.name = "ipam.block_in_use",
                block = %block,
                "block no longer empty, clearing release timer"
            );
        }
    }

    /// Records that the block is empty. Returns true once the block has been
    /// continuously empty for the grace period; with no grace period
    /// configured, returns true immediately.
    pub fn mark_empty(&mut self, block: &str) -> bool {
        let Some(grace) = self.grace_period else {
            return true;
        };
        let now = Instant::now();
        let since = *self
            .empty_since
            .entry(block.to_string())
            .or_insert(now);
        now.duration_since(since) >= grace
    }

    pub fn on_block_deleted(&mut self, block: &str) {
        self.empty_since.remove(block);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn grace_period_is_enforced() {
        let mut t = BlockReleaseTracker::new(Some(Duration::from_secs(900)));

        assert!(!t.mark_empty("10.1.0.0/26"));
        tokio::time::advance(Duration::from_secs(600)).await;
        assert!(!t.mark_empty("10.1.0.0/26"));
        tokio::time::advance(Duration::from_secs(600)).await;
        assert!(t.mark_empty("10.1.0.0/26"));
    }

    #[tokio::test(start_paused = true)]
    async fn in_use_resets_the_timer() {
        let mut t = BlockReleaseTracker::new(Some(Duration::from_secs(900)));

        assert!(!t.mark_empty("10.1.0.0/26"));
        tokio::time::advance(Duration::from_secs(1200)).await;
        t.mark_in_use("10.1.0.0/26");

        assert!(!t.mark_empty("10.1.0.0/26"));
        tokio::time::advance(Duration::from_secs(1200)).await;
        assert!(t.mark_empty("10.1.0.0/26"));
    }

    #[test]
    fn no_grace_period_releases_immediately() {
        let mut t = BlockReleaseTracker::new(None);
        assert!(t.mark_empty("10.1.0.0/26"));
    }

    #[tokio::test(start_paused = true)]
    async fn deletion_forgets_the_block() {
        let mut t = BlockReleaseTracker::new(Some(Duration::from_secs(900)));
        assert!(!t.mark_empty("10.1.0.0/26"));
        tokio::time::advance(Duration::from_secs(1200)).await;
        t.on_block_deleted("10.1.0.0/26");
        // Re-created block starts a fresh dwell.
        assert!(!t.mark_empty("10.1.0.0/26"));
    }
}
