//! Associates allocation blocks with the IP pool they were carved from.

use std::collections::{HashMap, HashSet};

use ipnetwork::IpNetwork;
use selkie_ipam::model::IpPoolSpec;
use tracing::{debug, warn};

/// Pool label used for blocks that match no known pool, e.g. blocks from a
/// pool that was deleted while its blocks still exist.
pub const UNKNOWN_POOL_LABEL: &str = "";

/// Maintains the pool set and the bidirectional pool ↔ block association.
#[derive(Default)]
pub struct PoolManager {
    all_pools: HashMap<String, IpPoolSpec>,
    blocks_by_pool: HashMap<String, HashSet<String>>,
    pools_by_block: HashMap<String, String>,
}

impl PoolManager {
    pub fn contains_pool(&self, name: &str) -> bool {
        self.all_pools.contains_key(name)
    }

    pub fn blocks_by_pool(&self) -> &HashMap<String, HashSet<String>> {
        &self.blocks_by_pool
    }

    /// The pool owning `block`, or [`UNKNOWN_POOL_LABEL`].
    pub fn pool_of_block(&self, block: &str) -> &str {
        self.pools_by_block
            .get(block)
            .map(String::as_str)
            .unwrap_or(UNKNOWN_POOL_LABEL)
    }

    pub fn on_pool_updated(&mut self, name: String, pool: IpPoolSpec) {
        let is_new = self.all_pools.insert(name.clone(), pool).is_none();
        self.blocks_by_pool.entry(name).or_default();
        if is_new {
            // Blocks seen before their pool were filed under the unknown
            // pool; give them another chance to match.
            let orphans: Vec<String> = self
                .blocks_by_pool
                .get(UNKNOWN_POOL_LABEL)
                .map(|b| b.iter().cloned().collect())
                .unwrap_or_default();
            for block in orphans {
                self.on_block_updated(&block);
            }
        }
    }

    pub fn on_pool_deleted(&mut self, name: &str) {
        self.all_pools.remove(name);
        if let Some(blocks) = self.blocks_by_pool.remove(name) {
            for block in blocks {
                self.pools_by_block.remove(&block);
            }
        }
    }

    /// Re-resolves the owning pool for a block by containment match.
    pub fn on_block_updated(&mut self, block: &str) {
        let pool = self.match_pool(block).unwrap_or(UNKNOWN_POOL_LABEL.to_string());
        if let Some(previous) = self.pools_by_block.get(block) {
            if *previous == pool {
                return;
            }
            let previous = previous.clone();
            if let Some(blocks) = self.blocks_by_pool.get_mut(&previous) {
                blocks.remove(block);
            }
        }
        debug!(
            event.name = "ipam.block_pool_assigned",
            block = %block,
            pool = %pool,
            "assigned block to pool"
        );
        self.blocks_by_pool
            .entry(pool.clone())
            .or_default()
            .insert(block.to_string());
        self.pools_by_block.insert(block.to_string(), pool);
    }

    pub fn on_block_deleted(&mut self, block: &str) {
        if let Some(pool) = self.pools_by_block.remove(block) {
            if let Some(blocks) = self.blocks_by_pool.get_mut(&pool) {
                blocks.remove(block);
            }
        }
    }

    /// Longest-prefix containment match of the block CIDR against known pool
    /// CIDRs.
    fn match_pool(&self, block: &str) -> Option<String> {
        let block_net: IpNetwork = match block.parse() {
            Ok(net) => net,
            Err(e) => {
                warn!(
                    event.name = "ipam.block_cidr_unparseable",
                    block = %block,
                    error.message = %e,
                    "cannot determine owning pool for malformed block CIDR"
                );
                return None;
            }
        };
        self.all_pools
            .iter()
            .filter_map(|(name, pool)| {
                let pool_net: IpNetwork = pool.cidr.parse().ok()?;
                (pool_net.contains(block_net.network()) && pool_net.prefix() <= block_net.prefix())
                    .then_some((name, pool_net.prefix()))
            })
            .max_by_key(|(_, prefix)| *prefix)
            .map(|(name, _)| name.clone())
    }
}
