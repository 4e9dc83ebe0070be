//! Metric definitions and the per-pool vector lifecycle.
//!
//! Pool-dimensioned metrics carry the pool as a constant label on a vector
//! created per pool, so the whole vector can be dropped when the pool goes
//! away without disturbing other pools. Legacy per-node gauges predate the
//! pool dimension and are kept for dashboards built against them.

use std::collections::HashMap;

use dashmap::DashMap;
use ipnetwork::IpNetwork;
use lazy_static::lazy_static;
use prometheus::{GaugeVec, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry};
use tracing::warn;

use crate::state::pools::UNKNOWN_POOL_LABEL;

/// Node label for allocations whose node attribute is unset.
pub const UNKNOWN_NODE_LABEL: &str = "unknown_node";

/// Node label for blocks that have no affinity.
pub const NO_AFFINITY_LABEL: &str = "no_affinity";

lazy_static! {
    /// Registry backing the `/metrics` endpoint.
    pub static ref REGISTRY: Registry = Registry::new();

    pub static ref POOL_SIZE_GAUGE: GaugeVec = GaugeVec::new(
        Opts::new("ipam_ippool_size", "Total number of addresses in the IP pool"),
        &["ippool"]
    ).expect("failed to create ipam_ippool_size metric");

    pub static ref LEGACY_ALLOCATIONS_GAUGE: IntGaugeVec = IntGaugeVec::new(
        Opts::new("ipam_allocations_per_node", "Number of IPs allocated"),
        &["node"]
    ).expect("failed to create ipam_allocations_per_node metric");

    pub static ref LEGACY_BORROWED_GAUGE: IntGaugeVec = IntGaugeVec::new(
        Opts::new(
            "ipam_allocations_borrowed_per_node",
            "Number of allocated IPs that are from non-affine blocks."
        ),
        &["node"]
    ).expect("failed to create ipam_allocations_borrowed_per_node metric");

    pub static ref LEGACY_BLOCKS_GAUGE: IntGaugeVec = IntGaugeVec::new(
        Opts::new("ipam_blocks_per_node", "Number of blocks in IPAM"),
        &["node"]
    ).expect("failed to create ipam_blocks_per_node metric");

    /// Allocations that carry no handle. The garbage collector can never
    /// reclaim these; they are only released with their block.
    pub static ref MISSING_HANDLE_GAUGE: IntGauge = IntGauge::new(
        "ipam_allocations_missing_handle",
        "Allocations without a handle, which cannot be reclaimed individually"
    ).expect("failed to create ipam_allocations_missing_handle metric");

    static ref POOL_VECTORS: DashMap<String, PoolVectors> = DashMap::new();
}

/// The pool-dimensioned vectors registered for one pool.
#[derive(Clone)]
pub struct PoolVectors {
    pub in_use: IntGaugeVec,
    pub borrowed: IntGaugeVec,
    pub blocks: IntGaugeVec,
    pub gc_candidates: IntGaugeVec,
    pub gc_reclamations: IntCounterVec,
}

/// Registers the static collectors and the unknown-pool vectors. Idempotent.
pub fn init_registry() {
    static ONCE: std::sync::Once = std::sync::Once::new();
    ONCE.call_once(|| {
        REGISTRY
            .register(Box::new(POOL_SIZE_GAUGE.clone()))
            .expect("failed to register ipam_ippool_size");
        REGISTRY
            .register(Box::new(LEGACY_ALLOCATIONS_GAUGE.clone()))
            .expect("failed to register ipam_allocations_per_node");
        REGISTRY
            .register(Box::new(LEGACY_BORROWED_GAUGE.clone()))
            .expect("failed to register ipam_allocations_borrowed_per_node");
        REGISTRY
            .register(Box::new(LEGACY_BLOCKS_GAUGE.clone()))
            .expect("failed to register ipam_blocks_per_node");
        REGISTRY
            .register(Box::new(MISSING_HANDLE_GAUGE.clone()))
            .expect("failed to register ipam_allocations_missing_handle");

        // Blocks with no matching pool report under this label.
        register_pool_vectors(UNKNOWN_POOL_LABEL);
    });
}

/// Creates and registers the vectors for a pool. No-op for known pools.
pub fn register_pool_vectors(pool: &str) {
    if POOL_VECTORS.contains_key(pool) {
        return;
    }

    let new_gauge = |name: &str, help: &str| {
        IntGaugeVec::new(
            Opts::new(name, help).const_label("ippool", pool),
            &["node"],
        )
        .expect("failed to create pool gauge vector")
    };

    let vectors = PoolVectors {
        in_use: new_gauge(
            "ipam_allocations_in_use",
            "IPs currently allocated in IPAM to a workload or tunnel endpoint.",
        ),
        borrowed: new_gauge(
            "ipam_allocations_borrowed",
            "IPs currently allocated in IPAM where the allocation was borrowed from a block \
             affine to another node.",
        ),
        blocks: new_gauge("ipam_blocks", "IPAM blocks currently allocated for the IP pool."),
        gc_candidates: new_gauge(
            "ipam_allocations_gc_candidates",
            "Allocations currently marked by the garbage collector as potential candidates to \
             reclaim.",
        ),
        gc_reclamations: IntCounterVec::new(
            Opts::new(
                "ipam_allocations_gc_reclamations",
                "Total allocations reclaimed by the garbage collector over time.",
            )
            .const_label("ippool", pool),
            &["node"],
        )
        .expect("failed to create pool counter vector"),
    };

    for collector in [
        Box::new(vectors.in_use.clone()) as Box<dyn prometheus::core::Collector>,
        Box::new(vectors.borrowed.clone()),
        Box::new(vectors.blocks.clone()),
        Box::new(vectors.gc_candidates.clone()),
        Box::new(vectors.gc_reclamations.clone()),
    ] {
        if let Err(e) = REGISTRY.register(collector) {
            warn!(
                event.name = "metrics.pool_register_failed",
                pool = %pool,
                error.message = %e,
                "failed to register pool metric vector"
            );
        }
    }
    POOL_VECTORS.insert(pool.to_string(), vectors);
}

/// Drops a deleted pool's vectors from the registry.
pub fn unregister_pool_vectors(pool: &str) {
    let Some((_, vectors)) = POOL_VECTORS.remove(pool) else {
        return;
    };
    let _ = REGISTRY.unregister(Box::new(vectors.in_use));
    let _ = REGISTRY.unregister(Box::new(vectors.borrowed));
    let _ = REGISTRY.unregister(Box::new(vectors.blocks));
    let _ = REGISTRY.unregister(Box::new(vectors.gc_candidates));
    let _ = REGISTRY.unregister(Box::new(vectors.gc_reclamations));
}

pub fn publish_pool_size(pool: &str, cidr: &str) {
    let net: IpNetwork = match cidr.parse() {
        Ok(net) => net,
        Err(e) => {
            warn!(
                event.name = "metrics.pool_cidr_unparseable",
                pool = %pool,
                error.message = %e,
                "unable to parse CIDR for IP pool"
            );
            return;
        }
    };
    let bits = match net {
        IpNetwork::V4(_) => 32,
        IpNetwork::V6(_) => 128,
    };
    let size = 2f64.powi(i32::from(bits - net.prefix()));
    POOL_SIZE_GAUGE.with_label_values(&[pool]).set(size);
}

pub fn clear_pool_size(pool: &str) {
    let _ = POOL_SIZE_GAUGE.remove_label_values(&[pool]);
}

/// Replaces a pool's gauge values wholesale, resetting series for nodes that
/// disappeared since the last sync.
pub fn update_pool_gauges(
    pool: &str,
    in_use: &HashMap<String, i64>,
    borrowed: &HashMap<String, i64>,
    blocks: &HashMap<String, i64>,
    gc_candidates: &HashMap<String, i64>,
) {
    let Some(vectors) = POOL_VECTORS.get(pool) else {
        warn!(
            event.name = "metrics.pool_vectors_missing",
            pool = %pool,
            "gauge vectors for pool were never created, skipping publish"
        );
        return;
    };
    set_node_values(&vectors.in_use, in_use);
    set_node_values(&vectors.borrowed, borrowed);
    set_node_values(&vectors.blocks, blocks);
    set_node_values(&vectors.gc_candidates, gc_candidates);
}

fn set_node_values(gauge: &IntGaugeVec, values: &HashMap<String, i64>) {
    gauge.reset();
    for (node, value) in values {
        gauge.with_label_values(&[node]).set(*value);
    }
}

pub fn increment_reclamation(pool: &str, node: &str) {
    let Some(vectors) = POOL_VECTORS.get(pool) else {
        warn!(
            event.name = "metrics.pool_vectors_missing",
            pool = %pool,
            "reclamation counter for pool was never created, skipping publish"
        );
        return;
    };
    vectors.gc_reclamations.with_label_values(&[node]).inc();
}

/// Clears reclamation counters for a node once the node itself is released,
/// so stale series do not accumulate.
pub fn clear_reclaimed_count_for_node(node: &str) {
    for entry in POOL_VECTORS.iter() {
        let _ = entry.gc_reclamations.remove_label_values(&[node]);
    }
}

#[cfg(test)]
mod tests {
    use prometheus::TextEncoder;
    use serial_test::serial;

    use super::*;

    fn rendered() -> String {
        TextEncoder::new()
            .encode_to_string(&REGISTRY.gather())
            .expect("encode metrics")
    }

    #[test]
    #[serial]
    fn pool_vector_lifecycle() {
        init_registry();

        register_pool_vectors("test-pool");
        increment_reclamation("test-pool", "node-a");
        let text = rendered();
        assert!(text.contains(
            r#"ipam_allocations_gc_reclamations{ippool="test-pool",node="node-a"} 1"#
        ));

        unregister_pool_vectors("test-pool");
        let text = rendered();
        assert!(!text.contains(r#"ippool="test-pool""#));
        // Publishing against a dropped vector is a logged no-op.
        increment_reclamation("test-pool", "node-a");
    }

    #[test]
    #[serial]
    fn pool_size_is_two_to_the_host_bits() {
        init_registry();
        publish_pool_size("sized-pool", "10.0.0.0/24");
        assert!(rendered().contains(r#"ipam_ippool_size{ippool="sized-pool"} 256"#));
        clear_pool_size("sized-pool");
    }

    #[test]
    #[serial]
    fn reclamation_counters_clear_per_node() {
        init_registry();
        register_pool_vectors("clear-pool");
        increment_reclamation("clear-pool", "node-b");
        assert!(rendered().contains(r#"ippool="clear-pool",node="node-b"} 1"#));

        clear_reclaimed_count_for_node("node-b");
        assert!(!rendered().contains(r#"ippool="clear-pool",node="node-b"}"#));
        unregister_pool_vectors("clear-pool");
    }
}
