//! Topology port: orders candidate nodes so the selector prefers the
//! cheapest placement first.

use crate::state::NodeStore;

pub trait TopologyPlugin: Send + Sync {
    /// Reorders candidate node indices in preferred allocation order.
    fn order_nodes(&self, nodes: &NodeStore, candidates: Vec<usize>) -> Vec<usize>;
}

/// Default ordering: ascending weight, ties by table index. Lightly loaded
/// switch-aware orderings replace this in topology-conscious clusters.
pub struct WeightOrderTopology;

impl TopologyPlugin for WeightOrderTopology {
    fn order_nodes(&self, nodes: &NodeStore, mut candidates: Vec<usize>) -> Vec<usize> {
        candidates.sort_by_key(|&i| {
            let weight = nodes.by_index(i).map(|n| n.weight).unwrap_or(u32::MAX);
            (weight, i)
        });
        candidates
    }
}
