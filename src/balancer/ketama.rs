//! Ketama 一致性哈希
//!
//! 每个节点按权重占据 `floor(weight / total * 40 * N)` 组虚拟点，每组由
//! `md5("{label}-{k}")` 的 16 字节切出 4 个小端 u32。环按点位排序，
//! key 的哈希取 md5 前 4 字节（小端），顺时针找到第一个不小于它的点。

use std::collections::HashMap;
use std::sync::RwLock;

use tracing::debug;

use super::{NodeSelector, NodeSet};
use crate::error::{Result, RouteError};

const POINTS_PER_DIGEST: usize = 4;
const DIGESTS_PER_BUCKET: u64 = 40;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct ContinuumPoint {
    point: u32,
    label: String,
}

/// 有序哈希环
#[derive(Debug, Default)]
struct Continuum {
    ring: Vec<ContinuumPoint>,
}

impl Continuum {
    fn build(nodes: &HashMap<String, u32>) -> Result<Self> {
        if nodes.is_empty() {
            return Err(RouteError::BalancerEmptyNodes);
        }

        let total_weight: u64 = nodes.values().map(|w| u64::from(*w)).sum();
        if total_weight == 0 {
            return Err(RouteError::BalancerEmptyNodes);
        }

        let bucket_count = nodes.len() as u64;
        let mut ring = Vec::new();
        for (label, weight) in nodes {
            let limit = (u64::from(*weight) * DIGESTS_PER_BUCKET * bucket_count / total_weight) as usize;
            ring.reserve(limit * POINTS_PER_DIGEST);
            for k in 0..limit {
                let digest = md5::compute(format!("{label}-{k}"));
                for h in 0..POINTS_PER_DIGEST {
                    ring.push(ContinuumPoint {
                        point: le_u32(&digest.0, h * 4),
                        label: label.clone(),
                    });
                }
            }
        }

        if ring.is_empty() {
            return Err(RouteError::BalancerEmptyNodes);
        }
        ring.sort_unstable();
        Ok(Self { ring })
    }

    fn locate(&self, key: &str) -> Option<&str> {
        if self.ring.is_empty() {
            return None;
        }
        let hash = key_hash(key);
        let idx = self.ring.partition_point(|p| p.point < hash);
        let idx = if idx == self.ring.len() { 0 } else { idx };
        Some(self.ring[idx].label.as_str())
    }
}

fn le_u32(digest: &[u8; 16], offset: usize) -> u32 {
    u32::from(digest[offset + 3]) << 24
        | u32::from(digest[offset + 2]) << 16
        | u32::from(digest[offset + 1]) << 8
        | u32::from(digest[offset])
}

fn key_hash(key: &str) -> u32 {
    le_u32(&md5::compute(key.as_bytes()).0, 0)
}

/// 一致性哈希负载均衡器
pub struct KetamaBalancer {
    continuum: RwLock<Continuum>,
}

impl KetamaBalancer {
    pub const NAME: &'static str = "hash-balancer";

    pub fn new(nodes: HashMap<String, u32>) -> Result<Self> {
        let continuum = Continuum::build(&nodes)?;
        debug!(
            nodes = nodes.len(),
            points = continuum.ring.len(),
            "Ketama continuum built"
        );
        Ok(Self {
            continuum: RwLock::new(continuum),
        })
    }

    /// 环上虚拟点数量
    pub fn point_count(&self) -> usize {
        self.continuum
            .read()
            .map(|c| c.ring.len())
            .unwrap_or_default()
    }
}

impl NodeSelector for KetamaBalancer {
    fn select_node(&self, key: &str) -> Result<String> {
        let continuum = self
            .continuum
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        continuum
            .locate(key)
            .map(str::to_string)
            .ok_or(RouteError::BalancerNodeNotFound)
    }

    fn update_nodes(&self, nodes: NodeSet) -> Result<()> {
        let NodeSet::Weighted(nodes) = nodes else {
            return Err(RouteError::BalancerTypeMismatch(
                "hash balancer requires weighted nodes".to_string(),
            ));
        };
        // 先在锁外构建新环，失败时保留旧环
        let continuum = Continuum::build(&nodes)?;
        let points = continuum.ring.len();
        *self
            .continuum
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = continuum;
        debug!(nodes = nodes.len(), points, "Ketama continuum replaced");
        Ok(())
    }

    fn name(&self) -> &'static str {
        Self::NAME
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn weighted(names: &[&str]) -> HashMap<String, u32> {
        names.iter().map(|n| (n.to_string(), 1)).collect()
    }

    #[test]
    fn test_empty_nodes_rejected() {
        assert!(matches!(
            KetamaBalancer::new(HashMap::new()),
            Err(RouteError::BalancerEmptyNodes)
        ));
    }

    #[test]
    fn test_point_count_follows_weights() {
        let balancer = KetamaBalancer::new(weighted(&["a", "b", "c"])).unwrap();
        // 每个节点 40 组 * 4 点
        assert_eq!(balancer.point_count(), 3 * 40 * 4);
    }

    #[test]
    fn test_stable_selection() {
        let balancer = KetamaBalancer::new(weighted(&["gw-1", "gw-2", "gw-3"])).unwrap();
        let first = balancer.select_node("user-42").unwrap();
        for _ in 0..1000 {
            assert_eq!(balancer.select_node("user-42").unwrap(), first);
        }
    }

    #[test]
    fn test_every_node_receives_keys() {
        let nodes = ["gw-1", "gw-2", "gw-3", "gw-4"];
        let balancer = KetamaBalancer::new(weighted(&nodes)).unwrap();
        let mut hits: HashMap<String, usize> = HashMap::new();
        for i in 0..100 {
            *hits
                .entry(balancer.select_node(&format!("user-{i}")).unwrap())
                .or_default() += 1;
        }
        for node in nodes {
            assert!(hits.get(node).copied().unwrap_or_default() > 0, "{node} got no keys");
        }
    }

    #[test]
    fn test_removing_node_remaps_bounded_fraction() {
        let balancer = KetamaBalancer::new(weighted(&["gw-1", "gw-2", "gw-3", "gw-4", "gw-5"])).unwrap();
        let keys: Vec<String> = (0..2000).map(|i| format!("key-{i}")).collect();
        let before: Vec<String> = keys.iter().map(|k| balancer.select_node(k).unwrap()).collect();

        balancer
            .update_nodes(NodeSet::Weighted(weighted(&["gw-1", "gw-2", "gw-3", "gw-4"])))
            .unwrap();
        let after: Vec<String> = keys.iter().map(|k| balancer.select_node(k).unwrap()).collect();

        let mut moved = 0;
        for (old, new) in before.iter().zip(after.iter()) {
            if old != new {
                // 只有原属于被移除节点的 key 会迁移
                assert_eq!(old, "gw-5");
                moved += 1;
            }
        }
        // 期望约 1/5，留出足够余量
        assert!(moved < keys.len() * 2 / 5, "moved {moved} of {}", keys.len());
    }

    #[test]
    fn test_heavier_node_gets_more_keys() {
        let mut nodes = weighted(&["light"]);
        nodes.insert("heavy".to_string(), 4);
        let balancer = KetamaBalancer::new(nodes).unwrap();
        let heavy = (0..2000)
            .filter(|i| balancer.select_node(&format!("k{i}")).unwrap() == "heavy")
            .count();
        assert!(heavy > 1000);
    }

    #[test]
    fn test_update_rejects_wrong_shape_and_keeps_state() {
        let balancer = KetamaBalancer::new(weighted(&["gw-1"])).unwrap();
        assert!(matches!(
            balancer.update_nodes(NodeSet::Ordered(vec!["gw-2".into()])),
            Err(RouteError::BalancerTypeMismatch(_))
        ));
        assert!(matches!(
            balancer.update_nodes(NodeSet::Weighted(HashMap::new())),
            Err(RouteError::BalancerEmptyNodes)
        ));
        assert_eq!(balancer.select_node("any").unwrap(), "gw-1");
    }
}
