//! 节点选择 / 负载均衡
//!
//! 两种策略共享 [`NodeSelector`] 契约：
//! - [`KetamaBalancer`]：加权一致性哈希，节点增减只迁移约 1/N 的 key
//! - [`RoundRobinBalancer`]：忽略 key 的轮询
//!
//! 选择调用持读锁，更新持写锁；并发选择只会看到完整的新集合或旧集合。

mod ketama;
mod partition;
mod round_robin;

use std::collections::HashMap;
use std::sync::Arc;

pub use ketama::KetamaBalancer;
pub use partition::PartitionSelector;
pub use round_robin::RoundRobinBalancer;

use crate::config::BalancerStrategy;
use crate::error::{Result, RouteError};

/// 节点集合
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeSet {
    /// 节点 -> 权重（一致性哈希）
    Weighted(HashMap<String, u32>),
    /// 有序节点列表（轮询）
    Ordered(Vec<String>),
}

impl NodeSet {
    pub fn len(&self) -> usize {
        match self {
            NodeSet::Weighted(nodes) => nodes.len(),
            NodeSet::Ordered(nodes) => nodes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub trait NodeSelector: Send + Sync {
    /// 按路由 key 选择节点
    fn select_node(&self, key: &str) -> Result<String>;

    /// 替换节点集合；失败时保留原集合
    fn update_nodes(&self, nodes: NodeSet) -> Result<()>;

    fn name(&self) -> &'static str;
}

/// 按策略创建负载均衡器
///
/// 节点集合形状与策略不符时返回 `BalancerTypeMismatch`。
pub fn new_balancer(strategy: BalancerStrategy, nodes: NodeSet) -> Result<Arc<dyn NodeSelector>> {
    match (strategy, nodes) {
        (BalancerStrategy::Hash, NodeSet::Weighted(nodes)) => Ok(Arc::new(KetamaBalancer::new(nodes)?)),
        (BalancerStrategy::RoundRobin, NodeSet::Ordered(nodes)) => {
            Ok(Arc::new(RoundRobinBalancer::new(&nodes)?))
        }
        (BalancerStrategy::Hash, NodeSet::Ordered(_)) => Err(RouteError::BalancerTypeMismatch(
            "hash balancer requires weighted nodes".to_string(),
        )),
        (BalancerStrategy::RoundRobin, NodeSet::Weighted(_)) => Err(RouteError::BalancerTypeMismatch(
            "roundrobin balancer requires ordered nodes".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_factory_builds_matching_strategy() {
        let hash = new_balancer(
            BalancerStrategy::Hash,
            NodeSet::Weighted(HashMap::from([("gw-1".to_string(), 1)])),
        )
        .unwrap();
        assert_eq!(hash.name(), "hash-balancer");

        let rr = new_balancer(
            BalancerStrategy::RoundRobin,
            NodeSet::Ordered(vec!["gw-1".to_string()]),
        )
        .unwrap();
        assert_eq!(rr.name(), "roundrobin-balancer");
    }

    #[test]
    fn test_factory_rejects_shape_mismatch() {
        assert!(matches!(
            new_balancer(BalancerStrategy::Hash, NodeSet::Ordered(vec!["a".into()])),
            Err(RouteError::BalancerTypeMismatch(_))
        ));
        assert!(matches!(
            new_balancer(BalancerStrategy::RoundRobin, NodeSet::Weighted(HashMap::new())),
            Err(RouteError::BalancerTypeMismatch(_))
        ));
    }

    #[test]
    fn test_factory_propagates_empty_nodes() {
        assert!(matches!(
            new_balancer(BalancerStrategy::Hash, NodeSet::Weighted(HashMap::new())),
            Err(RouteError::BalancerEmptyNodes)
        ));
    }
}
