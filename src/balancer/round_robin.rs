//! 轮询负载均衡

use std::sync::RwLock;
use std::sync::atomic::{AtomicUsize, Ordering};

use tracing::debug;

use super::{NodeSelector, NodeSet};
use crate::error::{Result, RouteError};

/// 轮询负载均衡器
///
/// 忽略路由 key，按 `list[counter % len]` 依次返回节点。
/// 计数器为无锁原子自增；更新节点列表时在写锁内替换并归零。
pub struct RoundRobinBalancer {
    nodes: RwLock<Vec<String>>,
    counter: AtomicUsize,
}

impl RoundRobinBalancer {
    pub const NAME: &'static str = "roundrobin-balancer";

    pub fn new(nodes: &[String]) -> Result<Self> {
        if nodes.is_empty() {
            return Err(RouteError::BalancerEmptyNodes);
        }
        Ok(Self {
            nodes: RwLock::new(nodes.to_vec()),
            counter: AtomicUsize::new(0),
        })
    }

    pub fn nodes(&self) -> Vec<String> {
        self.nodes
            .read()
            .map(|nodes| nodes.clone())
            .unwrap_or_default()
    }
}

impl NodeSelector for RoundRobinBalancer {
    fn select_node(&self, _key: &str) -> Result<String> {
        let nodes = self
            .nodes
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if nodes.is_empty() {
            return Err(RouteError::BalancerNodeNotFound);
        }
        let idx = self.counter.fetch_add(1, Ordering::Relaxed) % nodes.len();
        Ok(nodes[idx].clone())
    }

    fn update_nodes(&self, nodes: NodeSet) -> Result<()> {
        let NodeSet::Ordered(nodes) = nodes else {
            return Err(RouteError::BalancerTypeMismatch(
                "roundrobin balancer requires ordered nodes".to_string(),
            ));
        };
        if nodes.is_empty() {
            return Err(RouteError::BalancerEmptyNodes);
        }

        let count = nodes.len();
        let mut guard = self
            .nodes
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = nodes;
        self.counter.store(0, Ordering::Relaxed);
        drop(guard);

        debug!(nodes = count, "Round-robin node list replaced");
        Ok(())
    }

    fn name(&self) -> &'static str {
        Self::NAME
    }
}
