//! 服务注册边界
//!
//! 注册中心只用于向节点选择器提供节点集合，不参与路由控制流。
//! [`NodeSetRefresher`] 定期拉取健康实例，集合变化时调用 `update_nodes`。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::balancer::{NodeSelector, NodeSet};
use crate::config::BalancerStrategy;
use crate::error::Result;

/// 服务实例
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInstance {
    pub service_name: String,
    pub instance_id: String,
    /// host:port
    pub address: String,
    pub weight: u32,
    pub healthy: bool,
}

impl ServiceInstance {
    pub fn new(
        service_name: impl Into<String>,
        instance_id: impl Into<String>,
        address: impl Into<String>,
    ) -> Self {
        Self {
            service_name: service_name.into(),
            instance_id: instance_id.into(),
            address: address.into(),
            weight: 1,
            healthy: true,
        }
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }
}

#[async_trait]
pub trait ServiceRegistry: Send + Sync {
    async fn register_self(&self, instance: ServiceInstance) -> Result<()>;

    async fn deregister(&self, service_name: &str, instance_id: &str) -> Result<()>;

    /// 健康实例列表
    async fn healthy_instances(&self, service_name: &str) -> Result<Vec<ServiceInstance>>;
}

/// 静态注册表（单机部署、测试）
#[derive(Default)]
pub struct StaticRegistry {
    services: RwLock<HashMap<String, Vec<ServiceInstance>>>,
}

impl StaticRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_healthy(&self, service_name: &str, instance_id: &str, healthy: bool) {
        let mut services = self.services.write().await;
        if let Some(instance) = services
            .get_mut(service_name)
            .and_then(|list| list.iter_mut().find(|i| i.instance_id == instance_id))
        {
            instance.healthy = healthy;
        }
    }
}

#[async_trait]
impl ServiceRegistry for StaticRegistry {
    async fn register_self(&self, instance: ServiceInstance) -> Result<()> {
        let mut services = self.services.write().await;
        let list = services.entry(instance.service_name.clone()).or_default();
        list.retain(|existing| existing.instance_id != instance.instance_id);
        info!(
            service = %instance.service_name,
            instance_id = %instance.instance_id,
            address = %instance.address,
            "Service instance registered"
        );
        list.push(instance);
        Ok(())
    }

    async fn deregister(&self, service_name: &str, instance_id: &str) -> Result<()> {
        let mut services = self.services.write().await;
        if let Some(list) = services.get_mut(service_name) {
            list.retain(|existing| existing.instance_id != instance_id);
        }
        Ok(())
    }

    async fn healthy_instances(&self, service_name: &str) -> Result<Vec<ServiceInstance>> {
        Ok(self
            .services
            .read()
            .await
            .get(service_name)
            .map(|list| list.iter().filter(|i| i.healthy).cloned().collect())
            .unwrap_or_default())
    }
}

/// 节点集合刷新器
pub struct NodeSetRefresher {
    registry: Arc<dyn ServiceRegistry>,
    selector: Arc<dyn NodeSelector>,
    strategy: BalancerStrategy,
    service_name: String,
    last_applied: Mutex<Option<NodeSet>>,
}

impl NodeSetRefresher {
    pub fn new(
        registry: Arc<dyn ServiceRegistry>,
        selector: Arc<dyn NodeSelector>,
        strategy: BalancerStrategy,
        service_name: impl Into<String>,
    ) -> Self {
        Self {
            registry,
            selector,
            strategy,
            service_name: service_name.into(),
            last_applied: Mutex::new(None),
        }
    }

    fn node_set(&self, instances: &[ServiceInstance]) -> NodeSet {
        match self.strategy {
            BalancerStrategy::Hash => NodeSet::Weighted(
                instances
                    .iter()
                    .map(|i| (i.address.clone(), i.weight))
                    .collect(),
            ),
            BalancerStrategy::RoundRobin => {
                let mut addresses: Vec<String> = instances.iter().map(|i| i.address.clone()).collect();
                addresses.sort();
                NodeSet::Ordered(addresses)
            }
        }
    }

    /// 拉取一次；集合发生变化并成功应用时返回 true
    ///
    /// 没有健康实例时保留选择器当前集合。
    pub async fn refresh_once(&self) -> Result<bool> {
        let instances = self.registry.healthy_instances(&self.service_name).await?;
        if instances.is_empty() {
            warn!(service = %self.service_name, "No healthy instances, keeping current node set");
            return Ok(false);
        }

        let next = self.node_set(&instances);
        let mut last = self.last_applied.lock().await;
        if last.as_ref() == Some(&next) {
            return Ok(false);
        }

        self.selector.update_nodes(next.clone())?;
        info!(
            service = %self.service_name,
            balancer = self.selector.name(),
            nodes = next.len(),
            "Node set refreshed"
        );
        *last = Some(next);
        Ok(true)
    }

    /// 按固定间隔刷新，直到取消
    pub fn spawn(self: Arc<Self>, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!(service = %self.service_name, "Node set refresher stopped");
                        return;
                    }
                    _ = ticker.tick() => {}
                }
                if let Err(e) = self.refresh_once().await {
                    warn!(service = %self.service_name, error = %e, "Node set refresh failed");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::balancer::{RoundRobinBalancer, new_balancer};

    const SERVICE: &str = "im-gateway";

    #[tokio::test]
    async fn test_static_registry_filters_unhealthy() {
        let registry = StaticRegistry::new();
        registry
            .register_self(ServiceInstance::new(SERVICE, "gw-1", "10.0.0.1:9000"))
            .await
            .unwrap();
        registry
            .register_self(ServiceInstance::new(SERVICE, "gw-2", "10.0.0.2:9000"))
            .await
            .unwrap();
        registry.set_healthy(SERVICE, "gw-2", false).await;

        let healthy = registry.healthy_instances(SERVICE).await.unwrap();
        assert_eq!(healthy.len(), 1);
        assert_eq!(healthy[0].instance_id, "gw-1");
    }

    #[tokio::test]
    async fn test_refresher_feeds_round_robin() {
        let registry = Arc::new(StaticRegistry::new());
        let selector = Arc::new(RoundRobinBalancer::new(&["seed:1".to_string()]).unwrap());
        let refresher = NodeSetRefresher::new(
            registry.clone(),
            selector.clone(),
            BalancerStrategy::RoundRobin,
            SERVICE,
        );

        // 无实例时保留种子集合
        assert!(!refresher.refresh_once().await.unwrap());
        assert_eq!(selector.select_node("k").unwrap(), "seed:1");

        registry
            .register_self(ServiceInstance::new(SERVICE, "gw-2", "10.0.0.2:9000"))
            .await
            .unwrap();
        registry
            .register_self(ServiceInstance::new(SERVICE, "gw-1", "10.0.0.1:9000"))
            .await
            .unwrap();
        assert!(refresher.refresh_once().await.unwrap());
        assert!(!refresher.refresh_once().await.unwrap());
        assert_eq!(selector.nodes(), vec!["10.0.0.1:9000", "10.0.0.2:9000"]);
    }

    #[tokio::test]
    async fn test_refresher_feeds_weighted_hash() {
        let registry = Arc::new(StaticRegistry::new());
        registry
            .register_self(ServiceInstance::new(SERVICE, "gw-1", "10.0.0.1:9000").with_weight(3))
            .await
            .unwrap();
        let selector = new_balancer(
            BalancerStrategy::Hash,
            NodeSet::Weighted(HashMap::from([("seed:1".to_string(), 1)])),
        )
        .unwrap();
        let refresher = NodeSetRefresher::new(registry, selector.clone(), BalancerStrategy::Hash, SERVICE);

        assert!(refresher.refresh_once().await.unwrap());
        assert_eq!(selector.select_node("any-user").unwrap(), "10.0.0.1:9000");
    }

    #[tokio::test]
    async fn test_spawned_refresher_stops_on_cancel() {
        let registry = Arc::new(StaticRegistry::new());
        registry
            .register_self(ServiceInstance::new(SERVICE, "gw-1", "10.0.0.1:9000"))
            .await
            .unwrap();
        let selector = Arc::new(RoundRobinBalancer::new(&["seed:1".to_string()]).unwrap());
        let refresher = Arc::new(NodeSetRefresher::new(
            registry,
            selector.clone(),
            BalancerStrategy::RoundRobin,
            SERVICE,
        ));

        let cancel = CancellationToken::new();
        let handle = refresher.spawn(Duration::from_millis(10), cancel.clone());
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        handle.await.unwrap();
        assert_eq!(selector.nodes(), vec!["10.0.0.1:9000"]);
    }
}
